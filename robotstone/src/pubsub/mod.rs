/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Publish/subscribe fabric.
//!
//! Named topics carry opaque fixed-size messages between synthetic tasks,
//! within a process or across the Master/Slave pair. Each topic owns one
//! bounded broadcast queue (a shared-memory ring, see [`ring`]) and, in every
//! process that binds it, a gatekeeper task that drains the ring and fans
//! each message out to the private bounded FIFO of every local subscriber.
//!
//! # Design decisions vs the reference implementation
//!
//! | Topic | Reference | Here |
//! |---|---|---|
//! | Ownership | `Publisher* → Topic → publisher list` cycles | table owns `Arc<TopicState>`; handles hold the `Arc` plus their id; topics track ids only |
//! | Cross-process liveness | named heap cell under a named mutex | atomic member count embedded in the ring |
//! | Creation race | first `rt_queue_bind` failure decides | `O_CREAT \| O_EXCL` plus an init latch in the ring header |
//! | Table serialization | process-wide named mutex | one process-local `Mutex` (creation races resolve in the ring) |
//! | Gatekeeper exit | null sentinel message | shutdown latch + futex wake |
//!
//! A gatekeeper consumes from the ring only while its process holds
//! subscribers on the topic; otherwise it parks. Since every topic's
//! subscribers live in a single process at a time, the parked peer never
//! steals broadcast traffic.

pub mod ring;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::clock;
use crate::error::{BenchError, BenchResult};
use crate::rt;
use ring::Ring;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the topic table; topic ids are dense small integers.
pub const MAX_TOPICS: usize = 256;

/// Depth of each subscriber's private FIFO.
pub const SUB_BUFFER_SIZE: usize = 30;

/// Gatekeeper tasks outrank every synthetic task and the management task.
pub const GATEKEEPER_PRIORITY: u8 = 90;

/// Management topic, Master → Slave direction.
pub const TOPIC_MASTER_TO_SLAVE: u8 = 0;

/// Management topic, Slave → Master direction.
pub const TOPIC_SLAVE_TO_MASTER: u8 = 1;

/// First topic id available to synthetic tasks; 0 and 1 are reserved.
pub const FIRST_DATA_TOPIC: u8 = 2;

// ── Topic state ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SubEntry {
    id: u32,
    tx: Sender<Box<[u8]>>,
}

/// Local membership and gatekeeper park/shutdown state.
#[derive(Debug)]
struct GateState {
    pubs: Vec<u32>,
    subs: Vec<SubEntry>,
    shutdown: bool,
}

#[derive(Debug)]
struct TopicState {
    id: u8,
    msg_size: usize,
    ring: Ring,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
    gatekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl TopicState {
    fn local_members(&self) -> usize {
        let g = self.gate.lock().unwrap();
        g.pubs.len() + g.subs.len()
    }
}

/// Per-topic fan-out task: drain the ring, copy to every local subscriber.
///
/// Parks while the local subscriber set is empty so a process holding only
/// publishers never consumes broadcast traffic meant for the peer.
fn gatekeeper_loop(state: Arc<TopicState>) {
    let mut buf = vec![0u8; state.msg_size].into_boxed_slice();

    loop {
        {
            let mut g = state.gate.lock().unwrap();
            while g.subs.is_empty() && !g.shutdown {
                g = state.gate_cv.wait(g).unwrap();
            }
            if g.shutdown {
                return;
            }
        }

        let parked = || {
            let g = state.gate.lock().unwrap();
            g.shutdown || g.subs.is_empty()
        };
        if state.ring.receive(&mut buf, parked) {
            let g = state.gate.lock().unwrap();
            for sub in &g.subs {
                if sub.tx.try_send(buf.clone()).is_err() {
                    // Bounded FIFO full: drop, surfaces as subscriber
                    // deadline misses.
                    trace!(topic = state.id, subscriber = sub.id, "subscriber queue full, copy dropped");
                }
            }
        } else if state.gate.lock().unwrap().shutdown {
            return;
        }
    }
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// Outcome of a blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// A message was copied into the caller's buffer.
    Message,
    /// The wait was broken by an [`Unblocker`] (or the fabric tore down).
    Unblocked,
}

/// Subscribing membership on one topic.
#[derive(Debug)]
pub struct Subscriber {
    topic: u8,
    id: u32,
    msg_size: usize,
    state: Arc<TopicState>,
    rx: Receiver<Box<[u8]>>,
    unblock_tx: Sender<()>,
    unblock_rx: Receiver<()>,
}

impl Subscriber {
    /// Block until a message arrives on the subscribed topic, copying
    /// exactly `message_size` bytes into `out`, or until unblocked.
    pub fn receive(&self, out: &mut [u8]) -> Receipt {
        crossbeam::select! {
            recv(self.rx) -> msg => match msg {
                Ok(m) => {
                    out[..self.msg_size].copy_from_slice(&m);
                    Receipt::Message
                }
                Err(_) => Receipt::Unblocked,
            },
            recv(self.unblock_rx) -> _ => Receipt::Unblocked,
        }
    }

    /// A handle that can break this subscriber's blocking receive from
    /// another task.
    pub fn unblocker(&self) -> Unblocker {
        Unblocker {
            tx: self.unblock_tx.clone(),
        }
    }

    pub fn topic(&self) -> u8 {
        self.topic
    }

    pub fn message_size(&self) -> usize {
        self.msg_size
    }
}

/// Breaks a subscriber out of a blocking receive.
///
/// The channel holds at most one token, so unblocking a task that is not
/// currently blocked leaves a single stale token behind; receivers that are
/// not stopping simply discard it and wait again.
#[derive(Debug)]
pub struct Unblocker {
    tx: Sender<()>,
}

impl Unblocker {
    pub fn unblock(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Publishing membership on one topic.
#[derive(Debug)]
pub struct Publisher {
    topic: u8,
    id: u32,
    msg_size: usize,
    state: Arc<TopicState>,
}

impl Publisher {
    /// Copy `message_size` bytes into a queue slot and broadcast.
    ///
    /// Non-blocking: a full topic queue is [`BenchError::QueueFull`] and the
    /// message is dropped.
    pub fn send(&self, msg: &[u8]) -> BenchResult<()> {
        self.state.ring.try_send(msg)
    }

    pub fn topic(&self) -> u8 {
        self.topic
    }

    pub fn message_size(&self) -> usize {
        self.msg_size
    }
}

// ── Topic table ───────────────────────────────────────────────────────────────

/// Process-wide topic registry.
///
/// All mutations (subscribe, publish, leave) serialize on the table mutex so
/// membership changes never race with topic destruction.
pub struct TopicTable {
    namespace: String,
    topics: Mutex<Vec<Option<Arc<TopicState>>>>,
}

impl TopicTable {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            topics: Mutex::new((0..MAX_TOPICS).map(|_| None).collect()),
        }
    }

    /// Request subscribing membership, creating the topic on first use in
    /// either process.
    ///
    /// The returned handle's `receive` blocks indefinitely until a message
    /// arrives.
    pub fn subscribing_request(&self, topic: u8, msg_size: usize) -> BenchResult<Subscriber> {
        let mut topics = self.topics.lock().unwrap();
        let state = self.get_or_create(&mut topics, topic, msg_size)?;

        let (tx, rx) = channel::bounded(SUB_BUFFER_SIZE);
        let (unblock_tx, unblock_rx) = channel::bounded(1);

        let id = {
            let mut g = state.gate.lock().unwrap();
            let id = fresh_id(g.subs.iter().map(|s| s.id));
            g.subs.push(SubEntry { id, tx });
            id
        };
        state.ring.add_ref();
        // A parked gatekeeper must notice the first subscriber.
        state.gate_cv.notify_all();

        debug!(topic, id, msg_size, "subscriber joined");
        Ok(Subscriber {
            topic,
            id,
            msg_size,
            state,
            rx,
            unblock_tx,
            unblock_rx,
        })
    }

    /// Request publishing membership, creating the topic on first use in
    /// either process.
    pub fn publishing_request(&self, topic: u8, msg_size: usize) -> BenchResult<Publisher> {
        let mut topics = self.topics.lock().unwrap();
        let state = self.get_or_create(&mut topics, topic, msg_size)?;

        let id = {
            let mut g = state.gate.lock().unwrap();
            let id = fresh_id(g.pubs.iter().copied());
            g.pubs.push(id);
            id
        };
        state.ring.add_ref();

        debug!(topic, id, msg_size, "publisher joined");
        Ok(Publisher {
            topic,
            id,
            msg_size,
            state,
        })
    }

    /// Release a subscribing membership; destroys the topic when it was the
    /// last local member, unlinking the backing object when the peer holds
    /// none either.
    pub fn leave_subscriber(&self, sub: Subscriber) {
        let Subscriber { topic, id, state, .. } = sub;
        let mut topics = self.topics.lock().unwrap();
        {
            let mut g = state.gate.lock().unwrap();
            g.subs.retain(|s| s.id != id);
            if g.subs.is_empty() {
                // The active gatekeeper re-evaluates its park predicate.
                state.ring.wake_consumers();
            }
        }
        debug!(topic, id, "subscriber left");
        self.release(&state, &mut topics);
    }

    /// Release a publishing membership; same destruction rules as
    /// [`TopicTable::leave_subscriber`].
    pub fn leave_publisher(&self, publisher: Publisher) {
        let Publisher { topic, id, state, .. } = publisher;
        let mut topics = self.topics.lock().unwrap();
        {
            let mut g = state.gate.lock().unwrap();
            g.pubs.retain(|p| *p != id);
        }
        debug!(topic, id, "publisher left");
        self.release(&state, &mut topics);
    }

    /// Whether the topic currently exists in this process.
    pub fn topic_exists(&self, topic: u8) -> bool {
        self.topics.lock().unwrap()[topic as usize].is_some()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn get_or_create(
        &self,
        topics: &mut [Option<Arc<TopicState>>],
        topic: u8,
        msg_size: usize,
    ) -> BenchResult<Arc<TopicState>> {
        if let Some(state) = &topics[topic as usize] {
            if state.msg_size != msg_size {
                return Err(BenchError::TopicCreationFailed {
                    topic,
                    reason: format!(
                        "message size mismatch: topic carries {} bytes, requested {msg_size}",
                        state.msg_size
                    ),
                });
            }
            return Ok(Arc::clone(state));
        }

        let ring = Ring::open(&self.namespace, topic, msg_size)?;
        let state = Arc::new(TopicState {
            id: topic,
            msg_size,
            ring,
            gate: Mutex::new(GateState {
                pubs: Vec::new(),
                subs: Vec::new(),
                shutdown: false,
            }),
            gate_cv: Condvar::new(),
            gatekeeper: Mutex::new(None),
        });

        let worker_state = Arc::clone(&state);
        let handle = rt::spawn_rt(&format!("topic_{topic}"), GATEKEEPER_PRIORITY, move || {
            gatekeeper_loop(worker_state)
        })?;
        *state.gatekeeper.lock().unwrap() = Some(handle);

        debug!(topic, msg_size, "topic created");
        topics[topic as usize] = Some(Arc::clone(&state));
        Ok(state)
    }

    /// Drop one cross-process reference and destroy the local topic when the
    /// local member count reaches zero.
    fn release(&self, state: &Arc<TopicState>, topics: &mut [Option<Arc<TopicState>>]) {
        let remaining_global = state.ring.release_ref();

        if state.local_members() > 0 {
            return;
        }

        // Destruction: stop the gatekeeper, join it, then decide whether the
        // name itself goes away.
        {
            let mut g = state.gate.lock().unwrap();
            g.shutdown = true;
        }
        state.gate_cv.notify_all();
        state.ring.wake_consumers();
        if let Some(handle) = state.gatekeeper.lock().unwrap().take() {
            let _ = handle.join();
        }

        if remaining_global == 0 {
            state.ring.unlink();
        }
        debug!(topic = state.id, remaining_global, "topic destroyed locally");
        topics[state.id as usize] = None;
    }
}

/// Clock-derived handle id, retried until it collides with nothing in the
/// topic's set.
fn fresh_id(taken: impl Iterator<Item = u32> + Clone) -> u32 {
    loop {
        let id = clock::handle_entropy();
        if !taken.clone().any(|t| t == id) {
            return id;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_table(tag: &str) -> TopicTable {
        TopicTable::new(format!(
            "rstone_fab_{}_{}_{tag}",
            std::process::id(),
            clock::now() % 1_000_000
        ))
    }

    #[test]
    fn co_resident_round_trip_delivers_every_message() {
        let table = test_table("rt");
        let publisher = table.publishing_request(2, 8).unwrap();
        let subscriber = table.subscribing_request(2, 8).unwrap();

        for i in 0..5u8 {
            publisher.send(&[i; 8]).unwrap();
        }
        let mut out = [0u8; 8];
        for i in 0..5u8 {
            assert_eq!(subscriber.receive(&mut out), Receipt::Message);
            assert_eq!(out, [i; 8]);
        }

        table.leave_subscriber(subscriber);
        table.leave_publisher(publisher);
    }

    #[test]
    fn unblocker_breaks_a_blocking_receive() {
        let table = test_table("unblock");
        let _publisher = table.publishing_request(2, 4).unwrap();
        let subscriber = table.subscribing_request(2, 4).unwrap();
        let unblocker = subscriber.unblocker();

        let worker = std::thread::spawn(move || {
            let mut out = [0u8; 4];
            let receipt = subscriber.receive(&mut out);
            (receipt, subscriber)
        });

        std::thread::sleep(Duration::from_millis(50));
        unblocker.unblock();

        let (receipt, subscriber) = worker.join().unwrap();
        assert_eq!(receipt, Receipt::Unblocked);
        table.leave_subscriber(subscriber);
    }

    #[test]
    fn stale_unblock_token_does_not_stack() {
        let table = test_table("stale");
        let publisher = table.publishing_request(2, 4).unwrap();
        let subscriber = table.subscribing_request(2, 4).unwrap();
        let unblocker = subscriber.unblocker();

        // Tokens from unblocking a non-blocked task cap at one.
        unblocker.unblock();
        unblocker.unblock();
        unblocker.unblock();

        publisher.send(&[7u8; 4]).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // One receive may consume the stale token, the next must see the
        // message.
        let mut out = [0u8; 4];
        let mut receipts = Vec::new();
        for _ in 0..2 {
            receipts.push(subscriber.receive(&mut out));
            if receipts.last() == Some(&Receipt::Message) {
                break;
            }
        }
        assert!(receipts.contains(&Receipt::Message));
        assert_eq!(out, [7u8; 4]);

        table.leave_subscriber(subscriber);
        table.leave_publisher(publisher);
    }

    #[test]
    fn leaving_last_member_destroys_the_topic() {
        let table = test_table("destroy");
        let subscriber = table.subscribing_request(5, 4).unwrap();
        assert!(table.topic_exists(5));

        table.leave_subscriber(subscriber);
        assert!(!table.topic_exists(5));
    }

    #[test]
    fn topic_survives_while_a_member_remains() {
        let table = test_table("survive");
        let publisher = table.publishing_request(6, 4).unwrap();
        let subscriber = table.subscribing_request(6, 4).unwrap();

        table.leave_subscriber(subscriber);
        assert!(table.topic_exists(6), "publisher still holds the topic");

        // Re-subscribing joins the existing topic rather than recreating it.
        let again = table.subscribing_request(6, 4).unwrap();
        publisher.send(&[3u8; 4]).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(again.receive(&mut out), Receipt::Message);
        assert_eq!(out, [3u8; 4]);

        table.leave_subscriber(again);
        table.leave_publisher(publisher);
        assert!(!table.topic_exists(6));
    }

    #[test]
    fn mismatched_message_size_is_rejected_locally() {
        let table = test_table("mismatch");
        let publisher = table.publishing_request(7, 8).unwrap();
        let err = table.subscribing_request(7, 16).unwrap_err();
        assert!(matches!(err, BenchError::TopicCreationFailed { topic: 7, .. }));
        table.leave_publisher(publisher);
    }

    #[test]
    fn fan_out_reaches_every_local_subscriber() {
        let table = test_table("fanout");
        let publisher = table.publishing_request(8, 2).unwrap();
        let sub_a = table.subscribing_request(8, 2).unwrap();
        let sub_b = table.subscribing_request(8, 2).unwrap();

        publisher.send(&[1, 2]).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(sub_a.receive(&mut out), Receipt::Message);
        assert_eq!(out, [1, 2]);
        assert_eq!(sub_b.receive(&mut out), Receipt::Message);
        assert_eq!(out, [1, 2]);

        table.leave_subscriber(sub_a);
        table.leave_subscriber(sub_b);
        table.leave_publisher(publisher);
    }

    #[test]
    fn two_tables_on_one_namespace_cross_deliver() {
        // Two tables in one process stand in for the two peer processes.
        let ns = format!(
            "rstone_fab_{}_{}_xproc",
            std::process::id(),
            clock::now() % 1_000_000
        );
        let master_side = TopicTable::new(ns.clone());
        let slave_side = TopicTable::new(ns);

        let publisher = master_side.publishing_request(2, 4).unwrap();
        let subscriber = slave_side.subscribing_request(2, 4).unwrap();

        publisher.send(&[9, 9, 9, 9]).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(subscriber.receive(&mut out), Receipt::Message);
        assert_eq!(out, [9, 9, 9, 9]);

        slave_side.leave_subscriber(subscriber);
        master_side.leave_publisher(publisher);
    }
}
