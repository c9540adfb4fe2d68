/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Per-topic bounded broadcast queue over named shared memory.
//!
//! One ring exists per topic, named `<namespace>_t<ID>`, and is shared by
//! whichever of the two peer processes binds the topic. The layout is a
//! `repr(C)` header of atomics followed by `capacity × msg_size` slot bytes:
//!
//! * producers (publisher handles, either process) serialize on an embedded
//!   spinlock, fail fast with `QueueFull` when the ring is full, and bump a
//!   commit sequence that doubles as the consumer futex word;
//! * the consumer (the topic gatekeeper of the process holding the
//!   subscribers) futex-sleeps on the commit sequence and is woken by every
//!   publish and by local shutdown/park requests;
//! * the header also carries the cross-process member count that decides
//!   when the last leaver may unlink the object.
//!
//! Exactly one gatekeeper consumes at a time: a gatekeeper whose process has
//! no subscribers on the topic parks instead of receiving (see the fabric
//! module). Head therefore has a single writer, and tail is protected by the
//! producer lock.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::clock;
use crate::error::{BenchError, BenchResult};
use crate::rt::shm::{futex_wait, futex_wake_all, SharedRegion};

/// Slots per topic ring.
pub(crate) const RING_CAPACITY: u64 = 32;

/// Init-latch value released by the creator once the header is filled in.
const RING_MAGIC: u32 = 0x5254_4F50; // "RTOP"

// ── Header ────────────────────────────────────────────────────────────────────

#[repr(C)]
struct RingHeader {
    /// Zero until the creator publishes the initialized header.
    magic: AtomicU32,
    /// Message size in bytes; immutable while the topic exists.
    msg_size: AtomicU32,
    /// Producer spinlock (0 free, 1 held).
    lock: AtomicU32,
    /// Commit sequence, bumped per publish and per wake request; consumer
    /// futex word.
    commit_seq: AtomicU32,
    /// Cross-process publisher+subscriber count ("tasks_number").
    refs: AtomicU32,
    /// Absolute read counter; written only by the active consumer.
    head: AtomicU64,
    /// Absolute write counter; written under the producer lock.
    tail: AtomicU64,
}

const HEADER_LEN: usize = std::mem::size_of::<RingHeader>();

// ── Ring ──────────────────────────────────────────────────────────────────────

/// Handle to one mapped topic ring.
#[derive(Debug)]
pub(crate) struct Ring {
    region: SharedRegion,
    topic: u8,
    msg_size: usize,
}

impl Ring {
    /// Create the ring for `topic` or bind to the peer's, validating that
    /// the message size agrees.
    pub(crate) fn open(namespace: &str, topic: u8, msg_size: usize) -> BenchResult<Self> {
        if msg_size == 0 {
            return Err(BenchError::TopicCreationFailed {
                topic,
                reason: "zero message size".into(),
            });
        }

        let len = HEADER_LEN + RING_CAPACITY as usize * msg_size;
        let region = SharedRegion::create_or_bind(&format!("{namespace}_t{topic}"), len)
            .map_err(|e| BenchError::TopicCreationFailed {
                topic,
                reason: e.to_string(),
            })?;

        let ring = Self {
            region,
            topic,
            msg_size,
        };

        if ring.region.created() {
            let h = ring.header();
            h.msg_size.store(msg_size as u32, Ordering::Relaxed);
            h.magic.store(RING_MAGIC, Ordering::Release);
        } else {
            // Wait out the creator's init window, then check compatibility.
            let deadline = clock::now() + clock::TICKS_PER_SECOND;
            while ring.header().magic.load(Ordering::Acquire) != RING_MAGIC {
                if clock::now() > deadline {
                    return Err(BenchError::TopicCreationFailed {
                        topic,
                        reason: io::Error::from(io::ErrorKind::TimedOut).to_string(),
                    });
                }
                std::thread::yield_now();
            }
            let existing = ring.header().msg_size.load(Ordering::Acquire) as usize;
            if existing != msg_size {
                return Err(BenchError::TopicCreationFailed {
                    topic,
                    reason: format!(
                        "message size mismatch: topic carries {existing} bytes, requested {msg_size}"
                    ),
                });
            }
        }

        Ok(ring)
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    fn slot_ptr(&self, abs_index: u64) -> *mut u8 {
        let slot = (abs_index % RING_CAPACITY) as usize;
        unsafe { self.region.as_ptr().add(HEADER_LEN + slot * self.msg_size) }
    }

    /// Message size this ring was created with.
    pub(crate) fn msg_size(&self) -> usize {
        self.msg_size
    }

    // ── Producer side ─────────────────────────────────────────────────────────

    /// Copy `msg_size` bytes from `msg` into the next free slot.
    ///
    /// Never blocks: a full ring is [`BenchError::QueueFull`] and the
    /// message is dropped by the caller.
    pub(crate) fn try_send(&self, msg: &[u8]) -> BenchResult<()> {
        debug_assert_eq!(msg.len(), self.msg_size);

        let h = self.header();
        self.lock_producers();

        let head = h.head.load(Ordering::Acquire);
        let tail = h.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= RING_CAPACITY {
            self.unlock_producers();
            return Err(BenchError::QueueFull { topic: self.topic });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(msg.as_ptr(), self.slot_ptr(tail), self.msg_size);
        }
        h.tail.store(tail.wrapping_add(1), Ordering::Release);
        self.unlock_producers();

        h.commit_seq.fetch_add(1, Ordering::AcqRel);
        futex_wake_all(&h.commit_seq);
        Ok(())
    }

    fn lock_producers(&self) {
        let lock = &self.header().lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_producers(&self) {
        self.header().lock.store(0, Ordering::Release);
    }

    // ── Consumer side ─────────────────────────────────────────────────────────

    /// Block until a message arrives, copying it into `out`, or until
    /// `parked()` turns true (shutdown, or the local subscriber set drained).
    ///
    /// Returns `true` when `out` holds a message.
    pub(crate) fn receive(&self, out: &mut [u8], parked: impl Fn() -> bool) -> bool {
        debug_assert_eq!(out.len(), self.msg_size);
        let h = self.header();

        loop {
            // Order matters: sample the sequence before checking emptiness
            // so a publish between the check and the sleep changes the word
            // and the futex wait falls through.
            let seq = h.commit_seq.load(Ordering::Acquire);
            let head = h.head.load(Ordering::Relaxed);
            if head != h.tail.load(Ordering::Acquire) {
                unsafe {
                    std::ptr::copy_nonoverlapping(self.slot_ptr(head), out.as_mut_ptr(), self.msg_size);
                }
                h.head.store(head.wrapping_add(1), Ordering::Release);
                return true;
            }
            if parked() {
                return false;
            }
            futex_wait(&h.commit_seq, seq);
        }
    }

    /// Kick every consumer futex-sleeping on this ring so it re-evaluates
    /// its park/shutdown predicate.
    pub(crate) fn wake_consumers(&self) {
        let h = self.header();
        h.commit_seq.fetch_add(1, Ordering::AcqRel);
        futex_wake_all(&h.commit_seq);
    }

    // ── Cross-process membership ──────────────────────────────────────────────

    /// Register one publisher or subscriber on the topic, either process.
    pub(crate) fn add_ref(&self) {
        self.header().refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one member; returns the count remaining across both processes.
    pub(crate) fn release_ref(&self) -> u32 {
        self.header().refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Remove the backing object name. Called by the last leaver only.
    pub(crate) fn unlink(&self) {
        self.region.unlink();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_ns(tag: &str) -> String {
        format!(
            "rstone_ring_{}_{}_{tag}",
            std::process::id(),
            clock::now() % 1_000_000
        )
    }

    #[test]
    fn send_then_receive_round_trips_bytes() {
        let ns = test_ns("rt");
        let ring = Ring::open(&ns, 2, 4).unwrap();

        ring.try_send(&[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        assert!(ring.receive(&mut out, || false));
        assert_eq!(out, [1, 2, 3, 4]);

        ring.unlink();
    }

    #[test]
    fn full_ring_reports_queue_full() {
        let ns = test_ns("full");
        let ring = Ring::open(&ns, 3, 2).unwrap();

        for i in 0..RING_CAPACITY {
            ring.try_send(&[i as u8, 0]).unwrap();
        }
        let err = ring.try_send(&[0xFF, 0]).unwrap_err();
        assert!(matches!(err, BenchError::QueueFull { topic: 3 }));

        // Draining one slot makes room again.
        let mut out = [0u8; 2];
        assert!(ring.receive(&mut out, || false));
        ring.try_send(&[0xFF, 0]).unwrap();

        ring.unlink();
    }

    #[test]
    fn messages_are_delivered_in_order() {
        let ns = test_ns("order");
        let ring = Ring::open(&ns, 4, 1).unwrap();
        for i in 0..10u8 {
            ring.try_send(&[i]).unwrap();
        }
        let mut out = [0u8; 1];
        for i in 0..10u8 {
            assert!(ring.receive(&mut out, || false));
            assert_eq!(out[0], i);
        }
        ring.unlink();
    }

    #[test]
    fn binder_sees_creator_messages() {
        let ns = test_ns("bind");
        let creator = Ring::open(&ns, 5, 8).unwrap();
        let binder = Ring::open(&ns, 5, 8).unwrap();

        creator.try_send(&[9u8; 8]).unwrap();
        let mut out = [0u8; 8];
        assert!(binder.receive(&mut out, || false));
        assert_eq!(out, [9u8; 8]);

        creator.unlink();
    }

    #[test]
    fn binder_with_wrong_message_size_is_rejected() {
        let ns = test_ns("size");
        let _creator = Ring::open(&ns, 6, 8).unwrap();
        let err = Ring::open(&ns, 6, 4).unwrap_err();
        assert!(matches!(err, BenchError::TopicCreationFailed { topic: 6, .. }));
        _creator.unlink();
    }

    #[test]
    fn zero_message_size_is_rejected() {
        let ns = test_ns("zero");
        assert!(Ring::open(&ns, 7, 0).is_err());
    }

    #[test]
    fn receive_blocks_until_publish() {
        let ns = test_ns("block");
        let ring = Arc::new(Ring::open(&ns, 8, 2).unwrap());

        let consumer_ring = Arc::clone(&ring);
        let consumer = std::thread::spawn(move || {
            let mut out = [0u8; 2];
            let got = consumer_ring.receive(&mut out, || false);
            (got, out)
        });

        std::thread::sleep(Duration::from_millis(50));
        ring.try_send(&[0xAB, 0xCD]).unwrap();

        let (got, out) = consumer.join().unwrap();
        assert!(got);
        assert_eq!(out, [0xAB, 0xCD]);
        ring.unlink();
    }

    #[test]
    fn parked_consumer_returns_without_message() {
        let ns = test_ns("park");
        let ring = Arc::new(Ring::open(&ns, 9, 2).unwrap());

        let consumer_ring = Arc::clone(&ring);
        let stop = Arc::new(AtomicU32::new(0));
        let consumer_stop = Arc::clone(&stop);
        let consumer = std::thread::spawn(move || {
            let mut out = [0u8; 2];
            consumer_ring.receive(&mut out, || consumer_stop.load(Ordering::Acquire) != 0)
        });

        std::thread::sleep(Duration::from_millis(50));
        stop.store(1, Ordering::Release);
        ring.wake_consumers();

        assert!(!consumer.join().unwrap());
        ring.unlink();
    }

    #[test]
    fn refs_count_members_across_handles() {
        let ns = test_ns("refs");
        let a = Ring::open(&ns, 10, 2).unwrap();
        let b = Ring::open(&ns, 10, 2).unwrap();

        a.add_ref();
        a.add_ref();
        b.add_ref();
        assert_eq!(a.release_ref(), 2);
        assert_eq!(b.release_ref(), 1);
        assert_eq!(b.release_ref(), 0);

        a.unlink();
    }
}
