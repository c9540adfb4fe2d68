/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Named shared-memory regions and futex-based cross-process signalling.
//!
//! Both benchmark processes run on one host and meet through named POSIX
//! shared-memory objects: whichever process touches a name first creates and
//! sizes it, the peer binds to the existing object. All cross-process state —
//! the stop flag, the test-step epoch, topic reference counts and the topic
//! rings themselves — lives in such regions as plain atomics.
//!
//! Blocking is done with raw futexes on atomic words inside the regions:
//! waiters sleep while a sequence word holds its observed value, wakers bump
//! the word and wake everyone. Spurious wakeups are expected; every waiter
//! rechecks its condition in a loop.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::debug;

use crate::clock::{self, Tick};
use crate::error::{BenchError, BenchResult};

// ── Futex primitives ──────────────────────────────────────────────────────────

/// Sleep while `*word == expected`. Returns on wake, value change or any
/// spurious condition; callers loop.
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0,
        );
    }
}

/// Wake up to `count` waiters sleeping on `word`.
pub(crate) fn futex_wake(word: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0,
        );
    }
}

/// Wake every waiter sleeping on `word`.
pub(crate) fn futex_wake_all(word: &AtomicU32) {
    futex_wake(word, libc::c_int::MAX);
}

// ── SharedRegion ──────────────────────────────────────────────────────────────

/// A named, mapped shared-memory object.
///
/// The mapping stays valid for the lifetime of the value; `Drop` unmaps but
/// deliberately does not unlink — object lifetime is governed by the topic
/// reference counts and by [`SharedRegion::unlink`].
#[derive(Debug)]
pub struct SharedRegion {
    name: CString,
    ptr: *mut u8,
    len: usize,
    created: bool,
}

// The region is a bag of atomics; all access goes through &self methods on
// types that overlay repr(C) atomic structs.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the object `name` (leading `/` added if absent) of `len`
    /// bytes, or bind to it if a peer already created it.
    ///
    /// A freshly created object is zero-filled by the kernel, so "all
    /// zeroes" must be a valid initial state for whatever overlays it; a
    /// binder may additionally have to wait on an init latch maintained by
    /// the overlay.
    pub fn create_or_bind(name: &str, len: usize) -> BenchResult<Self> {
        let path = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };
        let c_name = CString::new(path.clone()).map_err(|_| BenchError::Shm {
            name: path.clone(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

        let shm_err = |source: io::Error| BenchError::Shm {
            name: path.clone(),
            source,
        };

        let mut created = true;
        let mut fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            let err = clock::os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(shm_err(err));
            }
            created = false;
            fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600) };
            if fd < 0 {
                return Err(shm_err(clock::os_error()));
            }
        }

        if created {
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
                let err = clock::os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(shm_err(err));
            }
        } else {
            // The creator may not have sized the object yet; wait until it
            // reaches the expected length.
            let deadline = clock::now() + clock::TICKS_PER_SECOND;
            loop {
                let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
                let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
                if rc == 0 && unsafe { st.assume_init() }.st_size as usize >= len {
                    break;
                }
                if clock::now() > deadline {
                    unsafe { libc::close(fd) };
                    return Err(shm_err(io::Error::from(io::ErrorKind::TimedOut)));
                }
                std::thread::yield_now();
            }
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(shm_err(clock::os_error()));
        }

        debug!(name = %path, len, created, "shared region mapped");
        Ok(Self {
            name: c_name,
            ptr: ptr.cast(),
            len,
            created,
        })
    }

    /// Whether this process created the object (vs binding to a peer's).
    pub fn created(&self) -> bool {
        self.created
    }

    /// Base pointer of the mapping.
    ///
    /// # Safety contract (callers)
    /// Overlays must be `repr(C)` structs of atomics that fit in `len`.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Remove the name from the namespace. Existing mappings (here and in
    /// the peer) stay valid until unmapped.
    pub fn unlink(&self) {
        unsafe {
            libc::shm_unlink(self.name.as_ptr());
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

// ── SharedControl ─────────────────────────────────────────────────────────────

/// Cross-process experiment control block.
#[repr(C)]
struct ControlBlock {
    /// Nonzero while the controller wants every synthetic task to leave its
    /// superloop. Written only by the Master controller.
    stop: AtomicU32,
    /// Common activation epoch, snapshotted by the Master immediately
    /// before each start broadcast.
    initial_time: AtomicU64,
    /// Start-broadcast sequence; also the futex word tasks sleep on.
    start_seq: AtomicU32,
}

/// Handle to the per-namespace control region shared by the two peers.
///
/// Replaces three named objects of the reference implementation (stop-flag
/// heap, initial-time heap, start condition variable) with one region and a
/// futex sequence word. The broadcast is edge-triggered: a waiter records
/// the sequence with [`SharedControl::start_epoch`] and then sleeps until it
/// moves, so a task that reaches its wait after the broadcast of a previous
/// step does not start spuriously.
#[derive(Debug)]
pub struct SharedControl {
    region: SharedRegion,
}

impl SharedControl {
    /// Open (or create) the control region for `namespace`.
    ///
    /// The Master passes `owner = true` and resets the stop flag and epoch,
    /// which also clears state left behind by a crashed previous run.
    pub fn open(namespace: &str, owner: bool) -> BenchResult<Self> {
        let region = SharedRegion::create_or_bind(
            &format!("{namespace}_ctrl"),
            std::mem::size_of::<ControlBlock>(),
        )?;
        let ctrl = Self { region };
        if owner {
            ctrl.block().stop.store(0, Ordering::Release);
            ctrl.block().initial_time.store(0, Ordering::Release);
        }
        Ok(ctrl)
    }

    fn block(&self) -> &ControlBlock {
        unsafe { &*(self.region.as_ptr() as *const ControlBlock) }
    }

    /// Current stop-flag value; read by every task at its superloop tail.
    pub fn is_stopped(&self) -> bool {
        self.block().stop.load(Ordering::Acquire) != 0
    }

    /// Set or clear the stop flag. Controller-only.
    pub fn set_stop(&self, stop: bool) {
        self.block().stop.store(stop as u32, Ordering::Release);
    }

    /// The shared activation epoch for the current step.
    pub fn initial_time(&self) -> Tick {
        self.block().initial_time.load(Ordering::Acquire)
    }

    /// Snapshot the activation epoch. Controller-only, once per step,
    /// immediately before [`SharedControl::broadcast_start`].
    pub fn set_initial_time(&self, t: Tick) {
        self.block().initial_time.store(t, Ordering::Release);
    }

    /// Observe the broadcast sequence before going to sleep.
    pub fn start_epoch(&self) -> u32 {
        self.block().start_seq.load(Ordering::Acquire)
    }

    /// Block until the sequence moves past `epoch`.
    pub fn wait_start(&self, epoch: u32) {
        let seq = &self.block().start_seq;
        while seq.load(Ordering::Acquire) == epoch {
            futex_wait(seq, epoch);
        }
    }

    /// Wake every task (in both processes) waiting for the step start.
    pub fn broadcast_start(&self) {
        let seq = &self.block().start_seq;
        seq.fetch_add(1, Ordering::AcqRel);
        futex_wake_all(seq);
    }

    /// Remove the region name; used by the owning process at exit.
    pub fn unlink(&self) {
        self.region.unlink();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
