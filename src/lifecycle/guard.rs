//! Liveness token gating every asynchronous continuation.
//!
//! # States
//! ```text
//! Running ──begin_stop()──▶ Stopping   (terminal)
//! ```
//!
//! Each continuation (accept completion, handshake completion, request read
//! completion) calls [`HandlerRunner::try_acquire`] before doing anything
//! else and returns without side effects when it gets `None`. Locks taken
//! before the transition stay valid, so in-flight steps finish normally.
//!
//! The state is one atomic word: the high bit marks *stopping*, the low bits
//! count outstanding [`ScopedLock`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

const STOPPING: u64 = 1 << 63;

/// Server-wide cancellation guard.
///
/// Shared behind an `Arc`; connections hold a `Weak` so a dropped server
/// reads as stopped.
#[derive(Debug)]
pub struct HandlerRunner {
    state: AtomicU64,
    stopping_tx: watch::Sender<bool>,
}

impl HandlerRunner {
    pub fn new() -> Arc<Self> {
        let (stopping_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: AtomicU64::new(0),
            stopping_tx,
        })
    }

    /// Acquire a lock for the synchronous portion of a continuation.
    ///
    /// Returns `None` once [`begin_stop`](Self::begin_stop) has been called,
    /// for every later call.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ScopedLock> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & STOPPING != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(ScopedLock {
                        runner: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Flip to *stopping*. Idempotent.
    pub fn begin_stop(&self) {
        let previous = self.state.fetch_or(STOPPING, Ordering::AcqRel);
        if previous & STOPPING == 0 {
            self.stopping_tx.send_replace(true);
            tracing::debug!(in_flight = previous, "Handler runner stopping");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.state.load(Ordering::Acquire) & STOPPING != 0
    }

    /// Number of locks currently held.
    pub fn active(&self) -> u64 {
        self.state.load(Ordering::Acquire) & !STOPPING
    }

    /// Resolves once the runner has entered *stopping*.
    pub async fn stopped(&self) {
        let mut rx = self.stopping_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

/// Upgrade a weak runner reference and try to lock it.
///
/// A runner that no longer exists behaves like one that is stopping.
pub fn continue_lock(runner: &Weak<HandlerRunner>) -> Option<ScopedLock> {
    runner.upgrade()?.try_acquire()
}

/// Proof that the runner was live when the current step began.
#[derive(Debug)]
pub struct ScopedLock {
    runner: Arc<HandlerRunner>,
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        self.runner.state.fetch_sub(1, Ordering::AcqRel);
    }
}
