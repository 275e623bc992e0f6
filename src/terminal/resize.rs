//! Terminal size handoff between the control path and the exec stream
//!
//! Resize frames arrive on the client read path while the exec stream polls
//! for size changes on its own task. The two meet in a single-slot
//! [`ResizeQueue`]: a new size overwrites an unread one, so a burst of
//! resizes collapses to the latest dimensions instead of queueing up.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Terminal size for the remote PTY
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl From<TerminalSize> for kube::api::TerminalSize {
    fn from(size: TerminalSize) -> Self {
        kube::api::TerminalSize {
            width: size.cols,
            height: size.rows,
        }
    }
}

/// One-shot broadcast termination signal.
///
/// The first [`fire`](Self::fire) wins; later calls are no-ops. Every task
/// parked in [`wait`](Self::wait) is woken, and waits that start afterwards
/// return immediately.
#[derive(Debug, Default)]
pub struct DoneSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl DoneSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        let first = self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent fire() between
        // the check and the await is not missed.
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

/// Single-slot, latest-wins rendezvous for terminal sizes
#[derive(Debug, Default)]
pub struct ResizeQueue {
    slot: Mutex<Option<TerminalSize>>,
    notify: Notify,
}

impl ResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a new size, replacing any size the reader has not taken yet.
    /// Never blocks.
    pub fn offer(&self, size: TerminalSize) {
        let replaced = self.slot.lock().replace(size);
        if let Some(stale) = replaced {
            tracing::trace!(?stale, ?size, "Coalesced pending resize");
        }
        self.notify.notify_one();
    }

    /// Take the pending size without waiting
    pub fn try_take(&self) -> Option<TerminalSize> {
        self.slot.lock().take()
    }

    /// Wait for the next size, or `None` once `done` has fired.
    pub async fn next(&self, done: &DoneSignal) -> Option<TerminalSize> {
        loop {
            if done.is_fired() {
                return None;
            }
            if let Some(size) = self.try_take() {
                return Some(size);
            }
            tokio::select! {
                biased;
                _ = done.wait() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}
