//! [`KillSwitch`] – operator abort shared across threads and tasks.
//!
//! The switch is one-way: once tripped it stays tripped for the lifetime of
//! the process. It is the only value that crosses from a plain OS thread (the
//! Ctrl-C handler) into the async world, so it is built from an atomic flag
//! plus a [`Notify`] rather than anything runtime-bound.
//!
//! # Example
//!
//! ```
//! use neogrip_kernel::KillSwitch;
//!
//! let ks = KillSwitch::new();
//! let handle = ks.clone();
//! std::thread::spawn(move || handle.trip()).join().unwrap();
//! assert!(ks.is_tripped());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::warn;

#[derive(Default)]
struct Inner {
    tripped: AtomicBool,
    notify: Notify,
}

/// Cloneable handle onto a process-wide abort flag.
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Inner>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the switch and wake every task awaiting [`KillSwitch::tripped`].
    ///
    /// Returns `true` for the call that actually tripped it. Safe to call from
    /// any thread, including signal handlers' helper threads.
    pub fn trip(&self) -> bool {
        let first = !self.inner.tripped.swap(true, Ordering::SeqCst);
        if first {
            warn!("killswitch tripped");
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Resolve once the switch has been tripped (immediately if it already
    /// was).
    pub async fn tripped(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a trip in between is not lost.
        notified.as_mut().enable();
        if self.is_tripped() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KillSwitch")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}
