use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A request which is ready to be executed, as seen by the [`Dispatcher`][super::Dispatcher].
///
/// The dispatcher only needs to know which host a call is for and whether it has
/// been cancelled. Cancellation is cooperative: the call's own code checks
/// [`is_canceled`][Call::is_canceled] at its checkpoints.
pub struct Call {
    id: u64,
    host: Box<str>,
    canceled: AtomicBool,
}

impl Call {
    /// A new call to `host`.
    pub fn new(host: impl Into<Box<str>>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            host: host.into(),
            canceled: AtomicBool::new(false),
        }
    }

    /// A process-unique identifier for this call.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The host this call is for. Per-host limits are counted by this value.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Request cancellation. Cancelling twice, or cancelling a finished call, is a no-op.
    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            tracing::trace!(call = self.id, host = %self.host, "call canceled");
        }
    }

    /// Has cancellation been requested?
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Call: Send, Sync);

    #[test]
    fn ids_are_unique() {
        let a = Call::new("example.com");
        let b = Call::new("example.com");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.host(), "example.com");
    }

    #[test]
    fn cancel_is_idempotent() {
        let call = Call::new("example.com");
        assert!(!call.is_canceled());
        call.cancel();
        call.cancel();
        assert!(call.is_canceled());
    }
}
