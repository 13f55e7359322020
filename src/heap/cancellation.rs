use std::sync::atomic::{AtomicU8, Ordering};

use super::shared_vars::SharedEnumFlag;

/// Why the in-flight concurrent work was asked to stop.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CancelCause {
    /// A mutator ran out of memory; the cycle degenerates.
    AllocFailure,
    /// Collector is shutting down.
    Shutdown,
    /// Concurrent marking exhausted its round budget without reaching a
    /// fixed point; handled exactly like an allocation-failure cancellation.
    MarkBailout,
}

const CANCELLABLE: u8 = 0;
const CANCELLED: u8 = 1;

/// Cooperative cancellation shared by the control loop, the marking workers,
/// and the mutator allocation slow path.
///
/// The flag is only ever *sampled*, never waited on: concurrent-phase code
/// checks it at bounded intervals and unwinds by itself. `clear` is called by
/// the stop-the-world paths once they own the world and no concurrent work can
/// be in flight.
pub struct CancellationToken {
    state: SharedEnumFlag,
    cause: AtomicU8,
}

impl CancellationToken {
    pub const fn new() -> Self {
        Self {
            state: SharedEnumFlag::new(),
            cause: AtomicU8::new(0),
        }
    }

    /// Returns true for the caller that performed the cancellation; later
    /// callers see false and the original cause is kept.
    pub fn try_cancel(&self, cause: CancelCause) -> bool {
        if self.state.cmpxchg(CANCELLABLE, CANCELLED) == CANCELLABLE {
            self.cause.store(cause as u8, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn cancel(&self, cause: CancelCause) {
        self.try_cancel(cause);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.get() == CANCELLED
    }

    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_cancelled() {
            return None;
        }

        Some(match self.cause.load(Ordering::Acquire) {
            x if x == CancelCause::AllocFailure as u8 => CancelCause::AllocFailure,
            x if x == CancelCause::Shutdown as u8 => CancelCause::Shutdown,
            _ => CancelCause::MarkBailout,
        })
    }

    pub fn clear(&self) {
        self.state.set(CANCELLABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cancel_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.cause(), None);

        assert!(token.try_cancel(CancelCause::AllocFailure));
        assert!(!token.try_cancel(CancelCause::Shutdown));
        assert!(token.is_cancelled());
        assert_eq!(token.cause(), Some(CancelCause::AllocFailure));

        token.clear();
        assert!(!token.is_cancelled());
        assert!(token.try_cancel(CancelCause::Shutdown));
        assert_eq!(token.cause(), Some(CancelCause::Shutdown));
    }
}
