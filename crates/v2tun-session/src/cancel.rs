//! Generation-based cancellation.
//!
//! Every `Start`, `Stop` and revocation bumps a shared generation counter
//! before it is queued. Work started under an older generation observes the
//! bump and unwinds, so a `Stop` takes effect even while a `Start` is still
//! establishing the interface or retrying the descriptor handoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Observes whether the generation it was issued for is still current.
#[derive(Debug, Clone)]
pub struct CancelToken {
    current: Arc<AtomicU64>,
    issued: u64,
}

impl CancelToken {
    /// Create a token for generation `issued` of `current`.
    pub fn new(current: Arc<AtomicU64>, issued: u64) -> Self {
        Self { current, issued }
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::new(Arc::new(AtomicU64::new(0)), 0)
    }

    /// Generation this token belongs to.
    pub fn generation(&self) -> u64 {
        self.issued
    }

    /// Has a newer command superseded this generation?
    pub fn is_cancelled(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.issued
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        assert!(token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_bump_cancels() {
        let current = Arc::new(AtomicU64::new(3));
        let token = CancelToken::new(current.clone(), 3);
        assert!(!token.is_cancelled());

        current.fetch_add(1, Ordering::SeqCst);
        assert!(token.is_cancelled());
        assert!(!token.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn test_sleep_interrupted_from_other_thread() {
        let current = Arc::new(AtomicU64::new(0));
        let token = CancelToken::new(current.clone(), 0);

        let bumper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            current.fetch_add(1, Ordering::SeqCst);
        });

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        bumper.join().unwrap();
    }
}
