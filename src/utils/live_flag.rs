use crossbeam::utils::{Backoff, CachePadded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Cheaply clonable liveness flag raised once a service loop is
/// actually serving. Cache-padded to avoid false sharing with
/// neighbouring counters.
#[derive(Clone)]
#[repr(transparent)]
pub struct LiveFlag(Arc<CachePadded<AtomicBool>>);

impl LiveFlag {
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    #[inline(always)]
    pub fn up(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn down(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Wait until the flag goes up, spinning briefly before sleeping.
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_up(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let backoff = Backoff::new();
        loop {
            if self.is_up() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }
}

impl fmt::Debug for LiveFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveFlag").field("up", &self.is_up()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_observes_raise_from_another_thread() {
        let flag = LiveFlag::new(false);
        let remote = flag.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.up();
        });
        assert!(flag.wait_up(Duration::from_secs(1)));
        handle.join().expect("raiser panicked");
    }

    #[test]
    fn wait_times_out_when_down() {
        let flag = LiveFlag::new(false);
        assert!(!flag.wait_up(Duration::from_millis(20)));
    }
}
