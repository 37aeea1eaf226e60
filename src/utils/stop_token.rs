use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

const RUN: u8 = 0;
const STOP: u8 = 1;
const KILL: u8 = 2;

/// Shared stop state. Each state may have a parent, so raising a
/// parent is observed by every descendant. The mode only moves up.
struct StopState {
    mode: AtomicU8,
    parent: Option<Arc<StopState>>,
}

impl StopState {
    fn mode(&self) -> u8 {
        let own = self.mode.load(Ordering::Relaxed);
        match &self.parent {
            Some(p) => own.max(p.mode()),
            None => own,
        }
    }

    fn raise(&self, mode: u8) {
        self.mode.fetch_max(mode, Ordering::Relaxed);
    }
}

/// Two-level stop signal shared across the control plane.
///
/// `stop` requests an orderly drain; `kill` discards in-flight work.
/// A token can be cloned cheaply and checked at any time; children are
/// raised together with their parent and never lower their mode.
#[derive(Clone)]
pub struct StopToken {
    state: Arc<StopState>,
}

impl StopToken {
    /// Create a new root token in the running state.
    pub fn new_root() -> Self {
        Self {
            state: Arc::new(StopState {
                mode: AtomicU8::new(RUN),
                parent: None,
            }),
        }
    }

    /// Create a child token linked to this one.
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(StopState {
                mode: AtomicU8::new(RUN),
                parent: Some(self.state.clone()),
            }),
        }
    }

    /// Request an orderly stop (drain, then exit).
    #[inline]
    pub fn stop(&self) {
        self.state.raise(STOP);
    }

    /// Request immediate termination (discard in-flight work).
    #[inline]
    pub fn kill(&self) {
        self.state.raise(KILL);
    }

    /// True once `stop` or `kill` was requested here or on an ancestor.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state.mode() >= STOP
    }

    /// True once `kill` was requested here or on an ancestor.
    #[inline]
    pub fn is_killed(&self) -> bool {
        self.state.mode() >= KILL
    }

    /// Sleep until the token leaves the running state or `total` elapses.
    /// Returns `true` if the full duration passed while still running.
    pub fn sleep_while_running(&self, total: Duration) -> bool {
        let tick = Duration::from_millis(20);
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.is_stopped() {
                return false;
            }
            std::thread::sleep(tick.min(total - slept));
            slept += tick;
        }
        !self.is_stopped()
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("is_stopped", &self.is_stopped())
            .field("is_killed", &self.is_killed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_raises_children() {
        let root = StopToken::new_root();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_stopped());
        root.stop();
        assert!(child.is_stopped());
        assert!(grandchild.is_stopped());
        assert!(!grandchild.is_killed());

        root.kill();
        assert!(grandchild.is_killed());
    }

    #[test]
    fn child_does_not_raise_parent() {
        let root = StopToken::new_root();
        let child = root.child();

        child.kill();
        assert!(child.is_killed());
        assert!(!root.is_stopped());
    }

    #[test]
    fn mode_never_lowers() {
        let token = StopToken::new_root();
        token.kill();
        token.stop();
        assert!(token.is_killed());
    }
}
