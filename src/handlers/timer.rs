//! One-shot timers for the hold-back resolvers.
//!
//! Timers cannot be cancelled once their thread is sleeping, so each armed
//! timer carries a token and the callback validates the token against the
//! slot before acting. A stale fire (the slot was disarmed or re-armed in
//! the meantime) is a no-op.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// Token slot tracking the currently armed timer of a resolver.
#[derive(Debug, Default)]
pub struct TimerSlot {
    next_token: u64,
    armed: Option<u64>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a new timer as armed and returns its token.
    pub fn arm(&mut self) -> u64 {
        self.next_token += 1;
        self.armed = Some(self.next_token);
        self.next_token
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    /// True iff `token` belongs to the currently armed timer.
    pub fn is_current(&self, token: u64) -> bool {
        self.armed == Some(token)
    }
}

/// Runs `callback` on `target` after `delay`, unless the target has been
/// dropped by then. The callback runs with the target's lock held and must
/// perform its own token check via [`TimerSlot::is_current`].
pub fn schedule<T, F>(delay: Duration, target: Weak<Mutex<T>>, callback: F)
where
    T: Send + 'static,
    F: FnOnce(&mut T) + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name("timeout".into())
        .spawn(move || {
            thread::sleep(delay);
            if let Some(target) = Weak::upgrade(&target) {
                callback(&mut target.lock());
            }
        });
    if let Err(e) = spawned {
        log::warn!("failed to spawn a timeout thread: {e}");
    }
}

/// Helper for constructing the shared handler cell together with the weak
/// self reference timered handlers keep for their callbacks.
pub fn new_shared<T, F>(build: F) -> Arc<Mutex<T>>
where
    F: FnOnce(Weak<Mutex<T>>) -> T,
{
    Arc::new_cyclic(|weak| Mutex::new(build(weak.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_tokens_are_rejected() {
        let mut slot = TimerSlot::new();
        let first = slot.arm();
        assert!(slot.is_current(first));

        let second = slot.arm();
        assert!(!slot.is_current(first));
        assert!(slot.is_current(second));

        slot.disarm();
        assert!(!slot.is_current(second));
    }

    #[test]
    fn schedule_fires_on_live_target() {
        let cell = Arc::new(Mutex::new(0u32));
        schedule(Duration::from_millis(5), Arc::downgrade(&cell), |v| *v += 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(*cell.lock(), 1);
    }
}
