use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

struct EventState {
    is_set: bool,
    /// Bumped on every transition to set. `wait` uses this to detect a
    /// signal that happened between `reset` and `wait`.
    signal_count: u64,
}

/// Binary event with a generation counter.
///
/// The latch slow paths reset the event, publish their intent to wait, then
/// re-check the lock word; the generation snapshot returned by `reset` makes
/// a `set` that races between the re-check and the `wait` call visible, so
/// the classic missed-wakeup window closes without holding any mutex across
/// the check.
pub struct Event {
    state: StdMutex<EventState>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            state: StdMutex::new(EventState {
                is_set: false,
                signal_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Moves the event to the non-signalled state and returns the current
    /// generation. A later `wait(gen)` returns immediately if `set` ran
    /// after this `reset`.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.is_set = false;
        state.signal_count
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.is_set {
            state.is_set = true;
            state.signal_count += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks until the event is set, unless it has been set since the
    /// `reset` that produced `generation`.
    pub fn wait(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        while !state.is_set && state.signal_count == generation {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// `wait` with an upper bound, for monitor threads. Returns false on
    /// timeout.
    pub fn wait_timeout(&self, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.is_set && state.signal_count == generation {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, res) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
            if res.timed_out() && !state.is_set && state.signal_count == generation {
                return false;
            }
        }
        true
    }

    /// Level-triggered wait: blocks while the event is in the
    /// non-signalled state, regardless of generations.
    pub fn wait_until_set(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.is_set {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().is_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_before_wait_returns_immediately() {
        let event = Event::new();
        let sig = event.reset();
        event.set();
        // Must not block.
        event.wait(sig);
    }

    #[test]
    fn test_stale_generation_does_not_block() {
        let event = Event::new();
        let sig = event.reset();
        event.set();
        let _ = event.reset(); // back to non-signalled, but generation moved
        event.wait(sig);
    }

    #[test]
    fn test_wakes_waiter() {
        let event = Arc::new(Event::new());
        let sig = event.reset();
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(sig))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_timeout() {
        let event = Event::new();
        let sig = event.reset();
        assert!(!event.wait_timeout(sig, Duration::from_millis(10)));
        event.set();
        assert!(event.wait_timeout(sig, Duration::from_millis(10)));
    }
}
