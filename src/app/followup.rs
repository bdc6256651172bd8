use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::app::clock::Clock;
use crate::app::error::AppError;

pub type Action = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    due: Instant,
    seq: u64,
    label: String,
    action: Action,
}

struct State {
    pending: Vec<Pending>,
    running: bool,
    next_seq: u64,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes every action due at `now`, oldest first.
    fn take_due(state: &mut State, now: Instant) -> Vec<Pending> {
        let (mut due, later): (Vec<Pending>, Vec<Pending>) =
            state.pending.drain(..).partition(|item| item.due <= now);
        state.pending = later;
        due.sort_by_key(|item| (item.due, item.seq));
        due
    }
}

fn fire(item: Pending) {
    debug!(label = %item.label, "follow-up fired");
    if panic::catch_unwind(AssertUnwindSafe(item.action)).is_err() {
        error!(label = %item.label, "follow-up action panicked");
    }
}

/// Single-shot delayed actions. Nothing is retried; shutdown cancels whatever is left.
pub struct FollowUpScheduler {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl FollowUpScheduler {
    /// Background timer thread fires actions as they come due.
    pub fn spawn(clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        let scheduler = Self::manual(clock);
        let shared = Arc::clone(&scheduler.shared);
        let handle = thread::Builder::new()
            .name("follow-up".to_string())
            .spawn(move || timer_loop(&shared))
            .map_err(|err| AppError::system(format!("Failed to spawn follow-up timer: {err}"), ""))?;
        *scheduler
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(scheduler)
    }

    /// No thread; the owner calls [`FollowUpScheduler::fire_due`].
    pub fn manual(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: Vec::new(),
                    running: true,
                    next_seq: 0,
                }),
                wake: Condvar::new(),
                clock,
            }),
            timer: Mutex::new(None),
        }
    }

    /// Returns false once shut down; the action is dropped unrun.
    pub fn after(&self, delay: Duration, label: impl Into<String>, action: Action) -> bool {
        let label = label.into();
        let mut state = self.shared.lock();
        if !state.running {
            debug!(label = %label, "follow-up rejected after shutdown");
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = self.shared.clock.now() + delay;
        debug!(label = %label, delay_ms = delay.as_millis() as u64, "follow-up scheduled");
        state.pending.push(Pending {
            due,
            seq,
            label,
            action,
        });
        drop(state);
        self.shared.wake.notify_all();
        true
    }

    /// Runs every due action on the calling thread; returns how many ran.
    pub fn fire_due(&self) -> usize {
        let due = {
            let mut state = self.shared.lock();
            if !state.running {
                return 0;
            }
            let now = self.shared.clock.now();
            Shared::take_due(&mut state, now)
        };
        let count = due.len();
        for item in due {
            fire(item);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn shutdown(&self) {
        let cancelled = {
            let mut state = self.shared.lock();
            state.running = false;
            std::mem::take(&mut state.pending)
        };
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "pending follow-ups cancelled");
        }
        drop(cancelled);
        self.shared.wake.notify_all();
        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FollowUpScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if !state.running {
            return;
        }
        let now = shared.clock.now();
        let due = Shared::take_due(&mut state, now);
        if !due.is_empty() {
            drop(state);
            for item in due {
                fire(item);
            }
            state = shared.lock();
            continue;
        }
        let next = state.pending.iter().map(|item| item.due).min();
        state = match next {
            Some(at) => {
                shared
                    .wake
                    .wait_timeout(state, at.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::clock::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn counter_action(counter: &Arc<AtomicUsize>) -> Action {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_once_after_delay() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = FollowUpScheduler::manual(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        assert!(scheduler.after(Duration::from_secs(10), "refresh", counter_action(&fired)));

        clock.advance(Duration::from_secs(9));
        assert_eq!(scheduler.fire_due(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.fire_due(), 1);
        clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.fire_due(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_in_due_order() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = FollowUpScheduler::manual(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, secs) in [("late", 10), ("early", 3), ("mid", 5)] {
            let order = Arc::clone(&order);
            scheduler.after(
                Duration::from_secs(secs),
                label,
                Box::new(move || order.lock().expect("lock").push(label)),
            );
        }
        clock.advance(Duration::from_secs(30));
        assert_eq!(scheduler.fire_due(), 3);
        assert_eq!(*order.lock().expect("lock"), vec!["early", "mid", "late"]);
    }

    #[test]
    fn shutdown_cancels_pending() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = FollowUpScheduler::manual(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.after(Duration::from_secs(3), "refresh", counter_action(&fired));
        assert_eq!(scheduler.pending(), 1);
        scheduler.shutdown();
        assert_eq!(scheduler.pending(), 0);
        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.fire_due(), 0);
        assert!(!scheduler.after(Duration::ZERO, "late", counter_action(&fired)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timer_thread_fires_real_delay() {
        let scheduler = FollowUpScheduler::spawn(Arc::new(SystemClock)).expect("spawn");
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler.after(
            Duration::from_millis(50),
            "ping",
            Box::new(move || tx.send(()).expect("send")),
        );
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
        assert!(start.elapsed() >= Duration::from_millis(50));
        scheduler.shutdown();
    }

    #[test]
    fn panicking_action_does_not_stop_timer() {
        let scheduler = FollowUpScheduler::spawn(Arc::new(SystemClock)).expect("spawn");
        scheduler.after(Duration::ZERO, "boom", Box::new(|| panic!("boom")));
        let (tx, rx) = mpsc::channel();
        scheduler.after(
            Duration::from_millis(10),
            "after-boom",
            Box::new(move || tx.send(()).expect("send")),
        );
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
    }
}
