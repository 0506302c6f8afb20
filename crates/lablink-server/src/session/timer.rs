//! Restartable one-shot deadline timer.
//!
//! Each `start` bumps a generation counter and schedules a task that, once
//! the deadline passes, fires only if it still owns the current generation.
//! The generation check and the transition back to `Disarmed` happen under
//! the same lock that `start`/`stop` take, so for any arm cycle exactly one
//! of "callback runs" or "stop/rearm takes effect" wins.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
enum TimerState {
    Disarmed,
    Armed {
        generation: u64,
        deadline: Instant,
        task: JoinHandle<()>,
    },
}

#[derive(Debug)]
struct TimerInner {
    duration: Duration,
    generation: u64,
    state: TimerState,
}

/// A one-shot countdown reused across many arm/disarm cycles.
///
/// `start` and `stop` must be called from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct DeadlineTimer {
    name: &'static str,
    inner: Arc<Mutex<TimerInner>>,
}

impl DeadlineTimer {
    pub fn new(name: &'static str, duration: Duration) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(TimerInner {
                duration,
                generation: 0,
                state: TimerState::Disarmed,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay used by the next `start`. An already scheduled firing keeps its deadline.
    pub fn set_duration(&self, duration: Duration) {
        self.lock().duration = duration;
    }

    /// Cancel any pending firing and schedule `callback` to run once after
    /// the current duration.
    pub fn start<F>(&self, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if let TimerState::Armed { task, .. } = &inner.state {
            task.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        let deadline = Instant::now() + inner.duration;

        let shared = self.inner.clone();
        let name = self.name;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
                match inner.state {
                    TimerState::Armed { generation: g, .. } if g == generation => {
                        inner.state = TimerState::Disarmed;
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                debug!(timer = name, generation, "timer fired");
                callback.await;
            }
        });

        debug!(timer = name, generation, duration_ms = inner.duration.as_millis() as u64, "timer armed");
        inner.state = TimerState::Armed {
            generation,
            deadline,
            task,
        };
    }

    /// Cancel the pending firing, if any. Safe to call at any time.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let TimerState::Armed {
            generation, task, ..
        } = std::mem::replace(&mut inner.state, TimerState::Disarmed)
        {
            task.abort();
            debug!(timer = self.name, generation, "timer stopped");
        }
    }

    /// Whether a firing is pending.
    pub fn is_active(&self) -> bool {
        matches!(self.lock().state, TimerState::Armed { .. })
    }

    /// Time left until the pending firing.
    pub fn remaining(&self) -> Option<Duration> {
        match &self.lock().state {
            TimerState::Armed { deadline, .. } => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            TimerState::Disarmed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(c: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let timer = DeadlineTimer::new("test", Duration::from_secs(5));
        let fired = counter();
        timer.start(bump(&fired));
        assert!(timer.is_active());

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_active());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_firing() {
        let timer = DeadlineTimer::new("test", Duration::from_secs(1));
        let fired = counter();
        timer.start(bump(&fired));
        timer.stop();
        assert!(!timer.is_active());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let timer = DeadlineTimer::new("test", Duration::from_millis(10));
        timer.stop();
        timer.stop();

        let fired = counter();
        timer.start(bump(&fired));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.stop();
        timer.stop();
        assert!(!timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_callback() {
        let timer = DeadlineTimer::new("test", Duration::from_secs(2));
        let old = counter();
        let new = counter();
        timer.start(bump(&old));
        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.start(bump(&new));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_duration_applies_to_next_start() {
        let timer = DeadlineTimer::new("test", Duration::from_secs(1));
        let fired = counter();
        timer.start(bump(&fired));
        timer.set_duration(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timer.start(bump(&fired));
        assert_eq!(timer.remaining(), Some(Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_may_rearm_its_own_timer() {
        let timer = DeadlineTimer::new("test", Duration::from_secs(1));
        let fired = counter();
        let again = timer.clone();
        let c = fired.clone();
        timer.start(async move {
            c.fetch_add(1, Ordering::SeqCst);
            again.start(async {});
        });
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_active());
    }
}
