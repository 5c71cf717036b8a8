//! Deadline-ordered timers for control-side housekeeping.
//!
//! A [`Housekeeper`] keeps one-shot and periodic jobs on a [`PrioQ`] keyed by
//! deadline. [`run_due`](Housekeeper::run_due) fires every job whose deadline
//! has passed; [`run`](Housekeeper::run) drives that on the tokio runtime
//! until shutdown. The main periodic job is the stale shared memory sweep
//! built by [`shm_reaper`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sonance::config::ShmConfig;
//! use sonance::housekeeping::Housekeeper;
//!
//! # async fn example() {
//! let mut housekeeper = Housekeeper::new();
//! housekeeper.schedule_shm_reaper(ShmConfig::default());
//!
//! let (stop, stopped) = tokio::sync::oneshot::channel();
//! let task = tokio::spawn(housekeeper.run(stopped));
//! // ...
//! let _ = stop.send(());
//! task.await.unwrap();
//! # }
//! ```

use crate::config::ShmConfig;
use crate::defaults::MIN_TIMER_PERIOD;
use crate::memory::SharedSegment;
use crate::observability::{record_timer_fired, span_housekeeper};
use crate::prioq::{PrioQ, PrioqHandle};
use std::cmp::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::Instrument;

/// A housekeeping job.
pub type Job = Box<dyn FnMut() + Send>;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(PrioqHandle);

struct Timer {
    name: String,
    deadline: Instant,
    period: Option<Duration>,
    job: Job,
}

fn by_deadline(a: &Timer, b: &Timer) -> Ordering {
    a.deadline.cmp(&b.deadline)
}

/// Timer list ordered by deadline.
pub struct Housekeeper {
    timers: PrioQ<Timer, fn(&Timer, &Timer) -> Ordering>,
}

impl Default for Housekeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Housekeeper {
    /// Create an empty timer list.
    pub fn new() -> Self {
        Self {
            timers: PrioQ::new(by_deadline as fn(&Timer, &Timer) -> Ordering),
        }
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Returns true if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Run `job` once at `at`.
    pub fn schedule(
        &mut self,
        name: impl Into<String>,
        at: Instant,
        job: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.insert(name.into(), at, None, Box::new(job))
    }

    /// Run `job` every `period`, first one period from now.
    ///
    /// Periods below [`MIN_TIMER_PERIOD`] are raised to it.
    pub fn schedule_periodic(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        job: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let name = name.into();
        if period < MIN_TIMER_PERIOD {
            tracing::warn!(timer = %name, ?period, "timer period too short, clamped");
        }
        let period = period.max(MIN_TIMER_PERIOD);
        self.insert(
            name,
            Instant::now() + period,
            Some(period),
            Box::new(job),
        )
    }

    /// Schedule the stale segment sweep at `config.cleanup_interval`.
    pub fn schedule_shm_reaper(&mut self, config: ShmConfig) -> TimerId {
        let period = config.cleanup_interval;
        self.schedule_periodic("shm-reaper", period, shm_reaper(config))
    }

    fn insert(
        &mut self,
        name: String,
        deadline: Instant,
        period: Option<Duration>,
        job: Job,
    ) -> TimerId {
        tracing::debug!(timer = %name, ?period, "timer scheduled");
        TimerId(self.timers.put(Timer {
            name,
            deadline,
            period,
            job,
        }))
    }

    /// Drop a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.try_remove(id.0).is_some()
    }

    /// Move a timer to a new deadline. Returns false if it no longer exists.
    pub fn reschedule(&mut self, id: TimerId, at: Instant) -> bool {
        let Some(timer) = self.timers.get_mut(id.0) else {
            return false;
        };
        timer.deadline = at;
        self.timers.reshuffle(id.0);
        true
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|t| t.deadline)
    }

    /// Run every job due at `now`. Returns the number of jobs run.
    ///
    /// One-shot timers are removed before their job runs. Periodic timers
    /// are re-armed one period later; a timer that fell more than a period
    /// behind restarts from `now` instead of firing repeatedly. Each periodic
    /// timer fires at most once per call.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        while let Some(handle) = self.timers.peek_handle() {
            let Some(timer) = self.timers.get_mut(handle) else {
                break;
            };
            if timer.deadline > now {
                break;
            }

            match timer.period {
                Some(period) => {
                    timer.deadline += period;
                    if timer.deadline <= now {
                        timer.deadline = now + period;
                    }
                    record_timer_fired(&timer.name);
                    (timer.job)();
                    self.timers.reshuffle(handle);
                }
                None => {
                    let mut timer = self.timers.remove(handle);
                    record_timer_fired(&timer.name);
                    (timer.job)();
                }
            }
            fired += 1;
        }

        fired
    }

    /// Drive the timers until `shutdown` resolves or its sender is dropped.
    ///
    /// Due jobs run on tokio's blocking pool.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        async move {
            tracing::info!(timers = self.len(), "housekeeper started");
            loop {
                let deadline = self.next_deadline();
                let sleep = async move {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                        None => std::future::pending().await,
                    }
                };

                let due = tokio::select! {
                    _ = &mut shutdown => false,
                    _ = sleep => true,
                };
                if !due {
                    break;
                }

                let now = tokio::time::Instant::now().into_std();
                self = match tokio::task::spawn_blocking(move || {
                    self.run_due(now);
                    self
                })
                .await
                {
                    Ok(housekeeper) => housekeeper,
                    Err(e) => {
                        tracing::error!(error = %e, "housekeeping job failed, stopping");
                        return;
                    }
                };
            }
            tracing::info!("housekeeper stopped");
        }
        .instrument(span_housekeeper())
        .await
    }
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper")
            .field("timers", &self.timers.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

/// Build a job sweeping orphaned shared memory segments.
///
/// Failures are logged; the next run tries again.
pub fn shm_reaper(config: ShmConfig) -> impl FnMut() + Send + 'static {
    move || match SharedSegment::cleanup_in(&config) {
        Ok(0) => {}
        Ok(reaped) => tracing::debug!(prefix = %config.prefix, reaped, "shm sweep done"),
        Err(e) => tracing::warn!(prefix = %config.prefix, error = %e, "shm sweep failed"),
    }
}
