use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodic work the main loop knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodicTask {
    /// Connectivity tick of the cloud session.
    Cloud,
    /// Sensor sampling, telemetry and indicator refresh.
    Data,
}

impl PeriodicTask {
    /// Drain order within one loop iteration.
    pub const ALL: [PeriodicTask; 2] = [PeriodicTask::Cloud, PeriodicTask::Data];
}

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A "due" flag raised by a timer and consumed by the main loop.
///
/// Raising is the only thing a timer does: no allocation, no JSON, no calls
/// back into the core.
#[derive(Debug, Clone, Default)]
pub struct DueFlag(Arc<AtomicBool>);

impl DueFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Check and clear in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cooperative, non-preemptive scheduler.
///
/// Each registered task gets a timer that raises its [`DueFlag`]; the main
/// loop calls [`Scheduler::drain_due`] once per iteration and runs each due
/// task body to completion before looking at the next.
#[derive(Debug, Default)]
pub struct Scheduler {
    flags: HashMap<PeriodicTask, DueFlag>,
    timers: HashMap<PeriodicTask, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let flags = PeriodicTask::ALL
            .into_iter()
            .map(|task| (task, DueFlag::default()))
            .collect();
        Scheduler {
            flags,
            timers: HashMap::new(),
        }
    }

    /// Arm (or re-arm) the timer for `task`. A previous timer for the same
    /// task is cancelled, so a task never has more than one timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_periodic(&mut self, task: PeriodicTask, period: Duration) {
        if period < MIN_PERIOD {
            warn!(?task, "Periodic task period below 1 ms, clamping");
        }
        let period = period.max(MIN_PERIOD);
        let flag = self.flag(task);
        let timer = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                flag.raise();
            }
        });

        if let Some(previous) = self.timers.insert(task, timer) {
            previous.abort();
        }
        debug!(?task, period_ms = period.as_millis() as u64, "Periodic task armed");
    }

    pub fn is_armed(&self, task: PeriodicTask) -> bool {
        self.timers.contains_key(&task)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    pub fn flag(&mut self, task: PeriodicTask) -> DueFlag {
        self.flags.entry(task).or_default().clone()
    }

    /// Clear and return every due task, in [`PeriodicTask::ALL`] order.
    pub fn drain_due(&mut self) -> Vec<PeriodicTask> {
        PeriodicTask::ALL
            .into_iter()
            .filter(|task| self.flags.get(task).is_some_and(DueFlag::take))
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_flag_take_clears() {
        let flag = DueFlag::default();
        assert!(!flag.take());
        flag.raise();
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn test_drain_due_runs_each_task_once_in_order() {
        let mut scheduler = Scheduler::new();
        scheduler.flag(PeriodicTask::Data).raise();
        scheduler.flag(PeriodicTask::Cloud).raise();

        assert_eq!(
            scheduler.drain_due(),
            vec![PeriodicTask::Cloud, PeriodicTask::Data]
        );
        assert!(scheduler.drain_due().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_raises_flag_each_period() {
        let mut scheduler = Scheduler::new();
        scheduler.register_periodic(PeriodicTask::Data, Duration::from_millis(1000));
        tokio::task::yield_now().await;
        assert!(scheduler.drain_due().is_empty());

        time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(scheduler.drain_due(), vec![PeriodicTask::Data]);

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(scheduler.drain_due(), vec![PeriodicTask::Data]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_still_raises_flag() {
        let mut scheduler = Scheduler::new();
        scheduler.register_periodic(PeriodicTask::Cloud, Duration::ZERO);
        time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.drain_due(), vec![PeriodicTask::Cloud]);
        assert!(scheduler.is_armed(PeriodicTask::Cloud));
    }

    #[tokio::test]
    async fn test_rearm_replaces_timer() {
        let mut scheduler = Scheduler::new();
        scheduler.register_periodic(PeriodicTask::Cloud, Duration::from_millis(500));
        scheduler.register_periodic(PeriodicTask::Cloud, Duration::from_millis(500));
        scheduler.register_periodic(PeriodicTask::Data, Duration::from_millis(1000));

        assert!(scheduler.is_armed(PeriodicTask::Cloud));
        assert!(scheduler.is_armed(PeriodicTask::Data));
        assert_eq!(scheduler.armed_count(), 2);
    }
}
