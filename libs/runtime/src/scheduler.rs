//! Per-node task list and firing policy
//!
//! The node is driven by one ordered task list. Only its head matters to
//! the driver, which sleeps until [`Scheduler::next_deadline`] and then
//! pops every due task:
//!
//! ```text
//!        trigger / wake           pop_due(now)
//!  idle ───────────────► scheduled ───────────► strategy pass
//!   ▲  (watchdog armed)                              │
//!   └──────────────── no progress ◄──────────────────┘
//!                     progress → trigger(now)
//! ```
//!
//! Strategy passes coalesce: a pending pass at or before the requested
//! time absorbs the request, a later one is moved earlier. Watchdog and
//! maintenance are unique by identity.

use crate::metrics::SchedulerMetrics;
use flow_config::{SchedulerSettings, SchedulerStrategy};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Fire actors and communicate endpoints
    Strategy,
    /// Nothing happened for a long time; re-run the strategy
    Watchdog,
    /// Periodic housekeeping of tunnel bookkeeping
    Maintenance,
    /// Operation deadline, e.g. quiesce timeout
    Deadline(u64),
    /// A request to a peer still owed its reply
    ReplyTimeout(Uuid),
}

#[derive(Debug)]
pub struct Scheduler {
    tasks: BTreeMap<(Instant, u64), Task>,
    seq: u64,
    strategy: SchedulerStrategy,
    fire_budget: Duration,
    watchdog_timeout: Duration,
    maintenance_period: Duration,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(settings: &SchedulerSettings, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            tasks: BTreeMap::new(),
            seq: 0,
            strategy: settings.strategy,
            fire_budget: settings.fire_budget(),
            watchdog_timeout: settings.watchdog_timeout(),
            maintenance_period: settings.maintenance_period(),
            metrics,
        }
    }

    pub fn strategy(&self) -> SchedulerStrategy {
        self.strategy
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn find(&self, task: Task) -> Option<(Instant, u64)> {
        self.tasks.iter().find(|(_, t)| **t == task).map(|(k, _)| *k)
    }

    fn push(&mut self, at: Instant, task: Task) {
        self.seq += 1;
        self.tasks.insert((at, self.seq), task);
    }

    /// Insert a task, coalescing with an equal pending one
    pub fn insert(&mut self, at: Instant, task: Task) {
        match (task, self.find(task)) {
            (Task::Strategy, Some((pending, _))) if pending <= at => {}
            (Task::Strategy, Some(key)) => {
                self.tasks.remove(&key);
                self.push(at, task);
            }
            (Task::Watchdog | Task::Maintenance, Some(_)) => {}
            (Task::Deadline(_) | Task::ReplyTimeout(_), Some(key)) => {
                self.tasks.remove(&key);
                self.push(at, task);
            }
            (_, None) => self.push(at, task),
        }
        trace!(?task, tasks = self.tasks.len(), "Task inserted");
    }

    /// Run a strategy pass as soon as possible
    pub fn trigger(&mut self, now: Instant) {
        self.insert(now, Task::Strategy);
    }

    pub fn cancel(&mut self, task: Task) -> bool {
        match self.find(task) {
            Some(key) => self.tasks.remove(&key).is_some(),
            None => false,
        }
    }

    /// When the driver must wake next
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.keys().next().map(|(at, _)| *at)
    }

    pub fn pop_due(&mut self, now: Instant) -> Option<Task> {
        let key = *self.tasks.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.tasks.remove(&key)
    }

    /// Arm the watchdog unless a strategy pass is already pending
    pub fn arm_watchdog(&mut self, now: Instant) {
        if self.find(Task::Strategy).is_none() {
            self.insert(now + self.watchdog_timeout, Task::Watchdog);
        }
    }

    pub fn schedule_maintenance(&mut self, now: Instant) {
        self.insert(now + self.maintenance_period, Task::Maintenance);
    }

    /// Run one actor's firing steps under the configured policy.
    /// `step` returns true while the actor makes progress. Returns the
    /// number of productive steps.
    pub fn fire_actor(&self, mut step: impl FnMut() -> bool) -> usize {
        let started = Instant::now();
        let mut fired = 0;
        while step() {
            fired += 1;
            self.metrics.record_firing();
            match self.strategy {
                SchedulerStrategy::RoundRobin => break,
                SchedulerStrategy::Simple if started.elapsed() >= self.fire_budget => break,
                SchedulerStrategy::Simple | SchedulerStrategy::NonPreemptive => {}
            }
        }
        fired
    }
}
