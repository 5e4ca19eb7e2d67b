//! Bookkeeping of live schedulers for the "advance everything" driver.
//!
//! The registry holds weak references only. A scheduler adds itself when
//! it gains its first task and removes itself when it runs out of tasks
//! (or is dropped). `tick_all` iterates over a snapshot, so schedulers may
//! deregister mid-iteration.

use crate::scheduler::UpdateReport;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tickworld_env::SchedulerId;
use tracing::debug;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Type-erased view of a scheduler, as seen by the registry driver.
pub trait Tick: Send {
    fn scheduler_id(&self) -> SchedulerId;

    /// Advances one group by one tick.
    fn tick(&mut self, group: &str) -> UpdateReport;

    fn task_count(&self) -> usize;

    fn is_active(&self) -> bool;
}

/// Shared handle to a registered scheduler.
pub type TickHandle = Arc<Mutex<dyn Tick>>;

/// Aggregate of one `tick_all` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Schedulers visited
    pub schedulers: usize,

    /// Tasks fired across all schedulers
    pub fired: usize,

    /// Tasks removed (completed or cancelled)
    pub removed: usize,

    /// Schedulers that went idle and left the registry
    pub went_idle: usize,
}

/// Process-wide set of live schedulers.
///
/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    entries: Arc<Mutex<BTreeMap<SchedulerId, Weak<Mutex<dyn Tick>>>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, id: SchedulerId, scheduler: Weak<Mutex<dyn Tick>>) {
        let mut entries = lock(&self.entries);
        if entries.insert(id, scheduler).is_none() {
            debug!("registry: scheduler {} registered", id);
        }
    }

    pub(crate) fn remove(&self, id: SchedulerId) {
        let mut entries = lock(&self.entries);
        if entries.remove(&id).is_some() {
            debug!("registry: scheduler {} deregistered", id);
        }
    }

    pub fn contains(&self, id: SchedulerId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Ids of every registered scheduler, in id order.
    pub fn ids(&self) -> Vec<SchedulerId> {
        lock(&self.entries).keys().copied().collect()
    }

    /// Read-only snapshot of the live schedulers.
    ///
    /// Entries whose scheduler has been dropped are pruned on the way.
    pub fn schedulers(&self) -> Vec<TickHandle> {
        let mut entries = lock(&self.entries);
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                live.push(handle);
                true
            }
            None => false,
        });
        live
    }

    /// Advances `group` by one tick on every live scheduler.
    pub fn tick_all(&self, group: &str) -> TickSummary {
        let mut summary = TickSummary::default();

        // The registry lock is released here; schedulers may deregister below.
        for handle in self.schedulers() {
            let report = lock(&handle).tick(group);
            summary.schedulers += 1;
            summary.fired += report.fired.len();
            summary.removed += report.removed;
            if report.idle {
                summary.went_idle += 1;
            }
        }

        summary
    }
}

impl std::fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("schedulers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::task::{SchedulerTask, TaskTiming};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tickworld_env::{ContextKind, Schedulable};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Plain;

    impl ContextKind for Plain {
        fn base(&self) -> Option<Self> {
            None
        }
    }

    #[derive(Default)]
    struct Counter(AtomicU32);

    impl Schedulable for Counter {
        type Kind = Plain;

        fn kind(&self) -> Plain {
            Plain
        }
    }

    fn bump(delay: u64) -> SchedulerTask<Counter> {
        SchedulerTask::from_fn("bump", |ctx: &mut crate::task::TaskContext<'_, Counter>| {
            ctx.owner().0.fetch_add(1, Ordering::SeqCst);
        })
        .with_timing(TaskTiming::one_shot(delay))
    }

    #[test]
    fn test_registration_follows_task_presence() {
        let registry = SchedulerRegistry::new();
        let owner = Arc::new(Counter::default());
        let handle = Scheduler::shared(SchedulerId::from_seed(1), &owner, &registry);

        // Empty schedulers are not tracked
        assert!(registry.is_empty());

        lock(&handle).schedule(bump(1)).unwrap();
        assert!(registry.contains(SchedulerId::from_seed(1)));

        let summary = registry.tick_all("default");
        assert_eq!(summary.fired, 1);
        assert_eq!(summary.went_idle, 1);
        assert!(registry.is_empty());
        assert_eq!(owner.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tick_all_visits_every_scheduler() {
        let registry = SchedulerRegistry::new();
        let owner = Arc::new(Counter::default());
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let handle = Scheduler::shared(SchedulerId::from_seed(i), &owner, &registry);
                lock(&handle).schedule(bump(2)).unwrap();
                handle
            })
            .collect();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.tick_all("default").fired, 0);

        let summary = registry.tick_all("default");
        assert_eq!(summary.schedulers, 3);
        assert_eq!(summary.fired, 3);
        assert_eq!(owner.0.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        drop(handles);
    }

    #[test]
    fn test_dropped_scheduler_leaves_registry() {
        let registry = SchedulerRegistry::new();
        let owner = Arc::new(Counter::default());
        let handle = Scheduler::shared(SchedulerId::from_seed(9), &owner, &registry);
        lock(&handle).schedule(bump(5)).unwrap();
        assert_eq!(registry.len(), 1);

        drop(handle);
        assert!(registry.schedulers().is_empty());
        assert!(registry.is_empty());
    }
}
