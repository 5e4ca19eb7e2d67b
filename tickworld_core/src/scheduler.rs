//! The per-context task scheduler.
//!
//! A `Scheduler` owns the tasks attached to one owning context and advances
//! them group by group. It is purely synchronous: `update(group)` runs every
//! due task of that group to completion before returning.

use crate::registry::{SchedulerRegistry, Tick};
use crate::task::{CancelToken, SchedulerTask, TaskAction, TaskContext, TaskTiming};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tickworld_env::{Schedulable, SchedulerId};
use tracing::{debug, trace};

/// Scheduling errors. All of them are programming errors on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task name already in use: {0}")]
    DuplicateTaskName(String),

    #[error("Initial delay must be at least 1 tick (got {0})")]
    InvalidInitialDelay(u64),

    #[error("Template {name:?} already registered for {kind}")]
    DuplicateTemplate { name: String, kind: String },
}

/// Shared, lockable scheduler. This is what the registry points at.
pub type SchedulerHandle<C> = Arc<Mutex<Scheduler<C>>>;

/// Outcome of one `update(group)` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub group: String,

    /// Labels of the tasks that fired, in firing order
    pub fired: Vec<String>,

    /// Tasks detached during this pass
    pub removed: usize,

    /// Scheduler was inactive; nothing moved
    pub skipped: bool,

    /// Scheduler holds no tasks after this pass
    pub idle: bool,
}

impl UpdateReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Default::default()
        }
    }
}

/// Task scheduler bound to one owning context.
///
/// # Invariants
///
/// - A non-null task name is unique inside one scheduler.
/// - Advancing group A never touches tasks of group B.
/// - While inactive, updates are dropped (not queued).
pub struct Scheduler<C: Schedulable> {
    id: SchedulerId,

    /// Held weakly so a context may own its own scheduler
    owner: Weak<C>,

    active: bool,

    /// Attached tasks, in attachment order
    tasks: Vec<SchedulerTask<C>>,

    registry: Option<SchedulerRegistry>,

    /// Weak self-reference handed to the registry
    this: Option<Weak<Mutex<dyn Tick>>>,
}

impl<C: Schedulable> Scheduler<C> {
    /// Creates a standalone scheduler that never registers anywhere.
    pub fn new(owner: &Arc<C>) -> Self {
        Self::detached(SchedulerId::new(), Arc::downgrade(owner))
    }

    fn detached(id: SchedulerId, owner: Weak<C>) -> Self {
        Self {
            id,
            owner,
            active: true,
            tasks: Vec::new(),
            registry: None,
            this: None,
        }
    }

    /// Creates a shared scheduler that registers itself with `registry`
    /// whenever it holds tasks.
    pub fn shared(
        id: SchedulerId,
        owner: &Arc<C>,
        registry: &SchedulerRegistry,
    ) -> SchedulerHandle<C> {
        Self::shared_from(id, Arc::downgrade(owner), registry)
    }

    pub(crate) fn shared_from(
        id: SchedulerId,
        owner: Weak<C>,
        registry: &SchedulerRegistry,
    ) -> SchedulerHandle<C> {
        Arc::new_cyclic(|this: &Weak<Mutex<Scheduler<C>>>| {
            let this: Weak<Mutex<dyn Tick>> = this.clone();
            let mut scheduler = Self::detached(id, owner);
            scheduler.registry = Some(registry.clone());
            scheduler.this = Some(this);
            Mutex::new(scheduler)
        })
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    /// The owning context, if it is still alive.
    pub fn owner(&self) -> Option<Arc<C>> {
        self.owner.upgrade()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Gates every update. Elapsed counters freeze while inactive and pick
    /// up where they left off once reactivated.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            debug!("scheduler {}: active={}", self.id, active);
        }
        self.active = active;
    }

    /// Attaches a task. Rejects a name that is already attached.
    pub fn schedule(&mut self, task: SchedulerTask<C>) -> Result<CancelToken, SchedulerError> {
        task.validate()?;
        if let Some(name) = task.name() {
            if self.task(name).is_some() {
                return Err(SchedulerError::DuplicateTaskName(name.to_string()));
            }
        }
        let token = task.cancel_token();
        self.attach(task);
        Ok(token)
    }

    /// Attaches `action` under `group` with the given delays.
    pub fn schedule_action(
        &mut self,
        action: impl TaskAction<C> + 'static,
        group: &str,
        initial_delay: u64,
        periodic_delay: i64,
    ) -> Result<CancelToken, SchedulerError> {
        let task = SchedulerTask::new(action)
            .in_group(group)
            .with_timing(TaskTiming {
                initial_delay,
                periodic_delay,
                elapsed: 0,
            });
        self.schedule(task)
    }

    fn attach(&mut self, task: SchedulerTask<C>) {
        trace!("scheduler {}: attach {} in {}", self.id, task.label(), task.group());
        let was_empty = self.tasks.is_empty();
        self.tasks.push(task);
        if was_empty {
            self.register();
        }
    }

    /// Advances every task of `group` by one tick and fires the due ones.
    pub fn update(&mut self, group: &str) -> UpdateReport {
        let mut report = UpdateReport::new(group);

        if !self.active {
            report.skipped = true;
            report.idle = self.tasks.is_empty();
            return report;
        }

        let Some(owner) = self.owner.upgrade() else {
            report.removed = self.tasks.len();
            if !self.tasks.is_empty() {
                debug!("scheduler {}: owner dropped, clearing {} tasks", self.id, self.tasks.len());
            }
            self.tasks.clear();
            self.deregister();
            report.idle = true;
            return report;
        };

        let mut ctx = TaskContext::new(owner.as_ref(), self.id, group, self.attached_names());
        let mut finished = vec![false; self.tasks.len()];

        for (index, task) in self.tasks.iter_mut().enumerate() {
            if task.group != group {
                continue;
            }
            if task.is_cancelled() {
                ctx.release(task.name());
                finished[index] = true;
                continue;
            }
            if !task.timing.advance() {
                continue;
            }

            let one_shot = !task.timing.is_periodic();
            if one_shot {
                ctx.release(task.name());
                finished[index] = true;
            }

            ctx.begin(task.name.clone(), task.timing.elapsed);
            task.execute(&mut ctx);
            if ctx.take_cancel_self() {
                task.cancel();
            }
            report.fired.push(task.label());
        }

        let mut index = 0;
        self.tasks.retain(|_| {
            let keep = !finished[index];
            index += 1;
            keep
        });
        report.removed = finished.iter().filter(|done| **done).count();

        // Tasks scheduled during the pass start counting next tick
        for task in ctx.into_pending() {
            self.attach(task);
        }

        if self.tasks.is_empty() {
            self.deregister();
            report.idle = true;
        }

        if !report.fired.is_empty() {
            debug!(
                "scheduler {} [{}]: fired {:?}",
                self.id, group, report.fired
            );
        }
        report
    }

    /// Every attached task, in attachment order.
    pub fn tasks(&self) -> &[SchedulerTask<C>] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&SchedulerTask<C>> {
        self.tasks.iter().find(|t| t.name() == Some(name))
    }

    pub fn tasks_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a SchedulerTask<C>> + 'a {
        self.tasks.iter().filter(move |t| t.group() == group)
    }

    /// Distinct groups with at least one attached task, in first-seen order.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for task in &self.tasks {
            if !groups.iter().any(|g| g == task.group()) {
                groups.push(task.group().to_string());
            }
        }
        groups
    }

    /// Cancels the named task. It leaves at the next update of its group.
    pub fn cancel(&self, name: &str) -> bool {
        match self.task(name) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every attached task.
    pub fn cancel_all(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Restores persisted state. Used by snapshot restore.
    pub(crate) fn load(&mut self, active: bool, tasks: Vec<SchedulerTask<C>>) -> Result<(), SchedulerError> {
        self.active = active;
        for task in tasks {
            self.schedule(task)?;
        }
        Ok(())
    }

    pub(crate) fn restored(id: SchedulerId, owner: &Arc<C>) -> Self {
        Self::detached(id, Arc::downgrade(owner))
    }

    /// Every attached name, cancelled tasks included: a cancelled task keeps
    /// its name until an update of its own group removes it.
    fn attached_names(&self) -> HashMap<String, CancelToken> {
        self.tasks
            .iter()
            .filter_map(|t| t.name().map(|n| (n.to_string(), t.cancel_token())))
            .collect()
    }

    fn register(&self) {
        if let (Some(registry), Some(this)) = (&self.registry, &self.this) {
            registry.add(self.id, this.clone());
        }
    }

    fn deregister(&self) {
        if let Some(registry) = &self.registry {
            registry.remove(self.id);
        }
    }
}

impl<C: Schedulable> Tick for Scheduler<C> {
    fn scheduler_id(&self) -> SchedulerId {
        self.id
    }

    fn tick(&mut self, group: &str) -> UpdateReport {
        self.update(group)
    }

    fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl<C: Schedulable> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl<C: Schedulable> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("tasks", &self.tasks)
            .finish()
    }
}
