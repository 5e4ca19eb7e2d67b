//! Scheduler tasks: timing state machine, actions and cancellation.
//!
//! A task waits in its group's tick stream. Every tick of that group bumps
//! `elapsed` by one and then checks whether the task is due:
//!
//! ```text
//! one-shot  (periodic_delay <= 0):  elapsed == initial_delay          -> fire, remove
//! periodic  (periodic_delay  > 0):  elapsed >= initial_delay
//!                                   && (elapsed - initial_delay) % periodic_delay == 0
//!                                                                      -> fire, keep waiting
//! ```
//!
//! Cancellation is checked before the counter moves, so a cancelled task
//! never fires again and is dropped at the next update of its group.

use crate::scheduler::SchedulerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tickworld_env::SchedulerId;
use uuid::Uuid;

/// Group used when a task does not name one.
pub const DEFAULT_GROUP: &str = "default";

/// One-way cancellation flag shared between a task and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the task dead. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancelled() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

/// Identity of a task object.
///
/// Copies made with `Clone` keep the id (they are the same task);
/// `SchedulerTask::instantiate` mints a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing parameters and progress of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTiming {
    /// Ticks before the first firing (at least 1)
    pub initial_delay: u64,

    /// Ticks between firings after the first; `<= 0` means one-shot
    pub periodic_delay: i64,

    /// Ticks seen so far in the task's group
    pub elapsed: u64,
}

impl TaskTiming {
    /// Fires once, `delay` ticks from now.
    pub fn one_shot(delay: u64) -> Self {
        Self {
            initial_delay: delay,
            periodic_delay: 0,
            elapsed: 0,
        }
    }

    /// Fires after `initial_delay` ticks and then every `period` ticks.
    pub fn periodic(initial_delay: u64, period: u64) -> Self {
        Self {
            initial_delay,
            periodic_delay: i64::try_from(period).unwrap_or(i64::MAX),
            elapsed: 0,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic_delay > 0
    }

    /// Whether the current `elapsed` value is a firing tick.
    pub fn is_due(&self) -> bool {
        if self.is_periodic() {
            self.elapsed >= self.initial_delay
                && (self.elapsed - self.initial_delay) % self.periodic_delay as u64 == 0
        } else {
            self.elapsed == self.initial_delay
        }
    }

    /// Moves one tick forward and reports whether the task fires on it.
    pub fn advance(&mut self) -> bool {
        self.elapsed = self.elapsed.saturating_add(1);
        self.is_due()
    }

    /// Number of firings a fresh task with this timing produces in `ticks` ticks.
    pub fn firings_within(&self, ticks: u64) -> u64 {
        if ticks < self.initial_delay {
            0
        } else if self.is_periodic() {
            1 + (ticks - self.initial_delay) / self.periodic_delay as u64
        } else {
            1
        }
    }

    /// Same parameters, counter back at zero.
    pub fn reset(&self) -> Self {
        Self {
            elapsed: 0,
            ..*self
        }
    }
}

impl Default for TaskTiming {
    fn default() -> Self {
        Self::one_shot(1)
    }
}

/// The work a task performs when it fires.
///
/// `kind` names the action for persistence: an `ActionFactory` rebuilds a
/// restored task's action from its kind and the value returned by `state`.
pub trait TaskAction<C>: Send {
    /// Stable persistence tag.
    fn kind(&self) -> &str;

    /// Runs the work against the owning context.
    fn execute(&mut self, ctx: &mut TaskContext<'_, C>);

    /// Boxed copy (templates are cloned per scheduler).
    fn clone_action(&self) -> Box<dyn TaskAction<C>>;

    /// Action-specific state to persist alongside the timing fields.
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A `TaskAction` backed by a cloneable closure.
#[derive(Clone)]
pub struct FnAction<F> {
    kind: String,
    f: F,
}

impl<F> FnAction<F> {
    pub fn new(kind: impl Into<String>, f: F) -> Self {
        Self {
            kind: kind.into(),
            f,
        }
    }
}

impl<C, F> TaskAction<C> for FnAction<F>
where
    C: 'static,
    F: FnMut(&mut TaskContext<'_, C>) + Clone + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_, C>) {
        (self.f)(ctx)
    }

    fn clone_action(&self) -> Box<dyn TaskAction<C>> {
        Box::new(self.clone())
    }
}

/// A unit of deferred or repeating work bound to one group.
pub struct SchedulerTask<C> {
    pub(crate) id: TaskId,
    pub(crate) name: Option<String>,
    pub(crate) group: String,
    pub(crate) timing: TaskTiming,
    pub(crate) cancel: CancelToken,
    pub(crate) action: Box<dyn TaskAction<C>>,
}

impl<C: 'static> SchedulerTask<C> {
    /// Creates an unnamed one-shot task in the default group firing on the next tick.
    pub fn new(action: impl TaskAction<C> + 'static) -> Self {
        Self::from_boxed(Box::new(action))
    }

    /// Creates a task from a closure.
    pub fn from_fn<F>(kind: impl Into<String>, f: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_, C>) + Clone + Send + 'static,
    {
        Self::new(FnAction::new(kind, f))
    }

    pub fn from_boxed(action: Box<dyn TaskAction<C>>) -> Self {
        Self {
            id: TaskId::new(),
            name: None,
            group: DEFAULT_GROUP.to_string(),
            timing: TaskTiming::default(),
            cancel: CancelToken::new(),
            action,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_timing(mut self, timing: TaskTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_initial_delay(mut self, ticks: u64) -> Self {
        self.timing.initial_delay = ticks;
        self
    }

    pub fn with_periodic_delay(mut self, ticks: i64) -> Self {
        self.timing.periodic_delay = ticks;
        self
    }

    /// Fresh copy for attaching elsewhere: new id, new token, counter at zero.
    pub fn instantiate(&self) -> Self {
        Self {
            id: TaskId::new(),
            name: self.name.clone(),
            group: self.group.clone(),
            timing: self.timing.reset(),
            cancel: CancelToken::new(),
            action: self.action.clone_action(),
        }
    }

    pub(crate) fn restored(
        name: Option<String>,
        group: String,
        timing: TaskTiming,
        cancelled: bool,
        action: Box<dyn TaskAction<C>>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name,
            group,
            timing,
            cancel: if cancelled {
                CancelToken::cancelled()
            } else {
                CancelToken::new()
            },
            action,
        }
    }
}

impl<C> SchedulerTask<C> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn timing(&self) -> TaskTiming {
        self.timing
    }

    pub fn elapsed(&self) -> u64 {
        self.timing.elapsed
    }

    pub fn initial_delay(&self) -> u64 {
        self.timing.initial_delay
    }

    pub fn periodic_delay(&self) -> i64 {
        self.timing.periodic_delay
    }

    pub fn is_periodic(&self) -> bool {
        self.timing.is_periodic()
    }

    pub fn action_kind(&self) -> &str {
        self.action.kind()
    }

    pub fn action_state(&self) -> serde_json::Value {
        self.action.state()
    }

    /// Idempotently marks the task dead.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle that cancels this task after it has been moved into a scheduler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the task's work once.
    pub fn execute(&mut self, ctx: &mut TaskContext<'_, C>) {
        self.action.execute(ctx);
    }

    /// Name for logs and reports: the task name, or `kind#id` when unnamed.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}#{}", self.action.kind(), &self.id.0.to_string()[..8]),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        if self.timing.initial_delay == 0 {
            return Err(SchedulerError::InvalidInitialDelay(self.timing.initial_delay));
        }
        Ok(())
    }
}

impl<C> Clone for SchedulerTask<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            group: self.group.clone(),
            timing: self.timing,
            cancel: self.cancel.clone(),
            action: self.action.clone_action(),
        }
    }
}

impl<C> std::fmt::Debug for SchedulerTask<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerTask")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("kind", &self.action.kind())
            .field("timing", &self.timing)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Mutable context passed to a task while it fires.
///
/// Gives the action its owning context and lets it schedule or cancel
/// tasks on the same scheduler. New tasks are attached after the current
/// update pass and start counting on the next tick.
pub struct TaskContext<'a, C> {
    owner: &'a C,
    scheduler_id: SchedulerId,
    group: String,
    elapsed: u64,
    current: Option<String>,
    cancel_current: bool,
    names: HashMap<String, CancelToken>,
    pending: Vec<SchedulerTask<C>>,
}

impl<'a, C: 'static> TaskContext<'a, C> {
    pub(crate) fn new(
        owner: &'a C,
        scheduler_id: SchedulerId,
        group: &str,
        names: HashMap<String, CancelToken>,
    ) -> Self {
        Self {
            owner,
            scheduler_id,
            group: group.to_string(),
            elapsed: 0,
            current: None,
            cancel_current: false,
            names,
            pending: Vec::new(),
        }
    }

    /// Detached context for running an action outside a scheduler.
    pub fn detached(owner: &'a C) -> Self {
        Self::new(owner, SchedulerId::from_seed(0), DEFAULT_GROUP, HashMap::new())
    }

    /// The object whose work the task performs.
    pub fn owner(&self) -> &'a C {
        self.owner
    }

    pub fn scheduler_id(&self) -> SchedulerId {
        self.scheduler_id
    }

    /// Group being advanced.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Elapsed tick count of the firing task.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Name of the firing task, if it has one.
    pub fn task_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Attaches `task` after this pass. Rejects names already in use.
    pub fn schedule(&mut self, task: SchedulerTask<C>) -> Result<CancelToken, SchedulerError> {
        task.validate()?;
        if let Some(name) = &task.name {
            if self.names.contains_key(name) {
                return Err(SchedulerError::DuplicateTaskName(name.clone()));
            }
            self.names.insert(name.clone(), task.cancel_token());
        }
        let token = task.cancel_token();
        self.pending.push(task);
        Ok(token)
    }

    /// Cancels the named task on this scheduler. Returns false if unknown.
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.names.get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the firing task once it returns.
    pub fn cancel_self(&mut self) {
        self.cancel_current = true;
    }

    pub(crate) fn begin(&mut self, name: Option<String>, elapsed: u64) {
        self.current = name;
        self.elapsed = elapsed;
        self.cancel_current = false;
    }

    pub(crate) fn take_cancel_self(&mut self) -> bool {
        std::mem::take(&mut self.cancel_current)
    }

    /// Frees a name whose task is about to leave the scheduler.
    pub(crate) fn release(&mut self, name: Option<&str>) {
        if let Some(name) = name {
            self.names.remove(name);
        }
    }

    pub(crate) fn into_pending(self) -> Vec<SchedulerTask<C>> {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fire_ticks(mut timing: TaskTiming, ticks: u64) -> Vec<u64> {
        let mut fired = Vec::new();
        for _ in 0..ticks {
            if timing.advance() {
                fired.push(timing.elapsed);
            }
        }
        fired
    }

    #[test]
    fn test_one_shot_fires_on_delay_tick_only() {
        assert_eq!(fire_ticks(TaskTiming::one_shot(3), 10), vec![3]);
        assert_eq!(fire_ticks(TaskTiming::one_shot(1), 10), vec![1]);
    }

    #[test]
    fn test_negative_period_is_one_shot() {
        let timing = TaskTiming {
            initial_delay: 2,
            periodic_delay: -5,
            elapsed: 0,
        };
        assert!(!timing.is_periodic());
        assert_eq!(fire_ticks(timing, 10), vec![2]);
    }

    #[test]
    fn test_periodic_schedule() {
        assert_eq!(fire_ticks(TaskTiming::periodic(2, 3), 11), vec![2, 5, 8, 11]);
        assert_eq!(fire_ticks(TaskTiming::periodic(3, 1), 6), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_reset_keeps_parameters() {
        let mut timing = TaskTiming::periodic(4, 2);
        timing.advance();
        timing.advance();
        let fresh = timing.reset();
        assert_eq!(fresh.elapsed, 0);
        assert_eq!(fresh.initial_delay, 4);
        assert_eq!(fresh.periodic_delay, 2);
    }

    #[test]
    fn test_cancel_token_is_shared_and_idempotent() {
        let task: SchedulerTask<()> = SchedulerTask::from_fn("noop", |_| {});
        let token = task.cancel_token();
        assert!(!task.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_instantiate_is_independent() {
        let template: SchedulerTask<()> = SchedulerTask::from_fn("noop", |_| {})
            .named("tpl")
            .with_timing(TaskTiming {
                initial_delay: 2,
                periodic_delay: 0,
                elapsed: 1,
            });
        let copy = template.instantiate();

        assert_ne!(copy.id(), template.id());
        assert_eq!(copy.elapsed(), 0);
        assert_eq!(copy.name(), Some("tpl"));

        copy.cancel();
        assert!(!template.is_cancelled());

        // Clone is the same task object
        let same = template.clone();
        assert_eq!(same.id(), template.id());
    }

    #[test]
    fn test_context_rejects_duplicate_names() {
        let owner = ();
        let mut ctx = TaskContext::detached(&owner);
        let first: SchedulerTask<()> = SchedulerTask::from_fn("noop", |_| {}).named("a");
        let second: SchedulerTask<()> = SchedulerTask::from_fn("noop", |_| {}).named("a");

        assert!(ctx.schedule(first).is_ok());
        assert_eq!(
            ctx.schedule(second).unwrap_err(),
            SchedulerError::DuplicateTaskName("a".into())
        );
        assert!(ctx.cancel("a"));
        assert!(!ctx.cancel("b"));
        assert_eq!(ctx.into_pending().len(), 1);
    }

    #[test]
    fn test_zero_initial_delay_is_invalid() {
        let task: SchedulerTask<()> = SchedulerTask::from_fn("noop", |_| {}).with_initial_delay(0);
        assert_eq!(task.validate(), Err(SchedulerError::InvalidInitialDelay(0)));
    }

    proptest! {
        #[test]
        fn prop_fire_count_matches_formula(initial in 1u64..20, period in 1u64..10, extra in 0u64..40) {
            let timing = TaskTiming::periodic(initial, period);
            let ticks = initial + extra;
            prop_assert_eq!(fire_ticks(timing, ticks).len() as u64, timing.firings_within(ticks));
        }

        #[test]
        fn prop_periodic_fires_at_offsets(initial in 1u64..20, period in 1u64..10) {
            let fired = fire_ticks(TaskTiming::periodic(initial, period), initial + 3 * period);
            let expected: Vec<u64> = (0..4).map(|k| initial + k * period).collect();
            prop_assert_eq!(fired, expected);
        }
    }
}
