//! Per-kind task templates that every new scheduler starts with.
//!
//! A `SchedulerDefinition` maps an owning-context kind to the templates
//! scheduled for every instance of that kind and of the kinds that
//! specialize it. Resolution walks the kind's lineage from most specific to
//! least specific and keeps one template per task name, so a specialized
//! kind shadows its base's template of the same name.

use crate::registry::SchedulerRegistry;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::task::SchedulerTask;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tickworld_env::{ContextKind, Schedulable, SchedulerId};
use tracing::debug;

/// Registry of task templates keyed by owning-context kind.
pub struct SchedulerDefinition<C: Schedulable> {
    name: String,
    templates: HashMap<C::Kind, Vec<SchedulerTask<C>>>,
}

impl<C: Schedulable> SchedulerDefinition<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            templates: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `task` as a template for every instance of `kind`.
    ///
    /// Registering the same task object twice for one kind is a no-op.
    /// The same object may be registered for several kinds. A different
    /// template reusing a name already registered for this exact kind is
    /// rejected.
    pub fn schedule(&mut self, task: &SchedulerTask<C>, kind: C::Kind) -> Result<(), SchedulerError> {
        task.validate()?;
        let list = self.templates.entry(kind).or_default();

        if list.iter().any(|t| t.id() == task.id()) {
            return Ok(());
        }
        if let Some(name) = task.name() {
            if list.iter().any(|t| t.name() == Some(name)) {
                return Err(SchedulerError::DuplicateTemplate {
                    name: name.to_string(),
                    kind: format!("{:?}", kind),
                });
            }
        }

        debug!("definition {}: {} registered for {:?}", self.name, task.label(), kind);
        list.push(task.clone());
        Ok(())
    }

    /// Removes `task` from `kind` only. Returns false if it was not registered there.
    pub fn remove(&mut self, task: &SchedulerTask<C>, kind: C::Kind) -> bool {
        self.remove_where(kind, |t| t.id() == task.id())
    }

    /// Removes the template called `name` from `kind` only.
    pub fn remove_named(&mut self, name: &str, kind: C::Kind) -> bool {
        self.remove_where(kind, |t| t.name() == Some(name))
    }

    fn remove_where(&mut self, kind: C::Kind, pred: impl Fn(&SchedulerTask<C>) -> bool) -> bool {
        let Some(list) = self.templates.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|t| !pred(t));
        let removed = list.len() != before;
        if list.is_empty() {
            self.templates.remove(&kind);
        }
        removed
    }

    /// The template an instance of `kind` would use for task `name`.
    pub fn global_task(&self, name: &str, kind: C::Kind) -> Option<&SchedulerTask<C>> {
        kind.lineage().into_iter().find_map(|k| {
            self.templates
                .get(&k)
                .and_then(|list| list.iter().find(|t| t.name() == Some(name)))
        })
    }

    /// Templates registered directly on `kind`, in registration order.
    pub fn registered(&self, kind: C::Kind) -> &[SchedulerTask<C>] {
        self.templates.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kinds with at least one registration.
    pub fn kinds(&self) -> impl Iterator<Item = &C::Kind> {
        self.templates.keys()
    }

    /// Every template applicable to `kind`, one per task name.
    ///
    /// Most specific kind first; unnamed templates are all kept.
    pub fn resolve(&self, kind: C::Kind) -> Vec<&SchedulerTask<C>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut resolved = Vec::new();

        for k in kind.lineage() {
            let Some(list) = self.templates.get(&k) else {
                continue;
            };
            for template in list {
                match template.name() {
                    Some(name) => {
                        if seen.insert(name) {
                            resolved.push(template);
                        }
                    }
                    None => resolved.push(template),
                }
            }
        }

        resolved
    }

    /// Builds a standalone scheduler for `owner` holding fresh clones of
    /// every applicable template.
    pub fn instantiate(&self, owner: &Arc<C>) -> Result<Scheduler<C>, SchedulerError> {
        let mut scheduler = Scheduler::new(owner);
        self.populate(&mut scheduler, owner.kind())?;
        Ok(scheduler)
    }

    /// Like `instantiate`, but the scheduler registers with `registry`.
    pub fn realize(
        &self,
        id: SchedulerId,
        owner: &Arc<C>,
        registry: &SchedulerRegistry,
    ) -> Result<SchedulerHandle<C>, SchedulerError> {
        let handle = Scheduler::shared(id, owner, registry);
        {
            let mut scheduler = crate::registry::lock(&handle);
            self.populate(&mut scheduler, owner.kind())?;
        }
        Ok(handle)
    }

    fn populate(&self, scheduler: &mut Scheduler<C>, kind: C::Kind) -> Result<(), SchedulerError> {
        for template in self.resolve(kind) {
            scheduler.schedule(template.instantiate())?;
        }
        Ok(())
    }

    pub(crate) fn insert_restored(&mut self, kind: C::Kind, task: SchedulerTask<C>) -> Result<(), SchedulerError> {
        self.schedule(&task, kind)
    }
}

impl<C: Schedulable> std::fmt::Debug for SchedulerDefinition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerDefinition")
            .field("name", &self.name)
            .field("templates", &self.templates)
            .finish()
    }
}
