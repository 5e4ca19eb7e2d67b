//! Snapshot / restore of schedulers and definitions.
//!
//! The wire schema is explicit and versioned. Every task is reduced to
//! `name, group, initial_delay, periodic_delay, elapsed, cancelled` plus its
//! action kind and action state; restoring rebuilds actions through an
//! `ActionFactory` and re-attaches the scheduler to the registry, so updates
//! resume exactly where an uninterrupted run would be.

use crate::definition::SchedulerDefinition;
use crate::registry::{lock, SchedulerRegistry};
use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle};
use crate::task::{SchedulerTask, TaskAction, TaskTiming};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tickworld_env::{Schedulable, SchedulerId};
use tracing::{debug, info};

/// Current snapshot format.
pub const FORMAT_VERSION: u32 = 1;

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("No action registered for kind {0:?}")]
    UnknownAction(String),

    #[error("Invalid action state for {kind:?}: {reason}")]
    InvalidActionState { kind: String, reason: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Persisted form of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: Option<String>,
    pub group: String,
    pub initial_delay: u64,
    pub periodic_delay: i64,
    pub elapsed: u64,
    pub cancelled: bool,

    /// Action kind used to look up the factory
    pub action: String,

    /// Action-specific state
    #[serde(default)]
    pub state: serde_json::Value,
}

impl TaskRecord {
    pub fn capture<C>(task: &SchedulerTask<C>) -> Self {
        let timing = task.timing();
        Self {
            name: task.name().map(str::to_string),
            group: task.group().to_string(),
            initial_delay: timing.initial_delay,
            periodic_delay: timing.periodic_delay,
            elapsed: timing.elapsed,
            cancelled: task.is_cancelled(),
            action: task.action_kind().to_string(),
            state: task.action_state(),
        }
    }

    pub fn timing(&self) -> TaskTiming {
        TaskTiming {
            initial_delay: self.initial_delay,
            periodic_delay: self.periodic_delay,
            elapsed: self.elapsed,
        }
    }

    pub fn restore<C: 'static>(&self, factory: &ActionFactory<C>) -> Result<SchedulerTask<C>, PersistenceError> {
        let action = factory.build(&self.action, &self.state)?;
        Ok(SchedulerTask::restored(
            self.name.clone(),
            self.group.clone(),
            self.timing(),
            self.cancelled,
            action,
        ))
    }
}

/// Persisted form of a scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub version: u32,
    pub id: SchedulerId,
    pub active: bool,
    pub tasks: Vec<TaskRecord>,
}

impl SchedulerSnapshot {
    pub fn capture<C: Schedulable>(scheduler: &Scheduler<C>) -> Self {
        Self {
            version: FORMAT_VERSION,
            id: scheduler.id(),
            active: scheduler.is_active(),
            tasks: scheduler.tasks().iter().map(TaskRecord::capture).collect(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }

    /// Rebuilds a standalone scheduler for `owner`.
    pub fn restore<C: Schedulable>(
        &self,
        owner: &Arc<C>,
        factory: &ActionFactory<C>,
    ) -> Result<Scheduler<C>, PersistenceError> {
        let mut scheduler = Scheduler::restored(self.id, owner);
        scheduler.load(self.active, self.rebuild_tasks(factory)?)?;
        Ok(scheduler)
    }

    /// Rebuilds a shared scheduler and re-attaches it to `registry`.
    pub fn restore_shared<C: Schedulable>(
        &self,
        owner: &Arc<C>,
        registry: &SchedulerRegistry,
        factory: &ActionFactory<C>,
    ) -> Result<SchedulerHandle<C>, PersistenceError> {
        let tasks = self.rebuild_tasks(factory)?;
        let handle = Scheduler::shared(self.id, owner, registry);
        lock(&handle).load(self.active, tasks)?;
        debug!("scheduler {} restored with {} tasks", self.id, self.tasks.len());
        Ok(handle)
    }

    fn rebuild_tasks<C: Schedulable>(
        &self,
        factory: &ActionFactory<C>,
    ) -> Result<Vec<SchedulerTask<C>>, PersistenceError> {
        self.tasks.iter().map(|record| record.restore(factory)).collect()
    }
}

/// Persisted form of a definition's kind-keyed template table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSnapshot<K> {
    pub version: u32,
    pub name: String,
    pub templates: Vec<(K, Vec<TaskRecord>)>,
}

impl<K> DefinitionSnapshot<K>
where
    K: Serialize + DeserializeOwned + Ord + Clone,
{
    pub fn capture<C>(definition: &SchedulerDefinition<C>) -> Self
    where
        C: Schedulable<Kind = K>,
    {
        let mut kinds: Vec<K> = definition.kinds().cloned().collect();
        kinds.sort();
        let templates = kinds
            .into_iter()
            .map(|kind| {
                let records = definition
                    .registered(kind.clone())
                    .iter()
                    .map(TaskRecord::capture)
                    .collect();
                (kind, records)
            })
            .collect();
        Self {
            version: FORMAT_VERSION,
            name: definition.name().to_string(),
            templates,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }

    pub fn restore<C>(&self, factory: &ActionFactory<C>) -> Result<SchedulerDefinition<C>, PersistenceError>
    where
        C: Schedulable<Kind = K>,
    {
        let mut definition = SchedulerDefinition::new(self.name.clone());
        for (kind, records) in &self.templates {
            for record in records {
                definition.insert_restored(kind.clone(), record.restore(factory)?)?;
            }
        }
        Ok(definition)
    }
}

fn check_version(found: u32) -> Result<(), PersistenceError> {
    if found != FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found,
            expected: FORMAT_VERSION,
        });
    }
    Ok(())
}

type ActionBuilder<C> =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn TaskAction<C>>, PersistenceError> + Send + Sync>;

/// Rebuilds task actions from their persisted kind and state.
pub struct ActionFactory<C> {
    builders: HashMap<String, ActionBuilder<C>>,
}

impl<C: 'static> ActionFactory<C> {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers a builder for `kind`. A later registration replaces an earlier one.
    pub fn register<F>(&mut self, kind: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn TaskAction<C>>, PersistenceError> + Send + Sync + 'static,
    {
        self.builders.insert(kind.into(), Box::new(builder));
        self
    }

    /// Registers a stateless action: every restore gets a clone of `prototype`.
    pub fn register_prototype<A>(&mut self, prototype: A) -> &mut Self
    where
        A: TaskAction<C> + Clone + Sync + 'static,
    {
        let kind = prototype.kind().to_string();
        self.register(kind, move |_| Ok(prototype.clone_action()))
    }

    /// Registers an action whose state round-trips through serde.
    pub fn register_serde<A>(&mut self, kind: impl Into<String>) -> &mut Self
    where
        A: TaskAction<C> + DeserializeOwned + 'static,
    {
        let kind = kind.into();
        let name = kind.clone();
        self.register(kind, move |state| {
            let action: A = serde_json::from_value(state.clone()).map_err(|e| {
                PersistenceError::InvalidActionState {
                    kind: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Box::new(action) as Box<dyn TaskAction<C>>)
        })
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn build(&self, kind: &str, state: &serde_json::Value) -> Result<Box<dyn TaskAction<C>>, PersistenceError> {
        let builder = self
            .builders
            .get(kind)
            .ok_or_else(|| PersistenceError::UnknownAction(kind.to_string()))?;
        builder(state)
    }
}

impl<C: 'static> Default for ActionFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable storage for scheduler snapshots.
///
/// Implementations must be thread-safe.
pub trait SchedulerStore: Send + Sync {
    fn save(&self, snapshot: &SchedulerSnapshot) -> Result<(), PersistenceError>;

    fn load(&self, id: SchedulerId) -> Result<Option<SchedulerSnapshot>, PersistenceError>;

    fn remove(&self, id: SchedulerId) -> Result<(), PersistenceError>;

    /// Ids of every stored snapshot.
    fn ids(&self) -> Result<Vec<SchedulerId>, PersistenceError>;
}

/// Sled-based snapshot store
///
/// Snapshots are keyed by the scheduler's UUID bytes.
pub struct SledSchedulerStore {
    db: sled::Db,
}

impl SledSchedulerStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let db = sled::open(path)
            .map_err(|e| PersistenceError::Storage(format!("Failed to open sled DB: {}", e)))?;
        info!("opened scheduler store ({} snapshots)", db.len());
        Ok(Self { db })
    }

    /// Create a temporary in-memory store (for testing)
    pub fn temporary() -> Result<Self, PersistenceError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| PersistenceError::Storage(format!("Failed to create temp DB: {}", e)))?;
        Ok(Self { db })
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db
            .flush()
            .map_err(|e| PersistenceError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

impl SchedulerStore for SledSchedulerStore {
    fn save(&self, snapshot: &SchedulerSnapshot) -> Result<(), PersistenceError> {
        self.db
            .insert(snapshot.id.as_uuid().as_bytes(), snapshot.encode()?)
            .map_err(|e| PersistenceError::Storage(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    fn load(&self, id: SchedulerId) -> Result<Option<SchedulerSnapshot>, PersistenceError> {
        let value = self
            .db
            .get(id.as_uuid().as_bytes())
            .map_err(|e| PersistenceError::Storage(format!("Get failed: {}", e)))?;
        value.map(|bytes| SchedulerSnapshot::decode(&bytes)).transpose()
    }

    fn remove(&self, id: SchedulerId) -> Result<(), PersistenceError> {
        self.db
            .remove(id.as_uuid().as_bytes())
            .map_err(|e| PersistenceError::Storage(format!("Remove failed: {}", e)))?;
        Ok(())
    }

    fn ids(&self) -> Result<Vec<SchedulerId>, PersistenceError> {
        self.db
            .iter()
            .keys()
            .map(|key| {
                let key = key.map_err(|e| PersistenceError::Storage(format!("Iteration failed: {}", e)))?;
                let bytes = <[u8; 16]>::try_from(&key[..])
                    .map_err(|_| PersistenceError::Storage("Malformed key".to_string()))?;
                Ok(SchedulerId(uuid::Uuid::from_bytes(bytes)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tickworld_env::ContextKind;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    enum Kind {
        Base,
        Special,
    }

    impl ContextKind for Kind {
        fn base(&self) -> Option<Self> {
            match self {
                Kind::Base => None,
                Kind::Special => Some(Kind::Base),
            }
        }
    }

    /// Sums the `amount` of every firing, and remembers the tick it fired on.
    #[derive(Default)]
    struct Ledger {
        total: AtomicU64,
        last_tick: AtomicU64,
    }

    impl Schedulable for Ledger {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            Kind::Special
        }
    }

    #[derive(Clone, Serialize, Deserialize)]
    struct Deposit {
        amount: u64,
    }

    impl TaskAction<Ledger> for Deposit {
        fn kind(&self) -> &str {
            "deposit"
        }

        fn execute(&mut self, ctx: &mut TaskContext<'_, Ledger>) {
            ctx.owner().total.fetch_add(self.amount, Ordering::SeqCst);
            ctx.owner().last_tick.store(ctx.elapsed(), Ordering::SeqCst);
        }

        fn clone_action(&self) -> Box<dyn TaskAction<Ledger>> {
            Box::new(self.clone())
        }

        fn state(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap_or_default()
        }
    }

    fn factory() -> ActionFactory<Ledger> {
        let mut factory = ActionFactory::new();
        factory.register_serde::<Deposit>("deposit");
        factory
    }

    fn populate(scheduler: &mut Scheduler<Ledger>) {
        scheduler
            .schedule(
                SchedulerTask::new(Deposit { amount: 10 })
                    .named("salary")
                    .in_group("economy")
                    .with_timing(TaskTiming::periodic(3, 4)),
            )
            .unwrap();
        scheduler
            .schedule(
                SchedulerTask::new(Deposit { amount: 1 })
                    .named("bonus")
                    .with_timing(TaskTiming::one_shot(5)),
            )
            .unwrap();
        scheduler
            .schedule(
                SchedulerTask::new(Deposit { amount: 1000 })
                    .named("voided")
                    .with_timing(TaskTiming::one_shot(6)),
            )
            .unwrap();
    }

    fn drive(scheduler: &mut Scheduler<Ledger>, ticks: u32) {
        for _ in 0..ticks {
            scheduler.update("economy");
            scheduler.update("default");
        }
    }

    #[test]
    fn test_round_trip_resumes_identically() {
        // Uninterrupted run
        let reference = Arc::new(Ledger::default());
        let mut straight = Scheduler::new(&reference);
        populate(&mut straight);
        drive(&mut straight, 4);
        straight.cancel("voided");
        drive(&mut straight, 16);

        // Interrupted run: snapshot after 4 ticks, restore, continue
        let resumed = Arc::new(Ledger::default());
        let mut first_half = Scheduler::new(&resumed);
        populate(&mut first_half);
        drive(&mut first_half, 4);
        first_half.cancel("voided");

        let bytes = SchedulerSnapshot::capture(&first_half).encode().unwrap();
        drop(first_half);
        let snapshot = SchedulerSnapshot::decode(&bytes).unwrap();
        assert_eq!(snapshot.tasks.len(), 3);
        assert!(snapshot.tasks.iter().any(|t| t.cancelled));

        let mut second_half = snapshot.restore(&resumed, &factory()).unwrap();
        assert_eq!(second_half.task("salary").map(|t| t.elapsed()), Some(4));
        drive(&mut second_half, 16);

        assert_eq!(
            resumed.total.load(Ordering::SeqCst),
            reference.total.load(Ordering::SeqCst)
        );
        assert_eq!(
            resumed.last_tick.load(Ordering::SeqCst),
            reference.last_tick.load(Ordering::SeqCst)
        );
        // salary fired at 3,7,11,15,19 and bonus once
        assert_eq!(reference.total.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn test_inactive_flag_survives() {
        let owner = Arc::new(Ledger::default());
        let mut scheduler = Scheduler::new(&owner);
        populate(&mut scheduler);
        scheduler.set_active(false);

        let snapshot = SchedulerSnapshot::capture(&scheduler);
        let restored = snapshot.restore(&owner, &factory()).unwrap();
        assert!(!restored.is_active());
        assert_eq!(restored.id(), scheduler.id());
    }

    #[test]
    fn test_restore_shared_reregisters() {
        let owner = Arc::new(Ledger::default());
        let mut scheduler = Scheduler::new(&owner);
        populate(&mut scheduler);
        let snapshot = SchedulerSnapshot::capture(&scheduler);

        let registry = SchedulerRegistry::new();
        let handle = snapshot.restore_shared(&owner, &registry, &factory()).unwrap();
        assert!(registry.contains(snapshot.id));
        assert_eq!(lock(&handle).len(), 3);
    }

    #[test]
    fn test_unknown_action_fails() {
        let owner = Arc::new(Ledger::default());
        let mut scheduler = Scheduler::new(&owner);
        populate(&mut scheduler);
        let snapshot = SchedulerSnapshot::capture(&scheduler);

        let err = snapshot.restore(&owner, &ActionFactory::new()).unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownAction(kind) if kind == "deposit"));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let snapshot = SchedulerSnapshot {
            version: FORMAT_VERSION + 1,
            id: SchedulerId::from_seed(3),
            active: true,
            tasks: Vec::new(),
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        assert!(matches!(
            SchedulerSnapshot::decode(&bytes),
            Err(PersistenceError::UnsupportedVersion { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn test_definition_round_trip() {
        let mut definition: SchedulerDefinition<Ledger> = SchedulerDefinition::new("ledgers");
        definition
            .schedule(
                &SchedulerTask::new(Deposit { amount: 5 })
                    .named("interest")
                    .with_timing(TaskTiming::periodic(2, 2)),
                Kind::Base,
            )
            .unwrap();
        definition
            .schedule(
                &SchedulerTask::new(Deposit { amount: 50 }).named("interest"),
                Kind::Special,
            )
            .unwrap();

        let bytes = DefinitionSnapshot::capture(&definition).encode().unwrap();
        let restored = DefinitionSnapshot::<Kind>::decode(&bytes)
            .unwrap()
            .restore(&factory())
            .unwrap();

        assert_eq!(restored.name(), "ledgers");
        assert_eq!(restored.registered(Kind::Base).len(), 1);
        let special = restored.global_task("interest", Kind::Special).unwrap();
        assert_eq!(special.action_state()["amount"], 50);
        let base = restored.global_task("interest", Kind::Base).unwrap();
        assert_eq!(base.periodic_delay(), 2);
    }

    #[test]
    fn test_sled_store() {
        let store = SledSchedulerStore::temporary().unwrap();
        assert!(store.is_empty());

        let owner = Arc::new(Ledger::default());
        let mut scheduler = Scheduler::new(&owner);
        populate(&mut scheduler);
        drive(&mut scheduler, 2);
        let snapshot = SchedulerSnapshot::capture(&scheduler);

        store.save(&snapshot).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.ids().unwrap(), vec![snapshot.id]);
        assert_eq!(store.load(snapshot.id).unwrap(), Some(snapshot.clone()));
        assert_eq!(store.load(SchedulerId::from_seed(99)).unwrap(), None);

        store.remove(snapshot.id).unwrap();
        assert!(store.is_empty());
    }
}
