//! Named scenarios exercising the scheduler and the router.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// TW-001: one-shot task fires once and detaches
    OneShot,

    /// TW-002: periodic task fire count over d + 3p ticks
    Periodic,

    /// TW-003: advancing one group leaves other groups untouched
    GroupIsolation,

    /// TW-004: deactivated scheduler drops ticks without losing progress
    PauseResume,

    /// TW-005: cancelled task never fires and its scheduler deregisters
    Cancellation,

    /// TW-006: per-kind templates override their base kind's
    Inheritance,

    /// TW-007: snapshot to sled mid-run, resume, compare with a straight run
    SnapshotResume,

    /// TW-008: random traffic over a random tiered topology
    PacketStorm,

    /// TW-009: unreachable destinations are dismissed silently
    DeadEnds,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::OneShot,
            ScenarioId::Periodic,
            ScenarioId::GroupIsolation,
            ScenarioId::PauseResume,
            ScenarioId::Cancellation,
            ScenarioId::Inheritance,
            ScenarioId::SnapshotResume,
            ScenarioId::PacketStorm,
            ScenarioId::DeadEnds,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::OneShot => "one_shot",
            ScenarioId::Periodic => "periodic",
            ScenarioId::GroupIsolation => "group_isolation",
            ScenarioId::PauseResume => "pause_resume",
            ScenarioId::Cancellation => "cancellation",
            ScenarioId::Inheritance => "inheritance",
            ScenarioId::SnapshotResume => "snapshot_resume",
            ScenarioId::PacketStorm => "packet_storm",
            ScenarioId::DeadEnds => "dead_ends",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::OneShot => "One-shot task fires on tick d and leaves the registry",
            ScenarioId::Periodic => "Periodic task fires 4 times in d + 3p ticks",
            ScenarioId::GroupIsolation => "Ticking group g1 never advances group g2",
            ScenarioId::PauseResume => "Inactive scheduler drops ticks, fires exactly once after resume",
            ScenarioId::Cancellation => "Cancelled task never fires; scheduler empties and deregisters",
            ScenarioId::Inheritance => "Server template overrides the Computer template of the same name",
            ScenarioId::SnapshotResume => "Snapshot to sled mid-run; resumed run matches an uninterrupted one",
            ScenarioId::PacketStorm => "Seeded random traffic between devices is always delivered",
            ScenarioId::DeadEnds => "Packets to missing nodes, unlinked and uplink-less networks are dropped",
        }
    }

    /// Returns true if the scenario routes packets.
    pub fn is_routing(&self) -> bool {
        matches!(self, ScenarioId::PacketStorm | ScenarioId::DeadEnds)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one_shot" | "oneshot" | "tw-001" => Ok(ScenarioId::OneShot),
            "periodic" | "tw-002" => Ok(ScenarioId::Periodic),
            "group_isolation" | "groups" | "tw-003" => Ok(ScenarioId::GroupIsolation),
            "pause_resume" | "pause" | "tw-004" => Ok(ScenarioId::PauseResume),
            "cancellation" | "cancel" | "tw-005" => Ok(ScenarioId::Cancellation),
            "inheritance" | "tw-006" => Ok(ScenarioId::Inheritance),
            "snapshot_resume" | "snapshot" | "tw-007" => Ok(ScenarioId::SnapshotResume),
            "packet_storm" | "storm" | "tw-008" => Ok(ScenarioId::PacketStorm),
            "dead_ends" | "deadends" | "tw-009" => Ok(ScenarioId::DeadEnds),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
