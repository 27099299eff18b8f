//! Core types for flag definitions, rollout stages, and audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique, stable identifier for a feature flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlagId(pub String);

impl FlagId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FlagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle stage of a flag's rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Flag is off for everyone outside the allow-list.
    Disabled,
    /// Allow-list only testing; percentage pinned at 0.
    Canary,
    /// Percentage increases along the ramp schedule.
    Ramping,
    /// Released; percentage locked at 100.
    Full,
    /// Automatic or emergency recovery state. Absorbing until a manual
    /// reset to Disabled.
    RolledBack,
}

impl Stage {
    /// Stages the health monitor actively watches.
    pub fn is_monitored(self) -> bool {
        matches!(self, Self::Canary | Self::Ramping)
    }

    /// Stages from which a rollback is reachable.
    pub fn can_roll_back(self) -> bool {
        !matches!(self, Self::Disabled | Self::RolledBack)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Canary => write!(f, "canary"),
            Self::Ramping => write!(f, "ramping"),
            Self::Full => write!(f, "full"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "canary" => Ok(Self::Canary),
            "ramping" => Ok(Self::Ramping),
            "full" => Ok(Self::Full),
            "rolled_back" | "rolled-back" => Ok(Self::RolledBack),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// Why a stage transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Explicit operator action.
    Manual,
    /// Ramp schedule advanced a percentage step.
    ScheduledRamp,
    /// Health monitor detected sustained degradation.
    AutoRollback,
}

impl TransitionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::ScheduledRamp => "scheduled_ramp",
            Self::AutoRollback => "auto_rollback",
        }
    }
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable definition of a feature flag. One record per flag identifier
/// in the store; the `version` counter drives optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDefinition {
    /// Stable flag identifier.
    pub id: FlagId,
    /// Current rollout stage.
    pub stage: Stage,
    /// Rollout percentage (0-100). Meaningful only in Canary/Ramping.
    pub percentage: u8,
    /// Subjects always included regardless of percentage.
    #[serde(default)]
    pub allow_list: BTreeSet<String>,
    /// Subjects always excluded. Wins over the allow-list.
    #[serde(default)]
    pub deny_list: BTreeSet<String>,
    /// Deployment environment this definition applies to.
    pub environment: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Monotonically increasing version for optimistic concurrency.
    pub version: u64,
    /// Soft-deleted. Archived flags never evaluate true but stay
    /// resident so historical transition records keep resolving.
    #[serde(default)]
    pub archived: bool,
}

impl FlagDefinition {
    /// Create a fresh definition in the Disabled stage.
    pub fn new(id: FlagId, environment: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            stage: Stage::Disabled,
            percentage: 0,
            allow_list: BTreeSet::new(),
            deny_list: BTreeSet::new(),
            environment: environment.into(),
            created_at: now,
            updated_at: now,
            version: 1,
            archived: false,
        }
    }
}

/// Outcome of a single flag evaluation. Ephemeral: produced per request,
/// never persisted unless a caller explicitly logs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub flag: FlagId,
    pub subject: String,
    /// The decision: is the guarded code path active for this subject.
    pub enabled: bool,
    /// Stage observed at decision time.
    pub stage: Stage,
    /// Bucket value in basis points [0, 10000), present only when the
    /// percentage test was actually consulted.
    pub bucket: Option<u16>,
}

/// Metric kinds the health monitor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ErrorRate,
    LatencyP99,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorRate => write!(f, "error_rate"),
            Self::LatencyP99 => write!(f, "latency_p99"),
        }
    }
}

/// One named sample from the external metrics feed. Produced outside the
/// engine; consumed read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub flag: FlagId,
    pub metric: MetricKind,
    pub value: f64,
    /// Reference value supplied by the feed. The monitor prefers its own
    /// baseline captured at Canary entry and falls back to this when no
    /// capture exists (e.g. after a daemon restart mid-ramp).
    pub baseline: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of one stage transition. Forms the audit trail;
/// never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub flag: FlagId,
    pub from: Stage,
    pub to: Stage,
    pub cause: TransitionCause,
    pub timestamp: DateTime<Utc>,
    /// The health sample that tripped an automatic rollback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<HealthSample>,
}

impl TransitionRecord {
    pub fn new(
        flag: FlagId,
        from: Stage,
        to: Stage,
        cause: TransitionCause,
        trigger: Option<HealthSample>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flag,
            from,
            to,
            cause,
            timestamp: Utc::now(),
            trigger,
        }
    }
}

/// Default ramp percentage steps.
const DEFAULT_RAMP_STEPS: [u8; 4] = [5, 25, 50, 100];

/// Operator- or policy-defined percentage schedule for the Ramping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampSchedule {
    /// Strictly increasing percentage steps, last step 100.
    pub steps: Vec<u8>,
}

impl Default for RampSchedule {
    fn default() -> Self {
        Self {
            steps: DEFAULT_RAMP_STEPS.to_vec(),
        }
    }
}

impl RampSchedule {
    pub fn new(steps: Vec<u8>) -> Self {
        Self { steps }
    }

    /// First step of the schedule, used when a flag enters Ramping.
    pub fn first_step(&self) -> u8 {
        self.steps.first().copied().unwrap_or(100)
    }

    /// Next step strictly above the current percentage, or `None` when
    /// the schedule is exhausted.
    pub fn next_step(&self, current: u8) -> Option<u8> {
        self.steps.iter().copied().find(|&step| step > current)
    }

    /// Schedule sanity problems, reported as startup warnings.
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.steps.is_empty() {
            warnings.push("ramp schedule has no steps; Ramping will jump straight to Full".into());
            return warnings;
        }
        if !self.steps.windows(2).all(|w| w[0] < w[1]) {
            warnings.push("ramp schedule steps are not strictly increasing".into());
        }
        if self.steps.iter().any(|&s| s > 100) {
            warnings.push("ramp schedule contains steps above 100".into());
        }
        if self.steps.last() != Some(&100) {
            warnings.push("ramp schedule does not end at 100; Ramping will never auto-complete".into());
        }
        warnings
    }
}
