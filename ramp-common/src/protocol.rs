//! Wire protocol between the `ramp` CLI and the `rampd` daemon.
//!
//! JSON lines over the Unix socket: one request object per line, one
//! response object per line. Administrative operations map one-to-one
//! onto single atomic store operations.

use crate::types::{EvaluationResult, FlagDefinition, Stage, TransitionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client request. The `op` field selects the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    /// Is `flag` active for `subject`?
    Evaluate { flag: String, subject: String },
    /// Create a flag in the Disabled stage.
    CreateFlag {
        flag: String,
        #[serde(default)]
        environment: Option<String>,
    },
    /// Manual stage transition (including emergency rollback and the
    /// RolledBack -> Disabled reset).
    SetStage { flag: String, stage: Stage },
    /// Manual percentage increase within Ramping.
    SetPercentage { flag: String, percentage: u8 },
    /// Replace the allow/deny lists.
    SetLists {
        flag: String,
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        deny: Vec<String>,
    },
    /// Permanently disable a flag while keeping it resident for audit.
    ArchiveFlag { flag: String },
    /// Fetch one definition.
    GetFlag { flag: String },
    /// List definitions, optionally scoped to an environment.
    ListFlags {
        #[serde(default)]
        environment: Option<String>,
    },
    /// Transition history for a flag within an optional time range.
    History {
        flag: String,
        #[serde(default)]
        since: Option<DateTime<Utc>>,
        #[serde(default)]
        until: Option<DateTime<Utc>>,
    },
    /// Daemon status summary.
    Status,
}

/// Daemon response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Response {
    Evaluation(EvaluationResult),
    Flag(FlagDefinition),
    Flags(Vec<FlagDefinition>),
    History(Vec<TransitionRecord>),
    Status(DaemonStatus),
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Daemon status summary returned by `Request::Status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub pid: u32,
    pub uptime_seconds: u64,
    pub environment: String,
    pub flags_total: usize,
    /// Flags currently in a monitored stage (Canary/Ramping).
    pub flags_active: usize,
    /// The metrics feed failed on the most recent monitor cycle.
    pub monitor_degraded: bool,
}
