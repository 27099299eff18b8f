//! Error types shared across the Ramp workspace.
//!
//! Evaluation callers never see these: the evaluation path resolves every
//! failure to a safe `false`. They surface on the administrative and
//! monitoring paths, where writers retry and operators get told.

use crate::types::{FlagId, Stage};
use thiserror::Error;

/// Flag store access errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown flag identifier. Evaluation fails closed on this.
    #[error("flag not found: {0}")]
    NotFound(FlagId),

    /// Optimistic-concurrency write race. Always retried by the writer,
    /// never surfaced to evaluation callers.
    #[error("version conflict on {flag}: expected {expected}, stored {actual}")]
    VersionConflict {
        flag: FlagId,
        expected: u64,
        actual: u64,
    },

    /// A create hit an existing definition.
    #[error("flag already exists: {0}")]
    AlreadyExists(FlagId),

    /// Store backend is unreachable or timed out.
    #[error("flag store unavailable: {0}")]
    Unavailable(String),
}

/// Metrics feed errors. The monitor degrades to hold-only mode on these.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Feed cannot be reached. Absence of evidence blocks advancement
    /// but is never treated as evidence of harm.
    #[error("metrics feed unavailable: {0}")]
    Unavailable(String),

    /// Feed returned data the monitor cannot interpret.
    #[error("metrics feed returned malformed data: {0}")]
    Malformed(String),
}

/// Stage transition errors.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The requested edge does not exist in the state machine.
    #[error("invalid transition for {flag}: {from} -> {to}")]
    Invalid {
        flag: FlagId,
        from: Stage,
        to: Stage,
    },

    /// The flag is archived; only audit reads remain valid.
    #[error("flag is archived: {0}")]
    Archived(FlagId),

    /// A percentage change that is not an increase within 0-100.
    #[error("invalid percentage for {flag}: {requested} (current {current})")]
    InvalidPercentage {
        flag: FlagId,
        current: u8,
        requested: u8,
    },

    /// Another writer already applied an equivalent-or-stronger decision;
    /// the caller should abandon its cycle.
    #[error("transition already satisfied for {0}")]
    AlreadySatisfied(FlagId),

    /// Conflict retries ran out without a committed write.
    #[error("transition for {flag} abandoned after {attempts} version conflicts")]
    RetriesExhausted { flag: FlagId, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
