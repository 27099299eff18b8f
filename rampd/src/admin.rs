//! Administrative operations on flags.
//!
//! Each operation is a single atomic store operation: stage changes go
//! through the transition engine (versioned write + audit record), list
//! edits and archival are versioned definition updates retried on
//! conflict.

use crate::rollout::{TransitionEngine, TransitionRequest};
use crate::store::FlagStore;
use ramp_common::errors::{StoreError, TransitionError};
use ramp_common::types::{FlagDefinition, FlagId, Stage, TransitionCause};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Definition-update conflict retries. These writes carry no decision
/// state, so losing a race is always safe to replay.
const MAX_UPDATE_RETRIES: u32 = 5;

/// Operator-facing service wrapping the store and transition engine.
pub struct AdminService {
    store: Arc<FlagStore>,
    engine: Arc<TransitionEngine>,
    environment: String,
}

impl AdminService {
    pub fn new(store: Arc<FlagStore>, engine: Arc<TransitionEngine>, environment: String) -> Self {
        Self {
            store,
            engine,
            environment,
        }
    }

    /// Create a flag in the Disabled stage.
    pub fn create_flag(
        &self,
        id: FlagId,
        environment: Option<String>,
    ) -> Result<FlagDefinition, StoreError> {
        let environment = environment.unwrap_or_else(|| self.environment.clone());
        let def = FlagDefinition::new(id.clone(), environment);
        let def = self.store.create(def)?;
        info!("Created flag {} in {} (disabled)", id, def.environment);
        Ok(def)
    }

    /// Manual stage transition, including emergency rollback and the
    /// RolledBack -> Disabled reset.
    pub async fn set_stage(
        &self,
        id: &FlagId,
        stage: Stage,
    ) -> Result<FlagDefinition, TransitionError> {
        let request = if stage == Stage::RolledBack {
            TransitionRequest::Rollback {
                cause: TransitionCause::Manual,
                trigger: None,
            }
        } else {
            TransitionRequest::SetStage {
                to: stage,
                cause: TransitionCause::Manual,
            }
        };
        self.engine.apply(id, request).await?;
        Ok(self.store.get(id)?)
    }

    /// Manual percentage increase within Ramping.
    pub async fn set_percentage(
        &self,
        id: &FlagId,
        percentage: u8,
    ) -> Result<FlagDefinition, TransitionError> {
        self.engine
            .apply(
                id,
                TransitionRequest::SetPercentage {
                    percentage,
                    cause: TransitionCause::Manual,
                },
            )
            .await?;
        Ok(self.store.get(id)?)
    }

    /// Replace the allow and deny lists. Not a stage transition: no
    /// TransitionRecord, just a versioned definition update.
    pub fn set_lists(
        &self,
        id: &FlagId,
        allow: BTreeSet<String>,
        deny: BTreeSet<String>,
    ) -> Result<FlagDefinition, StoreError> {
        self.update_definition(id, |def| {
            def.allow_list = allow.clone();
            def.deny_list = deny.clone();
        })
    }

    /// Archive a flag: permanently Disabled, kept resident for audit
    /// continuity. Idempotent.
    pub fn archive_flag(&self, id: &FlagId) -> Result<FlagDefinition, StoreError> {
        let def = self.update_definition(id, |def| {
            def.stage = Stage::Disabled;
            def.percentage = 0;
            def.archived = true;
        })?;
        info!("Archived flag {}", id);
        Ok(def)
    }

    /// Read one definition.
    pub fn get_flag(&self, id: &FlagId) -> Result<FlagDefinition, StoreError> {
        self.store.get(id)
    }

    /// List definitions, optionally scoped to an environment.
    pub fn list_flags(&self, environment: Option<&str>) -> Vec<FlagDefinition> {
        self.store.list(environment)
    }

    /// Versioned read-modify-write with conflict retry.
    fn update_definition(
        &self,
        id: &FlagId,
        mutate: impl Fn(&mut FlagDefinition),
    ) -> Result<FlagDefinition, StoreError> {
        let mut attempt = 0;
        loop {
            let def = self.store.get(id)?;
            let mut next = def.clone();
            mutate(&mut next);
            match self.store.put(id, def.version, next) {
                Ok(stored) => return Ok(stored),
                Err(StoreError::VersionConflict { .. }) if attempt < MAX_UPDATE_RETRIES => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
