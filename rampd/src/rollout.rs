//! Rollout state machine.
//!
//! Stage graph: Disabled -> Canary -> Ramping -> Full, with RolledBack
//! reachable from every non-Disabled stage and absorbing until a manual
//! reset to Disabled.
//!
//! The machine is split in two so the transition rules are testable
//! without timers or I/O:
//!
//! - [`plan_transition`] is a pure function from a definition and a
//!   request to the next definition plus the audit record skeleton.
//! - [`TransitionEngine`] applies a plan with an optimistic-concurrency
//!   write, retrying on version conflicts with jittered backoff. A
//!   losing writer re-reads and either re-plans against the new state or
//!   abandons the cycle when another writer already landed an
//!   equivalent-or-stronger decision.

use crate::audit::AuditLog;
use crate::metrics;
use crate::store::FlagStore;
use rand::RngExt;
use ramp_common::errors::{StoreError, TransitionError};
use ramp_common::types::{
    FlagDefinition, FlagId, HealthSample, RampSchedule, Stage, TransitionCause, TransitionRecord,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Conflict retries before a transition attempt is abandoned. Abandoned
/// attempts are reported, never silently dropped; the monitor re-issues
/// its decision on the next cycle.
const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Base backoff between conflict retries.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// A requested state-machine edge.
#[derive(Debug, Clone)]
pub enum TransitionRequest {
    /// Move to an explicit stage (operator actions, including emergency
    /// rollback and the RolledBack -> Disabled reset).
    SetStage { to: Stage, cause: TransitionCause },
    /// Advance the percentage to the next schedule step; completes to
    /// Full at 100.
    AdvancePercentage { cause: TransitionCause },
    /// Raise the percentage to an explicit value within Ramping.
    SetPercentage { percentage: u8, cause: TransitionCause },
    /// Pull the flag for everyone. Reachable from any non-Disabled stage.
    Rollback {
        cause: TransitionCause,
        trigger: Option<HealthSample>,
    },
}

/// The outcome of planning: the next definition and the audit skeleton.
#[derive(Debug, Clone)]
pub struct PlannedTransition {
    pub next: FlagDefinition,
    pub from: Stage,
    pub to: Stage,
    pub cause: TransitionCause,
    pub trigger: Option<HealthSample>,
}

/// Plan a transition against a current definition. Pure: no clocks, no
/// I/O, no randomness.
pub fn plan_transition(
    def: &FlagDefinition,
    request: &TransitionRequest,
    schedule: &RampSchedule,
) -> Result<PlannedTransition, TransitionError> {
    if def.archived {
        return Err(TransitionError::Archived(def.id.clone()));
    }

    let planned = |next: FlagDefinition, to: Stage, cause: TransitionCause, trigger| {
        PlannedTransition {
            from: def.stage,
            next,
            to,
            cause,
            trigger,
        }
    };

    match *request {
        TransitionRequest::SetStage { to, cause } => {
            let legal = matches!(
                (def.stage, to),
                (Stage::Disabled, Stage::Canary)
                    | (Stage::Canary, Stage::Ramping)
                    | (Stage::Ramping, Stage::Full)
                    | (Stage::RolledBack, Stage::Disabled)
            ) || (to == Stage::RolledBack && def.stage.can_roll_back());

            if !legal {
                if to == Stage::RolledBack && def.stage == Stage::RolledBack {
                    return Err(TransitionError::AlreadySatisfied(def.id.clone()));
                }
                return Err(TransitionError::Invalid {
                    flag: def.id.clone(),
                    from: def.stage,
                    to,
                });
            }

            let mut next = def.clone();
            next.stage = to;
            next.percentage = match to {
                // Canary pins at 0: allow-list only.
                Stage::Canary | Stage::Disabled | Stage::RolledBack => 0,
                Stage::Ramping => schedule.first_step(),
                Stage::Full => 100,
            };
            Ok(planned(next, to, cause, None))
        }

        TransitionRequest::AdvancePercentage { cause } => {
            if def.stage != Stage::Ramping {
                return Err(TransitionError::Invalid {
                    flag: def.id.clone(),
                    from: def.stage,
                    to: Stage::Ramping,
                });
            }
            let mut next = def.clone();
            match schedule.next_step(def.percentage) {
                Some(step) if step >= 100 => {
                    next.percentage = 100;
                    next.stage = Stage::Full;
                    Ok(planned(next, Stage::Full, cause, None))
                }
                Some(step) => {
                    next.percentage = step;
                    Ok(planned(next, Stage::Ramping, cause, None))
                }
                // Schedule exhausted below 100: complete the rollout.
                None => {
                    next.percentage = 100;
                    next.stage = Stage::Full;
                    Ok(planned(next, Stage::Full, cause, None))
                }
            }
        }

        TransitionRequest::SetPercentage { percentage, cause } => {
            if def.stage != Stage::Ramping {
                return Err(TransitionError::Invalid {
                    flag: def.id.clone(),
                    from: def.stage,
                    to: Stage::Ramping,
                });
            }
            // Raising only ever adds subjects; a decrease would drop
            // subjects mid-ramp and is not a ramp operation.
            if percentage > 100 || percentage <= def.percentage {
                return Err(TransitionError::InvalidPercentage {
                    flag: def.id.clone(),
                    current: def.percentage,
                    requested: percentage,
                });
            }
            let mut next = def.clone();
            next.percentage = percentage;
            if percentage == 100 {
                next.stage = Stage::Full;
                Ok(planned(next, Stage::Full, cause, None))
            } else {
                Ok(planned(next, Stage::Ramping, cause, None))
            }
        }

        TransitionRequest::Rollback { cause, ref trigger } => {
            if def.stage == Stage::RolledBack {
                // Another writer already landed the same decision.
                return Err(TransitionError::AlreadySatisfied(def.id.clone()));
            }
            if !def.stage.can_roll_back() {
                return Err(TransitionError::Invalid {
                    flag: def.id.clone(),
                    from: def.stage,
                    to: Stage::RolledBack,
                });
            }
            let mut next = def.clone();
            next.stage = Stage::RolledBack;
            next.percentage = 0;
            Ok(planned(next, Stage::RolledBack, cause, trigger.clone()))
        }
    }
}

/// Applies planned transitions to the store with per-flag versioned
/// writes and appends the audit trail.
pub struct TransitionEngine {
    store: Arc<FlagStore>,
    audit: Arc<AuditLog>,
    schedule: RampSchedule,
    max_conflict_retries: u32,
}

impl TransitionEngine {
    pub fn new(store: Arc<FlagStore>, audit: Arc<AuditLog>, schedule: RampSchedule) -> Self {
        Self {
            store,
            audit,
            schedule,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    /// Apply a transition request.
    ///
    /// Returns the committed record, or `Ok(None)` when another writer
    /// already made an equivalent-or-stronger decision and this cycle was
    /// abandoned without side effects. The transition is complete once
    /// the store write succeeds; the audit append runs on its own retry
    /// discipline and never gates the result.
    pub async fn apply(
        &self,
        flag: &FlagId,
        request: TransitionRequest,
    ) -> Result<Option<TransitionRecord>, TransitionError> {
        let mut attempt = 0u32;
        loop {
            let def = self.store.get(flag)?;
            let plan = match plan_transition(&def, &request, &self.schedule) {
                Ok(plan) => plan,
                Err(TransitionError::AlreadySatisfied(_)) => {
                    info!("Transition for {} already satisfied; abandoning cycle", flag);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match self.store.put(flag, def.version, plan.next) {
                Ok(stored) => {
                    let record = TransitionRecord::new(
                        flag.clone(),
                        plan.from,
                        plan.to,
                        plan.cause,
                        plan.trigger,
                    );
                    info!(
                        "Flag {} transitioned {} -> {} at {}% ({})",
                        flag, plan.from, plan.to, stored.percentage, plan.cause
                    );
                    metrics::record_transition(plan.cause, plan.to);
                    self.audit.append(record.clone());
                    return Ok(Some(record));
                }
                Err(StoreError::VersionConflict { actual, .. }) => {
                    attempt += 1;
                    if attempt > self.max_conflict_retries {
                        warn!(
                            "Transition for {} abandoned after {} version conflicts",
                            flag, attempt
                        );
                        return Err(TransitionError::RetriesExhausted {
                            flag: flag.clone(),
                            attempts: attempt,
                        });
                    }
                    let jitter = rand::rng().random_range(0..=CONFLICT_BACKOFF.as_millis() as u64);
                    let backoff = CONFLICT_BACKOFF * attempt + Duration::from_millis(jitter);
                    warn!(
                        "Version conflict on {} (stored v{}); retry {} in {:?}",
                        flag, actual, attempt, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramp_common::types::MetricKind;

    fn def_at(stage: Stage, percentage: u8) -> FlagDefinition {
        let mut def = FlagDefinition::new(FlagId::new("checkout-v2"), "production");
        def.stage = stage;
        def.percentage = percentage;
        def
    }

    fn schedule() -> RampSchedule {
        RampSchedule::default()
    }

    fn set_stage(to: Stage) -> TransitionRequest {
        TransitionRequest::SetStage {
            to,
            cause: TransitionCause::Manual,
        }
    }

    // ── Planner ────────────────────────────────────────────────────────

    #[test]
    fn test_plan_disabled_to_canary_pins_percentage() {
        let plan =
            plan_transition(&def_at(Stage::Disabled, 0), &set_stage(Stage::Canary), &schedule())
                .unwrap();
        assert_eq!(plan.to, Stage::Canary);
        assert_eq!(plan.next.percentage, 0);
    }

    #[test]
    fn test_plan_canary_to_ramping_starts_at_first_step() {
        let plan =
            plan_transition(&def_at(Stage::Canary, 0), &set_stage(Stage::Ramping), &schedule())
                .unwrap();
        assert_eq!(plan.to, Stage::Ramping);
        assert_eq!(plan.next.percentage, 5);
    }

    #[test]
    fn test_plan_ramping_to_full_locks_at_100() {
        let plan =
            plan_transition(&def_at(Stage::Ramping, 50), &set_stage(Stage::Full), &schedule())
                .unwrap();
        assert_eq!(plan.to, Stage::Full);
        assert_eq!(plan.next.percentage, 100);
    }

    #[test]
    fn test_plan_rejects_stage_skips() {
        for (from, to) in [
            (Stage::Disabled, Stage::Ramping),
            (Stage::Disabled, Stage::Full),
            (Stage::Canary, Stage::Full),
            (Stage::Full, Stage::Ramping),
            (Stage::Full, Stage::Canary),
            (Stage::RolledBack, Stage::Canary),
            (Stage::RolledBack, Stage::Full),
        ] {
            let result = plan_transition(&def_at(from, 0), &set_stage(to), &schedule());
            assert!(
                matches!(result, Err(TransitionError::Invalid { .. })),
                "{from} -> {to} should be invalid"
            );
        }
    }

    #[test]
    fn test_plan_rollback_reachable_from_all_active_stages() {
        for from in [Stage::Canary, Stage::Ramping, Stage::Full] {
            let plan = plan_transition(
                &def_at(from, 50),
                &TransitionRequest::Rollback {
                    cause: TransitionCause::AutoRollback,
                    trigger: None,
                },
                &schedule(),
            )
            .unwrap();
            assert_eq!(plan.to, Stage::RolledBack);
            assert_eq!(plan.next.percentage, 0);
        }
    }

    #[test]
    fn test_plan_rollback_from_disabled_is_invalid() {
        let result = plan_transition(
            &def_at(Stage::Disabled, 0),
            &TransitionRequest::Rollback {
                cause: TransitionCause::Manual,
                trigger: None,
            },
            &schedule(),
        );
        assert!(matches!(result, Err(TransitionError::Invalid { .. })));
    }

    #[test]
    fn test_plan_rollback_is_absorbing() {
        let result = plan_transition(
            &def_at(Stage::RolledBack, 0),
            &TransitionRequest::Rollback {
                cause: TransitionCause::AutoRollback,
                trigger: None,
            },
            &schedule(),
        );
        assert!(matches!(result, Err(TransitionError::AlreadySatisfied(_))));
    }

    #[test]
    fn test_plan_rolled_back_resets_to_disabled_manually() {
        let plan = plan_transition(
            &def_at(Stage::RolledBack, 0),
            &set_stage(Stage::Disabled),
            &schedule(),
        )
        .unwrap();
        assert_eq!(plan.to, Stage::Disabled);
    }

    #[test]
    fn test_plan_advance_walks_the_schedule() {
        let plan = plan_transition(
            &def_at(Stage::Ramping, 5),
            &TransitionRequest::AdvancePercentage {
                cause: TransitionCause::ScheduledRamp,
            },
            &schedule(),
        )
        .unwrap();
        assert_eq!(plan.to, Stage::Ramping);
        assert_eq!(plan.next.percentage, 25);
    }

    #[test]
    fn test_plan_advance_completes_to_full_at_100() {
        let plan = plan_transition(
            &def_at(Stage::Ramping, 50),
            &TransitionRequest::AdvancePercentage {
                cause: TransitionCause::ScheduledRamp,
            },
            &schedule(),
        )
        .unwrap();
        assert_eq!(plan.to, Stage::Full);
        assert_eq!(plan.next.percentage, 100);
    }

    #[test]
    fn test_plan_advance_outside_ramping_is_invalid() {
        for stage in [Stage::Disabled, Stage::Canary, Stage::Full, Stage::RolledBack] {
            let result = plan_transition(
                &def_at(stage, 0),
                &TransitionRequest::AdvancePercentage {
                    cause: TransitionCause::ScheduledRamp,
                },
                &schedule(),
            );
            assert!(result.is_err(), "advance from {stage} should fail");
        }
    }

    #[test]
    fn test_plan_set_percentage_must_increase() {
        let request = |percentage| TransitionRequest::SetPercentage {
            percentage,
            cause: TransitionCause::Manual,
        };
        let def = def_at(Stage::Ramping, 25);
        assert!(matches!(
            plan_transition(&def, &request(25), &schedule()),
            Err(TransitionError::InvalidPercentage { .. })
        ));
        assert!(matches!(
            plan_transition(&def, &request(10), &schedule()),
            Err(TransitionError::InvalidPercentage { .. })
        ));
        let plan = plan_transition(&def, &request(40), &schedule()).unwrap();
        assert_eq!(plan.next.percentage, 40);
        assert_eq!(plan.to, Stage::Ramping);
        let plan = plan_transition(&def, &request(100), &schedule()).unwrap();
        assert_eq!(plan.to, Stage::Full);
    }

    #[test]
    fn test_plan_archived_flag_rejects_everything() {
        let mut def = def_at(Stage::Ramping, 25);
        def.archived = true;
        let result = plan_transition(&def, &set_stage(Stage::Full), &schedule());
        assert!(matches!(result, Err(TransitionError::Archived(_))));
    }

    #[test]
    fn test_plan_rollback_carries_trigger_sample() {
        let sample = HealthSample {
            flag: FlagId::new("checkout-v2"),
            metric: MetricKind::ErrorRate,
            value: 0.09,
            baseline: 0.03,
            timestamp: chrono::Utc::now(),
        };
        let plan = plan_transition(
            &def_at(Stage::Ramping, 25),
            &TransitionRequest::Rollback {
                cause: TransitionCause::AutoRollback,
                trigger: Some(sample.clone()),
            },
            &schedule(),
        )
        .unwrap();
        assert_eq!(plan.trigger, Some(sample));
    }

    // ── Engine ─────────────────────────────────────────────────────────

    fn engine() -> (Arc<FlagStore>, Arc<AuditLog>, TransitionEngine) {
        let store = Arc::new(FlagStore::new());
        let audit = Arc::new(AuditLog::with_default_capacity());
        let engine = TransitionEngine::new(store.clone(), audit.clone(), schedule());
        (store, audit, engine)
    }

    #[tokio::test]
    async fn test_apply_commits_store_and_audit() {
        let (store, audit, engine) = engine();
        let flag = FlagId::new("checkout-v2");
        store
            .create(FlagDefinition::new(flag.clone(), "production"))
            .unwrap();

        let record = engine
            .apply(&flag, set_stage(Stage::Canary))
            .await
            .unwrap()
            .expect("transition should commit");
        assert_eq!(record.from, Stage::Disabled);
        assert_eq!(record.to, Stage::Canary);

        let def = store.get(&flag).unwrap();
        assert_eq!(def.stage, Stage::Canary);
        assert_eq!(def.version, 2);
        assert_eq!(audit.query(&flag, None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_apply_unknown_flag_is_not_found() {
        let (_store, _audit, engine) = engine();
        let result = engine
            .apply(&FlagId::new("ghost"), set_stage(Stage::Canary))
            .await;
        assert!(matches!(
            result,
            Err(TransitionError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize_by_version() {
        let (store, audit, engine) = engine();
        let engine = Arc::new(engine);
        let flag = FlagId::new("checkout-v2");
        let def = store
            .create(FlagDefinition::new(flag.clone(), "production"))
            .unwrap();

        // Simulate the race: another writer commits against the same
        // starting version before our transition runs its store write.
        let mut winner = def.clone();
        winner.stage = Stage::Canary;
        store.put(&flag, def.version, winner).unwrap();

        // Our Canary request re-reads the committed state and finds the
        // Disabled -> Canary edge no longer applies.
        let result = engine.apply(&flag, set_stage(Stage::Canary)).await;
        assert!(matches!(result, Err(TransitionError::Invalid { .. })));

        // A rollback raced the same way is re-applied cleanly.
        let rollback = TransitionRequest::Rollback {
            cause: TransitionCause::AutoRollback,
            trigger: None,
        };
        let record = engine.apply(&flag, rollback.clone()).await.unwrap();
        assert!(record.is_some());

        // And a second rollback abandons without a second commit.
        let record = engine.apply(&flag, rollback).await.unwrap();
        assert!(record.is_none());
        assert_eq!(store.get(&flag).unwrap().stage, Stage::RolledBack);
        assert_eq!(audit.query(&flag, None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_two_tasks_racing_one_retries() {
        let (store, _audit, engine) = engine();
        let engine = Arc::new(engine);
        let flag = FlagId::new("checkout-v2");
        store
            .create(FlagDefinition::new(flag.clone(), "production"))
            .unwrap();
        engine
            .apply(&flag, set_stage(Stage::Canary))
            .await
            .unwrap();
        engine
            .apply(&flag, set_stage(Stage::Ramping))
            .await
            .unwrap();

        // Two monitor cycles decide to roll back at the same time.
        let a = {
            let engine = engine.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                engine
                    .apply(
                        &flag,
                        TransitionRequest::Rollback {
                            cause: TransitionCause::AutoRollback,
                            trigger: None,
                        },
                    )
                    .await
            })
        };
        let b = {
            let engine = engine.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                engine
                    .apply(
                        &flag,
                        TransitionRequest::Rollback {
                            cause: TransitionCause::AutoRollback,
                            trigger: None,
                        },
                    )
                    .await
            })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        // Exactly one writer committed; the other observed the stronger
        // state and abandoned.
        assert!(a.is_some() ^ b.is_some());
        assert_eq!(store.get(&flag).unwrap().stage, Stage::RolledBack);
    }
}
