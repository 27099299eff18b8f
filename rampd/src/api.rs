//! Unix socket API.
//!
//! JSON lines over the daemon socket: each line is one
//! [`ramp_common::protocol::Request`], answered with one
//! [`ramp_common::protocol::Response`]. Dispatch is separated from the
//! socket plumbing so handlers are testable without a listener.

use crate::admin::AdminService;
use crate::audit::AuditLog;
use crate::evaluate::Evaluator;
use crate::store::FlagStore;
use ramp_common::protocol::{DaemonStatus, Request, Response};
use ramp_common::types::FlagId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Shared daemon context passed to all API handlers.
#[derive(Clone)]
pub struct DaemonContext {
    pub store: Arc<FlagStore>,
    pub evaluator: Evaluator,
    pub admin: Arc<AdminService>,
    pub audit: Arc<AuditLog>,
    /// Set by the health monitor when the metrics feed fails.
    pub monitor_degraded: Arc<AtomicBool>,
    pub environment: String,
    pub started_at: Instant,
    pub version: &'static str,
    pub pid: u32,
}

/// Serve one client connection until it closes.
pub async fn handle_connection(stream: UnixStream, ctx: DaemonContext) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&ctx, request).await,
            Err(e) => Response::error(format!("malformed request: {e}")),
        };
        let mut payload = serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","data":{{"message":"{e}"}}}}"#));
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

/// Route one request to its handler.
pub async fn dispatch(ctx: &DaemonContext, request: Request) -> Response {
    debug!("API request: {:?}", request);
    match request {
        Request::Evaluate { flag, subject } => {
            let result = ctx.evaluator.evaluate(&FlagId::new(flag), &subject).await;
            Response::Evaluation(result)
        }
        Request::CreateFlag { flag, environment } => {
            match ctx.admin.create_flag(FlagId::new(flag), environment) {
                Ok(def) => Response::Flag(def),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::SetStage { flag, stage } => {
            match ctx.admin.set_stage(&FlagId::new(flag), stage).await {
                Ok(def) => Response::Flag(def),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::SetPercentage { flag, percentage } => {
            match ctx.admin.set_percentage(&FlagId::new(flag), percentage).await {
                Ok(def) => Response::Flag(def),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::SetLists { flag, allow, deny } => {
            let allow: BTreeSet<String> = allow.into_iter().collect();
            let deny: BTreeSet<String> = deny.into_iter().collect();
            match ctx.admin.set_lists(&FlagId::new(flag), allow, deny) {
                Ok(def) => Response::Flag(def),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::ArchiveFlag { flag } => match ctx.admin.archive_flag(&FlagId::new(flag)) {
            Ok(def) => Response::Flag(def),
            Err(e) => Response::error(e.to_string()),
        },
        Request::GetFlag { flag } => match ctx.admin.get_flag(&FlagId::new(flag)) {
            Ok(def) => Response::Flag(def),
            Err(e) => Response::error(e.to_string()),
        },
        Request::ListFlags { environment } => {
            Response::Flags(ctx.admin.list_flags(environment.as_deref()))
        }
        Request::History { flag, since, until } => {
            Response::History(ctx.audit.query(&FlagId::new(flag), since, until))
        }
        Request::Status => {
            let flags = ctx.store.list(None);
            let flags_active = flags
                .iter()
                .filter(|def| !def.archived && def.stage.is_monitored())
                .count();
            Response::Status(DaemonStatus {
                version: ctx.version.to_string(),
                pid: ctx.pid,
                uptime_seconds: ctx.started_at.elapsed().as_secs(),
                environment: ctx.environment.clone(),
                flags_total: flags.len(),
                flags_active,
                monitor_degraded: ctx.monitor_degraded.load(Ordering::Relaxed),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::TransitionEngine;
    use ramp_common::types::{RampSchedule, Stage};

    fn context() -> DaemonContext {
        let store = Arc::new(FlagStore::new());
        let audit = Arc::new(AuditLog::with_default_capacity());
        let engine = Arc::new(TransitionEngine::new(
            store.clone(),
            audit.clone(),
            RampSchedule::default(),
        ));
        DaemonContext {
            evaluator: Evaluator::new(store.clone()),
            admin: Arc::new(AdminService::new(
                store.clone(),
                engine,
                "production".to_string(),
            )),
            store,
            audit,
            monitor_degraded: Arc::new(AtomicBool::new(false)),
            environment: "production".to_string(),
            started_at: Instant::now(),
            version: "test",
            pid: std::process::id(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_create_then_evaluate() {
        let ctx = context();
        let response = dispatch(
            &ctx,
            Request::CreateFlag {
                flag: "checkout-v2".to_string(),
                environment: None,
            },
        )
        .await;
        assert!(matches!(response, Response::Flag(_)));

        let response = dispatch(
            &ctx,
            Request::Evaluate {
                flag: "checkout-v2".to_string(),
                subject: "u1".to_string(),
            },
        )
        .await;
        match response {
            Response::Evaluation(result) => {
                assert!(!result.enabled);
                assert_eq!(result.stage, Stage::Disabled);
            }
            other => panic!("expected evaluation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_evaluate_unknown_flag_fails_closed_not_error() {
        let ctx = context();
        let response = dispatch(
            &ctx,
            Request::Evaluate {
                flag: "ghost".to_string(),
                subject: "u1".to_string(),
            },
        )
        .await;
        // Evaluation never surfaces errors to callers.
        match response {
            Response::Evaluation(result) => assert!(!result.enabled),
            other => panic!("expected evaluation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_admin_errors_are_reported() {
        let ctx = context();
        let response = dispatch(
            &ctx,
            Request::SetStage {
                flag: "ghost".to_string(),
                stage: Stage::Canary,
            },
        )
        .await;
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_dispatch_full_lifecycle_and_history() {
        let ctx = context();
        dispatch(
            &ctx,
            Request::CreateFlag {
                flag: "f".to_string(),
                environment: None,
            },
        )
        .await;
        for stage in [Stage::Canary, Stage::Ramping] {
            let response = dispatch(
                &ctx,
                Request::SetStage {
                    flag: "f".to_string(),
                    stage,
                },
            )
            .await;
            assert!(!response.is_error());
        }

        let response = dispatch(
            &ctx,
            Request::History {
                flag: "f".to_string(),
                since: None,
                until: None,
            },
        )
        .await;
        match response {
            Response::History(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[1].to, Stage::Ramping);
            }
            other => panic!("expected history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_status_counts_monitored_flags() {
        let ctx = context();
        for flag in ["a", "b", "c"] {
            dispatch(
                &ctx,
                Request::CreateFlag {
                    flag: flag.to_string(),
                    environment: None,
                },
            )
            .await;
        }
        dispatch(
            &ctx,
            Request::SetStage {
                flag: "a".to_string(),
                stage: Stage::Canary,
            },
        )
        .await;

        let response = dispatch(&ctx, Request::Status).await;
        match response {
            Response::Status(status) => {
                assert_eq!(status.flags_total, 3);
                assert_eq!(status.flags_active, 1);
                assert!(!status.monitor_degraded);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }
}
