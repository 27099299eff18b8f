//! Evaluation service: the request-serving path.
//!
//! One bounded store read plus the pure bucketing computation. Nothing
//! here can fail from the caller's perspective: an unknown flag, a store
//! error, or a read overrunning its budget all resolve to the safe
//! default (off, Disabled semantics) so a flagging outage never takes
//! down the calling application.

use crate::metrics;
use crate::store::FlagStore;
use ramp_common::bucketing;
use ramp_common::types::{EvaluationResult, FlagId, Stage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default store read budget on the evaluation path.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Evaluates flags against the store. Cheap to clone; safe for unbounded
/// concurrent callers.
#[derive(Clone)]
pub struct Evaluator {
    store: Arc<FlagStore>,
    read_timeout: Duration,
}

impl Evaluator {
    pub fn new(store: Arc<FlagStore>) -> Self {
        Self {
            store,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Is `flag` active for `subject`?
    pub async fn evaluate(&self, flag: &FlagId, subject: &str) -> EvaluationResult {
        let store = self.store.clone();
        let flag_for_read = flag.clone();
        let read = timeout(
            self.read_timeout,
            tokio::task::spawn_blocking(move || store.get(&flag_for_read)),
        )
        .await;

        let def = match read {
            Ok(Ok(Ok(def))) => def,
            Ok(Ok(Err(e))) => {
                debug!("Evaluation of {} failing closed: {}", flag, e);
                return self.fail_closed(flag, subject);
            }
            Ok(Err(join_err)) => {
                debug!("Evaluation of {} failing closed: {}", flag, join_err);
                return self.fail_closed(flag, subject);
            }
            Err(_elapsed) => {
                debug!(
                    "Evaluation of {} failing closed: store read exceeded {:?}",
                    flag, self.read_timeout
                );
                return self.fail_closed(flag, subject);
            }
        };

        let result = bucketing::evaluate(&def, subject);
        metrics::record_evaluation(if result.enabled { "on" } else { "off" });
        result
    }

    fn fail_closed(&self, flag: &FlagId, subject: &str) -> EvaluationResult {
        metrics::record_evaluation("fail_closed");
        EvaluationResult {
            flag: flag.clone(),
            subject: subject.to_string(),
            enabled: false,
            stage: Stage::Disabled,
            bucket: None,
        }
    }
}
