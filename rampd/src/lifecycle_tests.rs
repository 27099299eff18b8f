//! End-to-end rollout lifecycle exercised against in-memory components:
//! create -> canary -> ramp -> health-driven rollback -> manual reset.

use crate::admin::AdminService;
use crate::audit::AuditLog;
use crate::evaluate::Evaluator;
use crate::monitor::{HealthMonitor, MetricsFeed, MonitorSettings};
use crate::rollout::TransitionEngine;
use crate::store::FlagStore;
use chrono::{TimeDelta, Utc};
use ramp_common::errors::FeedError;
use ramp_common::types::{
    FlagId, HealthSample, MetricKind, RampSchedule, Stage, TransitionCause,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedFeed {
    samples: Mutex<Vec<HealthSample>>,
}

impl ScriptedFeed {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, flag: &FlagId, metric: MetricKind, values: &[f64]) {
        let mut samples = self.samples.lock().unwrap();
        let start = samples.len() as i64;
        for (i, value) in values.iter().enumerate() {
            samples.push(HealthSample {
                flag: flag.clone(),
                metric,
                value: *value,
                baseline: 0.0,
                timestamp: Utc::now() + TimeDelta::seconds(start + i as i64),
            });
        }
    }
}

impl MetricsFeed for ScriptedFeed {
    fn pull(&self, flag: &FlagId) -> Result<Vec<HealthSample>, FeedError> {
        Ok(self
            .samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| &s.flag == flag)
            .cloned()
            .collect())
    }
}

struct Harness {
    store: Arc<FlagStore>,
    audit: Arc<AuditLog>,
    admin: AdminService,
    evaluator: Evaluator,
    monitor: HealthMonitor<ScriptedFeed>,
    feed: Arc<ScriptedFeed>,
}

fn harness() -> Harness {
    let store = Arc::new(FlagStore::new());
    let audit = Arc::new(AuditLog::with_default_capacity());
    let engine = Arc::new(TransitionEngine::new(
        store.clone(),
        audit.clone(),
        RampSchedule::default(),
    ));
    let feed = Arc::new(ScriptedFeed::new());
    let monitor = HealthMonitor::new(
        store.clone(),
        engine.clone(),
        feed.clone(),
        MonitorSettings {
            min_observation: Duration::ZERO,
            min_consecutive_breaches: 5,
            ..Default::default()
        },
    );
    Harness {
        admin: AdminService::new(store.clone(), engine, "production".to_string()),
        evaluator: Evaluator::new(store.clone()),
        store,
        audit,
        monitor,
        feed,
    }
}

#[tokio::test]
async fn test_checkout_v2_full_lifecycle_with_auto_rollback() {
    let h = harness();
    let flag = FlagId::new("checkout-v2");

    // Created disabled: off for everyone.
    h.admin.create_flag(flag.clone(), None).unwrap();
    assert!(!h.evaluator.evaluate(&flag, "u1").await.enabled);

    // Canary with allow-list {"u1"}: u1 on, u2 off.
    h.admin.set_stage(&flag, Stage::Canary).await.unwrap();
    h.admin
        .set_lists(&flag, BTreeSet::from(["u1".to_string()]), BTreeSet::new())
        .unwrap();
    assert!(h.evaluator.evaluate(&flag, "u1").await.enabled);
    assert!(!h.evaluator.evaluate(&flag, "u2").await.enabled);

    // Healthy canary establishes the baseline.
    h.feed.emit(&flag, MetricKind::ErrorRate, &[0.01, 0.01]);
    h.monitor.run_cycle().await;

    // Ramping at 10%.
    h.admin.set_stage(&flag, Stage::Ramping).await.unwrap();
    h.admin.set_percentage(&flag, 10).await.unwrap();

    // Inclusion rate over 10k synthetic subjects is 10% +/- 1pp, and the
    // included set is identical on re-evaluation.
    let mut included = Vec::new();
    for i in 0..10_000 {
        let subject = format!("subject-{i}");
        if h.evaluator.evaluate(&flag, &subject).await.enabled {
            included.push(subject);
        }
    }
    assert!(
        (900..=1100).contains(&included.len()),
        "expected ~1000 included, got {}",
        included.len()
    );
    for subject in &included {
        assert!(h.evaluator.evaluate(&flag, subject).await.enabled);
    }

    // Error rate spikes to 3x baseline for 5 consecutive samples: the
    // monitor pulls the flag.
    h.feed
        .emit(&flag, MetricKind::ErrorRate, &[0.03, 0.03, 0.03, 0.03, 0.03]);
    h.monitor.run_cycle().await;

    let def = h.store.get(&flag).unwrap();
    assert_eq!(def.stage, Stage::RolledBack);

    // Everyone previously included is off, and the allow-listed canary
    // subject is force-excluded too (fail-closed).
    for subject in included.iter().take(100) {
        assert!(!h.evaluator.evaluate(&flag, subject).await.enabled);
    }
    assert!(!h.evaluator.evaluate(&flag, "u1").await.enabled);

    // Rollback is absorbing: further cycles with healthy metrics change
    // nothing.
    h.feed.emit(&flag, MetricKind::ErrorRate, &[0.01, 0.01]);
    h.monitor.run_cycle().await;
    assert_eq!(h.store.get(&flag).unwrap().stage, Stage::RolledBack);

    // The audit trail names the automatic rollback and its trigger.
    let history = h.audit.query(&flag, None, None);
    let rollback = history
        .iter()
        .find(|r| r.to == Stage::RolledBack)
        .expect("rollback recorded");
    assert_eq!(rollback.cause, TransitionCause::AutoRollback);
    let trigger = rollback.trigger.as_ref().expect("trigger sample recorded");
    assert_eq!(trigger.metric, MetricKind::ErrorRate);
    assert_eq!(trigger.value, 0.03);

    // Manual remediation path: back to Disabled, then a fresh canary.
    h.admin.set_stage(&flag, Stage::Disabled).await.unwrap();
    h.admin.set_stage(&flag, Stage::Canary).await.unwrap();
    assert!(h.evaluator.evaluate(&flag, "u1").await.enabled);
}

#[tokio::test]
async fn test_scheduled_ramp_reaches_full_under_healthy_metrics() {
    let h = harness();
    let flag = FlagId::new("search-rewrite");
    h.admin.create_flag(flag.clone(), None).unwrap();
    h.admin.set_stage(&flag, Stage::Canary).await.unwrap();
    h.admin.set_stage(&flag, Stage::Ramping).await.unwrap();
    assert_eq!(h.store.get(&flag).unwrap().percentage, 5);

    // One healthy sample per cycle walks the whole schedule.
    for _ in 0..4 {
        h.feed.emit(&flag, MetricKind::ErrorRate, &[0.02]);
        h.monitor.run_cycle().await;
    }

    let def = h.store.get(&flag).unwrap();
    assert_eq!(def.stage, Stage::Full);
    assert_eq!(def.percentage, 100);

    // Full means on for everyone outside the deny list.
    assert!(h.evaluator.evaluate(&flag, "anyone").await.enabled);

    // 5 -> 25 -> 50 -> 100 plus the two manual steps.
    assert_eq!(h.audit.query(&flag, None, None).len(), 5);
}

#[tokio::test]
async fn test_monotone_exposure_across_ramp_steps() {
    let h = harness();
    let flag = FlagId::new("checkout-v2");
    h.admin.create_flag(flag.clone(), None).unwrap();
    h.admin.set_stage(&flag, Stage::Canary).await.unwrap();
    h.admin.set_stage(&flag, Stage::Ramping).await.unwrap();

    let mut previously_included: Vec<String> = Vec::new();
    for step in [10u8, 30, 60] {
        h.admin.set_percentage(&flag, step).await.unwrap();
        let mut included = Vec::new();
        for i in 0..2_000 {
            let subject = format!("subject-{i}");
            if h.evaluator.evaluate(&flag, &subject).await.enabled {
                included.push(subject);
            }
        }
        // Raising the percentage only ever adds subjects.
        for subject in &previously_included {
            assert!(included.contains(subject), "{subject} dropped at {step}%");
        }
        previously_included = included;
    }
}
