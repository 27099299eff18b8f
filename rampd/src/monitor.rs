//! Health monitor: health-driven ramp advancement and rollback.
//!
//! Periodically pulls health samples per monitored flag from the external
//! metrics feed, compares them against a baseline captured at Canary
//! entry, and drives the state machine:
//!
//! - a breach streak at or above `min_consecutive_breaches` rolls the
//!   flag back (severe, sustained degradation);
//! - any shorter streak holds percentage advancement (mild degradation);
//! - a breach-free flag past its observation window advances one
//!   schedule step.
//!
//! Fail-safe discipline: an unavailable feed blocks all advancement but
//! never triggers a rollback on its own. Absence of evidence is not
//! evidence of harm.
//!
//! The interval loop ([`HealthMonitor::start`]) and the decision logic
//! ([`HealthMonitor::run_cycle`]) are separate so the rules can be
//! tested without real timers.

use crate::metrics;
use crate::rollout::{TransitionEngine, TransitionRequest};
use crate::store::FlagStore;
use chrono::{DateTime, Utc};
use ramp_common::errors::FeedError;
use ramp_common::types::{FlagDefinition, FlagId, HealthSample, MetricKind, Stage, TransitionCause};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default interval between monitor cycles.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Pull-queryable source of health samples, keyed by flag.
///
/// Implementations should answer promptly (in-memory or locally cached
/// data); the monitor calls this once per monitored flag per cycle.
pub trait MetricsFeed: Send + Sync + 'static {
    fn pull(&self, flag: &FlagId) -> Result<Vec<HealthSample>, FeedError>;
}

/// Feed reading JSONL `HealthSample` lines from a file an external
/// collector keeps appending to.
pub struct FileMetricsFeed {
    path: PathBuf,
}

impl FileMetricsFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MetricsFeed for FileMetricsFeed {
    fn pull(&self, flag: &FlagId) -> Result<Vec<HealthSample>, FeedError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| FeedError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let mut samples = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let sample: HealthSample = serde_json::from_str(line)
                .map_err(|e| FeedError::Malformed(e.to_string()))?;
            if &sample.flag == flag {
                samples.push(sample);
            }
        }
        Ok(samples)
    }
}

/// Monitor thresholds and pacing.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Interval between cycles.
    pub check_interval: Duration,
    /// Error-rate breach: value exceeds this multiple of baseline.
    pub error_rate_multiplier: f64,
    /// Latency breach: value exceeds baseline by this relative increase.
    pub latency_increase: f64,
    /// Consecutive breached samples required for auto-rollback.
    pub min_consecutive_breaches: u32,
    /// Minimum breach-free dwell at a percentage step before advancing.
    pub min_observation: Duration,
    /// Environment scope for the scan loop.
    pub environment: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            error_rate_multiplier: 2.0,
            latency_increase: 0.5,
            min_consecutive_breaches: 3,
            min_observation: Duration::from_secs(300),
            environment: "production".to_string(),
        }
    }
}

/// Per-flag monitoring state.
#[derive(Debug, Default)]
struct FlagWatch {
    /// Baseline values captured at Canary entry, per metric.
    baseline: HashMap<MetricKind, f64>,
    /// Consecutive breached samples, across cycles.
    breach_streak: u32,
    /// The most recent breached sample, kept as the rollback trigger.
    last_breach: Option<HealthSample>,
    /// Timestamp of the newest processed sample; older samples are
    /// never re-counted on subsequent pulls.
    cursor: Option<DateTime<Utc>>,
}

/// What a cycle decided for one flag.
#[derive(Debug)]
enum Verdict {
    /// Sustained degradation: pull the flag.
    RollBack(Option<HealthSample>),
    /// Degradation below the rollback threshold, or no fresh evidence:
    /// keep the current percentage.
    Hold(&'static str),
    /// Breach-free and observed long enough: next schedule step.
    Advance,
}

/// Health monitor that periodically scans all monitored flags.
pub struct HealthMonitor<F: MetricsFeed> {
    store: Arc<FlagStore>,
    engine: Arc<TransitionEngine>,
    feed: Arc<F>,
    settings: MonitorSettings,
    /// Watch state per flag.
    watches: Arc<RwLock<HashMap<FlagId, FlagWatch>>>,
    /// The most recent cycle saw at least one feed failure.
    degraded: Arc<AtomicBool>,
    /// Whether the monitor loop is running.
    running: Arc<RwLock<bool>>,
}

impl<F: MetricsFeed> Clone for HealthMonitor<F> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            engine: self.engine.clone(),
            feed: self.feed.clone(),
            settings: self.settings.clone(),
            watches: self.watches.clone(),
            degraded: self.degraded.clone(),
            running: self.running.clone(),
        }
    }
}

impl<F: MetricsFeed> HealthMonitor<F> {
    pub fn new(
        store: Arc<FlagStore>,
        engine: Arc<TransitionEngine>,
        feed: Arc<F>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            engine,
            feed,
            settings,
            watches: Arc::new(RwLock::new(HashMap::new())),
            degraded: Arc::new(AtomicBool::new(false)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the monitoring background task.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            *monitor.running.write().await = true;
            let mut ticker = interval(monitor.settings.check_interval);

            info!(
                "Health monitor started (interval: {}, thresholds: {}x error rate, +{:.0}% latency, {} consecutive breaches)",
                humantime::format_duration(monitor.settings.check_interval),
                monitor.settings.error_rate_multiplier,
                monitor.settings.latency_increase * 100.0,
                monitor.settings.min_consecutive_breaches
            );

            loop {
                ticker.tick().await;
                if !*monitor.running.read().await {
                    info!("Health monitor stopping");
                    break;
                }
                monitor.run_cycle().await;
            }
        })
    }

    /// Stop the monitor loop after the current cycle.
    #[allow(dead_code)] // Will be used for graceful shutdown
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// The last cycle could not reach the metrics feed for some flag.
    #[allow(dead_code)] // Status reporting reads the shared handle instead
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Shared handle to the degraded marker, for status reporting.
    pub fn degraded_handle(&self) -> Arc<AtomicBool> {
        self.degraded.clone()
    }

    /// One full scan over monitored flags. Public so transition rules can
    /// be exercised without timers.
    pub async fn run_cycle(&self) {
        let flags = self.store.list(Some(&self.settings.environment));
        let monitored: Vec<FlagDefinition> = flags
            .into_iter()
            .filter(|def| !def.archived && def.stage.is_monitored())
            .collect();
        metrics::ACTIVE_FLAGS.set(monitored.len() as i64);
        debug!("Monitor cycle over {} flag(s)", monitored.len());

        let mut any_feed_failure = false;
        for def in &monitored {
            if !self.check_flag(def).await {
                any_feed_failure = true;
            }
        }
        self.degraded.store(any_feed_failure, Ordering::Relaxed);

        // Drop watch state for flags that left the monitored set, so a
        // later re-entry into Canary captures a fresh baseline.
        let keep: std::collections::HashSet<&FlagId> =
            monitored.iter().map(|def| &def.id).collect();
        let mut watches = self.watches.write().await;
        watches.retain(|id, _| keep.contains(id));
    }

    /// Check one flag. Returns false when the feed could not be pulled.
    async fn check_flag(&self, def: &FlagDefinition) -> bool {
        let samples = match self.feed.pull(&def.id) {
            Ok(samples) => samples,
            Err(e) => {
                // Degraded monitoring: hold, never roll back on a silent feed.
                warn!(
                    "Metrics feed failed for {}; holding at {} {}%: {}",
                    def.id, def.stage, def.percentage, e
                );
                metrics::FEED_UNAVAILABLE_TOTAL.inc();
                return false;
            }
        };

        let verdict = self.digest_samples(def, samples).await;
        match verdict {
            Verdict::RollBack(trigger) => {
                warn!(
                    "Sustained health breach on {}; rolling back from {} {}%",
                    def.id, def.stage, def.percentage
                );
                match self
                    .engine
                    .apply(
                        &def.id,
                        TransitionRequest::Rollback {
                            cause: TransitionCause::AutoRollback,
                            trigger,
                        },
                    )
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("Rollback of {} already applied elsewhere", def.id),
                    // The breach streak survives in the watch state, so
                    // the next cycle re-issues the decision.
                    Err(e) => warn!("Rollback of {} not committed, will retry: {}", def.id, e),
                }
            }
            Verdict::Hold(reason) => {
                debug!("Holding {} at {} {}%: {}", def.id, def.stage, def.percentage, reason);
            }
            Verdict::Advance => {
                match self
                    .engine
                    .apply(
                        &def.id,
                        TransitionRequest::AdvancePercentage {
                            cause: TransitionCause::ScheduledRamp,
                        },
                    )
                    .await
                {
                    Ok(Some(record)) => {
                        info!("Advanced {} ({} -> {})", def.id, record.from, record.to);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Advance of {} not committed, will retry: {}", def.id, e),
                }
            }
        }
        true
    }

    /// Fold fresh samples into the flag's watch state and decide.
    async fn digest_samples(
        &self,
        def: &FlagDefinition,
        mut samples: Vec<HealthSample>,
    ) -> Verdict {
        let mut watches = self.watches.write().await;
        let watch = watches.entry(def.id.clone()).or_default();

        samples.sort_by_key(|s| s.timestamp);
        let fresh: Vec<&HealthSample> = samples
            .iter()
            .filter(|s| watch.cursor.is_none_or(|c| s.timestamp > c))
            .collect();

        // Baseline is captured at Canary entry: the first samples the
        // monitor sees after the flag becomes monitored.
        if watch.baseline.is_empty() && !fresh.is_empty() {
            for sample in &fresh {
                watch.baseline.insert(sample.metric, sample.value);
            }
            info!(
                "Captured health baseline for {} ({} metric(s))",
                def.id,
                watch.baseline.len()
            );
        }

        for sample in &fresh {
            // Prefer the captured baseline; a sample's own reference
            // covers flags first observed mid-ramp (daemon restart).
            let reference = watch
                .baseline
                .get(&sample.metric)
                .copied()
                .unwrap_or(sample.baseline);
            if is_breach(sample, reference, &self.settings) {
                watch.breach_streak += 1;
                watch.last_breach = Some((*sample).clone());
            } else {
                watch.breach_streak = 0;
            }
        }
        if let Some(last) = samples.last() {
            watch.cursor = Some(last.timestamp);
        }

        if watch.breach_streak >= self.settings.min_consecutive_breaches {
            return Verdict::RollBack(watch.last_breach.clone());
        }
        if watch.breach_streak > 0 {
            return Verdict::Hold("breach streak below rollback threshold");
        }
        if watch.cursor.is_none() {
            // Never seen a sample: no evidence to advance on.
            return Verdict::Hold("no health samples observed yet");
        }
        if def.stage != Stage::Ramping {
            // Canary only advances by an explicit operator action.
            return Verdict::Hold("canary advances manually");
        }
        let dwell = (Utc::now() - def.updated_at).to_std().unwrap_or_default();
        if dwell < self.settings.min_observation {
            return Verdict::Hold("observation window still open");
        }
        Verdict::Advance
    }
}

/// Does one sample breach its threshold against a reference value?
///
/// A zero reference means the baseline saw no errors (or no latency
/// signal); any nonzero error rate against a zero baseline is a breach,
/// while latency needs a usable reference to compare against.
fn is_breach(sample: &HealthSample, reference: f64, settings: &MonitorSettings) -> bool {
    match sample.metric {
        MetricKind::ErrorRate => {
            if reference <= 0.0 {
                sample.value > 0.0
            } else {
                sample.value > settings.error_rate_multiplier * reference
            }
        }
        MetricKind::LatencyP99 => {
            reference > 0.0 && sample.value > reference * (1.0 + settings.latency_increase)
        }
    }
}
