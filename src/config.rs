//! Configuration types.

use std::time::Duration;

/// Thresholds driving the job scan and worker reaping.
///
/// Only the ordering `stuck < orphan <= dead_worker` is relied on: the stuck
/// pass must release plain expired leases before the orphan pass looks for
/// jobs whose owner has vanished, so the same job is never handled twice in
/// one tick.
#[derive(Debug, Clone)]
pub struct ScanThresholds {
    /// A running job whose lease expired at least this long ago is stuck.
    pub stuck: Duration,
    /// A running job whose lease owner has not heartbeated for this long is
    /// orphaned.
    pub orphan: Duration,
    /// A worker silent for this long is reaped.
    pub dead_worker: Duration,
}

impl Default for ScanThresholds {
    fn default() -> Self {
        Self {
            stuck: Duration::from_secs(600),       // 10 minutes
            orphan: Duration::from_secs(900),      // 15 minutes
            dead_worker: Duration::from_secs(900), // 15 minutes
        }
    }
}

/// Thresholds for systemic failure detection.
#[derive(Debug, Clone)]
pub struct SystemicThresholds {
    /// Minimum occurrences of a signature inside the window.
    pub min_count: u32,
    /// Minimum distinct deals hitting the signature.
    pub min_entities: u32,
    /// Trailing window to aggregate over.
    pub window: Duration,
}

impl Default for SystemicThresholds {
    fn default() -> Self {
        Self {
            min_count: 5,
            min_entities: 3,
            window: Duration::from_secs(3600), // 60 minutes
        }
    }
}

/// Thresholds for the invariant checks.
#[derive(Debug, Clone)]
pub struct CheckThresholds {
    /// A report generating for this long gets a warning finding.
    pub report_warn: Duration,
    /// A report generating for this long is auto-healed to `error`.
    pub report_critical: Duration,
    /// Upstream jobs older than this count as blocking a rejected report.
    pub blocked_staleness: Duration,
    /// How far back to look for report rejection events.
    pub rejection_window: Duration,
}

impl Default for CheckThresholds {
    fn default() -> Self {
        Self {
            report_warn: Duration::from_secs(600),        // 10 minutes
            report_critical: Duration::from_secs(1800),   // 30 minutes
            blocked_staleness: Duration::from_secs(1200), // 20 minutes
            rejection_window: Duration::from_secs(1800),  // 30 minutes
        }
    }
}

/// Sentinel configuration.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Maximum jobs pulled per table per tick.
    pub batch_size: usize,
    /// Maximum automatic retries before a retryable failure is marked dead.
    pub max_auto_retry: u32,
    /// Scan and reaping thresholds.
    pub scan: ScanThresholds,
    /// Systemic failure detection thresholds.
    pub systemic: SystemicThresholds,
    /// Invariant check thresholds.
    pub checks: CheckThresholds,
    /// Deployment environment tag stamped on every event.
    pub environment: String,
    /// Release identifier stamped on every event.
    pub release: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_auto_retry: 5,
            scan: ScanThresholds::default(),
            systemic: SystemicThresholds::default(),
            checks: CheckThresholds::default(),
            environment: "development".to_string(),
            release: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SentinelConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(env) = std::env::var("SENTINEL_ENV") {
            config.environment = env;
        }
        if let Ok(release) = std::env::var("SENTINEL_RELEASE") {
            config.release = release;
        }
        if let Some(batch) = env_parse("SENTINEL_BATCH_SIZE") {
            config.batch_size = batch;
        }
        if let Some(max) = env_parse("SENTINEL_MAX_AUTO_RETRY") {
            config.max_auto_retry = max;
        }
        if let Some(secs) = env_parse("SENTINEL_STUCK_SECS") {
            config.scan.stuck = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SENTINEL_ORPHAN_SECS") {
            config.scan.orphan = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SENTINEL_DEAD_WORKER_SECS") {
            config.scan.dead_worker = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
