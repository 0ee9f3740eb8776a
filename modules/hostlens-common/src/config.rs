use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::HostlensError;
use crate::types::DEFAULT_PARSE_THRESHOLD;

/// Engine configuration loaded from environment variables.
///
/// Every variable is optional; unset variables fall back to the defaults in
/// [`HostlensConfig::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct HostlensConfig {
    /// Minimum parse score (exclusive) for a candidate to be tracked.
    pub parse_threshold: f64,
    /// Ceiling on a single active identity probe.
    pub probe_timeout: Duration,

    // Scan cadence
    /// How long after startup the scanner runs at `scan_startup_interval`.
    pub scan_startup_window: Duration,
    pub scan_startup_interval: Duration,
    /// Cadence once past startup while nothing is tracked.
    pub scan_empty_interval: Duration,
    /// Cadence once past startup with a live population.
    pub scan_steady_interval: Duration,
}

impl Default for HostlensConfig {
    fn default() -> Self {
        Self {
            parse_threshold: DEFAULT_PARSE_THRESHOLD,
            probe_timeout: Duration::from_millis(3_000),
            scan_startup_window: Duration::from_secs(60),
            scan_startup_interval: Duration::from_millis(500),
            scan_empty_interval: Duration::from_secs(2),
            scan_steady_interval: Duration::from_secs(10),
        }
    }
}

impl HostlensConfig {
    /// Load configuration from `HOSTLENS_*` environment variables.
    pub fn from_env() -> Result<Self, HostlensError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HostlensError> {
        let defaults = Self::default();
        let config = Self {
            parse_threshold: optional_f64(&lookup, "HOSTLENS_PARSE_THRESHOLD")?
                .unwrap_or(defaults.parse_threshold),
            probe_timeout: optional_millis(&lookup, "HOSTLENS_PROBE_TIMEOUT_MS")?
                .unwrap_or(defaults.probe_timeout),
            scan_startup_window: optional_millis(&lookup, "HOSTLENS_SCAN_STARTUP_WINDOW_MS")?
                .unwrap_or(defaults.scan_startup_window),
            scan_startup_interval: optional_millis(&lookup, "HOSTLENS_SCAN_STARTUP_INTERVAL_MS")?
                .unwrap_or(defaults.scan_startup_interval),
            scan_empty_interval: optional_millis(&lookup, "HOSTLENS_SCAN_EMPTY_INTERVAL_MS")?
                .unwrap_or(defaults.scan_empty_interval),
            scan_steady_interval: optional_millis(&lookup, "HOSTLENS_SCAN_STEADY_INTERVAL_MS")?
                .unwrap_or(defaults.scan_steady_interval),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HostlensError> {
        if !(0.0..1.0).contains(&self.parse_threshold) {
            return Err(HostlensError::Config(format!(
                "parse threshold must be in [0, 1), got {}",
                self.parse_threshold
            )));
        }
        for (name, value) in [
            ("probe timeout", self.probe_timeout),
            ("scan startup interval", self.scan_startup_interval),
            ("scan empty interval", self.scan_empty_interval),
            ("scan steady interval", self.scan_steady_interval),
        ] {
            if value.is_zero() {
                return Err(HostlensError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Log the active configuration. Nothing here is secret, but the name
    /// matches the other services' startup logging.
    pub fn log_redacted(&self) {
        info!(
            parse_threshold = self.parse_threshold,
            probe_timeout_ms = self.probe_timeout.as_millis() as u64,
            scan_startup_window_ms = self.scan_startup_window.as_millis() as u64,
            scan_startup_interval_ms = self.scan_startup_interval.as_millis() as u64,
            scan_empty_interval_ms = self.scan_empty_interval.as_millis() as u64,
            scan_steady_interval_ms = self.scan_steady_interval.as_millis() as u64,
            "Hostlens configuration"
        );
    }
}

fn optional_f64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<f64>, HostlensError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HostlensError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}

fn optional_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, HostlensError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| {
                HostlensError::Config(format!("{key} must be milliseconds, got {raw:?}"))
            }),
    }
}
