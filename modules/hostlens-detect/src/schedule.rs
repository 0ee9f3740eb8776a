use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hostlens_common::HostlensConfig;

/// Floor applied to every computed interval so a misconfigured custom
/// function cannot spin the scanner.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(10);

/// Default interval function: scan hard right after startup, slow down once
/// past it, and slow down further when there is a live population.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPolicy {
    pub startup_window: Duration,
    pub startup_interval: Duration,
    pub empty_interval: Duration,
    pub steady_interval: Duration,
}

impl ScanPolicy {
    pub fn interval(&self, live: usize, elapsed: Duration) -> Duration {
        if elapsed < self.startup_window {
            self.startup_interval
        } else if live == 0 {
            self.empty_interval
        } else {
            self.steady_interval
        }
    }
}

impl From<&HostlensConfig> for ScanPolicy {
    fn from(config: &HostlensConfig) -> Self {
        Self {
            startup_window: config.scan_startup_window,
            startup_interval: config.scan_startup_interval,
            empty_interval: config.scan_empty_interval,
            steady_interval: config.scan_steady_interval,
        }
    }
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self::from(&HostlensConfig::default())
    }
}

type IntervalFn = dyn Fn(usize, Duration) -> Duration + Send + Sync;

/// How long to wait before the next exhaustive scan, as a function of the
/// live-entity count and time since the detector started.
#[derive(Clone)]
pub enum ScanInterval {
    Policy(ScanPolicy),
    Custom(Arc<IntervalFn>),
}

impl ScanInterval {
    pub fn fixed(every: Duration) -> Self {
        Self::custom(move |_, _| every)
    }

    pub fn custom(f: impl Fn(usize, Duration) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn next(&self, live: usize, elapsed: Duration) -> Duration {
        let interval = match self {
            ScanInterval::Policy(policy) => policy.interval(live, elapsed),
            ScanInterval::Custom(f) => f(live, elapsed),
        };
        interval.max(MIN_SCAN_INTERVAL)
    }
}

impl Default for ScanInterval {
    fn default() -> Self {
        Self::Policy(ScanPolicy::default())
    }
}

impl fmt::Debug for ScanInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanInterval::Policy(policy) => f.debug_tuple("Policy").field(policy).finish(),
            ScanInterval::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
