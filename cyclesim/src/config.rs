use std::time::Duration;

use clap::{ArgAction, CommandFactory, Parser};
use serde::Serialize;

use crate::driver::DriverError;
use crate::plusargs;

pub const DEFAULT_PROCS: u32 = 2;
pub const DEFAULT_PERIOD: f64 = 10e-9;
pub const DEFAULT_OPEN_RETRIES: u32 = 40;
pub const DEFAULT_OPEN_BACKOFF_MS: u64 = 10;
pub const MAX_OPEN_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_START_DELAY_SECS: f64 = 86_400.0;

/// Simulated time resolution, 1ps.
pub const TIME_UNITS_PER_SEC: f64 = 1e12;

#[derive(Parser, Debug, Serialize, Clone)]
#[command(name = "cyclesim", about = "Cycle-synchronized simulation driver")]
pub struct SimCli {
    /// Barrier shared with the other simulators; runs unsynchronized when unset
    #[arg(long)]
    pub barrier_uri: Option<String>,

    /// Whether this process creates the barrier: 0/1/true/false
    #[arg(long, default_value = "0", value_parser = parse_flag, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "1")]
    pub barrier_leader: bool,

    /// Number of simulators meeting at the barrier
    #[arg(long, default_value_t = DEFAULT_PROCS)]
    pub barrier_procs: u32,

    /// Fail a barrier wait after this many milliseconds
    #[arg(long)]
    pub barrier_timeout_ms: Option<u64>,

    /// Stop after this many cycles, 0 for no limit
    #[arg(long, default_value_t = 0)]
    pub max_cycles: u64,

    /// Clock period in seconds
    #[arg(long, default_value_t = DEFAULT_PERIOD)]
    pub period: f64,

    /// Attempts to open the barrier before giving up
    #[arg(long, default_value_t = DEFAULT_OPEN_RETRIES)]
    pub open_retries: u32,

    /// First delay between open attempts; doubles up to 250ms
    #[arg(long, default_value_t = DEFAULT_OPEN_BACKOFF_MS)]
    pub open_backoff_ms: u64,

    /// Seconds to sleep after opening the barrier and before the first cycle
    #[arg(long)]
    pub start_delay: Option<f64>,

    /// The built-in counter model finishes once it reaches this value, 0 for never
    #[arg(long, default_value_t = 0)]
    pub finish_at: u64,

    /// Output filename for the JSON run summary
    #[arg(long, default_value = "")]
    pub summary: String,
}

fn parse_flag(s: &str) -> Result<bool, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" | "" => Ok(false),
        other => other
            .parse::<i64>()
            .map(|v| v != 0)
            .map_err(|_| format!("expected 0/1/true/false, got {:?}", s)),
    }
}

impl SimCli {
    /// Parses flags and plusargs alike. Plusargs this program does not know
    /// belong to the simulator and are ignored.
    pub fn parse_args<I>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = String>,
    {
        let known: Vec<String> = Self::command()
            .get_arguments()
            .filter_map(|a| a.get_long().map(str::to_string))
            .collect();
        Self::try_parse_from(plusargs::normalize(args, &known))
    }

    pub fn to_config(&self) -> Result<DriverConfig, DriverError> {
        if !(self.period.is_finite() && self.period > 0.0) {
            return Err(DriverError::InvalidConfig(format!(
                "period must be a positive number of seconds, got {}",
                self.period
            )));
        }
        let period_units = (self.period * TIME_UNITS_PER_SEC).round() as u64;
        if period_units < 2 {
            return Err(DriverError::InvalidConfig(format!(
                "period {}s is below the 1ps time resolution",
                self.period
            )));
        }
        let rise = period_units / 2;
        let half_periods = (rise, period_units - rise);

        let barrier = match self.barrier_uri.as_deref() {
            None | Some("") => None,
            Some(uri) => {
                if self.barrier_procs == 0 {
                    return Err(DriverError::InvalidConfig(
                        "barrier_procs must be at least 1".to_string(),
                    ));
                }
                Some(BarrierSettings {
                    uri: uri.to_string(),
                    leader: self.barrier_leader,
                    procs: self.barrier_procs,
                    timeout: self
                        .barrier_timeout_ms
                        .filter(|ms| *ms > 0)
                        .map(Duration::from_millis),
                })
            }
        };

        let start_delay = match self.start_delay {
            Some(secs) if secs.is_nan() || secs > MAX_START_DELAY_SECS => {
                return Err(DriverError::InvalidConfig(format!(
                    "start_delay {} is not a usable number of seconds",
                    secs
                )))
            }
            // negative means no delay
            Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            _ => None,
        };

        Ok(DriverConfig {
            barrier,
            max_cycles: self.max_cycles,
            half_periods,
            start_delay,
            retry: RetryPolicy {
                attempts: self.open_retries.max(1),
                initial_backoff: Duration::from_millis(self.open_backoff_ms),
                max_backoff: MAX_OPEN_BACKOFF,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierSettings {
    pub uri: String,
    pub leader: bool,
    pub procs: u32,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed open (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_OPEN_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_OPEN_BACKOFF_MS),
            max_backoff: MAX_OPEN_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// `None` runs unsynchronized.
    pub barrier: Option<BarrierSettings>,
    pub max_cycles: u64,
    /// Simulated time, in ps, spent before the rising edge and before the
    /// falling edge of each cycle.
    pub half_periods: (u64, u64),
    pub start_delay: Option<Duration>,
    pub retry: RetryPolicy,
}

impl DriverConfig {
    pub fn unsynchronized(max_cycles: u64) -> Self {
        Self {
            barrier: None,
            max_cycles,
            half_periods: (5_000, 5_000),
            start_delay: None,
            retry: RetryPolicy::default(),
        }
    }
}
