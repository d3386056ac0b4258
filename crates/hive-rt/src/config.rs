//! Actor system configuration.
//!
//! All options have defaults; host processes override them directly or
//! through string key/value pairs (`set`). Invalid values are fatal at
//! startup: system construction validates and fails instead of running
//! half-configured.

use std::time::Duration;

use crate::error::Error;

/// Run-queue organization of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    /// Per-worker queues plus stealing (default).
    WorkStealing,
    /// One shared queue for all workers.
    Sharing,
}

/// Configuration for one actor system.
#[derive(Debug, Clone)]
pub struct ActorSystemConfig {
    pub scheduler_policy: SchedulerPolicy,
    /// Worker count; 0 means one per hardware thread.
    pub max_threads: usize,
    /// Messages per resumable run.
    pub max_throughput: usize,
    /// BASP heartbeat interval; zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals before a peer is declared dead.
    pub heartbeat_misses: u32,
    /// Bounds the BASP read loop per wake-up.
    pub max_consecutive_reads: usize,
    /// Advisory flag for the transport host.
    pub enable_tcp_nodelay: bool,
    /// Record per-actor messages-processed and cpu-time counters.
    pub enable_profiling: bool,
}

impl Default for ActorSystemConfig {
    fn default() -> ActorSystemConfig {
        ActorSystemConfig {
            scheduler_policy: SchedulerPolicy::WorkStealing,
            max_threads: 0,
            max_throughput: 100,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 3,
            max_consecutive_reads: 50,
            enable_tcp_nodelay: true,
            enable_profiling: false,
        }
    }
}

impl ActorSystemConfig {
    /// Set an option by its string key, e.g. from CLI flags:
    /// `scheduler.policy`, `scheduler.max-threads`,
    /// `scheduler.max-throughput`, `scheduler.enable-profiling`,
    /// `middleman.heartbeat-interval`, `middleman.max-consecutive-reads`,
    /// `middleman.enable-tcp-nodelay`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        match key {
            "scheduler.policy" => {
                self.scheduler_policy = match value {
                    "work-stealing" => SchedulerPolicy::WorkStealing,
                    "sharing" => SchedulerPolicy::Sharing,
                    _ => return Err(invalid(key, value)),
                };
            }
            "scheduler.max-threads" => {
                self.max_threads = value.parse().map_err(|_| invalid(key, value))?;
            }
            "scheduler.max-throughput" => {
                self.max_throughput = value.parse().map_err(|_| invalid(key, value))?;
            }
            "scheduler.enable-profiling" => {
                self.enable_profiling = parse_bool(key, value)?;
            }
            "middleman.heartbeat-interval" => {
                self.heartbeat_interval = parse_duration(key, value)?;
            }
            "middleman.max-consecutive-reads" => {
                self.max_consecutive_reads = value.parse().map_err(|_| invalid(key, value))?;
            }
            "middleman.enable-tcp-nodelay" => {
                self.enable_tcp_nodelay = parse_bool(key, value)?;
            }
            _ => return Err(Error::InvalidOption(format!("unknown option '{key}'"))),
        }
        Ok(())
    }

    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_throughput == 0 {
            return Err(Error::InvalidOption(
                "scheduler.max-throughput must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_reads == 0 {
            return Err(Error::InvalidOption(
                "middleman.max-consecutive-reads must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_misses < 3 {
            return Err(Error::InvalidOption(
                "middleman heartbeat tolerance must be at least 3 intervals".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidOption(format!("invalid value '{value}' for '{key}'"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

/// Durations accept `ms` and `s` suffixes; a bare number is
/// milliseconds. `0` disables the timer.
fn parse_duration(key: &str, value: &str) -> Result<Duration, Error> {
    let (number, unit_ms) = if let Some(v) = value.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = value.strip_suffix('s') {
        (v, 1000u64)
    } else {
        (value, 1u64)
    };
    let n: u64 = number.parse().map_err(|_| invalid(key, value))?;
    Ok(Duration::from_millis(n * unit_ms))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
