use std::time::Duration;

use tracing::warn;

use crate::transport::chunk::ChunkConfig;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime configuration for one sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub chunk: ChunkConfig,
    /// Upper bound on a single signal send before it counts as failed.
    pub send_timeout: Duration,
    /// How often the intake task sweeps idle partial transfers.
    pub sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `COSTATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            chunk: ChunkConfig::from_lookup(&lookup),
            send_timeout: parse_duration_ms(
                &lookup,
                "COSTATE_SEND_TIMEOUT_MS",
                DEFAULT_SEND_TIMEOUT,
                Duration::from_millis(1),
            ),
            sweep_interval: parse_duration_ms(
                &lookup,
                "COSTATE_SWEEP_INTERVAL_MS",
                DEFAULT_SWEEP_INTERVAL,
                Duration::from_millis(10),
            ),
        }
    }
}

pub(crate) fn parse_usize<F>(lookup: &F, var: &str, default: usize, min: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "costate::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "costate::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config value; using default"
                );
                default
            }
        },
        None => default,
    }
}

pub(crate) fn parse_duration_ms<F>(lookup: &F, var: &str, default: Duration, min: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let min_ms = usize::try_from(min.as_millis()).unwrap_or(usize::MAX);
    let default_ms = usize::try_from(default.as_millis()).unwrap_or(usize::MAX);
    let ms = parse_usize(lookup, var, default_ms, min_ms);
    Duration::from_millis(ms as u64)
}
