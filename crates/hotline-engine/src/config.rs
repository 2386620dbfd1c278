use std::env;
use std::time::Duration;

/// Engine tuning knobs. Every field can be overridden through a
/// `HOTLINE_*` environment variable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a session lives without being extended.
    pub session_ttl: Duration,
    /// Period of the sweep that deletes expired sessions.
    pub expiry_sweep_interval: Duration,
    /// Period of the sweep that evicts silent connections.
    pub liveness_sweep_interval: Duration,
    /// A connection is evicted once this long passes without a ping.
    pub heartbeat_timeout: Duration,
    /// Window during which successive pushes to a session coalesce.
    pub batch_delay: Duration,
    /// Deltas with at least this many changed nodes ship as a full update.
    pub incremental_threshold: usize,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_ttl: env_secs("HOTLINE_SESSION_TTL_SECS", defaults.session_ttl),
            expiry_sweep_interval: env_secs(
                "HOTLINE_EXPIRY_SWEEP_SECS",
                defaults.expiry_sweep_interval,
            ),
            liveness_sweep_interval: env_secs(
                "HOTLINE_LIVENESS_SWEEP_SECS",
                defaults.liveness_sweep_interval,
            ),
            heartbeat_timeout: env_secs(
                "HOTLINE_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            batch_delay: env_millis("HOTLINE_BATCH_DELAY_MS", defaults.batch_delay),
            incremental_threshold: env::var("HOTLINE_INCREMENTAL_THRESHOLD")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.incremental_threshold),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(8 * 60 * 60),
            expiry_sweep_interval: Duration::from_secs(60),
            liveness_sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            batch_delay: Duration::from_millis(50),
            incremental_threshold: 10,
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
