//! Engine configuration, sourced from the environment.

use std::time::Duration;

/// Worker configuration. Every field has a production default; only the
/// database DSN and JWT key are mandatory at the binary boundary.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub http_port: u16,
    /// Identity written into `workflow.host` and operation `handled_by`.
    pub host_ip: String,
    pub db_dsn: String,
    pub jwt_signing_key: String,
    /// A workflow whose heartbeat is older than this is takeover-eligible.
    pub stale_takeover: Duration,
    pub operation_scan_interval: Duration,
    pub takeover_scan_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http_port: 9090,
            host_ip: "127.0.0.1".to_string(),
            db_dsn: String::new(),
            jwt_signing_key: String::new(),
            stale_takeover: Duration::from_secs(30),
            operation_scan_interval: Duration::from_secs(2),
            takeover_scan_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment, falling back to the
    /// defaults above. Interval overrides are whole seconds.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_port: env_parse("OPSFLOW_HTTP_PORT", defaults.http_port),
            host_ip: std::env::var("OPSFLOW_HOST_IP").unwrap_or(defaults.host_ip),
            db_dsn: std::env::var("DATABASE_URL").unwrap_or(defaults.db_dsn),
            jwt_signing_key: std::env::var("OPSFLOW_JWT_SIGNING_KEY")
                .unwrap_or(defaults.jwt_signing_key),
            stale_takeover: env_secs("OPSFLOW_STALE_TAKEOVER_SECONDS", defaults.stale_takeover),
            operation_scan_interval: env_secs(
                "OPSFLOW_OPERATION_SCAN_INTERVAL_SECONDS",
                defaults.operation_scan_interval,
            ),
            takeover_scan_interval: env_secs(
                "OPSFLOW_TAKEOVER_SCAN_INTERVAL_SECONDS",
                defaults.takeover_scan_interval,
            ),
            heartbeat_interval: env_secs(
                "OPSFLOW_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.stale_takeover, Duration::from_secs(30));
        assert_eq!(config.operation_scan_interval, Duration::from_secs(2));
        assert_eq!(config.takeover_scan_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }
}
