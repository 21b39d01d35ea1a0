//! Process configuration.
//!
//! Every knob has a flag, an environment variable, and a default.

use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:10900";
pub const DEFAULT_SIDECAR_CONTAINER: &str = "linkerd-proxy";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    // redis://[:password@]host[:port][/db]
    pub url: String,
    #[serde(default = "default_redis_pool_max")]
    pub pool_max: usize,
}

fn default_redis_pool_max() -> usize {
    16
}

impl RedisConfig {
    /// Accepts either a full URL or a bare `host:port`.
    pub fn from_address(address: &str, pool_max: usize) -> Self {
        let address = address.trim();
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{address}")
        };
        Self { url, pool_max }
    }

    pub fn validate(&self) -> Result<(), String> {
        let s = self.url.trim();
        if s.is_empty() {
            return Err("redis url should not be empty".to_string());
        }

        let url = Url::parse(s).map_err(|e| format!("invalid redis url: {}", e))?;

        let scheme = url.scheme();
        if scheme != "redis" && scheme != "rediss" {
            return Err(format!("unsupported URL scheme: {}", scheme));
        }

        if url.host().is_none() {
            return Err("redis url must have a host".to_string());
        }

        if self.pool_max == 0 {
            return Err("pool_max must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
pub struct RedisArgs {
    /// Redis address (`host:port` or `redis://` URL)
    #[arg(long = "redis-url", env = "MCP_COLLECTOR_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub url: String,

    /// Redis connection pool size
    #[arg(long = "redis-pool-max", env = "MCP_REDIS_POOL_MAX", default_value_t = 16)]
    pub pool_max: usize,
}

impl RedisArgs {
    pub fn to_config(&self) -> RedisConfig {
        RedisConfig::from_address(&self.url, self.pool_max)
    }
}

#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    /// Default log directive; `RUST_LOG` takes precedence when set
    #[arg(long = "log-level", env = "MCP_LOG_LEVEL", default_value = "info")]
    pub level: String,

    /// Emit JSON log lines
    #[arg(long = "log-json", env = "MCP_LOG_JSON", default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mesh-collector", about = "Builds the mesh graph and reconciles policies")]
pub struct CollectorConfig {
    #[command(flatten)]
    pub redis: RedisArgs,

    /// Prometheus base URL
    #[arg(long, env = "MCP_COLLECTOR_PROMETHEUS_URL", default_value = DEFAULT_PROMETHEUS_URL)]
    pub prometheus_url: String,

    /// Seconds between metrics polls
    #[arg(long, env = "MCP_METRICS_POLL_SECS", default_value_t = 15)]
    pub metrics_poll_secs: u64,

    /// Rate window in seconds used by the edge query
    #[arg(long, env = "MCP_METRICS_WINDOW_SECS", default_value_t = 30)]
    pub metrics_window_secs: u64,

    /// Timeout in seconds for one metrics query
    #[arg(long, env = "MCP_METRICS_TIMEOUT_SECS", default_value_t = 10)]
    pub metrics_timeout_secs: u64,

    /// Timeout in seconds for the sidecar lookup on service events
    #[arg(long, env = "MCP_LOOKUP_TIMEOUT_SECS", default_value_t = 10)]
    pub lookup_timeout_secs: u64,

    /// Container name that marks a pod as meshed
    #[arg(long, env = "MCP_SIDECAR_CONTAINER", default_value = DEFAULT_SIDECAR_CONTAINER)]
    pub sidecar_container: String,

    /// Seconds between snapshot publications
    #[arg(long, env = "MCP_SNAPSHOT_INTERVAL_SECS", default_value_t = 30)]
    pub snapshot_interval_secs: u64,

    /// Snapshot TTL in seconds
    #[arg(long, env = "MCP_SNAPSHOT_TTL_SECS", default_value_t = 600)]
    pub snapshot_ttl_secs: u64,

    /// Seconds between policy reconciliation passes
    #[arg(long, env = "MCP_RECONCILE_INTERVAL_SECS", default_value_t = 30)]
    pub reconcile_interval_secs: u64,

    /// Gate reconciliation on holding the leader key
    #[arg(long, env = "MCP_RECONCILER_LEADER_ELECTION", default_value_t = false)]
    pub leader_election: bool,

    /// Leader key TTL in seconds
    #[arg(long, env = "MCP_LEADER_TTL_SECS", default_value_t = 60)]
    pub leader_ttl_secs: u64,

    /// Identity written to the leader key (defaults to a random UUID)
    #[arg(long, env = "MCP_POD_UID")]
    pub identity: Option<String>,

    /// Seconds to wait before resubscribing after the delta stream drops
    #[arg(long, env = "MCP_RESUBSCRIBE_DELAY_SECS", default_value_t = 5)]
    pub resubscribe_delay_secs: u64,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl CollectorConfig {
    pub fn metrics_poll_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_poll_secs)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay_secs)
    }

    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.redis.to_config().validate()?;
        Url::parse(self.prometheus_url.trim())
            .map_err(|e| format!("invalid prometheus url: {}", e))?;
        for (name, secs) in [
            ("metrics_poll_secs", self.metrics_poll_secs),
            ("metrics_window_secs", self.metrics_window_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("snapshot_ttl_secs", self.snapshot_ttl_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("leader_ttl_secs", self.leader_ttl_secs),
        ] {
            if secs == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if self.snapshot_ttl_secs <= self.snapshot_interval_secs {
            return Err(format!(
                "snapshot_ttl_secs ({}) must exceed snapshot_interval_secs ({})",
                self.snapshot_ttl_secs, self.snapshot_interval_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mesh-server", about = "Serves the mesh graph and accepts policy intents")]
pub struct ServerConfig {
    /// Redis address (`host:port` or `redis://` URL)
    #[arg(long = "redis-url", env = "MCP_SERVER_REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Redis connection pool size
    #[arg(long = "redis-pool-max", env = "MCP_REDIS_POOL_MAX", default_value_t = 16)]
    pub redis_pool_max: usize,

    /// Address the HTTP surface binds to
    #[arg(long, env = "MCP_SERVER_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: SocketAddr,

    /// Seconds to wait before resubscribing after the delta stream drops
    #[arg(long, env = "MCP_RESUBSCRIBE_DELAY_SECS", default_value_t = 5)]
    pub resubscribe_delay_secs: u64,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl ServerConfig {
    pub fn redis(&self) -> RedisConfig {
        RedisConfig::from_address(&self.redis_url, self.redis_pool_max)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_accepts_bare_address() {
        let cfg = RedisConfig::from_address("localhost:6379", 4);
        assert_eq!(cfg.url, "redis://localhost:6379");
        assert!(cfg.validate().is_ok());

        let cfg = RedisConfig::from_address("rediss://:secret@cache.internal:6380/2", 4);
        assert_eq!(cfg.url, "rediss://:secret@cache.internal:6380/2");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_redis_config_validation() {
        assert!(RedisConfig::from_address("", 4).validate().is_err());
        assert!(RedisConfig::from_address("http://localhost:6379", 4)
            .validate()
            .is_err());
        assert!(RedisConfig::from_address("localhost:6379", 0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_collector_defaults() {
        let cfg = CollectorConfig::try_parse_from(["mesh-collector"]).unwrap();
        assert_eq!(cfg.redis.to_config().url, DEFAULT_REDIS_URL);
        assert_eq!(cfg.prometheus_url, DEFAULT_PROMETHEUS_URL);
        assert_eq!(cfg.metrics_poll_interval(), Duration::from_secs(15));
        assert_eq!(cfg.metrics_window(), Duration::from_secs(30));
        assert_eq!(cfg.metrics_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.snapshot_interval(), Duration::from_secs(30));
        assert_eq!(cfg.snapshot_ttl(), Duration::from_secs(600));
        assert_eq!(cfg.reconcile_interval(), Duration::from_secs(30));
        assert!(!cfg.leader_election);
        assert_eq!(cfg.sidecar_container, DEFAULT_SIDECAR_CONTAINER);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_collector_rejects_ttl_shorter_than_interval() {
        let cfg = CollectorConfig::try_parse_from([
            "mesh-collector",
            "--snapshot-interval-secs",
            "30",
            "--snapshot-ttl-secs",
            "30",
        ])
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_collector_identity_falls_back_to_uuid() {
        let cfg = CollectorConfig::try_parse_from(["mesh-collector", "--identity", "pod-123"])
            .unwrap();
        assert_eq!(cfg.identity(), "pod-123");

        let cfg = CollectorConfig::try_parse_from(["mesh-collector", "--identity", " "]).unwrap();
        assert!(uuid::Uuid::parse_str(&cfg.identity()).is_ok());
    }

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::try_parse_from(["mesh-server"]).unwrap();
        assert_eq!(cfg.redis().url, DEFAULT_REDIS_URL);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert!(cfg.redis().validate().is_ok());
    }
}
