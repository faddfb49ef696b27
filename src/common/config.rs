//! Configuration for veilq nodes
//!
//! Loaded from an optional TOML file plus `VEILQ__` environment overrides.
//! The delay parameters govern the privacy behavior of the flush scheduler;
//! startup fails hard when the shared instance secret is missing rather than
//! running with a silently substituted default.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::common::{Error, Result};

/// Global node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Instance identity and fleet membership
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Delayed-flush scheduling parameters
    #[serde(default)]
    pub delay: DelayConfig,

    /// Leader election parameters
    #[serde(default)]
    pub election: ElectionConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-instance identity and authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Advertised host, reachable by the other instances
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind and advertised port; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret authenticating inter-instance transfer calls.
    /// Required; an empty value fails startup.
    #[serde(default)]
    pub secret: String,

    /// Admin token accepted by the administrative endpoints
    #[serde(default)]
    pub admin_token: String,

    /// Single-instance deployment: skip election, self-declare leader
    #[serde(default)]
    pub standalone: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8700
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secret: String::new(),
            admin_token: String::new(),
            standalone: false,
        }
    }
}

impl InstanceConfig {
    /// Instance identity, derived from the advertised host:port
    pub fn instance_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bad instance address: {}", e)))
    }
}

/// Parameters of the randomized flush scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Lower bound of the flush percentage walk
    #[serde(default = "default_min_percentage")]
    pub min_percentage: u32,

    /// Upper bound of the flush percentage walk
    #[serde(default = "default_max_percentage")]
    pub max_percentage: u32,

    /// Step added to the percentage after a productive cycle
    #[serde(default = "default_percentage_increment")]
    pub percentage_increment: u32,

    /// Probability (percent) that a productive cycle resets the walk instead
    #[serde(default = "default_reset_chance")]
    pub reset_chance_percentage: u32,

    /// Per-question floor of responses that must stay queued after a flush
    #[serde(default = "default_minimum_submissions")]
    pub minimum_survey_submissions: usize,

    /// Delay window (seconds) for the first arm after an idle queue
    #[serde(default = "default_cold_window_min")]
    pub cold_window_min_secs: u64,
    #[serde(default = "default_cold_window_max")]
    pub cold_window_max_secs: u64,

    /// Delay window (seconds) for re-arming after a productive flush
    #[serde(default = "default_hot_window_min")]
    pub hot_window_min_secs: u64,
    #[serde(default = "default_hot_window_max")]
    pub hot_window_max_secs: u64,

    /// Timeout for outbound transfer calls
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_min_percentage() -> u32 {
    30
}
fn default_max_percentage() -> u32 {
    70
}
fn default_percentage_increment() -> u32 {
    2
}
fn default_reset_chance() -> u32 {
    5
}
fn default_minimum_submissions() -> usize {
    3
}
fn default_cold_window_min() -> u64 {
    600
}
fn default_cold_window_max() -> u64 {
    2400
}
fn default_hot_window_min() -> u64 {
    15
}
fn default_hot_window_max() -> u64 {
    45
}
fn default_transfer_timeout() -> u64 {
    5
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_percentage: default_min_percentage(),
            max_percentage: default_max_percentage(),
            percentage_increment: default_percentage_increment(),
            reset_chance_percentage: default_reset_chance(),
            minimum_survey_submissions: default_minimum_submissions(),
            cold_window_min_secs: default_cold_window_min(),
            cold_window_max_secs: default_cold_window_max(),
            hot_window_min_secs: default_hot_window_min(),
            hot_window_max_secs: default_hot_window_max(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl DelayConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// Leader election parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Lease lifetime; a leader that stops renewing loses within this window
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Interval between lease renewal attempts; must stay under the TTL
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Initial backoff after a coordination store failure
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// Backoff cap
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max_secs: u64,
}

fn default_lease_ttl() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_retry_backoff() -> u64 {
    1
}
fn default_retry_backoff_max() -> u64 {
    60
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            retry_backoff_secs: default_retry_backoff(),
            retry_backoff_max_secs: default_retry_backoff_max(),
        }
    }
}

impl ElectionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus `VEILQ__` env vars,
    /// then validate. Env overrides use `__` as section separator, e.g.
    /// `VEILQ__INSTANCE__SECRET`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p)),
            None => builder.add_source(config::File::with_name("veilq").required(false)),
        };

        let raw = builder
            .add_source(
                config::Environment::with_prefix("VEILQ")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would weaken the privacy behavior.
    pub fn validate(&self) -> Result<()> {
        if self.instance.secret.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "instance.secret is required; refusing to start without a shared instance secret"
                    .into(),
            ));
        }
        if self.delay.min_percentage == 0 || self.delay.min_percentage > self.delay.max_percentage {
            return Err(Error::InvalidConfig(format!(
                "percentage bounds out of order: min {} max {}",
                self.delay.min_percentage, self.delay.max_percentage
            )));
        }
        if self.delay.max_percentage > 100 || self.delay.reset_chance_percentage > 100 {
            return Err(Error::InvalidConfig("percentages must be <= 100".into()));
        }
        if self.delay.minimum_survey_submissions == 0 {
            return Err(Error::InvalidConfig(
                "minimum_survey_submissions must be at least 1".into(),
            ));
        }
        if self.delay.cold_window_min_secs > self.delay.cold_window_max_secs
            || self.delay.hot_window_min_secs > self.delay.hot_window_max_secs
        {
            return Err(Error::InvalidConfig("delay windows out of order".into()));
        }
        if self.election.heartbeat_interval_secs >= self.election.lease_ttl_secs {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be shorter than the lease TTL".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            instance: InstanceConfig {
                secret: "fleet-secret".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = valid_config();
        assert_eq!(cfg.delay.min_percentage, 30);
        assert_eq!(cfg.delay.max_percentage, 70);
        assert_eq!(cfg.delay.percentage_increment, 2);
        assert_eq!(cfg.delay.reset_chance_percentage, 5);
        assert_eq!(cfg.delay.minimum_survey_submissions, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_secret_rejected() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_inverted_percentages_rejected() {
        let mut cfg = valid_config();
        cfg.delay.min_percentage = 80;
        cfg.delay.max_percentage = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_undercut_ttl() {
        let mut cfg = valid_config();
        cfg.election.heartbeat_interval_secs = 30;
        cfg.election.lease_ttl_secs = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_instance_id_is_host_port() {
        let cfg = valid_config();
        assert_eq!(cfg.instance.instance_id(), "127.0.0.1:8700");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veilq.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[instance]
host = "10.0.0.5"
port = 9000
secret = "s3cret"

[delay]
min_percentage = 40
"#
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.instance.instance_id(), "10.0.0.5:9000");
        assert_eq!(cfg.delay.min_percentage, 40);
        assert_eq!(cfg.delay.max_percentage, 70);
    }

    #[test]
    fn test_load_rejects_empty_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veilq.toml");
        std::fs::write(&path, "[instance]\nport = 9001\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
