//! Daemon configuration.
//!
//! Loaded from a TOML file with per-section defaults; every knob has the
//! stock value baked in so an empty file (or no file at all) yields a
//! working daemon. Validation happens once at load time: a config that
//! passes [`Config::validate`] can be used without further checking.

use std::path::{Path, PathBuf};

use rfmp_proto::Ax25Address;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// Local node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Amateur radio callsign, 1-6 alphanumeric characters.
    pub callsign: String,
    /// Secondary station identifier, 0-15.
    pub ssid: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { callsign: "N0CALL".to_string(), ssid: 0 }
    }
}

/// TNC endpoint and connection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// KISS TCP host.
    pub direwolf_host: String,
    /// KISS TCP port.
    pub direwolf_port: u16,
    /// Seconds between reconnect attempts.
    pub reconnect_interval: u64,
    /// Suppress all TX and ingest; the daemon runs store-only.
    pub offline_mode: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            direwolf_host: "127.0.0.1".to_string(),
            direwolf_port: 8001,
            reconnect_interval: 5,
            offline_mode: false,
        }
    }
}

/// Protocol-level knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    /// Maximum encoded MSG bytes before fragmentation, 50-500.
    pub fragment_threshold: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { fragment_threshold: 200 }
    }
}

/// Transmission delay formula parameters, seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Fixed component of every delay.
    pub base_delay: f64,
    /// Upper bound of the uniform jitter component.
    pub jitter: f64,
    /// Extra delay per priority level below the maximum.
    pub priority_step: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { base_delay: 0.2, jitter: 0.4, priority_step: 0.35 }
    }
}

/// Rotating Bloom filter and periodic SYNC parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Seconds each window stays current.
    pub window_duration: u32,
    /// Number of rotating windows, 1-5. The wire format carries exactly
    /// three filters, so SYNC emission requires the default of 3.
    pub window_count: usize,
    /// Filter width in bits, a multiple of 8. The wire format fixes 256.
    pub bloom_bits: usize,
    /// Hash probes per id, 1-10.
    pub bloom_hashes: u32,
    /// Seconds between SYNC broadcasts.
    pub sync_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_duration: 600,
            window_count: 3,
            bloom_bits: 256,
            bloom_hashes: 3,
            sync_interval: 60,
        }
    }
}

/// REQ throttling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum REQ sends in any trailing minute.
    pub max_req_per_min: u32,
    /// First per-message backoff, seconds.
    pub initial_backoff: u32,
    /// Backoff ceiling, seconds.
    pub max_backoff: u32,
    /// Attempts after which an id is permanently blocked.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_req_per_min: 6, initial_backoff: 30, max_backoff: 600, max_retries: 4 }
    }
}

/// Persistent store location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Database file path; a leading `~/` expands to `$HOME`.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_path: "~/rfmpd/messages.db".to_string() }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local node identity.
    pub node: NodeConfig,
    /// TNC endpoint.
    pub network: NetworkConfig,
    /// Protocol knobs.
    pub protocol: ProtocolConfig,
    /// Delay formula.
    pub timing: TimingConfig,
    /// Rotating Bloom and SYNC cadence.
    pub sync: SyncConfig,
    /// REQ throttling.
    pub rate_limit: RateLimitConfig,
    /// Store location.
    pub storage: StorageConfig,
}

impl Config {
    /// Load from a TOML file, or defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// `DaemonError::Config` when the file cannot be read, does not parse,
    /// contains unknown keys, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    DaemonError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&text).map_err(|e| {
                    DaemonError::Config(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every bound the sections document.
    pub fn validate(&self) -> Result<(), DaemonError> {
        Ax25Address::new(&self.node.callsign, self.node.ssid)
            .map_err(|e| DaemonError::Config(format!("node identity: {e}")))?;

        if self.network.reconnect_interval == 0 {
            return Err(DaemonError::Config("reconnect_interval must be >= 1".to_string()));
        }
        if !(50..=500).contains(&self.protocol.fragment_threshold) {
            return Err(DaemonError::Config(
                "fragment_threshold must be 50-500".to_string(),
            ));
        }
        if self.timing.base_delay < 0.0
            || self.timing.jitter < 0.0
            || self.timing.priority_step < 0.0
        {
            return Err(DaemonError::Config("timing values must be >= 0".to_string()));
        }
        if self.sync.window_duration < 60 {
            return Err(DaemonError::Config("window_duration must be >= 60".to_string()));
        }
        if !(1..=5).contains(&self.sync.window_count) {
            return Err(DaemonError::Config("window_count must be 1-5".to_string()));
        }
        if self.sync.bloom_bits == 0 || self.sync.bloom_bits % 8 != 0 {
            return Err(DaemonError::Config(
                "bloom_bits must be a non-zero multiple of 8".to_string(),
            ));
        }
        if !(1..=10).contains(&self.sync.bloom_hashes) {
            return Err(DaemonError::Config("bloom_hashes must be 1-10".to_string()));
        }
        if self.sync.sync_interval < 10 {
            return Err(DaemonError::Config("sync_interval must be >= 10".to_string()));
        }
        if self.rate_limit.max_req_per_min == 0
            || self.rate_limit.initial_backoff == 0
            || self.rate_limit.max_retries == 0
        {
            return Err(DaemonError::Config("rate limit values must be >= 1".to_string()));
        }
        if self.rate_limit.max_backoff < 60 {
            return Err(DaemonError::Config("max_backoff must be >= 60".to_string()));
        }

        Ok(())
    }

    /// The node's AX.25 address. Valid after [`Config::validate`].
    pub fn node_address(&self) -> Result<Ax25Address, DaemonError> {
        Ax25Address::new(&self.node.callsign, self.node.ssid)
            .map_err(|e| DaemonError::Config(format!("node identity: {e}")))
    }

    /// Database path with `~/` expanded.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    expand_home_in(path, std::env::var("HOME").ok().as_deref())
}

fn expand_home_in(path: &str, home: Option<&str>) -> PathBuf {
    if let (Some(rest), Some(home)) = (path.strip_prefix("~/"), home) {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.node.callsign, "N0CALL");
        assert_eq!(config.network.direwolf_port, 8001);
        assert_eq!(config.protocol.fragment_threshold, 200);
        assert_eq!(config.sync.sync_interval, 60);
        assert_eq!(config.rate_limit.max_req_per_min, 6);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            callsign = "k1abc"
            ssid = 7

            [network]
            offline_mode = true
            "#,
        )
        .unwrap();

        assert_eq!(config.node.callsign, "k1abc");
        assert_eq!(config.node.ssid, 7);
        assert!(config.network.offline_mode);
        // Untouched sections keep their defaults.
        assert_eq!(config.sync.window_duration, 600);

        assert!(config.validate().is_ok());
        assert_eq!(config.node_address().unwrap().to_string(), "K1ABC-7");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [node]
            callsgn = "OOPS"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut config = Config::default();
        config.node.callsign = "TOOLONGCALL".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node.ssid = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.protocol.fragment_threshold = 20;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.bloom_bits = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limit.max_backoff = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn home_expansion() {
        assert_eq!(
            expand_home_in("~/rfmpd/messages.db", Some("/home/op")),
            PathBuf::from("/home/op/rfmpd/messages.db")
        );
        assert_eq!(expand_home_in("/var/lib/rfmpd.db", Some("/home/op")), {
            PathBuf::from("/var/lib/rfmpd.db")
        });
        assert_eq!(expand_home_in("~/x.db", None), PathBuf::from("~/x.db"));
    }
}
