//! Configuration management for HybridMesh.

use crate::error::{CoreError, CoreResult};
use crate::types::{clamp_signal, Device, TransportType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub delivery: DeliveryConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device_id: String,
    pub display_name: String,
    /// SQLite file holding messages, devices and peer keys. `:memory:` is allowed.
    pub database_path: PathBuf,
    /// Hex file holding the long-lived identity secret.
    pub identity_path: PathBuf,
    /// Fallback filter for `logging::init_with_filter` when `RUST_LOG` is unset.
    pub log_level: String,
    /// Radios available on this device.
    pub transports: Vec<TransportType>,
    /// Signal strength the local device contributes to its own links (dBm).
    pub signal_strength: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "node-001".to_string(),
            display_name: "HybridMesh node".to_string(),
            database_path: PathBuf::from("hybridmesh.db"),
            identity_path: PathBuf::from("identity.key"),
            log_level: "info".to_string(),
            transports: TransportType::ALL.to_vec(),
            signal_strength: -40,
        }
    }
}

impl NodeConfig {
    /// Topology record for the local device, seen at `now_ms`.
    pub fn local_device(&self, now_ms: u64) -> Device {
        let mut device = Device::new(
            self.device_id.clone(),
            self.display_name.clone(),
            TransportType::Bluetooth,
        )
        .with_signal(clamp_signal(self.signal_strength))
        .with_last_seen(now_ms)
        .with_online(true);
        device.transports = self.transports.iter().copied().collect();
        device
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Devices unseen for longer than this are pruned.
    pub staleness_window_ms: u64,
    pub prune_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            staleness_window_ms: 60_000,
            prune_interval_ms: 30_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_millis(self.staleness_window_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Message time-to-live.
    pub ttl_ms: u64,
    pub retry_interval_ms: u64,
    pub sweep_interval_ms: u64,
    /// Pause between delivery attempts when the pending queue is empty.
    pub attempt_interval_ms: u64,
    pub default_max_hops: u32,
    /// Status stream capacity; slow subscribers lose the oldest updates.
    pub status_channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            retry_interval_ms: 5_000,
            sweep_interval_ms: 60_000,
            attempt_interval_ms: 100,
            default_max_hops: crate::types::DEFAULT_MAX_HOPS,
            status_channel_capacity: 256,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Upper bound on messages waiting for upload; the oldest is dropped beyond it.
    pub max_queued: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            batch_size: 50,
            max_queued: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MeshConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML. Missing sections and keys take their defaults.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: MeshConfig =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.node.device_id.trim().is_empty() {
            return Err(CoreError::Config("node.device_id must not be empty".to_string()));
        }
        if self.node.transports.is_empty() {
            return Err(CoreError::Config("node.transports must not be empty".to_string()));
        }
        if self.delivery.default_max_hops == 0 {
            return Err(CoreError::Config(
                "delivery.default_max_hops must be at least 1".to_string(),
            ));
        }
        if self.sync.max_queued == 0 {
            return Err(CoreError::Config("sync.max_queued must be non-zero".to_string()));
        }
        if self.delivery.status_channel_capacity == 0 {
            return Err(CoreError::Config(
                "delivery.status_channel_capacity must be non-zero".to_string(),
            ));
        }

        let intervals = [
            ("discovery.staleness_window_ms", self.discovery.staleness_window_ms),
            ("discovery.prune_interval_ms", self.discovery.prune_interval_ms),
            ("delivery.ttl_ms", self.delivery.ttl_ms),
            ("delivery.retry_interval_ms", self.delivery.retry_interval_ms),
            ("delivery.sweep_interval_ms", self.delivery.sweep_interval_ms),
            ("delivery.attempt_interval_ms", self.delivery.attempt_interval_ms),
            ("sync.interval_ms", self.sync.interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(CoreError::Config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }
}
