//! Core functionality for the HybridMesh messaging engine.
//!
//! This crate provides the shared data model, configuration and logging
//! bootstrap used across the HybridMesh workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{DeliveryConfig, DiscoveryConfig, MeshConfig, NodeConfig, SyncConfig};
pub use error::{CoreError, CoreResult};
pub use types::{
    clamp_signal, current_timestamp_ms, Device, DeviceCapability, DeviceId, Message, MessageId,
    MessageStatus, TransportType, DEFAULT_MAX_HOPS, MAX_SIGNAL_STRENGTH, MIN_SIGNAL_STRENGTH,
};
