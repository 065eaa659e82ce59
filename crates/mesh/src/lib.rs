//! HybridMesh Mesh - delay-tolerant messaging over multiple short-range transports
//!
//! Devices found by several radios are merged into one topology, routed with
//! Dijkstra over link costs, and messages are delivered hop by hop through a
//! persistent store-and-forward pipeline.
//!
//! # Core Components
//!
//! - **Discovery Merge**: one record per device across transport snapshots
//! - **Routing Engine**: connection graph, best and disjoint alternate routes
//! - **Delivery Pipeline**: durable PENDING -> SENT -> DELIVERED state machine
//! - **Mesh Node**: key exchange, envelope encryption and background tasks
//!
//! # Design Principles
//!
//! 1. **Store first**: every transition is persisted before it is published
//! 2. **No plaintext fallback**: a missing peer key is an error
//! 3. **Disconnection is normal**: no route and transport failures are retried
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use hybridmesh_core::{logging, MeshConfig};
//! use hybridmesh_mesh::{LoopbackNetwork, MeshNode};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::from_file("hybridmesh.toml")?;
//! logging::init_with_filter(&config.node.log_level);
//!
//! let network = Arc::new(LoopbackNetwork::new());
//! let node = Arc::new(MeshNode::open(config, network)?);
//! node.start().await?;
//!
//! let status = node.status();
//! println!("Discovered devices: {}", status.discovered_devices);
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod delivery;
pub mod discovery;
pub mod error;
pub mod node;
pub mod routing;
pub mod store;
pub mod sync;
pub mod transport;

// Re-export main types
pub use control::{ControlMessage, PUBLIC_KEY_PREFIX, REQUEST_PUBLIC_KEY};
pub use delivery::{
    AttemptOutcome, DeliveryPipeline, FailureReason, QueueStatus, StatusUpdate, SweepReport,
};
pub use discovery::{DeviceSnapshot, Discovery, DiscoveryMerge};
pub use error::{MeshError, MeshResult};
pub use node::{Inbound, MeshNode, MeshStatus};
pub use routing::{Connection, Hop, Route, RoutingEngine, RoutingSnapshot};
pub use store::{MessageStore, SqliteStore};
pub use sync::{SyncForwarder, SyncSink, SyncStats};
pub use transport::{decode_message, encode_message, Inbox, LoopbackNetwork, MeshTransport};
