//! Structured logging infrastructure for HybridMesh.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use hybridmesh_core::logging;
///
/// logging::init();
/// tracing::info!("Mesh node started");
/// ```
pub fn init() {
    init_with_filter("info");
}

/// Initialize logging with a fallback filter used when `RUST_LOG` is unset.
///
/// Returns quietly if a global subscriber is already installed, so test
/// harnesses and embedders can call it more than once.
pub fn init_with_filter(default_filter: &str) {
    let filter = build_filter(default_filter);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use hybridmesh_core::logging;
///
/// logging::init_json();
/// tracing::info!(device_id = "node-a", "Mesh node started");
/// ```
pub fn init_json() {
    let filter = build_filter("info");

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}

fn build_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
