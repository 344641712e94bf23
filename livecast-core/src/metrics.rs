//! Prometheus metrics for the broadcast control plane
//!
//! All collectors live in one registry; `gather()` renders it in the text
//! exposition format for whatever front end scrapes it.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Segment relay operations
pub mod relay {
    use super::{register_int_counter_vec_with_registry, IntCounterVec, REGISTRY};

    /// Files published through a storage provider
    pub static FILES_SAVED: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "relay_files_saved_total",
            "Total number of staged files published to storage",
            &["provider", "kind"],
            REGISTRY.clone()
        )
        .expect("Failed to register FILES_SAVED")
    });

    /// Files that never reached storage
    pub static FILES_DROPPED: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "relay_files_dropped_total",
            "Total number of staged files not published",
            &["reason"],
            REGISTRY.clone()
        )
        .expect("Failed to register FILES_DROPPED")
    });
}

/// Stream lifecycle
pub mod lifecycle {
    use super::{
        register_int_counter_vec_with_registry, register_int_gauge_with_registry, IntCounterVec,
        IntGauge, REGISTRY,
    };

    /// State machine transitions
    pub static TRANSITIONS: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "lifecycle_transitions_total",
            "Total number of stream lifecycle transitions",
            &["from", "to"],
            REGISTRY.clone()
        )
        .expect("Failed to register TRANSITIONS")
    });

    /// 1 while a live source is being broadcast
    pub static BROADCAST_LIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "broadcast_live",
            "Whether a live stream is currently broadcast",
            REGISTRY.clone()
        )
        .expect("Failed to register BROADCAST_LIVE")
    });
}

/// Render all metrics in the Prometheus text format
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
