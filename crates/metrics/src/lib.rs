//! Metric names emitted by the relay, plus the optional Prometheus recorder.
//!
//! Call sites use the re-exported `metrics` macros with the constants below so
//! every series name lives in one place.

pub use metrics::{counter, gauge, histogram};

pub mod relay {
    /// Dispatch attempts, labelled with `outcome`.
    pub const DISPATCH_TOTAL: &str = "botlink_dispatch_total";
    pub const DISPATCH_DURATION_SECONDS: &str = "botlink_dispatch_duration_seconds";
    pub const PENDING_REQUESTS: &str = "botlink_pending_requests";
    /// Late or unknown replies that matched no pending request.
    pub const REPLIES_DROPPED_TOTAL: &str = "botlink_replies_dropped_total";
}

pub mod connections {
    /// Handshake results, labelled with `result`.
    pub const AUTHORIZATIONS_TOTAL: &str = "botlink_authorizations_total";
    pub const ACTIVE: &str = "botlink_connections_active";
    pub const REPLACED_TOTAL: &str = "botlink_connections_replaced_total";
    pub const EVICTED_TOTAL: &str = "botlink_connections_evicted_total";
}

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

/// Install the global Prometheus recorder and return a render handle.
#[cfg(feature = "prometheus")]
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                relay::DISPATCH_DURATION_SECONDS.to_string(),
            ),
            &[0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )?
        .install_recorder()?;
    tracing::debug!("prometheus recorder installed");
    Ok(handle)
}
