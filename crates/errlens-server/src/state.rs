//! Shared application state

use errlens_detector::DetectionEngine;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    /// Detection engine backing every route
    pub engine: Arc<DetectionEngine>,

    /// Prometheus metrics handle for rendering
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(engine: Arc<DetectionEngine>, metrics_handle: PrometheusHandle) -> Self {
        Self {
            engine,
            metrics_handle,
        }
    }
}
