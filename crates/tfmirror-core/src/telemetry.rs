//! Prometheus metrics for sync runs and downloads.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `tfmirror_sync_duration_seconds` | Histogram | `mirror` |
//! | `tfmirror_sync_errors_total` | Counter | `mirror` |
//! | `tfmirror_binary_downloads_total` | Counter | `version`, `os`, `arch` |

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Sync runs range from seconds (nothing to do) to tens of minutes.
pub const SYNC_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Metrics owned by one mirror process.
///
/// Cheap to clone; all clones feed the same registry.
#[derive(Clone)]
pub struct MirrorMetrics {
    registry: Registry,
    sync_duration: HistogramVec,
    sync_errors_total: CounterVec,
    binary_downloads_total: CounterVec,
}

impl std::fmt::Debug for MirrorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorMetrics").finish_non_exhaustive()
    }
}

impl MirrorMetrics {
    /// Create the metric families on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let sync_duration = HistogramVec::new(
            HistogramOpts::new(
                "tfmirror_sync_duration_seconds",
                "Wall-clock duration of mirror sync runs",
            )
            .buckets(SYNC_DURATION_BUCKETS.to_vec()),
            &["mirror"],
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        let sync_errors_total = CounterVec::new(
            Opts::new(
                "tfmirror_sync_errors_total",
                "Sync runs that failed or left platforms in error",
            ),
            &["mirror"],
        )?;
        registry.register(Box::new(sync_errors_total.clone()))?;

        let binary_downloads_total = CounterVec::new(
            Opts::new(
                "tfmirror_binary_downloads_total",
                "Download URLs issued for mirrored binaries",
            ),
            &["version", "os", "arch"],
        )?;
        registry.register(Box::new(binary_downloads_total.clone()))?;

        Ok(Self {
            registry,
            sync_duration,
            sync_errors_total,
            binary_downloads_total,
        })
    }

    /// Create metrics wrapped for sharing across tasks.
    pub fn shared() -> Result<Arc<Self>, MetricsError> {
        Self::new().map(Arc::new)
    }

    pub fn observe_sync_duration(&self, mirror: &str, seconds: f64) {
        self.sync_duration
            .with_label_values(&[truncate_label(mirror)])
            .observe(seconds);
    }

    pub fn sync_error(&self, mirror: &str) {
        self.sync_errors_total
            .with_label_values(&[truncate_label(mirror)])
            .inc();
    }

    pub fn binary_download(&self, version: &str, os: &str, arch: &str) {
        self.binary_downloads_total
            .with_label_values(&[truncate_label(version), truncate_label(os), truncate_label(arch)])
            .inc();
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn sync_error_count(&self, mirror: &str) -> f64 {
        self.sync_errors_total.with_label_values(&[mirror]).get()
    }

    #[cfg(test)]
    pub(crate) fn download_count(&self, version: &str, os: &str, arch: &str) -> f64 {
        self.binary_downloads_total
            .with_label_values(&[version, os, arch])
            .get()
    }
}

/// Cut a label value to [`MAX_LABEL_VALUE_LEN`] bytes on a char boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
