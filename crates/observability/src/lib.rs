//! Tracing and logging setup shared by every taskforge binary.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, ObservabilityConfig};

/// Initialize process-wide observability.
///
/// Logs are JSON unless `LOG_FORMAT=pretty`. This is safe to call multiple
/// times; subsequent calls become no-ops.
pub fn init() {
    let mut config = ObservabilityConfig::default();
    if let Some(format) = std::env::var("LOG_FORMAT").ok().and_then(|v| LogFormat::parse(&v)) {
        config.format = format;
    }
    tracing::init_with(&config);
}
