//! Tracing and logging setup shared by the API and worker binaries.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    self::tracing::init(format);
}
