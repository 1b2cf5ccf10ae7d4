//! Tracing/logging setup shared by relay binaries.

/// Initialize process-wide tracing using `LOG_FORMAT` to pick the output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::LogFormat;
