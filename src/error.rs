use thiserror::Error;

/// Errors returned by tracer, strategy, and emitter constructors.
///
/// Configuration problems fail fast at construction time. Transient I/O
/// failures during emission are not surfaced through this type; they are
/// logged and the affected trace data is dropped.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The sampling manifest declares a version this crate does not support.
    #[error("unsupported sampling manifest version: {0}")]
    UnsupportedManifestVersion(u64),

    /// A sampling rule failed validation.
    #[error("invalid sampling rule: {0}")]
    InvalidRule(String),

    /// The daemon address string could not be parsed.
    #[error("invalid daemon address `{0}`")]
    InvalidDaemonAddress(String),

    /// A remote rule fetch failed. Reported by `RuleFetcher` implementations;
    /// the refresh poller logs these and keeps the previous manifest.
    #[error("sampling rule refresh failed: {0}")]
    RuleRefresh(String),

    /// Wrapper for I/O errors raised by [`RuleFetcher`] implementations.
    ///
    /// [`RuleFetcher`]: crate::sampling::RuleFetcher
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
