//! Configuration Synchronization Error Hierarchy
//!
//! Defines error types for the sync engine, categorized by the layer that
//! raised them: configuration, backend access, templating, file
//! synchronization and the hosting system.

use std::path::PathBuf;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or contradictory configuration, surfaced synchronously
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Key/value backend failures (connectivity, lookup, watch)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Descriptor, template loading and rendering failures
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Check/replace/reload failures of one resource pass
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Infrastructure-level failures (io, task join)
    #[error(transparent)]
    System(#[from] SystemError),

    /// The call was never started because the processor is closing
    #[error("processor is shut down")]
    ProcessorShutdown,

    /// Unrecoverable failures, programmer errors
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No constructor registered for the requested backend type
    #[error("unknown backend type: {0}")]
    UnknownBackendType(String),

    /// Backend config carries no endpoint
    #[error("backend {0} has no endpoint configured")]
    NoEndpoints(String),

    /// Malformed endpoint address
    #[error("Invalid URI format: {0}")]
    InvalidURI(String),

    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// gRPC transport layer errors
    #[error(transparent)]
    TonicError(#[from] Box<tonic::transport::Error>),

    /// gRPC status code errors
    #[error(transparent)]
    TonicStatusError(#[from] Box<tonic::Status>),

    /// HTTP client errors
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Backend answered with something we cannot interpret
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// Every endpoint of the ring failed for one request
    #[error("All {count} endpoints failed, last error: {last}")]
    AllEndpointsFailed { count: usize, last: String },

    /// Server-side watch cancellation (compaction, auth expiry)
    #[error("Watch canceled by backend: {0}")]
    WatchCanceled(String),

    /// Operation exceeded its time budget
    #[error("Retry timeout")]
    RetryTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// Source template missing on disk
    #[error("template source not found: {0}")]
    MissingSource(PathBuf),

    /// Descriptor file could not be decoded
    #[error("cannot load template resource {path}: {source}")]
    Descriptor { path: PathBuf, source: ConfigError },

    /// Descriptor content is invalid
    #[error("invalid template resource {path}: {reason}")]
    InvalidResource { path: PathBuf, reason: String },

    /// `mode` field is not an octal permission string
    #[error("invalid file mode: {0}")]
    InvalidMode(String),

    /// minijinja failed to compile or render
    #[error(transparent)]
    Render(#[from] minijinja::Error),

    /// Encryption envelope or key material errors
    #[error("decryption failed: {0}")]
    Crypt(String),

    /// Glob pattern errors while listing descriptors
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Check command exited non-zero, destination left untouched
    #[error("check command `{cmd}` failed ({status}): {output}")]
    CheckFailed {
        cmd: String,
        status: String,
        output: String,
    },

    /// Reload command exited non-zero, destination already updated
    #[error("reload command `{cmd}` failed ({status}): {output}")]
    ReloadFailed {
        cmd: String,
        status: String,
        output: String,
    },

    /// Staged file could not replace the destination
    #[error("cannot replace {dest}: {source}")]
    Replace { dest: PathBuf, source: std::io::Error },

    /// Ownership change failure
    #[error("cannot chown {path}: {source}")]
    Chown { path: PathBuf, source: nix::Error },

    /// Several resources failed in one run
    #[error("{failed} of {total} resources failed, first error: {first}")]
    Resources {
        failed: usize,
        total: usize,
        first: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Disk I/O failures
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// I/O failure with the offending path
    #[error("Error occurred at path: {path}: {source}")]
    PathError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Background task panicked or was aborted
    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// JSON encode/decode failures
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::System(SystemError::IoError(e))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Backend(BackendError::TonicStatusError(Box::new(status)))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Backend(BackendError::TonicError(Box::new(e)))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Backend(BackendError::Http(e))
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Error::Template(TemplateError::Render(e))
    }
}

impl Error {
    /// Whether the destination was updated even though the pass failed.
    ///
    /// Reload failures happen after the replace; the new file is kept.
    pub fn is_degraded_update(&self) -> bool {
        matches!(self, Error::Sync(SyncError::ReloadFailed { .. }))
    }
}
