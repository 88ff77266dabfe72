use std::path::PathBuf;

/// Errors surfaced by the recording core.
#[derive(Debug, thiserror::Error)]
pub enum ExprecError {
    #[error("name '{0}' is already taken by another run")]
    NameTaken(String),

    #[error("run folder already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed metadata record at {}: {source}", path.display())]
    MalformedRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("a run cannot depend on its own files (run {0})")]
    SelfDependency(String),

    #[error("run {0} is still running; reading its files is not allowed")]
    SourceStillRunning(String),

    #[error("path '{0}' escapes its folder")]
    PathTraversal(String),

    #[error("duplicate run id: {0}")]
    Conflict(String),

    /// The run body ended with a failure outside the non-fatal set. The run
    /// has already been marked failed when this is returned.
    #[error("run {run_id} failed: {kind}: {message}")]
    RunFailed { run_id: String, kind: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("failed to encode metadata record: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ExprecError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

pub type Result<T, E = ExprecError> = std::result::Result<T, E>;
