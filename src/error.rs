use crate::tools::Diagnostic;
use std::{
    io,
    path::{Path, PathBuf},
};

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// A filesystem error annotated with the path that triggered it.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {source}", .path.display())]
pub struct BuildIoError {
    #[source]
    source: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(source: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { source, path: path.into() }
    }

    /// The path that the failing operation touched.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.source
    }
}

/// A structural defect in the artifact graph. Never recoverable; detected
/// before any worker runs.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected through {0}")]
    Cycle(String),
    #[error("unresolved coordinate {0}")]
    Unresolved(String),
    #[error("malformed shade mapping `{0}`: {1}")]
    MalformedShadeMapping(String, String),
}

/// Various error types the build core surfaces.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Io(#[from] BuildIoError),
    /// An external tool reported error-severity diagnostics or exited
    /// non-zero.
    #[error("{tool} reported errors:\n{}", Diagnostic::render(.diagnostics))]
    Tool { tool: String, diagnostics: Vec<Diagnostic> },
    /// The build was cancelled after another task failed; the payload is the
    /// first cause.
    #[error("build cancelled: {0}")]
    Cancelled(String),
    /// An invariant violation, e.g. a success marker without an output tree.
    /// Aborts the entire build.
    #[error("internal: {0}")]
    Internal(String),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        BuildError::Internal(msg.to_string())
    }

    pub(crate) fn tool(tool: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        BuildError::Tool { tool: tool.into(), diagnostics }
    }
}
