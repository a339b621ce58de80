//! Represents an entire completed build.

use crate::{
    error::{BuildError, Result},
    graph::ArtifactGraph,
    scheduler::BuildSummary,
    BuildRequest,
};
use serde::Serialize;
use std::{fs, path::Path};

pub const BUILD_INFO_FORMAT_VERSION: &str = "j2cl-build-info-1";

/// File written under the base directory after a successful build.
pub const BUILD_INFO_FILE: &str = "build-info.json";

/// Observational report of one build: which root at which fingerprint, and
/// what every `(artifact, step)` unit ended as. Never hashed, never read
/// back by the core.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo<'a> {
    /// The root fingerprint; identifies the build.
    pub id: String,
    #[serde(rename = "_format")]
    pub format: &'static str,
    pub root: String,
    pub optimization: &'static str,
    pub summary: &'a BuildSummary,
}

impl<'a> BuildInfo<'a> {
    pub fn new(
        graph: &ArtifactGraph,
        request: &BuildRequest,
        summary: &'a BuildSummary,
    ) -> Result<Self> {
        Ok(Self {
            id: graph.root().hash(request)?.to_string(),
            format: BUILD_INFO_FORMAT_VERSION,
            root: graph.root().coords.to_string(),
            optimization: request.optimization.as_str(),
            summary,
        })
    }

    /// Serializes the report to [`BUILD_INFO_FILE`] under `base`.
    pub fn write(&self, base: &Path) -> Result<()> {
        let path = base.join(BUILD_INFO_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|err| BuildError::io(err, &path))
    }
}
