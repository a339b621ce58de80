#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{BuildError, BuildIoError, GraphError, Result};

pub mod hash;
pub use hash::HashBuilder;

pub mod graph;
pub use graph::{Artifact, ArtifactCoords, ArtifactGraph, ArtifactKind, Resolver, ShadeMapping};

pub mod step;
pub use step::{StepKind, StepResult};

pub mod cache;
pub use cache::{CacheLayout, StepSlot};

pub mod tools;
pub use tools::{Diagnostic, Severity, ToolOutcome, Toolchain};

pub mod transforms;

mod workers;

pub mod scheduler;
pub use scheduler::{BuildSummary, Scheduler};

pub mod buildinfo;

pub mod log;

pub mod utils;

use crate::hash::HashBuilder as Hasher;
use once_cell::sync::OnceCell;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};

/// Scope filter handed to the resolver when producing the artifact graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClasspathScope {
    Compile,
    #[default]
    Runtime,
}

impl ClasspathScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ClasspathScope::Compile => "compile",
            ClasspathScope::Runtime => "runtime",
        }
    }
}

/// Closure optimization level applied to the bundled output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationLevel {
    Bundle,
    WhitespaceOnly,
    Simple,
    #[default]
    Advanced,
}

impl OptimizationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationLevel::Bundle => "BUNDLE",
            OptimizationLevel::WhitespaceOnly => "WHITESPACE_ONLY",
            OptimizationLevel::Simple => "SIMPLE",
            OptimizationLevel::Advanced => "ADVANCED",
        }
    }
}

/// Process-wide configuration for one build.
///
/// Constructed once, then read by every worker. Everything is immutable
/// after construction except the cancellation cell, which is monotone and
/// keeps the first cause.
#[derive(Debug)]
pub struct BuildRequest {
    /// Root of the content-addressed cache.
    pub base_dir: PathBuf,
    /// Where the assembled bundle lands.
    pub target_dir: PathBuf,
    /// Scope filter the resolver was asked for.
    pub scope: ClasspathScope,
    /// Closure optimization level.
    pub optimization: OptimizationLevel,
    /// Closure `--define` values, sorted by key.
    pub defines: BTreeMap<String, String>,
    /// Extern files handed to the closure optimizer.
    pub externs: Vec<String>,
    /// Closure formatting options.
    pub formatting: Vec<String>,
    /// Closure `--language_out` tag.
    pub language_out: String,
    test_id: Option<String>,
    pool: Arc<rayon::ThreadPool>,
    cancelled: OnceCell<String>,
}

impl BuildRequest {
    /// Convenience function to call `BuildRequestBuilder::default()`.
    pub fn builder() -> BuildRequestBuilder {
        BuildRequestBuilder::default()
    }

    /// The externally owned worker pool the scheduler submits to.
    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// Identifier of the test variant this request belongs to, if any. Its
    /// presence breaks cache sharing with the corresponding non-test build.
    pub fn test_id(&self) -> Option<&str> {
        self.test_id.as_deref()
    }

    /// Cancels the build. Idempotent; the first cause wins and is the one
    /// reported to the caller.
    pub fn cancel(&self, cause: impl std::fmt::Display) {
        let _ = self.cancelled.set(cause.to_string());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get().is_some()
    }

    pub fn cancellation_cause(&self) -> Option<&str> {
        self.cancelled.get().map(String::as_str)
    }

    /// Feeds every request parameter that influences build outputs into the
    /// artifact fingerprint, in a fixed order.
    pub(crate) fn append_hash_inputs(&self, hasher: &mut Hasher) {
        hasher.append(self.optimization.as_str());
        for (key, value) in &self.defines {
            hasher.append(key).append(value);
        }
        let mut externs = self.externs.clone();
        externs.sort();
        for extern_file in &externs {
            hasher.append(extern_file);
        }
        let mut formatting = self.formatting.clone();
        formatting.sort();
        for option in &formatting {
            hasher.append(option);
        }
        hasher.append(&self.language_out);
        hasher.append(self.scope.as_str());
    }
}

/// Fluent builder for [`BuildRequest`].
#[derive(Debug, Default)]
pub struct BuildRequestBuilder {
    base_dir: Option<PathBuf>,
    target_dir: Option<PathBuf>,
    scope: ClasspathScope,
    optimization: OptimizationLevel,
    defines: BTreeMap<String, String>,
    externs: Vec<String>,
    formatting: Vec<String>,
    language_out: Option<String>,
    test_id: Option<String>,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl BuildRequestBuilder {
    #[must_use]
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: ClasspathScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization = level;
        self
    }

    #[must_use]
    pub fn define(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn extern_file(mut self, file: impl Into<String>) -> Self {
        self.externs.push(file.into());
        self
    }

    #[must_use]
    pub fn formatting(mut self, option: impl Into<String>) -> Self {
        self.formatting.push(option.into());
        self
    }

    #[must_use]
    pub fn language_out(mut self, tag: impl Into<String>) -> Self {
        self.language_out = Some(tag.into());
        self
    }

    /// Marks the request as belonging to a test variant; distinct
    /// identifiers never share cache slots.
    #[must_use]
    pub fn test_id(mut self, id: impl Into<String>) -> Self {
        self.test_id = Some(id.into());
        self
    }

    /// Supplies the worker pool. The scheduler never creates or destroys a
    /// pool, only submits to it, so one pool can serve several builds.
    #[must_use]
    pub fn pool(mut self, pool: Arc<rayon::ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<BuildRequest> {
        let Self {
            base_dir,
            target_dir,
            scope,
            optimization,
            defines,
            externs,
            formatting,
            language_out,
            test_id,
            pool,
        } = self;

        let base_dir =
            base_dir.ok_or_else(|| BuildError::msg("build request needs a base directory"))?;
        let target_dir =
            target_dir.ok_or_else(|| BuildError::msg("build request needs a target directory"))?;
        let pool = match pool {
            Some(pool) => pool,
            None => Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_cpus::get())
                    .build()
                    .map_err(BuildError::msg)?,
            ),
        };

        Ok(BuildRequest {
            base_dir,
            target_dir,
            scope,
            optimization,
            defines,
            externs,
            formatting,
            language_out: language_out.unwrap_or_else(|| "ECMASCRIPT_2020".to_string()),
            test_id,
            pool,
            cancelled: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BuildRequest {
        BuildRequest::builder().base_dir("cache").target_dir("target").build().unwrap()
    }

    #[test]
    fn cancel_keeps_first_cause() {
        let request = request();
        assert!(!request.is_cancelled());
        request.cancel("first");
        request.cancel("second");
        assert!(request.is_cancelled());
        assert_eq!(request.cancellation_cause(), Some("first"));
    }

    #[test]
    fn builder_requires_directories() {
        assert!(BuildRequestBuilder::default().build().is_err());
        assert!(BuildRequestBuilder::default().base_dir("cache").build().is_err());
    }

    #[test]
    fn hash_inputs_cover_request_parameters() {
        fn digest(request: &BuildRequest) -> String {
            let mut hasher = Hasher::new();
            request.append_hash_inputs(&mut hasher);
            hasher.finish()
        }

        let plain = request();
        let tweaked = BuildRequest::builder()
            .base_dir("cache")
            .target_dir("target")
            .define("goog.DEBUG", "false")
            .build()
            .unwrap();
        assert_ne!(digest(&plain), digest(&tweaked));

        let relaxed = BuildRequest::builder()
            .base_dir("cache")
            .target_dir("target")
            .optimization(OptimizationLevel::Simple)
            .build()
            .unwrap();
        assert_ne!(digest(&plain), digest(&relaxed));

        // The cache and target locations do not feed the fingerprint.
        let moved =
            BuildRequest::builder().base_dir("elsewhere").target_dir("other").build().unwrap();
        assert_eq!(digest(&plain), digest(&moved));
    }
}
