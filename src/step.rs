//! The fixed pipeline every artifact moves through.

use crate::graph::Artifact;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the build pipeline, in execution order.
///
/// The chain is fixed: `Hash → Unpack → Compile → Strip → CompileStripped →
/// Transpile → Closure → Assemble`. Each step owns one subdirectory of the
/// artifact's cache entry; those directory names are an external contract and
/// may be inspected by other tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Hash,
    Unpack,
    Compile,
    Strip,
    CompileStripped,
    Transpile,
    Closure,
    Assemble,
}

impl StepKind {
    /// All steps, first to last.
    pub const ALL: [StepKind; 8] = [
        StepKind::Hash,
        StepKind::Unpack,
        StepKind::Compile,
        StepKind::Strip,
        StepKind::CompileStripped,
        StepKind::Transpile,
        StepKind::Closure,
        StepKind::Assemble,
    ];

    /// The step every artifact starts with.
    pub const FIRST: StepKind = StepKind::Hash;

    /// The terminal step; once the root records a marker for it the build is
    /// complete.
    pub const LAST: StepKind = StepKind::Assemble;

    /// The slot directory name inside the artifact's cache entry.
    pub fn dirname(self) -> &'static str {
        match self {
            StepKind::Hash => "0-hash",
            StepKind::Unpack => "1-unpack",
            StepKind::Compile => "2-bytecode",
            StepKind::Strip => "3-gwt-incompatible-stripped-source",
            StepKind::CompileStripped => "4-compile-gwt-incompatible-stripped",
            StepKind::Transpile => "5-transpiled-js",
            StepKind::Closure => "6-closure-bundle",
            StepKind::Assemble => "7-output-assembler",
        }
    }

    /// The next step in the chain, or `None` after the terminal step.
    pub fn successor(self) -> Option<StepKind> {
        let index = Self::ALL.iter().position(|step| *step == self).expect("step is enumerated");
        Self::ALL.get(index + 1).copied()
    }

    /// Whether a successful run of this step leaves a payload in the slot's
    /// `output/` directory. Hashing only records a marker, and assembly
    /// writes to the request's target directory instead.
    pub fn produces_output(self) -> bool {
        !matches!(self, StepKind::Hash | StepKind::Assemble)
    }

    /// Bootstrap and JRE artifacts are prebuilt; everything but their
    /// fingerprint is taken as given.
    pub fn skip_for_bootstrap_or_jre(self) -> bool {
        !matches!(self, StepKind::Hash)
    }

    /// Closure bundling and assembly only happen for the requested root.
    pub fn skip_for_non_root(self) -> bool {
        matches!(self, StepKind::Closure | StepKind::Assemble)
    }

    /// Whether this step is skipped outright for `artifact` — the worker is
    /// not invoked and a `Skipped` marker is recorded.
    pub fn skipped_for(self, artifact: &Artifact) -> bool {
        (self.skip_for_bootstrap_or_jre() && artifact.exempt_from_processing())
            || (self.skip_for_non_root() && !artifact.is_root())
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dirname())
    }
}

/// Terminal state of one `(artifact, step)` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepResult {
    Success,
    Failed,
    /// The step had no inputs and produced no work; the pipeline advances.
    Aborted,
    Skipped,
}

impl StepResult {
    /// Everything except `Failed` lets the artifact move to the successor
    /// step.
    pub fn advances(self) -> bool {
        !matches!(self, StepResult::Failed)
    }

    /// The zero-byte marker file recording this result inside a slot.
    pub fn marker_name(self) -> &'static str {
        match self {
            StepResult::Success => "result.SUCCESS",
            StepResult::Failed => "result.FAILED",
            StepResult::Aborted => "result.ABORTED",
            StepResult::Skipped => "result.SKIPPED",
        }
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.marker_name();
        f.write_str(name.strip_prefix("result.").unwrap_or(name))
    }
}
