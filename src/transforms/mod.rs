//! File-tree transforms with cache-correctness obligations: the
//! ignore-file-aware stripping copy and the package-relocating shade.

pub mod shade;
pub mod strip;

pub use shade::shade_tree;
pub use strip::strip_source_roots;

use crate::tools::Diagnostic;

/// What a transform pass did to its input tree.
#[derive(Debug)]
pub enum TransformOutcome {
    /// The output tree was produced.
    Applied,
    /// There was nothing to work on; no output tree remains.
    NoInputs,
    /// The transform does not apply to this artifact (e.g. no shade
    /// mappings); consumers fall back to the untransformed tree.
    Skipped,
    /// A wrapped tool rejected the input.
    Failed(Vec<Diagnostic>),
}
