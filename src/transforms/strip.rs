//! The annotation-stripping copy.
//!
//! Sources are copied out of their roots into the step's output tree with
//! ignore files applied, the stripper rewrites the copy in place, and plain
//! JavaScript sources ride along verbatim. The copy exists so the stripper
//! never touches the original tree and so downstream steps hash a stable,
//! self-contained input.

use super::TransformOutcome;
use crate::{
    error::Result,
    log::StepLog,
    tools::{AnnotationStripper, SourceFileInfo, StripInput},
    utils,
};
use std::path::{Path, PathBuf};

/// Copies every Java source of `roots` into `output` (honoring ignore
/// files), strips the copy in place, then copies `.js` sources verbatim.
///
/// Several roots merge into one output tree; later roots overwrite earlier
/// ones on colliding relative paths, which is logged. With no Java sources
/// at all the output is removed again and `NoInputs` is returned.
pub fn strip_source_roots(
    roots: &[PathBuf],
    output: &Path,
    stripper: &dyn AnnotationStripper,
    scratch: &Path,
    log: &mut StepLog,
) -> Result<TransformOutcome> {
    utils::create_if_absent(output)?;

    let mut files = Vec::new();
    for root in roots {
        for source in utils::gather(root, utils::is_java)? {
            let info = SourceFileInfo { original: source, source_root: root.clone() };
            let destination = output.join(info.relative());
            if destination.exists() {
                log.line(format!(
                    "overwriting {} with the copy from \"{}\"",
                    info.relative().display(),
                    root.display()
                ));
                warn!(
                    "source root \"{}\" overwrites {} from an earlier root",
                    root.display(),
                    info.relative().display()
                );
            }
            utils::copy_files(root, std::iter::once(&info.original), output)?;
            files.push(info);
        }
    }

    if files.is_empty() {
        log.line("no Java sources to strip");
        utils::remove_all(output)?;
        return Ok(TransformOutcome::NoInputs);
    }
    log.line(format!("stripping {} Java source(s)", files.len()));

    let outcome =
        stripper.strip(&StripInput { files: &files, output_root: output }, scratch, log)?;
    if let crate::tools::ToolOutcome::Failed(diagnostics) = outcome {
        return Ok(TransformOutcome::Failed(diagnostics));
    }

    // JavaScript sources (including `.native.js` companions) bypass the
    // stripper but belong to the same tree.
    for root in roots {
        let scripts = utils::gather(root, |path| {
            path.extension().map(|ext| ext == "js").unwrap_or_default()
        })?;
        let scripts: Vec<_> = scripts.into_iter().collect();
        utils::copy_files(root, scripts.iter(), output)?;
    }

    Ok(TransformOutcome::Applied)
}
