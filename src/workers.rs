//! One worker per pipeline step.
//!
//! Workers are stateless: they read prior step outputs (their own
//! artifact's or their dependencies'), write into the slot handed to them,
//! and report a [`StepResult`]. Tool and I/O failures come back as errors;
//! the scheduler turns those into `Failed` markers and cancels the build,
//! so an `Ok` from a worker is always an advancing result.

use crate::{
    cache::{CacheLayout, StepSlot},
    error::{BuildError, Result},
    graph::{Artifact, ArtifactKind},
    log::StepLog,
    step::{StepKind, StepResult},
    tools::{ClosureInput, JavacInput, ToolOutcome, Toolchain, TranspileInput},
    transforms::{self, TransformOutcome},
    utils, BuildRequest,
};
use std::{fs, io, path::PathBuf};

pub(crate) fn dispatch(
    step: StepKind,
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    match step {
        StepKind::Hash => run_hash(artifact, request, log),
        StepKind::Unpack => run_unpack(artifact, slot, log),
        StepKind::Compile => run_compile(artifact, slot, request, toolchain, layout, log),
        StepKind::Strip => run_strip(artifact, slot, request, toolchain, layout, log),
        StepKind::CompileStripped => {
            run_compile_stripped(artifact, slot, request, toolchain, layout, log)
        }
        StepKind::Transpile => run_transpile(artifact, slot, request, toolchain, layout, log),
        StepKind::Closure => run_closure(artifact, slot, request, toolchain, layout, log),
        StepKind::Assemble => run_assemble(artifact, slot, request, layout, log),
    }
}

/// Bails out with the build's first failure cause once cancellation has been
/// observed. Workers call this ahead of external-tool invocations and large
/// copies; completed slots stay untouched.
fn ensure_live(request: &BuildRequest) -> Result<()> {
    match request.cancellation_cause() {
        Some(cause) => Err(BuildError::Cancelled(cause.to_string())),
        None => Ok(()),
    }
}

/// Scratch space for argfiles and other adapter temporaries, removed when
/// the worker returns.
fn scratch_dir(slot: &StepSlot) -> Result<tempfile::TempDir> {
    slot.ensure_dir()?;
    tempfile::Builder::new()
        .prefix("scratch-")
        .tempdir_in(slot.dir())
        .map_err(|err| BuildError::io(err, slot.dir()))
}

/// Where this artifact's sources live: the unpack output for artifacts that
/// came as archives, the configured source roots otherwise.
fn source_roots(
    artifact: &Artifact,
    request: &BuildRequest,
    layout: &CacheLayout,
) -> Result<Vec<PathBuf>> {
    let unpack = layout.slot(artifact, StepKind::Unpack, request)?;
    if let Some(output) = unpack.existing_output() {
        return Ok(vec![output]);
    }
    Ok(artifact.source_roots.clone())
}

/// Builds the user classpath out of the transitive dependencies. Per
/// dependency the preference order is the shaded output, then the stripped
/// recompile, then the distributable archive (all an ignored or prebuilt
/// dependency ever offers, and the only representation available before the
/// dependency's stripped recompile exists).
fn assemble_classpath(
    artifact: &Artifact,
    request: &BuildRequest,
    layout: &CacheLayout,
) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for dep in artifact.transitive_deps() {
        let stripped = layout.slot(&dep, StepKind::CompileStripped, request)?;
        if let Some(shaded) = stripped.existing_shade_output() {
            entries.push(shaded);
        } else if let Some(output) = stripped.existing_output() {
            entries.push(output);
        } else if let Some(file) = &dep.artifact_file {
            entries.push(file.clone());
        }
    }
    Ok(entries)
}

/// Archives of transitive `JavacBootstrap` artifacts.
fn bootstrap_classpath(artifact: &Artifact) -> Vec<PathBuf> {
    artifact
        .transitive_deps()
        .iter()
        .filter(|dep| dep.kind == ArtifactKind::JavacBootstrap)
        .filter_map(|dep| dep.artifact_file.clone())
        .collect()
}

fn tool_result(tool: &str, outcome: ToolOutcome) -> Result<StepResult> {
    match outcome {
        ToolOutcome::Success => Ok(StepResult::Success),
        ToolOutcome::Failed(diagnostics) => Err(BuildError::tool(tool, diagnostics)),
    }
}

fn run_hash(artifact: &Artifact, request: &BuildRequest, log: &mut StepLog) -> Result<StepResult> {
    let hash = artifact.hash(request)?;
    log.line(format!("{} fingerprint {hash}", artifact.coords));
    Ok(StepResult::Success)
}

fn run_unpack(artifact: &Artifact, slot: &StepSlot, log: &mut StepLog) -> Result<StepResult> {
    let Some(archive) = &artifact.artifact_file else {
        log.line("no distributable archive to unpack");
        return Ok(StepResult::Aborted);
    };

    let file = fs::File::open(archive).map_err(|err| BuildError::io(err, archive))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|err| BuildError::msg(format!("reading \"{}\": {err}", archive.display())))?;

    let output = slot.output_dir();
    utils::create_if_absent(&output)?;
    let mut extracted = 0usize;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| BuildError::msg(format!("reading \"{}\": {err}", archive.display())))?;
        if !entry.is_file() {
            continue;
        }
        let Some(name) = entry.enclosed_name().map(PathBuf::from) else { continue };
        let source = name.extension().map(|ext| ext == "java" || ext == "js").unwrap_or_default();
        if !source {
            continue;
        }
        let destination = output.join(&name);
        utils::create_parent_dir_all(&destination)?;
        let mut target =
            fs::File::create(&destination).map_err(|err| BuildError::io(err, &destination))?;
        io::copy(&mut entry, &mut target).map_err(|err| BuildError::io(err, &destination))?;
        extracted += 1;
    }

    if extracted == 0 {
        log.line(format!("\"{}\" has no source entries", archive.display()));
        utils::remove_all(&output)?;
        return Ok(StepResult::Aborted);
    }
    log.line(format!("unpacked {extracted} source entr(ies) from \"{}\"", archive.display()));
    Ok(StepResult::Success)
}

fn run_compile(
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let roots = source_roots(artifact, request, layout)?;
    let mut sources = Vec::new();
    for root in &roots {
        sources.extend(utils::source_files(root, &[utils::JAVA_EXTENSION]));
    }
    if sources.is_empty() {
        log.line("no Java sources to compile");
        return Ok(StepResult::Aborted);
    }

    ensure_live(request)?;
    let output = slot.output_dir();
    utils::create_if_absent(&output)?;
    let scratch = scratch_dir(slot)?;
    let classpath = assemble_classpath(artifact, request, layout)?;
    let bootstrap = bootstrap_classpath(artifact);
    let input = JavacInput {
        sources: &sources,
        classpath: &classpath,
        bootstrap_classpath: &bootstrap,
        out_dir: &output,
    };
    log.line(format!("compiling {} Java source(s)", sources.len()));
    let outcome = toolchain.javac.compile(&input, scratch.path(), log)?;
    tool_result("javac", outcome)
}

fn run_strip(
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let roots = source_roots(artifact, request, layout)?;
    ensure_live(request)?;
    let scratch = scratch_dir(slot)?;
    let outcome = transforms::strip_source_roots(
        &roots,
        &slot.output_dir(),
        toolchain.stripper.as_ref(),
        scratch.path(),
        log,
    )?;
    match outcome {
        TransformOutcome::Applied => Ok(StepResult::Success),
        TransformOutcome::NoInputs => Ok(StepResult::Aborted),
        TransformOutcome::Skipped => Ok(StepResult::Skipped),
        TransformOutcome::Failed(diagnostics) => Err(BuildError::tool("stripper", diagnostics)),
    }
}

fn run_compile_stripped(
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let strip = layout.slot(artifact, StepKind::Strip, request)?;
    let Some(stripped) = strip.existing_output() else {
        log.line("no stripped sources to recompile");
        return Ok(StepResult::Aborted);
    };
    let sources = utils::source_files(&stripped, &[utils::JAVA_EXTENSION]);
    if sources.is_empty() {
        log.line("no stripped Java sources to recompile");
        return Ok(StepResult::Aborted);
    }

    ensure_live(request)?;
    let output = slot.output_dir();
    utils::create_if_absent(&output)?;
    let scratch = scratch_dir(slot)?;
    let classpath = assemble_classpath(artifact, request, layout)?;
    let bootstrap = bootstrap_classpath(artifact);
    let input = JavacInput {
        sources: &sources,
        classpath: &classpath,
        bootstrap_classpath: &bootstrap,
        out_dir: &output,
    };
    log.line(format!("recompiling {} stripped source(s)", sources.len()));
    let outcome = toolchain.javac.compile(&input, scratch.path(), log)?;
    let result = tool_result("javac", outcome)?;

    // Relocate the stripped sources plus the classes just produced; the
    // shaded tree is what dependents put on their classpath.
    ensure_live(request)?;
    let shade_inputs = [stripped, output];
    match transforms::shade_tree(&shade_inputs, &artifact.shade, &slot.shade_output_dir(), log)? {
        TransformOutcome::Failed(diagnostics) => Err(BuildError::tool("shade", diagnostics)),
        _ => Ok(result),
    }
}

fn run_transpile(
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let strip = layout.slot(artifact, StepKind::Strip, request)?;
    // With no stripped tree (e.g. a JavaScript-only artifact) the raw
    // sources still contribute their scripts.
    let roots = match strip.existing_output() {
        Some(stripped) => vec![stripped],
        None => source_roots(artifact, request, layout)?,
    };

    let mut java_sources = Vec::new();
    let mut native_sources = Vec::new();
    let mut plain_scripts: Vec<(PathBuf, PathBuf)> = Vec::new();
    for root in &roots {
        for file in utils::source_files(root, &[utils::JAVA_EXTENSION, "js"]) {
            if utils::is_java(&file) {
                java_sources.push(file);
            } else if utils::is_native_js(&file) {
                native_sources.push(file);
            } else {
                plain_scripts.push((root.clone(), file));
            }
        }
    }
    if java_sources.is_empty() && plain_scripts.is_empty() {
        log.line("nothing to transpile");
        return Ok(StepResult::Aborted);
    }

    let output = slot.output_dir();
    utils::create_if_absent(&output)?;
    if !java_sources.is_empty() {
        ensure_live(request)?;
        let scratch = scratch_dir(slot)?;
        let classpath = assemble_classpath(artifact, request, layout)?;
        let input = TranspileInput {
            java_sources: &java_sources,
            native_sources: &native_sources,
            classpath: &classpath,
            out_dir: &output,
        };
        log.line(format!(
            "transpiling {} Java source(s) with {} native companion(s)",
            java_sources.len(),
            native_sources.len()
        ));
        let outcome = toolchain.transpiler.transpile(&input, scratch.path(), log)?;
        tool_result("transpiler", outcome)?;
    }

    ensure_live(request)?;
    for (root, script) in &plain_scripts {
        utils::copy_files(root, std::iter::once(script), &output)?;
    }
    Ok(StepResult::Success)
}

fn run_closure(
    artifact: &Artifact,
    slot: &StepSlot,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let mut js_sources = Vec::new();
    let own = layout.slot(artifact, StepKind::Transpile, request)?;
    if let Some(output) = own.existing_output() {
        js_sources.extend(utils::source_files(&output, &["js"]));
    }
    for dep in artifact.transitive_deps() {
        let transpiled = layout.slot(&dep, StepKind::Transpile, request)?;
        if let Some(output) = transpiled.existing_output() {
            js_sources.extend(utils::source_files(&output, &["js"]));
        }
    }
    if js_sources.is_empty() {
        log.line("no JavaScript inputs to optimize");
        return Ok(StepResult::Aborted);
    }

    ensure_live(request)?;
    let output = slot.output_dir();
    utils::create_if_absent(&output)?;
    let scratch = scratch_dir(slot)?;
    let input = ClosureInput {
        js_sources: &js_sources,
        level: request.optimization.as_str(),
        defines: &request.defines,
        externs: &request.externs,
        formatting: &request.formatting,
        language_out: &request.language_out,
        out_dir: &output,
    };
    log.line(format!(
        "optimizing {} JavaScript source(s) at {}",
        js_sources.len(),
        request.optimization.as_str()
    ));
    let outcome = toolchain.closure.bundle(&input, scratch.path(), log)?;
    tool_result("closure", outcome)
}

fn run_assemble(
    artifact: &Artifact,
    _slot: &StepSlot,
    request: &BuildRequest,
    layout: &CacheLayout,
    log: &mut StepLog,
) -> Result<StepResult> {
    let closure = layout.slot(artifact, StepKind::Closure, request)?;
    let Some(bundle) = closure.existing_output() else {
        log.line("no optimized bundle to assemble");
        return Ok(StepResult::Aborted);
    };
    ensure_live(request)?;
    utils::create_if_absent(&request.target_dir)?;
    utils::copy_tree(&bundle, &request.target_dir)?;
    log.line(format!("assembled bundle into \"{}\"", request.target_dir.display()));
    Ok(StepResult::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ArtifactCoords;
    use std::sync::Arc;

    fn request(base: &std::path::Path) -> BuildRequest {
        BuildRequest::builder()
            .base_dir(base)
            .target_dir(base.join("target"))
            .build()
            .unwrap()
    }

    fn dependency(name: &str) -> Artifact {
        Artifact::new(ArtifactCoords::new("com.example", name, "1.0"), ArtifactKind::Dependency)
    }

    #[test]
    fn classpath_prefers_shaded_over_stripped_over_raw() {
        let tmp = utils::tempdir("workers").unwrap();
        let request = request(tmp.path());
        let layout = CacheLayout::new(tmp.path());

        let jar = tmp.path().join("dep.jar");
        std::fs::write(&jar, b"jar bytes").unwrap();
        let mut dep = dependency("dep");
        dep.artifact_file = Some(jar.clone());
        let dep = Arc::new(dep);

        let mut root = Artifact::new(
            ArtifactCoords::new("com.example", "app", "1.0"),
            ArtifactKind::Root,
        );
        root.deps.push(dep.clone());

        // Nothing built yet: the raw archive is all there is.
        let entries = assemble_classpath(&root, &request, &layout).unwrap();
        assert_eq!(entries, vec![jar]);

        // A stripped recompile takes precedence over the archive.
        let stripped = layout.slot(&dep, StepKind::CompileStripped, &request).unwrap();
        utils::create_if_absent(&stripped.output_dir()).unwrap();
        let entries = assemble_classpath(&root, &request, &layout).unwrap();
        assert_eq!(entries, vec![stripped.output_dir()]);

        // And the shaded variant beats both.
        utils::create_if_absent(&stripped.shade_output_dir()).unwrap();
        let entries = assemble_classpath(&root, &request, &layout).unwrap();
        assert_eq!(entries, vec![stripped.shade_output_dir()]);
    }

    #[test]
    fn bootstrap_classpath_collects_only_bootstrap_archives() {
        let mut bootstrap = Artifact::new(
            ArtifactCoords::new("com.example", "bootstrap", "1.0"),
            ArtifactKind::JavacBootstrap,
        );
        bootstrap.artifact_file = Some(PathBuf::from("bootstrap.jar"));
        let mut jre = Artifact::new(
            ArtifactCoords::new("com.example", "jre", "1.0"),
            ArtifactKind::JreBinary,
        );
        jre.artifact_file = Some(PathBuf::from("jre.jar"));

        let mut root = Artifact::new(
            ArtifactCoords::new("com.example", "app", "1.0"),
            ArtifactKind::Root,
        );
        root.deps.push(Arc::new(bootstrap));
        root.deps.push(Arc::new(jre));

        assert_eq!(bootstrap_classpath(&root), vec![PathBuf::from("bootstrap.jar")]);
    }

    #[test]
    fn cancelled_requests_stop_workers_before_tool_invocations() {
        let tmp = utils::tempdir("workers").unwrap();
        let request = request(tmp.path());
        request.cancel("dependency compile failed");
        assert!(matches!(ensure_live(&request), Err(BuildError::Cancelled(_))));
    }
}
