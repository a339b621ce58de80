//! Adapters around the external compiler front-ends.
//!
//! The pipeline core never shells out directly; each step that wraps a tool
//! goes through one of the traits below. The process-backed implementations
//! here invoke the host `javac` and the stripper/transpiler/closure jars,
//! capture their output into the step log, and translate exit status plus
//! parsed diagnostics into a [`ToolOutcome`]. Tests substitute in-process
//! mocks.

use crate::{
    error::{BuildError, Result},
    log::StepLog,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    sync::Arc,
};

/// A regex that matches `javac`-style diagnostics of the form
/// `File.java:12: error: message`, with named groups "file", "line",
/// "severity" and "message".
static RE_TOOL_DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?P<file>[^\s:][^:]*):(?P<line>\d+):\s*(?P<severity>error|warning):\s*(?P<message>.*)$")
        .unwrap()
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One severity-tagged message reported by an external tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self { severity, message: message.into(), file: None, line: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Extracts diagnostics from a block of tool output.
    pub fn parse_all(output: &str) -> Vec<Self> {
        RE_TOOL_DIAGNOSTIC
            .captures_iter(output)
            .map(|cap| Self {
                severity: match &cap["severity"] {
                    "warning" => Severity::Warning,
                    _ => Severity::Error,
                },
                message: cap["message"].to_string(),
                file: Some(PathBuf::from(&cap["file"])),
                line: cap["line"].parse().ok(),
            })
            .collect()
    }

    pub(crate) fn render(diagnostics: &[Self]) -> String {
        diagnostics.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:", file.display())?;
            if let Some(line) = self.line {
                write!(f, "{line}:")?;
            }
            f.write_str(" ")?;
        }
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// What an adapter invocation produced.
#[derive(Debug)]
pub enum ToolOutcome {
    Success,
    Failed(Vec<Diagnostic>),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success)
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        match self {
            ToolOutcome::Success => Vec::new(),
            ToolOutcome::Failed(diagnostics) => diagnostics,
        }
    }
}

/// Inputs for a bytecode compilation.
#[derive(Debug)]
pub struct JavacInput<'a> {
    pub sources: &'a [PathBuf],
    pub classpath: &'a [PathBuf],
    pub bootstrap_classpath: &'a [PathBuf],
    pub out_dir: &'a Path,
}

/// A source file copied into a strip output tree.
///
/// Carries the original source root so the relative location inside the
/// copy is recoverable; the stripper must emit its rewrite at exactly that
/// relative path.
#[derive(Clone, Debug)]
pub struct SourceFileInfo {
    /// Absolute path of the file in its original source root.
    pub original: PathBuf,
    /// The source root the file was gathered from.
    pub source_root: PathBuf,
}

impl SourceFileInfo {
    /// The file's path relative to its source root.
    pub fn relative(&self) -> &Path {
        self.original.strip_prefix(&self.source_root).unwrap_or(&self.original)
    }
}

/// Inputs for an in-place annotation-stripping pass over a copied tree.
#[derive(Debug)]
pub struct StripInput<'a> {
    pub files: &'a [SourceFileInfo],
    /// Root of the copy; every file lives at `output_root/relative`.
    pub output_root: &'a Path,
}

/// Inputs for a Java-to-JavaScript transpilation.
#[derive(Debug)]
pub struct TranspileInput<'a> {
    pub java_sources: &'a [PathBuf],
    pub native_sources: &'a [PathBuf],
    pub classpath: &'a [PathBuf],
    pub out_dir: &'a Path,
}

/// Inputs for the whole-program optimizer pass.
#[derive(Debug)]
pub struct ClosureInput<'a> {
    pub js_sources: &'a [PathBuf],
    pub level: &'a str,
    pub defines: &'a BTreeMap<String, String>,
    pub externs: &'a [String],
    pub formatting: &'a [String],
    pub language_out: &'a str,
    pub out_dir: &'a Path,
}

pub trait JavaCompiler: Send + Sync {
    fn compile(&self, input: &JavacInput<'_>, scratch: &Path, log: &mut StepLog)
        -> Result<ToolOutcome>;
}

pub trait AnnotationStripper: Send + Sync {
    fn strip(&self, input: &StripInput<'_>, scratch: &Path, log: &mut StepLog)
        -> Result<ToolOutcome>;
}

pub trait Transpiler: Send + Sync {
    fn transpile(
        &self,
        input: &TranspileInput<'_>,
        scratch: &Path,
        log: &mut StepLog,
    ) -> Result<ToolOutcome>;
}

pub trait ClosureBundler: Send + Sync {
    fn bundle(&self, input: &ClosureInput<'_>, scratch: &Path, log: &mut StepLog)
        -> Result<ToolOutcome>;
}

/// The set of adapters one build runs with.
#[derive(Clone)]
pub struct Toolchain {
    pub javac: Arc<dyn JavaCompiler>,
    pub stripper: Arc<dyn AnnotationStripper>,
    pub transpiler: Arc<dyn Transpiler>,
    pub closure: Arc<dyn ClosureBundler>,
}

impl Toolchain {
    pub fn new(
        javac: Arc<dyn JavaCompiler>,
        stripper: Arc<dyn AnnotationStripper>,
        transpiler: Arc<dyn Transpiler>,
        closure: Arc<dyn ClosureBundler>,
    ) -> Self {
        Self { javac, stripper, transpiler, closure }
    }

    /// A toolchain backed by host executables: `javac` plus the stripper,
    /// transpiler and closure jars at the given locations.
    pub fn external(config: ExternalTools) -> Self {
        let java = config.java.clone();
        Self {
            javac: Arc::new(ExternalJavac { javac: config.javac }),
            stripper: Arc::new(ExternalStripper { java: java.clone(), jar: config.stripper_jar }),
            transpiler: Arc::new(ExternalTranspiler {
                java: java.clone(),
                jar: config.transpiler_jar,
            }),
            closure: Arc::new(ExternalClosure { java, jar: config.closure_jar }),
        }
    }
}

impl fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolchain").finish_non_exhaustive()
    }
}

/// Locations of the host executables backing [`Toolchain::external`].
#[derive(Clone, Debug)]
pub struct ExternalTools {
    pub javac: PathBuf,
    pub java: PathBuf,
    pub stripper_jar: PathBuf,
    pub transpiler_jar: PathBuf,
    pub closure_jar: PathBuf,
}

/// Platform path-list separator for `-cp` style arguments.
fn classpath_arg(entries: &[PathBuf]) -> String {
    let separator = if cfg!(windows) { ";" } else { ":" };
    entries.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(separator)
}

/// Writes an `@argfile` into the scratch dir, one argument per line.
fn write_argfile(scratch: &Path, name: &str, args: &[String]) -> Result<PathBuf> {
    let path = scratch.join(name);
    let mut content = args.join("\n");
    content.push('\n');
    fs::write(&path, content).map_err(|err| BuildError::io(err, &path))?;
    Ok(path)
}

/// Runs the command, captures its output into the log, and reports the
/// outcome based on exit status and parsed diagnostics.
fn run_tool(mut cmd: Command, tool: &str, log: &mut StepLog) -> Result<ToolOutcome> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    debug!(?cmd, "invoking {tool}");
    let program = PathBuf::from(cmd.get_program());
    let output: Output = cmd.output().map_err(|err| BuildError::io(err, program))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    log.block(&stdout);
    log.block(&stderr);

    let mut diagnostics = Diagnostic::parse_all(&stdout);
    diagnostics.extend(Diagnostic::parse_all(&stderr));
    let has_errors = diagnostics.iter().any(Diagnostic::is_error);

    if output.status.success() && !has_errors {
        return Ok(ToolOutcome::Success);
    }
    if !has_errors {
        diagnostics.push(Diagnostic::error(format!("{tool} exited with {}", output.status)));
    }
    Ok(ToolOutcome::Failed(diagnostics))
}

/// The host `javac`, driven through an argfile.
#[derive(Debug)]
pub struct ExternalJavac {
    javac: PathBuf,
}

impl JavaCompiler for ExternalJavac {
    fn compile(
        &self,
        input: &JavacInput<'_>,
        scratch: &Path,
        log: &mut StepLog,
    ) -> Result<ToolOutcome> {
        let mut args = vec!["-d".to_string(), input.out_dir.display().to_string()];
        if !input.bootstrap_classpath.is_empty() {
            args.push("-bootclasspath".to_string());
            args.push(classpath_arg(input.bootstrap_classpath));
        }
        if !input.classpath.is_empty() {
            args.push("-cp".to_string());
            args.push(classpath_arg(input.classpath));
        }
        args.extend(input.sources.iter().map(|source| source.display().to_string()));

        let argfile = write_argfile(scratch, "javac.args", &args)?;
        let mut cmd = Command::new(&self.javac);
        cmd.arg(format!("@{}", argfile.display()));
        run_tool(cmd, "javac", log)
    }
}

/// The annotation stripper jar, rewriting a copied source tree in place.
#[derive(Debug)]
pub struct ExternalStripper {
    java: PathBuf,
    jar: PathBuf,
}

impl AnnotationStripper for ExternalStripper {
    fn strip(
        &self,
        input: &StripInput<'_>,
        scratch: &Path,
        log: &mut StepLog,
    ) -> Result<ToolOutcome> {
        let mut args = vec!["-d".to_string(), input.output_root.display().to_string()];
        args.extend(
            input
                .files
                .iter()
                .map(|info| input.output_root.join(info.relative()).display().to_string()),
        );

        let argfile = write_argfile(scratch, "stripper.args", &args)?;
        let mut cmd = Command::new(&self.java);
        cmd.arg("-jar").arg(&self.jar).arg(format!("@{}", argfile.display()));
        run_tool(cmd, "stripper", log)
    }
}

/// The Java-to-JavaScript transpiler jar.
#[derive(Debug)]
pub struct ExternalTranspiler {
    java: PathBuf,
    jar: PathBuf,
}

impl Transpiler for ExternalTranspiler {
    fn transpile(
        &self,
        input: &TranspileInput<'_>,
        scratch: &Path,
        log: &mut StepLog,
    ) -> Result<ToolOutcome> {
        let mut args = vec!["-d".to_string(), input.out_dir.display().to_string()];
        if !input.classpath.is_empty() {
            args.push("-cp".to_string());
            args.push(classpath_arg(input.classpath));
        }
        args.extend(input.java_sources.iter().map(|source| source.display().to_string()));
        args.extend(input.native_sources.iter().map(|source| source.display().to_string()));

        let argfile = write_argfile(scratch, "transpiler.args", &args)?;
        let mut cmd = Command::new(&self.java);
        cmd.arg("-jar").arg(&self.jar).arg(format!("@{}", argfile.display()));
        run_tool(cmd, "transpiler", log)
    }
}

/// The whole-program optimizer jar.
#[derive(Debug)]
pub struct ExternalClosure {
    java: PathBuf,
    jar: PathBuf,
}

impl ClosureBundler for ExternalClosure {
    fn bundle(
        &self,
        input: &ClosureInput<'_>,
        scratch: &Path,
        log: &mut StepLog,
    ) -> Result<ToolOutcome> {
        let mut args = vec![
            "--compilation_level".to_string(),
            input.level.to_string(),
            "--language_out".to_string(),
            input.language_out.to_string(),
            "--js_output_file".to_string(),
            input.out_dir.join("bundle.js").display().to_string(),
        ];
        for (key, value) in input.defines {
            args.push("--define".to_string());
            args.push(format!("{key}={value}"));
        }
        for extern_file in input.externs {
            args.push("--externs".to_string());
            args.push(extern_file.clone());
        }
        for option in input.formatting {
            args.push("--formatting".to_string());
            args.push(option.clone());
        }
        for source in input.js_sources {
            args.push("--js".to_string());
            args.push(source.display().to_string());
        }

        let argfile = write_argfile(scratch, "closure.args", &args)?;
        let mut cmd = Command::new(&self.java);
        cmd.arg("-jar").arg(&self.jar).arg(format!("@{}", argfile.display()));
        run_tool(cmd, "closure", log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_javac_style_diagnostics() {
        let output = "\
src/com/example/App.java:12: error: cannot find symbol\n\
        Missing m = new Missing();\n\
src/com/example/App.java:20: warning: deprecated API\n";
        let diagnostics = Diagnostic::parse_all(output);
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].is_error());
        assert_eq!(diagnostics[0].line, Some(12));
        assert_eq!(diagnostics[1].severity, Severity::Warning);
    }

    #[test]
    fn source_file_info_relative_strips_the_root() {
        let info = SourceFileInfo {
            original: PathBuf::from("/roots/main/com/example/App.java"),
            source_root: PathBuf::from("/roots/main"),
        };
        assert_eq!(info.relative(), Path::new("com/example/App.java"));
    }

    #[test]
    fn classpath_arg_joins_entries() {
        let entries = vec![PathBuf::from("a.jar"), PathBuf::from("b")];
        let joined = classpath_arg(&entries);
        assert!(joined == "a.jar:b" || joined == "a.jar;b");
    }
}
