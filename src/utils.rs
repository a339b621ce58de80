//! Filesystem primitives shared by the pipeline steps.

use crate::error::{BuildError, Result};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Per-directory ignore file consulted while gathering sources for the strip
/// step. One glob per line, rooted at the directory containing the file.
pub const IGNORE_FILE: &str = ".j2cl-maven-plugin-ignore.txt";

/// Extension of Java sources.
pub const JAVA_EXTENSION: &str = "java";

/// Idempotent directory creation.
pub fn create_if_absent(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| BuildError::io(err, path))
}

/// Creates the parent directories of `file` if necessary.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            BuildError::msg(format!(
                "Failed to create artifact parent folder \"{}\": {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

/// Returns `path` iff it exists as a directory.
pub fn existing_dir(path: &Path) -> Option<&Path> {
    path.is_dir().then_some(path)
}

/// Recursive delete; succeeds if the path is already gone.
pub fn remove_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BuildError::io(err, path)),
    }
}

/// Canonicalize the path, platform-agnostic.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BuildError::io(err, path))
}

/// Returns an iterator over all files under `root` whose extension is one of
/// `extensions`, or `root` itself if it is such a file.
///
/// This also follows symlinks.
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a [&'a str],
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path().extension().map(|ext| extensions.iter().any(|e| ext == *e)).unwrap_or_default()
        })
        .map(|e| e.path().into())
}

/// Returns a sorted list of all files with the given extensions under `root`.
pub fn source_files(root: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files: Vec<_> = source_files_iter(root, extensions).collect();
    files.sort();
    files
}

/// Whether the file is a `.native.js` companion source.
pub fn is_native_js(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(".native.js"))
        .unwrap_or_default()
}

/// Whether the file is a plain `.js` source (not a `.native.js` companion).
pub fn is_plain_js(path: &Path) -> bool {
    path.extension().map(|ext| ext == "js").unwrap_or_default() && !is_native_js(path)
}

/// Whether the file is a Java source.
pub fn is_java(path: &Path) -> bool {
    path.extension().map(|ext| ext == JAVA_EXTENSION).unwrap_or_default()
}

/// Recursively walks `root` and returns every file accepted by `include` and
/// not excluded by an ignore file, sorted lexicographically.
///
/// On entering a directory its [`IGNORE_FILE`] (if any) contributes glob
/// patterns rooted at that directory; the patterns stay active for the whole
/// subtree and are dropped again on the way out. A file makes it into the
/// result iff `include` accepts it and no active pattern matches its path.
pub fn gather(root: &Path, include: impl Fn(&Path) -> bool) -> Result<BTreeSet<PathBuf>> {
    fn visit(
        dir: &Path,
        active: &mut Vec<Vec<glob::Pattern>>,
        include: &dyn Fn(&Path) -> bool,
        out: &mut BTreeSet<PathBuf>,
    ) -> Result<()> {
        active.push(read_ignore_patterns(dir)?);
        let entries = fs::read_dir(dir).map_err(|err| BuildError::io(err, dir))?;
        for entry in entries {
            let entry = entry.map_err(|err| BuildError::io(err, dir))?;
            let path = entry.path();
            if path.is_dir() {
                visit(&path, active, include, out)?;
            } else if include(&path)
                && !active.iter().flatten().any(|pattern| pattern.matches_path(&path))
            {
                out.insert(path);
            }
        }
        active.pop();
        Ok(())
    }

    let mut out = BTreeSet::new();
    if root.is_dir() {
        visit(root, &mut Vec::new(), &include, &mut out)?;
    }
    Ok(out)
}

/// Reads the ignore file of `dir`, if present, into glob patterns rooted at
/// `dir`. Blank lines and `#` comments are dropped.
fn read_ignore_patterns(dir: &Path) -> Result<Vec<glob::Pattern>> {
    let file = dir.join(IGNORE_FILE);
    if !file.is_file() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&file).map_err(|err| BuildError::io(err, &file))?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let rooted = dir.join(line);
            glob::Pattern::new(&rooted.to_string_lossy()).map_err(|err| {
                BuildError::msg(format!(
                    "invalid glob `{line}` in \"{}\": {err}",
                    file.display()
                ))
            })
        })
        .collect()
}

/// Copies each of `files` from beneath `src_root` into `dst_root`, preserving
/// the path relative to `src_root`. Returns the destination paths.
pub fn copy_files<'a>(
    src_root: &Path,
    files: impl IntoIterator<Item = &'a PathBuf>,
    dst_root: &Path,
) -> Result<Vec<PathBuf>> {
    copy_files_rewriting(src_root, files, dst_root, |_, bytes| Ok(bytes))
}

/// Same as [`copy_files`] but passes every file's bytes through `rewrite`
/// before writing.
pub fn copy_files_rewriting<'a>(
    src_root: &Path,
    files: impl IntoIterator<Item = &'a PathBuf>,
    dst_root: &Path,
    rewrite: impl Fn(&Path, Vec<u8>) -> Result<Vec<u8>>,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for file in files {
        let relative = file.strip_prefix(src_root).unwrap_or(file);
        let dst = dst_root.join(relative);
        create_parent_dir_all(&dst)?;
        let bytes = fs::read(file).map_err(|err| BuildError::io(err, file))?;
        let bytes = rewrite(file, bytes)?;
        fs::write(&dst, bytes).map_err(|err| BuildError::io(err, &dst))?;
        written.push(dst);
    }
    Ok(written)
}

/// Recursively copies the whole tree under `src` into `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|err| {
            BuildError::msg(format!("walking \"{}\": {err}", src.display()))
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            create_if_absent(&target)?;
        } else {
            create_parent_dir_all(&target)?;
            fs::copy(entry.path(), &target).map_err(|err| BuildError::io(err, entry.path()))?;
        }
    }
    Ok(())
}

/// Creates a new named tempdir.
pub fn tempdir(name: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix(name)
        .tempdir()
        .map_err(|err| BuildError::io(err, name))
}

/// Creates the file and its parent directories; a test helper.
pub fn touch(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).write(true).open(path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_is_sorted_and_filtered() {
        let tmp = tempdir("gather").unwrap();
        let root = tmp.path();
        touch(&root.join("b/Second.java")).unwrap();
        touch(&root.join("a/First.java")).unwrap();
        touch(&root.join("a/notes.txt")).unwrap();

        let files = gather(root, is_java).unwrap();
        let files: Vec<_> = files.into_iter().collect();
        assert_eq!(files, vec![root.join("a/First.java"), root.join("b/Second.java")]);
    }

    #[test]
    fn gather_honors_ignore_file() {
        let tmp = tempdir("gather").unwrap();
        let root = tmp.path();
        touch(&root.join("A.java")).unwrap();
        touch(&root.join("B.java")).unwrap();
        fs::write(root.join(IGNORE_FILE), "# generated\n\nB.java\n").unwrap();

        let files = gather(root, is_java).unwrap();
        assert!(files.contains(&root.join("A.java")));
        assert!(!files.contains(&root.join("B.java")));
    }

    #[test]
    fn ignore_patterns_only_dominate_their_subtree() {
        let tmp = tempdir("gather").unwrap();
        let root = tmp.path();
        touch(&root.join("sub/Excluded.java")).unwrap();
        touch(&root.join("other/Excluded.java")).unwrap();
        fs::write(root.join("sub").join(IGNORE_FILE), "Excluded.java\n").unwrap();

        let files = gather(root, is_java).unwrap();
        assert!(!files.contains(&root.join("sub/Excluded.java")));
        assert!(files.contains(&root.join("other/Excluded.java")));
    }

    #[test]
    fn ignore_globs_match_whole_subtrees() {
        let tmp = tempdir("gather").unwrap();
        let root = tmp.path();
        touch(&root.join("gen/deep/Tool.java")).unwrap();
        touch(&root.join("src/Kept.java")).unwrap();
        fs::write(root.join(IGNORE_FILE), "gen/*\n").unwrap();

        let files = gather(root, is_java).unwrap();
        assert!(!files.contains(&root.join("gen/deep/Tool.java")));
        assert!(files.contains(&root.join("src/Kept.java")));
    }

    #[test]
    fn copy_files_preserves_relative_paths() {
        let tmp = tempdir("copy").unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        touch(&src.join("com/example/App.java")).unwrap();

        let files = vec![src.join("com/example/App.java")];
        copy_files(&src, &files, &dst).unwrap();
        assert!(dst.join("com/example/App.java").is_file());
    }

    #[test]
    fn copy_files_applies_rewrite() {
        let tmp = tempdir("copy").unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        touch(&src.join("App.java")).unwrap();
        fs::write(src.join("App.java"), "package a;").unwrap();

        let files = vec![src.join("App.java")];
        copy_files_rewriting(&src, &files, &dst, |_, bytes| {
            Ok(String::from_utf8_lossy(&bytes).replace("a;", "b;").into_bytes())
        })
        .unwrap();
        assert_eq!(fs::read_to_string(dst.join("App.java")).unwrap(), "package b;");
    }

    #[test]
    fn native_js_is_not_plain_js() {
        assert!(is_native_js(Path::new("a/Foo.native.js")));
        assert!(!is_plain_js(Path::new("a/Foo.native.js")));
        assert!(is_plain_js(Path::new("a/foo.js")));
    }

    #[test]
    fn remove_all_tolerates_missing() {
        let tmp = tempdir("rm").unwrap();
        remove_all(&tmp.path().join("nope")).unwrap();
    }

    #[test]
    fn canonicalize_resolves_dot_components() {
        let tmp = tempdir("canon").unwrap();
        touch(&tmp.path().join("dir/file.txt")).unwrap();
        let resolved = canonicalize(tmp.path().join("dir/./file.txt")).unwrap();
        assert!(resolved.ends_with("file.txt"));
        assert!(canonicalize(tmp.path().join("missing")).is_err());
    }
}
