//! Stable streaming fingerprints for build inputs.

use crate::error::{BuildError, Result};
use md5::Digest;
use std::{fs, path::Path};

/// Accumulates bytes into a stable digest.
///
/// Everything that influences a step's output is fed through one of these;
/// equal digests across runs imply byte-identical outputs, so the order and
/// encoding of appends is part of the cache contract.
#[derive(Clone, Debug, Default)]
pub struct HashBuilder {
    hasher: md5::Md5,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes. Strings go through here as UTF-8.
    pub fn append(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.hasher.update(bytes.as_ref());
        self
    }

    /// Appends the contents of a file, or of every file beneath a directory
    /// in lexicographic relative-path order, with each relative path mixed
    /// in ahead of its bytes so that renames change the digest.
    pub fn append_path(&mut self, path: &Path) -> Result<&mut Self> {
        if path.is_dir() {
            let mut files: Vec<_> = walkdir::WalkDir::new(path)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .collect();
            files.sort();
            for file in files {
                let relative = file.strip_prefix(path).unwrap_or(&file);
                self.append(relative.to_string_lossy().as_bytes());
                let bytes = fs::read(&file).map_err(|err| BuildError::io(err, &file))?;
                self.append(&bytes);
            }
        } else {
            let bytes = fs::read(path).map_err(|err| BuildError::io(err, path))?;
            self.append(&bytes);
        }
        Ok(self)
    }

    /// Finalizes the digest and returns it as lowercase hex.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    fn digest_of(f: impl FnOnce(&mut HashBuilder)) -> String {
        let mut hasher = HashBuilder::new();
        f(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn identical_appends_yield_identical_digests() {
        let a = digest_of(|h| {
            h.append("alpha").append("beta");
        });
        let b = digest_of(|h| {
            h.append("alpha").append("beta");
        });
        assert_eq!(a, b);
    }

    #[test]
    fn append_order_matters() {
        let a = digest_of(|h| {
            h.append("alpha").append("beta");
        });
        let b = digest_of(|h| {
            h.append("beta").append("alpha");
        });
        assert_ne!(a, b);
    }

    #[test]
    fn directory_digest_is_stable_and_content_sensitive() {
        let tmp = utils::tempdir("hash").unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/one.java"), "class One {}").unwrap();
        std::fs::write(root.join("two.java"), "class Two {}").unwrap();

        let first = digest_of(|h| {
            h.append_path(root).unwrap();
        });
        let second = digest_of(|h| {
            h.append_path(root).unwrap();
        });
        assert_eq!(first, second);

        std::fs::write(root.join("two.java"), "class Two { int x; }").unwrap();
        let third = digest_of(|h| {
            h.append_path(root).unwrap();
        });
        assert_ne!(first, third);
    }

    #[test]
    fn renaming_a_file_changes_the_digest() {
        let tmp = utils::tempdir("hash").unwrap();
        let root = tmp.path();
        std::fs::write(root.join("One.java"), "class One {}").unwrap();
        let before = digest_of(|h| {
            h.append_path(root).unwrap();
        });
        std::fs::rename(root.join("One.java"), root.join("Two.java")).unwrap();
        let after = digest_of(|h| {
            h.append_path(root).unwrap();
        });
        assert_ne!(before, after);
    }
}
