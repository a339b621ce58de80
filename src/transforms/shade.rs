//! The shade transform: relocating package prefixes across a tree of Java
//! sources and compiled classes.
//!
//! Files under a mapped prefix move to the replacement package's directory;
//! Java sources get a textual rewrite of the prefix in dot, slash and
//! backslash form, class files get the same substitution applied to their
//! constant-pool strings. Everything else is copied verbatim at its
//! original relative path. When two `find` prefixes overlap the longest one
//! wins.

use super::TransformOutcome;
use crate::{
    error::{BuildError, Result},
    graph::ShadeMapping,
    log::StepLog,
    utils,
};
use path_slash::PathExt;
use std::{
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Applies `mappings` to every file beneath `input_roots`, writing the
/// relocated tree into `output`. An empty mapping set is `Skipped` and
/// produces no output directory.
pub fn shade_tree(
    input_roots: &[PathBuf],
    mappings: &[ShadeMapping],
    output: &Path,
    log: &mut StepLog,
) -> Result<TransformOutcome> {
    if mappings.is_empty() {
        log.line("no shade mappings; consumers use the unshaded output");
        return Ok(TransformOutcome::Skipped);
    }
    let mut mappings = mappings.to_vec();
    mappings.sort_by(|a, b| b.find.len().cmp(&a.find.len()).then_with(|| a.find.cmp(&b.find)));

    utils::create_if_absent(output)?;
    for root in input_roots {
        let Some(root) = utils::existing_dir(root) else { continue };
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry
                .map_err(|err| BuildError::msg(format!("walking \"{}\": {err}", root.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let mapping = applicable_mapping(relative, &mappings);
            let destination = match mapping {
                Some(mapping) => {
                    let tail = relative
                        .strip_prefix(mapping.find_as_path())
                        .expect("matched mapping prefixes the path");
                    output.join(mapping.replace_as_path()).join(tail)
                }
                None => output.join(relative),
            };
            utils::create_parent_dir_all(&destination)?;

            let bytes =
                fs::read(entry.path()).map_err(|err| BuildError::io(err, entry.path()))?;
            let bytes = if mapping.is_none() {
                bytes
            } else if utils::is_java(relative) {
                rewrite_java_source(&bytes, &mappings)
            } else if relative.extension().map(|ext| ext == "class").unwrap_or_default() {
                rewrite_class_file(&bytes, &mappings)?
            } else {
                bytes
            };
            fs::write(&destination, bytes).map_err(|err| BuildError::io(err, &destination))?;
        }
    }
    log.line(format!("shaded {} mapping(s) into \"{}\"", mappings.len(), output.display()));
    Ok(TransformOutcome::Applied)
}

/// The mapping governing `relative`, if it lies under any `find` prefix.
/// `mappings` is sorted longest-find-first, so overlaps resolve to the most
/// specific prefix.
fn applicable_mapping<'a>(
    relative: &Path,
    mappings: &'a [ShadeMapping],
) -> Option<&'a ShadeMapping> {
    let slashed = relative.to_slash_lossy();
    mappings.iter().find(|mapping| {
        let prefix = mapping.find.replace('.', "/");
        *slashed == prefix || slashed.starts_with(&format!("{prefix}/"))
    })
}

/// Rewrites a Java source, substituting each prefix in dot, slash and
/// backslash form. An empty replacement removes the prefix together with
/// its trailing separator.
fn rewrite_java_source(bytes: &[u8], mappings: &[ShadeMapping]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(bytes) else { return bytes.to_vec() };
    let mut text = text.to_string();
    for mapping in mappings {
        for separator in ['.', '/', '\\'] {
            let find = mapping.find.replace('.', &separator.to_string());
            let replace = mapping.replace.replace('.', &separator.to_string());
            if replace.is_empty() {
                text = text.replace(&format!("{find}{separator}"), "");
                text = text.replace(&find, "");
            } else {
                text = text.replace(&find, &replace);
            }
        }
    }
    text.into_bytes()
}

// Constant pool tags, JVMS §4.4.
const CONSTANT_UTF8: u8 = 1;
const CONSTANT_INTEGER: u8 = 3;
const CONSTANT_FLOAT: u8 = 4;
const CONSTANT_LONG: u8 = 5;
const CONSTANT_DOUBLE: u8 = 6;
const CONSTANT_CLASS: u8 = 7;
const CONSTANT_STRING: u8 = 8;
const CONSTANT_FIELDREF: u8 = 9;
const CONSTANT_METHODREF: u8 = 10;
const CONSTANT_INTERFACE_METHODREF: u8 = 11;
const CONSTANT_NAME_AND_TYPE: u8 = 12;
const CONSTANT_METHOD_HANDLE: u8 = 15;
const CONSTANT_METHOD_TYPE: u8 = 16;
const CONSTANT_DYNAMIC: u8 = 17;
const CONSTANT_INVOKE_DYNAMIC: u8 = 18;
const CONSTANT_MODULE: u8 = 19;
const CONSTANT_PACKAGE: u8 = 20;

/// Rewrites the constant pool of a class file, substituting UTF-8 entries
/// that begin with a mapped prefix followed by `.` or `/` (or equal it
/// exactly). Everything past the constant pool is copied verbatim.
pub(crate) fn rewrite_class_file(bytes: &[u8], mappings: &[ShadeMapping]) -> Result<Vec<u8>> {
    let malformed = |why: &str| BuildError::msg(format!("malformed class file: {why}"));

    if bytes.len() < 10 || bytes[..4] != [0xCA, 0xFE, 0xBA, 0xBE] {
        return Err(malformed("bad magic"));
    }
    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(&bytes[..10]);
    let count = u16::from_be_bytes([bytes[8], bytes[9]]);

    let mut pos = 10;
    let mut index = 1;
    while index < count {
        let tag = *bytes.get(pos).ok_or_else(|| malformed("truncated constant pool"))?;
        let entry_len = match tag {
            CONSTANT_UTF8 => {
                let length = bytes
                    .get(pos + 1..pos + 3)
                    .map(|raw| u16::from_be_bytes([raw[0], raw[1]]) as usize)
                    .ok_or_else(|| malformed("truncated UTF-8 length"))?;
                let raw = bytes
                    .get(pos + 3..pos + 3 + length)
                    .ok_or_else(|| malformed("truncated UTF-8 entry"))?;
                let rewritten = rewrite_constant(raw, mappings);
                if rewritten.len() > u16::MAX as usize {
                    return Err(malformed("rewritten UTF-8 entry exceeds u16 length"));
                }
                out.push(tag);
                out.extend_from_slice(&(rewritten.len() as u16).to_be_bytes());
                out.extend_from_slice(&rewritten);
                index += 1;
                pos += 3 + length;
                continue;
            }
            CONSTANT_CLASS | CONSTANT_STRING | CONSTANT_METHOD_TYPE | CONSTANT_MODULE
            | CONSTANT_PACKAGE => 3,
            CONSTANT_METHOD_HANDLE => 4,
            CONSTANT_INTEGER
            | CONSTANT_FLOAT
            | CONSTANT_FIELDREF
            | CONSTANT_METHODREF
            | CONSTANT_INTERFACE_METHODREF
            | CONSTANT_NAME_AND_TYPE
            | CONSTANT_DYNAMIC
            | CONSTANT_INVOKE_DYNAMIC => 5,
            CONSTANT_LONG | CONSTANT_DOUBLE => {
                // Longs and doubles take two constant pool slots.
                index += 1;
                9
            }
            other => return Err(malformed(&format!("unknown constant pool tag {other}"))),
        };
        let entry =
            bytes.get(pos..pos + entry_len).ok_or_else(|| malformed("truncated entry"))?;
        out.extend_from_slice(entry);
        pos += entry_len;
        index += 1;
    }

    out.extend_from_slice(&bytes[pos..]);
    Ok(out)
}

/// Substitutes a mapped prefix at the start of one constant-pool string,
/// in whichever of the dot or slash spellings it uses.
fn rewrite_constant(raw: &[u8], mappings: &[ShadeMapping]) -> Vec<u8> {
    // Modified-UTF-8 oddities (embedded surrogates) fail the strict parse
    // and pass through untouched; package prefixes are plain ASCII.
    let Ok(text) = std::str::from_utf8(raw) else { return raw.to_vec() };
    for mapping in mappings {
        for separator in ['.', '/'] {
            let find = mapping.find.replace('.', &separator.to_string());
            let replace = mapping.replace.replace('.', &separator.to_string());
            let tail = if text == find {
                ""
            } else if let Some(tail) = text
                .strip_prefix(&find)
                .filter(|tail| tail.starts_with(['.', '/']))
            {
                tail
            } else {
                continue;
            };
            let mut rewritten = replace;
            if rewritten.is_empty() {
                return tail.trim_start_matches(['.', '/']).as_bytes().to_vec();
            }
            rewritten.push_str(tail);
            return rewritten.into_bytes();
        }
    }
    raw.to_vec()
}
