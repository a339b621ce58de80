//! On-disk layout of the content-addressed build cache.
//!
//! Every artifact owns one directory under the base, keyed by its sanitized
//! coordinates plus fingerprint; every step owns one slot directory inside
//! it. A slot holds the step's `output/` payload, its `log.txt`, a zero-byte
//! `result.*` marker and, while a worker is active, a `lock` file that
//! serializes writers across threads and processes.

use crate::{
    error::{BuildError, Result},
    graph::Artifact,
    step::{StepKind, StepResult},
    utils, BuildRequest,
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

const LOCK_FILE: &str = "lock";
const LOG_FILE: &str = "log.txt";
const OUTPUT_DIR: &str = "output";
const SHADE_OUTPUT_DIR: &str = "shade-output";

/// Locator for everything the build persists under the base directory.
#[derive(Clone, Debug)]
pub struct CacheLayout {
    base: PathBuf,
}

impl CacheLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates the base directory if it is not there yet.
    pub fn ensure_base(&self) -> Result<()> {
        utils::create_if_absent(&self.base)
    }

    /// The artifact's cache entry, `{base}/{sanitized-coords}-{hash}`.
    ///
    /// Forces the artifact fingerprint, so this can fail the same way
    /// hashing can.
    pub fn artifact_dir(&self, artifact: &Artifact, request: &BuildRequest) -> Result<PathBuf> {
        let hash = artifact.hash(request)?;
        Ok(self.base.join(format!("{}-{hash}", artifact.coords.sanitized())))
    }

    /// The slot for one `(artifact, step)` pair.
    pub fn slot(
        &self,
        artifact: &Artifact,
        step: StepKind,
        request: &BuildRequest,
    ) -> Result<StepSlot> {
        Ok(StepSlot { dir: self.artifact_dir(artifact, request)?.join(step.dirname()), step })
    }

    /// Failures in the hash step may predate the slot directory, so their
    /// log goes to a timestamped file directly under the base.
    pub fn hash_failure_log(&self, artifact: &Artifact) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        self.base.join(format!("hash-failure-{}-{millis}.log", artifact.coords.sanitized()))
    }
}

/// The on-disk directory for one `(artifact, step)` pair.
#[derive(Clone, Debug)]
pub struct StepSlot {
    dir: PathBuf,
    step: StepKind,
}

impl StepSlot {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step(&self) -> StepKind {
        self.step
    }

    /// Creates the slot directory if absent.
    pub fn ensure_dir(&self) -> Result<()> {
        utils::create_if_absent(&self.dir)
    }

    /// Where this step writes its payload.
    pub fn output_dir(&self) -> PathBuf {
        self.dir.join(OUTPUT_DIR)
    }

    /// The payload directory, iff it exists.
    pub fn existing_output(&self) -> Option<PathBuf> {
        let output = self.output_dir();
        output.is_dir().then_some(output)
    }

    /// Where the shade transform writes the relocated variant of this
    /// step's payload.
    pub fn shade_output_dir(&self) -> PathBuf {
        self.dir.join(SHADE_OUTPUT_DIR)
    }

    /// The shaded payload directory, iff it exists.
    pub fn existing_shade_output(&self) -> Option<PathBuf> {
        let output = self.shade_output_dir();
        output.is_dir().then_some(output)
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Reads the slot's terminal marker. `None` means the slot has not been
    /// computed. Two markers at once, or a success marker without its
    /// payload, are invariant violations.
    pub fn read_marker(&self) -> Result<Option<StepResult>> {
        let mut found = None;
        for result in
            [StepResult::Success, StepResult::Failed, StepResult::Aborted, StepResult::Skipped]
        {
            if self.dir.join(result.marker_name()).is_file() {
                if let Some(previous) = found {
                    return Err(BuildError::internal(format!(
                        "slot \"{}\" holds both {previous} and {result} markers",
                        self.dir.display()
                    )));
                }
                found = Some(result);
            }
        }
        if found == Some(StepResult::Success)
            && self.step.produces_output()
            && self.existing_output().is_none()
        {
            return Err(BuildError::internal(format!(
                "slot \"{}\" recorded SUCCESS but has no output directory",
                self.dir.display()
            )));
        }
        Ok(found)
    }

    /// Records the slot's terminal marker, replacing a stale one from a
    /// prior failed attempt.
    pub fn record(&self, result: StepResult) -> Result<()> {
        if result == StepResult::Success
            && self.step.produces_output()
            && self.existing_output().is_none()
        {
            return Err(BuildError::internal(format!(
                "refusing to record SUCCESS for \"{}\" without an output directory",
                self.dir.display()
            )));
        }
        self.ensure_dir()?;
        for stale in
            [StepResult::Success, StepResult::Failed, StepResult::Aborted, StepResult::Skipped]
        {
            let marker = self.dir.join(stale.marker_name());
            if marker.is_file() {
                fs::remove_file(&marker).map_err(|err| BuildError::io(err, &marker))?;
            }
        }
        let marker = self.dir.join(result.marker_name());
        fs::File::create(&marker).map_err(|err| BuildError::io(err, &marker))?;
        Ok(())
    }

    /// Attempts to become the slot's single writer. Returns `None` when
    /// another worker (in this process or another one) holds the lock; the
    /// caller then awaits completion and re-reads the marker.
    pub fn try_lock(&self) -> Result<Option<SlotLock>> {
        self.ensure_dir()?;
        let path = self.dir.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(SlotLock { path })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(BuildError::io(err, &path)),
        }
    }
}

/// Exclusive write access to a slot; releases the lock file on drop.
#[derive(Debug)]
pub struct SlotLock {
    path: PathBuf,
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            debug!("failed to release slot lock \"{}\": {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(step: StepKind) -> (tempfile::TempDir, StepSlot) {
        let tmp = utils::tempdir("slot").unwrap();
        let slot = StepSlot { dir: tmp.path().join(step.dirname()), step };
        (tmp, slot)
    }

    #[test]
    fn absent_marker_means_uncomputed() {
        let (_tmp, slot) = slot(StepKind::Unpack);
        assert_eq!(slot.read_marker().unwrap(), None);
    }

    #[test]
    fn record_and_read_roundtrip() {
        let (_tmp, slot) = slot(StepKind::Unpack);
        utils::create_if_absent(&slot.output_dir()).unwrap();
        slot.record(StepResult::Success).unwrap();
        assert_eq!(slot.read_marker().unwrap(), Some(StepResult::Success));
    }

    #[test]
    fn recording_replaces_a_failed_marker() {
        let (_tmp, slot) = slot(StepKind::Transpile);
        slot.record(StepResult::Failed).unwrap();
        assert_eq!(slot.read_marker().unwrap(), Some(StepResult::Failed));

        utils::create_if_absent(&slot.output_dir()).unwrap();
        slot.record(StepResult::Success).unwrap();
        assert_eq!(slot.read_marker().unwrap(), Some(StepResult::Success));
        assert!(!slot.dir().join(StepResult::Failed.marker_name()).exists());
    }

    #[test]
    fn success_without_output_is_an_invariant_violation() {
        let (_tmp, slot) = slot(StepKind::Unpack);
        assert!(matches!(slot.record(StepResult::Success), Err(BuildError::Internal(_))));

        // A marker planted behind our back trips the same check on read.
        slot.ensure_dir().unwrap();
        utils::touch(&slot.dir().join(StepResult::Success.marker_name())).unwrap();
        assert!(matches!(slot.read_marker(), Err(BuildError::Internal(_))));
    }

    #[test]
    fn hash_slot_success_needs_no_output() {
        let (_tmp, slot) = slot(StepKind::Hash);
        slot.record(StepResult::Success).unwrap();
        assert_eq!(slot.read_marker().unwrap(), Some(StepResult::Success));
    }

    #[test]
    fn second_lock_attempt_is_refused_until_release() {
        let (_tmp, slot) = slot(StepKind::Compile);
        let guard = slot.try_lock().unwrap();
        assert!(guard.is_some());
        assert!(slot.try_lock().unwrap().is_none());

        drop(guard);
        assert!(slot.try_lock().unwrap().is_some());
    }

    #[test]
    fn conflicting_markers_are_an_invariant_violation() {
        let (_tmp, slot) = slot(StepKind::Strip);
        slot.ensure_dir().unwrap();
        utils::touch(&slot.dir().join(StepResult::Aborted.marker_name())).unwrap();
        utils::touch(&slot.dir().join(StepResult::Skipped.marker_name())).unwrap();
        assert!(matches!(slot.read_marker(), Err(BuildError::Internal(_))));
    }
}
