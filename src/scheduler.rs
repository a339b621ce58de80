//! Drives every artifact of the graph through the step pipeline.
//!
//! The scheduler owns no threads: it submits one task per `(artifact,
//! step)` unit to the caller-supplied pool and collects completions over a
//! channel. Dependency waiting is expressed as not-yet-scheduled — a unit
//! is only submitted once every direct dependency holds an advancing marker
//! for the same step — so no task ever blocks on another task.
//!
//! Before a worker runs, the unit's slot marker decides whether there is
//! anything to do: an advancing marker from an earlier build (or a
//! concurrent one) is reused as-is, a `Failed` marker is retried, an absent
//! marker means work. A lock file inside the slot keeps writers exclusive
//! across threads and processes.

use crate::{
    buildinfo::BuildInfo,
    cache::CacheLayout,
    error::{BuildError, Result},
    graph::{Artifact, ArtifactCoords, ArtifactGraph},
    log::StepLog,
    step::{StepKind, StepResult},
    tools::Toolchain,
    workers, BuildRequest,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

/// How long a task sleeps between probes while another writer holds a slot
/// lock.
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// What one submitted task ended as.
enum TaskOutcome {
    /// The slot holds a marker now; `reused` is set when it was already
    /// there and no worker ran.
    Completed { result: StepResult, reused: bool },
    /// Cancellation was observed before the slot was touched.
    Cancelled,
}

type Message = (usize, StepKind, Result<TaskOutcome>);

/// Per-artifact, per-step results of a completed build.
#[derive(Debug, Default, Serialize)]
pub struct BuildSummary {
    results: BTreeMap<String, BTreeMap<StepKind, StepResult>>,
    reused: usize,
    executed: usize,
}

impl BuildSummary {
    pub fn artifacts(&self) -> usize {
        self.results.len()
    }

    pub fn result(&self, coords: &ArtifactCoords, step: StepKind) -> Option<StepResult> {
        self.results.get(&coords.to_string())?.get(&step).copied()
    }

    pub fn steps(&self, coords: &ArtifactCoords) -> Option<&BTreeMap<StepKind, StepResult>> {
        self.results.get(&coords.to_string())
    }

    /// Units satisfied by a pre-existing marker.
    pub fn reused_slots(&self) -> usize {
        self.reused
    }

    /// Units that actually ran (including predicate skips).
    pub fn executed_steps(&self) -> usize {
        self.executed
    }

    fn record(&mut self, coords: &ArtifactCoords, step: StepKind, result: StepResult, hit: bool) {
        self.results.entry(coords.to_string()).or_default().insert(step, result);
        if hit {
            self.reused += 1;
        } else {
            self.executed += 1;
        }
    }
}

/// Concurrent driver for one build.
#[derive(Debug)]
pub struct Scheduler<'a> {
    graph: &'a ArtifactGraph,
    request: Arc<BuildRequest>,
    toolchain: Arc<Toolchain>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a ArtifactGraph,
        request: Arc<BuildRequest>,
        toolchain: Arc<Toolchain>,
    ) -> Self {
        Self { graph, request, toolchain }
    }

    /// Runs the build to completion: returns once the root artifact holds a
    /// marker for the terminal step, or with the first failure once every
    /// in-flight task has drained.
    pub fn run(&self) -> Result<BuildSummary> {
        let layout = CacheLayout::new(&self.request.base_dir);
        layout.ensure_base()?;

        let artifacts = self.graph.artifacts();
        let index: HashMap<&ArtifactCoords, usize> = artifacts
            .iter()
            .enumerate()
            .map(|(position, artifact)| (&artifact.coords, position))
            .collect();

        let mut next: Vec<Option<StepKind>> = vec![Some(StepKind::FIRST); artifacts.len()];
        let mut in_flight = vec![false; artifacts.len()];
        let mut results: HashMap<(usize, StepKind), StepResult> = HashMap::new();
        let mut summary = BuildSummary::default();
        let mut first_error: Option<BuildError> = None;
        let mut active = 0usize;
        let (tx, rx) = mpsc::channel::<Message>();

        loop {
            if first_error.is_none() && !self.request.is_cancelled() {
                for position in 0..artifacts.len() {
                    let Some(step) = next[position] else { continue };
                    if in_flight[position]
                        || !deps_ready(&artifacts[position], step, &index, &results)
                    {
                        continue;
                    }
                    trace!("submitting {} {step}", artifacts[position].coords);
                    in_flight[position] = true;
                    active += 1;

                    let tx = tx.clone();
                    let artifact = artifacts[position].clone();
                    let request = self.request.clone();
                    let toolchain = self.toolchain.clone();
                    let layout = layout.clone();
                    self.request.pool().spawn(move || {
                        let outcome = run_task(&artifact, step, &request, &toolchain, &layout);
                        let _ = tx.send((position, step, outcome));
                    });
                }
            }

            if active == 0 {
                break;
            }
            let (position, step, outcome) = rx
                .recv()
                .map_err(|_| BuildError::internal("scheduler channel closed with tasks active"))?;
            active -= 1;
            in_flight[position] = false;
            let artifact = &artifacts[position];

            match outcome {
                Ok(TaskOutcome::Completed { result, reused }) => {
                    trace!("{} {step} -> {result}", artifact.coords);
                    results.insert((position, step), result);
                    summary.record(&artifact.coords, step, result, reused);
                    next[position] =
                        if result.advances() { step.successor() } else { None };
                }
                Ok(TaskOutcome::Cancelled) => {
                    trace!("{} {step} observed cancellation", artifact.coords);
                    next[position] = None;
                }
                Err(err) => {
                    debug!("{} {step} failed: {err}", artifact.coords);
                    self.request.cancel(&err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    next[position] = None;
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if let Some(cause) = self.request.cancellation_cause() {
            return Err(BuildError::Cancelled(cause.to_string()));
        }
        if !results.contains_key(&(0, StepKind::LAST)) {
            return Err(BuildError::internal(
                "scheduler stalled before the root reached the terminal step",
            ));
        }

        BuildInfo::new(self.graph, &self.request, &summary)?.write(layout.base())?;
        Ok(summary)
    }
}

/// A unit may start step `S` only when every direct dependency holds an
/// advancing marker for `S`.
fn deps_ready(
    artifact: &Artifact,
    step: StepKind,
    index: &HashMap<&ArtifactCoords, usize>,
    results: &HashMap<(usize, StepKind), StepResult>,
) -> bool {
    artifact.deps.iter().all(|dep| {
        index
            .get(&dep.coords)
            .and_then(|position| results.get(&(*position, step)))
            .map(|result| result.advances())
            .unwrap_or(false)
    })
}

/// Executes one `(artifact, step)` unit on a pool thread: marker lookup,
/// lock acquisition, predicate skips, worker dispatch, marker recording and
/// log flushing.
fn run_task(
    artifact: &Artifact,
    step: StepKind,
    request: &BuildRequest,
    toolchain: &Toolchain,
    layout: &CacheLayout,
) -> Result<TaskOutcome> {
    if request.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }

    // Locating the slot forces the fingerprint; when that fails the slot
    // directory may not exist yet, so the log goes to a timestamped file
    // under the base instead.
    let slot = match layout.slot(artifact, step, request) {
        Ok(slot) => slot,
        Err(err) => {
            let mut log = StepLog::new();
            log.line(&err);
            if let Err(flush) = log.flush_to(&layout.hash_failure_log(artifact)) {
                debug!("failed to write hash failure log: {flush}");
            }
            log.echo(format!("{} {step}", artifact.coords));
            request.cancel(&err);
            return Err(err);
        }
    };

    match slot.read_marker()? {
        Some(StepResult::Failed) | None => {}
        Some(result) => {
            trace!("{} {step} reusing {result} marker", artifact.coords);
            return Ok(TaskOutcome::Completed { result, reused: true });
        }
    }

    // Become the slot's single writer, or wait for whoever is and reuse
    // their marker.
    let _lock = loop {
        if request.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        match slot.try_lock()? {
            Some(lock) => break lock,
            None => {
                thread::sleep(LOCK_RETRY);
                match slot.read_marker()? {
                    Some(result) if result != StepResult::Failed => {
                        return Ok(TaskOutcome::Completed { result, reused: true });
                    }
                    _ => {}
                }
            }
        }
    };
    if let Some(result) = slot.read_marker()? {
        if result != StepResult::Failed {
            return Ok(TaskOutcome::Completed { result, reused: true });
        }
    }

    if step.skipped_for(artifact) {
        slot.record(StepResult::Skipped)?;
        return Ok(TaskOutcome::Completed { result: StepResult::Skipped, reused: false });
    }
    if request.is_cancelled() {
        return Ok(TaskOutcome::Cancelled);
    }

    let mut log = StepLog::new();
    match workers::dispatch(step, artifact, &slot, request, toolchain, layout, &mut log) {
        Ok(result) => {
            slot.record(result)?;
            log.flush_to(&slot.log_file())?;
            Ok(TaskOutcome::Completed { result, reused: false })
        }
        // Cancellation observed inside the worker: leave the slot exactly
        // as it was.
        Err(BuildError::Cancelled(_)) => Ok(TaskOutcome::Cancelled),
        Err(err) => {
            log.line(&err);
            slot.record(StepResult::Failed)?;
            if let Err(flush) = log.flush_to(&slot.log_file()) {
                debug!("failed to write step log: {flush}");
            }
            log.echo(format!("{} {step} FAILED", artifact.coords));
            request.cancel(&err);
            Err(err)
        }
    }
}
