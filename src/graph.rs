//! The resolved artifact graph and the fingerprint that keys the cache.

use crate::{
    error::{GraphError, Result},
    hash::HashBuilder,
    BuildRequest, ClasspathScope,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt,
    path::PathBuf,
    sync::Arc,
};

/// Opaque artifact identity: group, name, version and an optional classifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactCoords {
    pub group: String,
    pub name: String,
    pub version: String,
    pub classifier: Option<String>,
}

impl ArtifactCoords {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { group: group.into(), name: name.into(), version: version.into(), classifier: None }
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// A form safe for use in directory names: colons become dashes and any
    /// path separator is squashed.
    pub fn sanitized(&self) -> String {
        let mut key = format!("{}-{}-{}", self.group, self.name, self.version);
        if let Some(classifier) = &self.classifier {
            key.push('-');
            key.push_str(classifier);
        }
        key.replace(['/', '\\', ':'], "_")
    }
}

impl fmt::Display for ArtifactCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        Ok(())
    }
}

/// Classification assigned by the resolver; drives the per-step skip rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// The artifact whose build was requested.
    Root,
    /// An ordinary dependency, built through the full non-root pipeline.
    Dependency,
    /// Prebuilt compiler bootstrap classes, exempt from processing.
    JavacBootstrap,
    /// The prebuilt JRE emulation, exempt from processing.
    JreBinary,
    /// Present on the classpath but never processed.
    Ignored,
}

/// One package-prefix rename applied by the shade transform.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShadeMapping {
    /// Package prefix to relocate, in dot form, e.g. `java.io`.
    pub find: String,
    /// Replacement prefix in dot form; empty moves the package to the root.
    pub replace: String,
}

impl ShadeMapping {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self { find: find.into(), replace: replace.into() }
    }

    /// The prefix as a relative filesystem path (`java.io` → `java/io`).
    pub fn find_as_path(&self) -> PathBuf {
        self.find.split('.').collect()
    }

    /// The replacement as a relative filesystem path; empty for a move to
    /// the root.
    pub fn replace_as_path(&self) -> PathBuf {
        if self.replace.is_empty() {
            PathBuf::new()
        } else {
            self.replace.split('.').collect()
        }
    }

    fn validate(&self) -> Result<(), GraphError> {
        let malformed = |why: &str| {
            GraphError::MalformedShadeMapping(
                format!("{} -> {}", self.find, self.replace),
                why.to_string(),
            )
        };
        if self.find.is_empty() {
            return Err(malformed("empty find prefix"));
        }
        for (label, prefix) in [("find", &self.find), ("replace", &self.replace)] {
            if prefix.is_empty() {
                continue;
            }
            if prefix.split('.').any(|segment| {
                segment.is_empty() || segment.contains(['/', '\\', ' '])
            }) {
                return Err(malformed(&format!("invalid {label} prefix")));
            }
        }
        Ok(())
    }
}

/// A resolved unit of source or binary in the build graph.
///
/// Immutable after graph construction apart from the lazily computed
/// fingerprint.
#[derive(Debug)]
pub struct Artifact {
    pub coords: ArtifactCoords,
    pub kind: ArtifactKind,
    /// Direct dependencies in declared order.
    pub deps: Vec<Arc<Artifact>>,
    /// Package renames applied after the stripped recompile.
    pub shade: Vec<ShadeMapping>,
    /// Marks artifacts the resolver excluded from processing.
    pub processing_skipped: bool,
    /// Distributable archive for dependency and JRE kinds.
    pub artifact_file: Option<PathBuf>,
    /// Source directories for the root artifact.
    pub source_roots: Vec<PathBuf>,
    hash: OnceCell<String>,
}

impl Artifact {
    pub fn new(coords: ArtifactCoords, kind: ArtifactKind) -> Self {
        Self {
            coords,
            kind,
            deps: Vec::new(),
            shade: Vec::new(),
            processing_skipped: false,
            artifact_file: None,
            source_roots: Vec::new(),
            hash: OnceCell::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, ArtifactKind::Root)
    }

    /// Whether every step but the fingerprint is taken as given.
    pub fn exempt_from_processing(&self) -> bool {
        self.processing_skipped
            || matches!(
                self.kind,
                ArtifactKind::JavacBootstrap | ArtifactKind::JreBinary | ArtifactKind::Ignored
            )
    }

    /// All transitive dependencies in declared depth-first order, each once.
    pub fn transitive_deps(&self) -> Vec<Arc<Artifact>> {
        fn walk(
            deps: &[Arc<Artifact>],
            seen: &mut BTreeSet<ArtifactCoords>,
            out: &mut Vec<Arc<Artifact>>,
        ) {
            for dep in deps {
                if seen.insert(dep.coords.clone()) {
                    out.push(dep.clone());
                    walk(&dep.deps, seen, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.deps, &mut BTreeSet::new(), &mut out);
        out
    }

    /// The artifact's fingerprint: a pure function of every transitive input
    /// that can influence its outputs. Computed once and memoized.
    pub fn hash(&self, request: &BuildRequest) -> Result<&str> {
        let mut visiting = Vec::new();
        self.hash_with(request, &mut visiting)
    }

    fn hash_with<'a>(
        &'a self,
        request: &BuildRequest,
        visiting: &mut Vec<ArtifactCoords>,
    ) -> Result<&'a str> {
        if let Some(hash) = self.hash.get() {
            return Ok(hash.as_str());
        }
        if visiting.contains(&self.coords) {
            return Err(GraphError::Cycle(self.coords.to_string()).into());
        }
        visiting.push(self.coords.clone());
        let computed = self.compute_hash(request, visiting);
        visiting.pop();
        let computed = computed?;
        Ok(self.hash.get_or_init(|| computed).as_str())
    }

    fn compute_hash(
        &self,
        request: &BuildRequest,
        visiting: &mut Vec<ArtifactCoords>,
    ) -> Result<String> {
        let mut hasher = HashBuilder::new();
        request.append_hash_inputs(&mut hasher);
        hasher.append(self.coords.to_string());
        for dep in &self.deps {
            hasher.append(dep.hash_with(request, visiting)?);
        }
        if let Some(file) = &self.artifact_file {
            if !self.is_root() {
                hasher.append_path(file)?;
            }
        }
        let mut mappings = self.shade.clone();
        mappings.sort();
        for mapping in &mappings {
            hasher.append(&mapping.find).append(&mapping.replace);
        }
        if let Some(test) = request.test_id() {
            hasher.append(test);
        }
        Ok(hasher.finish())
    }
}

/// The acyclic graph of artifacts produced by the resolver.
#[derive(Debug)]
pub struct ArtifactGraph {
    root: Arc<Artifact>,
    artifacts: Vec<Arc<Artifact>>,
}

impl ArtifactGraph {
    /// Builds the graph reachable from `root`, validating shade mappings and
    /// rejecting cycles.
    pub fn new(root: Arc<Artifact>) -> Result<Self> {
        let mut artifacts = vec![root.clone()];
        artifacts.extend(root.transitive_deps());

        let mut visiting = Vec::new();
        check_cycles(&root, &mut visiting)?;
        for artifact in &artifacts {
            for mapping in &artifact.shade {
                mapping.validate()?;
            }
        }
        Ok(Self { root, artifacts })
    }

    pub fn root(&self) -> &Arc<Artifact> {
        &self.root
    }

    /// Every artifact in the graph, root first.
    pub fn artifacts(&self) -> &[Arc<Artifact>] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

fn check_cycles(artifact: &Artifact, visiting: &mut Vec<ArtifactCoords>) -> Result<()> {
    if visiting.contains(&artifact.coords) {
        return Err(GraphError::Cycle(artifact.coords.to_string()).into());
    }
    visiting.push(artifact.coords.clone());
    for dep in &artifact.deps {
        check_cycles(dep, visiting)?;
    }
    visiting.pop();
    Ok(())
}

/// Produces the initial artifact graph for a requested root, classifying
/// every artifact's kind. Called once at the start of a build.
pub trait Resolver {
    fn resolve(&self, root: &ArtifactCoords, scope: ClasspathScope) -> Result<ArtifactGraph>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{utils, BuildRequest};

    fn request() -> BuildRequest {
        let tmp = std::env::temp_dir();
        BuildRequest::builder()
            .base_dir(tmp.join("j2cl-graph-cache"))
            .target_dir(tmp.join("j2cl-graph-target"))
            .build()
            .unwrap()
    }

    fn leaf(name: &str) -> Artifact {
        Artifact::new(ArtifactCoords::new("com.example", name, "1.0"), ArtifactKind::Dependency)
    }

    #[test]
    fn coords_display_and_sanitize() {
        let coords = ArtifactCoords::new("com.example", "app", "1.0").with_classifier("sources");
        assert_eq!(coords.to_string(), "com.example:app:1.0:sources");
        assert_eq!(coords.sanitized(), "com.example-app-1.0-sources");
    }

    #[test]
    fn hash_is_memoized_and_deterministic() {
        let request = request();
        let artifact = leaf("lib");
        let first = artifact.hash(&request).unwrap().to_string();
        let second = artifact.hash(&request).unwrap().to_string();
        assert_eq!(first, second);

        let again = leaf("lib");
        assert_eq!(again.hash(&request).unwrap(), first);
    }

    #[test]
    fn hash_changes_with_dependency_hash() {
        let request = request();
        let mut root = Artifact::new(
            ArtifactCoords::new("com.example", "app", "1.0"),
            ArtifactKind::Root,
        );
        root.deps.push(Arc::new(leaf("lib")));
        let with_dep = root.hash(&request).unwrap().to_string();

        let bare = Artifact::new(
            ArtifactCoords::new("com.example", "app", "1.0"),
            ArtifactKind::Root,
        );
        assert_ne!(bare.hash(&request).unwrap(), with_dep);
    }

    #[test]
    fn hash_changes_with_shade_mapping() {
        let request = request();
        let plain = leaf("lib");
        let mut shaded = leaf("lib");
        shaded.shade.push(ShadeMapping::new("java.io", "example.java.io"));
        assert_ne!(plain.hash(&request).unwrap(), shaded.hash(&request).unwrap());
    }

    #[test]
    fn hash_changes_with_archive_contents() {
        let tmp = utils::tempdir("graph").unwrap();
        let jar = tmp.path().join("lib.jar");
        std::fs::write(&jar, b"one").unwrap();

        let request = request();
        let mut artifact = leaf("lib");
        artifact.artifact_file = Some(jar.clone());
        let before = artifact.hash(&request).unwrap().to_string();

        std::fs::write(&jar, b"two").unwrap();
        let mut artifact = leaf("lib");
        artifact.artifact_file = Some(jar);
        assert_ne!(artifact.hash(&request).unwrap(), before);
    }

    #[test]
    fn hash_changes_with_test_identifier() {
        let tmp = std::env::temp_dir();
        let alpha = BuildRequest::builder()
            .base_dir(tmp.join("cache"))
            .target_dir(tmp.join("target"))
            .test_id("alpha")
            .build()
            .unwrap();
        let beta = BuildRequest::builder()
            .base_dir(tmp.join("cache"))
            .target_dir(tmp.join("target"))
            .test_id("beta")
            .build()
            .unwrap();
        assert_ne!(leaf("lib").hash(&alpha).unwrap(), leaf("lib").hash(&beta).unwrap());
    }

    #[test]
    fn hash_ignores_unrelated_state() {
        let request = request();
        let plain = leaf("lib");
        let baseline = plain.hash(&request).unwrap().to_string();

        // A sibling artifact appearing elsewhere in the graph does not feed
        // into this artifact's digest.
        let mut other = leaf("other");
        other.shade.push(ShadeMapping::new("a.b", "c.d"));
        let _ = other.hash(&request).unwrap();
        assert_eq!(leaf("lib").hash(&request).unwrap(), baseline);
    }

    #[test]
    fn malformed_shade_mapping_is_rejected_at_graph_construction() {
        let mut artifact = leaf("lib");
        artifact.shade.push(ShadeMapping::new("", "somewhere"));
        let err = ArtifactGraph::new(Arc::new(artifact)).unwrap_err();
        assert!(err.to_string().contains("malformed shade mapping"));
    }

    #[test]
    fn graph_lists_transitive_artifacts_once() {
        let shared = Arc::new(leaf("shared"));
        let mut mid = leaf("mid");
        mid.deps.push(shared.clone());
        let mut root = Artifact::new(
            ArtifactCoords::new("com.example", "app", "1.0"),
            ArtifactKind::Root,
        );
        root.deps.push(Arc::new(mid));
        root.deps.push(shared);

        let graph = ArtifactGraph::new(Arc::new(root)).unwrap();
        assert_eq!(graph.len(), 3);
        assert!(graph.artifacts()[0].is_root());
    }
}
