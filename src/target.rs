//! Build targets and the target graph
//!
//! Targets are loaded from a JSON build plan and are immutable for the whole
//! build. The graph answers closure queries; it does not decide what is
//! stale (see [`crate::version`]).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label marking a target whose outputs must never be written to the cache
pub const NO_CACHE_LABEL: &str = "no_cache";

/// Build plan errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("IO error reading plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate target id: {0}")]
    DuplicateTarget(String),

    #[error("target {target} depends on unknown target {dependency}")]
    UnknownDependency { target: String, dependency: String },

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("invalid target id {0:?}: must be a plain file name")]
    InvalidTargetId(String),
}

/// A unit of source code compiled as one scheduling item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Identity; used as a single path component, so it may not be empty,
    /// `.`, `..` or contain a path separator
    pub id: String,
    /// Human-facing address, e.g. `src/java/org/example:lib`
    pub address: String,
    /// Ids of direct dependencies
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub resources: Vec<PathBuf>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Target platform tag handed to the compiler (e.g. `java8`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Target {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Whether outputs may be written back to the artifact cache
    pub fn is_cacheable(&self) -> bool {
        !self.has_label(NO_CACHE_LABEL)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// On-disk build plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Root that relative sources resolve against; defaults to the plan's
    /// directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildroot: Option<PathBuf>,
    pub targets: Vec<Target>,
}

/// Validated set of targets with dependency edges
#[derive(Debug, Clone)]
pub struct TargetGraph {
    buildroot: PathBuf,
    targets: Vec<Arc<Target>>,
    index: HashMap<String, usize>,
}

impl TargetGraph {
    /// Load a JSON build plan from disk. The buildroot is canonicalized so
    /// analysis rebasing always sees an absolute prefix.
    pub fn load(plan_path: &Path) -> Result<Self, PlanError> {
        let bytes = fs::read(plan_path).map_err(|source| PlanError::Io {
            path: plan_path.to_path_buf(),
            source,
        })?;
        let plan: BuildPlan = serde_json::from_slice(&bytes)?;

        let plan_dir = plan_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let buildroot = match &plan.buildroot {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => plan_dir.join(root),
            None => plan_dir,
        };
        let buildroot = fs::canonicalize(&buildroot).map_err(|source| PlanError::Io {
            path: buildroot.clone(),
            source,
        })?;

        Self::new(buildroot, plan.targets)
    }

    /// Build a graph, resolving relative sources against `buildroot`.
    pub fn new(buildroot: PathBuf, targets: Vec<Target>) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            if !is_plain_file_name(&target.id) {
                return Err(PlanError::InvalidTargetId(target.id.clone()));
            }
            if index.insert(target.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateTarget(target.id.clone()));
            }
        }

        for target in &targets {
            for dep in &target.dependencies {
                if !index.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        target: target.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let targets = targets
            .into_iter()
            .map(|mut target| {
                target.sources = resolve_all(&buildroot, target.sources);
                target.resources = resolve_all(&buildroot, target.resources);
                Arc::new(target)
            })
            .collect();

        Ok(Self {
            buildroot,
            targets,
            index,
        })
    }

    pub fn buildroot(&self) -> &Path {
        &self.buildroot
    }

    /// All targets in plan order
    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Target>> {
        self.index.get(id).map(|&i| &self.targets[i])
    }

    pub fn require(&self, id: &str) -> Result<&Arc<Target>, PlanError> {
        self.get(id)
            .ok_or_else(|| PlanError::UnknownTarget(id.to_string()))
    }

    /// The target followed by its transitive dependencies, depth-first
    /// pre-order, each appearing once.
    pub fn closure(&self, target: &Target) -> Vec<Arc<Target>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![target.id.as_str()];

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(current) = self.get(id) else {
                continue;
            };
            order.push(Arc::clone(current));
            // Reverse so the first declared dependency is visited first.
            for dep in current.dependencies.iter().rev() {
                if !seen.contains(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }

        order
    }
}

fn is_plain_file_name(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(|c: char| c == '/' || c == '\\' || c == '\0')
}

fn resolve_all(buildroot: &Path, paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .map(|p| if p.is_absolute() { p } else { buildroot.join(p) })
        .collect()
}
