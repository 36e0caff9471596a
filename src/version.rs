//! Version units and invalidation
//!
//! A version unit tracks one target's validity for one build. The compile
//! core only calls [`VersionUnit::update`] on success and
//! [`VersionUnit::force_invalidate`] on failure; both are idempotent.
//!
//! [`VersionRegistry`] is a small file-backed implementation: a target is
//! valid when its marker file holds the current fingerprint, a SHA-256 over
//! the target's identity, its source bytes and its dependencies'
//! fingerprints.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::fsutil::atomic_write;
use crate::target::{Target, TargetGraph};

/// Invalidation record for one target in one build
pub trait VersionUnit: Send + Sync {
    fn target_id(&self) -> &str;

    /// Key under which this unit's outputs are cached
    fn cache_key(&self) -> &str;

    /// Mark valid; eligible for future cache reads
    fn update(&self);

    /// Mark invalid; removed from cache candidacy
    fn force_invalidate(&self);

    fn is_valid(&self) -> bool;
}

/// Marker-file backed version unit
#[derive(Debug)]
pub struct VersionedTarget {
    target_id: String,
    fingerprint: String,
    marker: PathBuf,
    valid: AtomicBool,
}

impl VersionedTarget {
    pub fn new(target_id: impl Into<String>, fingerprint: String, marker: PathBuf, valid: bool) -> Self {
        Self {
            target_id: target_id.into(),
            fingerprint,
            marker,
            valid: AtomicBool::new(valid),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl VersionUnit for VersionedTarget {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    fn cache_key(&self) -> &str {
        &self.fingerprint
    }

    fn update(&self) {
        if let Some(parent) = self.marker.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(target_id = %self.target_id, error = %e, "cannot create version marker dir");
            }
        }
        match atomic_write(&self.marker, self.fingerprint.as_bytes()) {
            Ok(()) => self.valid.store(true, Ordering::SeqCst),
            Err(e) => warn!(target_id = %self.target_id, error = %e, "cannot write version marker"),
        }
    }

    fn force_invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
        match fs::remove_file(&self.marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(target_id = %self.target_id, error = %e, "cannot remove version marker"),
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

/// One scheduling partition of targets and their version units
#[derive(Clone)]
pub struct VersionedTargetSet {
    pub targets: Vec<Arc<Target>>,
    pub units: Vec<Arc<dyn VersionUnit>>,
}

impl VersionedTargetSet {
    pub fn new(targets: Vec<Arc<Target>>, units: Vec<Arc<dyn VersionUnit>>) -> Self {
        Self { targets, units }
    }

    /// Partition holding exactly one target
    pub fn single(target: Arc<Target>, unit: Arc<dyn VersionUnit>) -> Self {
        Self::new(vec![target], vec![unit])
    }

    pub fn update(&self) {
        for unit in &self.units {
            unit.update();
        }
    }

    pub fn force_invalidate(&self) {
        for unit in &self.units {
            unit.force_invalidate();
        }
    }
}

impl std::fmt::Debug for VersionedTargetSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.targets.iter().map(|t| t.id.as_str()).collect();
        f.debug_struct("VersionedTargetSet").field("targets", &ids).finish()
    }
}

/// Outcome of comparing fingerprints against markers
#[derive(Debug, Clone, Default)]
pub struct InvalidationCheck {
    /// Every target's unit, in graph order
    pub all_vts: Vec<VersionedTargetSet>,
    /// Invalid targets, one per partition
    pub invalid_vts_partitioned: Vec<VersionedTargetSet>,
}

impl InvalidationCheck {
    pub fn invalid_targets(&self) -> Vec<Arc<Target>> {
        self.invalid_vts_partitioned
            .iter()
            .flat_map(|vts| vts.targets.iter().cloned())
            .collect()
    }

    pub fn valid_targets(&self) -> Vec<Arc<Target>> {
        self.all_vts
            .iter()
            .filter(|vts| vts.units.iter().all(|u| u.is_valid()))
            .flat_map(|vts| vts.targets.iter().cloned())
            .collect()
    }
}

/// File-backed fingerprint store
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    dir: PathBuf,
}

impl VersionRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn marker(&self, target: &Target) -> PathBuf {
        self.dir.join(format!("{}.valid", target.id))
    }

    /// Fingerprint every target, dependencies first
    pub fn fingerprints(&self, graph: &TargetGraph) -> io::Result<HashMap<String, String>> {
        let mut memo = HashMap::new();
        for target in graph.targets() {
            fingerprint_into(graph, target, &mut memo, &mut Vec::new())?;
        }
        Ok(memo)
    }

    /// Compare every target's fingerprint with its marker
    pub fn invalidation_check(&self, graph: &TargetGraph) -> io::Result<InvalidationCheck> {
        let fingerprints = self.fingerprints(graph)?;
        let mut check = InvalidationCheck::default();

        for target in graph.targets() {
            let fingerprint = fingerprints.get(&target.id).cloned().unwrap_or_default();
            let marker = self.marker(target);
            let valid = match fs::read_to_string(&marker) {
                Ok(stored) => stored == fingerprint,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e),
            };

            let unit: Arc<dyn VersionUnit> =
                Arc::new(VersionedTarget::new(target.id.clone(), fingerprint, marker, valid));
            let vts = VersionedTargetSet::single(Arc::clone(target), unit);
            if !valid {
                check.invalid_vts_partitioned.push(vts.clone());
            }
            check.all_vts.push(vts);
        }

        Ok(check)
    }
}

fn fingerprint_into(
    graph: &TargetGraph,
    target: &Target,
    memo: &mut HashMap<String, String>,
    visiting: &mut Vec<String>,
) -> io::Result<String> {
    if let Some(done) = memo.get(&target.id) {
        return Ok(done.clone());
    }
    if visiting.contains(&target.id) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("dependency cycle through {}", target.id),
        ));
    }
    visiting.push(target.id.clone());

    let mut hasher = Sha256::new();
    hasher.update(target.id.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.address.as_bytes());
    hasher.update([0u8]);
    for label in &target.labels {
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
    }
    if let Some(platform) = &target.platform {
        hasher.update(platform.as_bytes());
    }
    hasher.update([0u8]);

    for source in target.sources.iter().chain(target.resources.iter()) {
        hash_file(&mut hasher, source)?;
    }

    for dep_id in &target.dependencies {
        if let Some(dep) = graph.get(dep_id) {
            let dep_fingerprint = fingerprint_into(graph, dep, memo, visiting)?;
            hasher.update(dep_fingerprint.as_bytes());
        }
    }

    visiting.pop();
    let fingerprint = hex::encode(hasher.finalize());
    memo.insert(target.id.clone(), fingerprint.clone());
    Ok(fingerprint)
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> io::Result<()> {
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    match fs::read(path) {
        Ok(bytes) => hasher.update(&bytes),
        // Missing and empty sources must fingerprint differently.
        Err(e) if e.kind() == io::ErrorKind::NotFound => hasher.update(b"\x01missing"),
        Err(e) => return Err(e),
    }
    hasher.update([0u8]);
    Ok(())
}
