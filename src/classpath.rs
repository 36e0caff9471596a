//! Shared classpath store and per-target classpath assembly
//!
//! The store maps a target id to its ordered `(conf, path)` entries. Compile
//! jobs running concurrently only ever mutate their own target's key, and the
//! map shards its locks per key, so no global lock is taken.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::ExtraPlacement;
use crate::context::{is_packaged, CompileContext};
use crate::target::Target;

/// One classpath element under one configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClasspathEntry {
    pub conf: String,
    pub path: PathBuf,
}

impl ClasspathEntry {
    pub fn new(conf: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            conf: conf.into(),
            path: path.into(),
        }
    }
}

/// Classpath contributions keyed by target
#[derive(Debug, Default)]
pub struct ClasspathStore {
    entries: DashMap<String, Vec<ClasspathEntry>>,
}

impl ClasspathStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries for a target, skipping ones already present
    pub fn add_for_target<I>(&self, target: &Target, entries: I)
    where
        I: IntoIterator<Item = ClasspathEntry>,
    {
        let mut slot = self.entries.entry(target.id.clone()).or_default();
        for entry in entries {
            if !slot.contains(&entry) {
                slot.push(entry);
            }
        }
    }

    /// Remove the given entries for a target
    pub fn remove_for_target<'a, I>(&self, target: &Target, entries: I)
    where
        I: IntoIterator<Item = &'a ClasspathEntry>,
    {
        let doomed: HashSet<&ClasspathEntry> = entries.into_iter().collect();
        if let Some(mut slot) = self.entries.get_mut(&target.id) {
            slot.retain(|e| !doomed.contains(e));
        }
    }

    /// Swap `old` for `new` under each conf, in place, under a single key lock.
    ///
    /// Confs where `old` is absent get `new` appended, so calling this twice
    /// is harmless.
    pub fn replace_for_target(&self, target: &Target, confs: &[String], old: &Path, new: &Path) {
        let mut slot = self.entries.entry(target.id.clone()).or_default();
        for conf in confs {
            let replacement = ClasspathEntry::new(conf.clone(), new);
            let position = slot
                .iter()
                .position(|e| &e.conf == conf && e.path == old);
            match position {
                Some(i) => {
                    if slot.contains(&replacement) {
                        slot.remove(i);
                    } else {
                        slot[i] = replacement;
                    }
                }
                None => {
                    if !slot.contains(&replacement) {
                        slot.push(replacement);
                    }
                }
            }
        }
    }

    /// Snapshot of a target's entries
    pub fn get_for_target(&self, target: &Target) -> Vec<ClasspathEntry> {
        self.entries
            .get(&target.id)
            .map(|slot| slot.value().clone())
            .unwrap_or_default()
    }

    /// Paths of a target's entries under the given confs
    pub fn paths_for_target(&self, target: &Target, confs: &[String]) -> Vec<PathBuf> {
        self.get_for_target(target)
            .into_iter()
            .filter(|e| confs.contains(&e.conf))
            .map(|e| e.path)
            .collect()
    }
}

/// Extra compile-time classpath elements, applied to every conf
#[derive(Debug, Clone, Default)]
pub struct ExtraClasspath {
    pub entries: Vec<ClasspathEntry>,
    pub placement: ExtraPlacement,
}

impl ExtraClasspath {
    /// Pair each element with each conf
    pub fn new(elements: &[PathBuf], confs: &[String], placement: ExtraPlacement) -> Self {
        let entries = confs
            .iter()
            .flat_map(|conf| {
                elements
                    .iter()
                    .map(move |path| ClasspathEntry::new(conf.clone(), path.clone()))
            })
            .collect();
        Self { entries, placement }
    }
}

/// Ordered classpath for one target's compile.
///
/// Closure members contribute in closure order, filtered to `confs`; extra
/// elements are prepended or appended per their placement. Duplicates keep
/// their first position.
pub fn compute_classpath(
    store: &ClasspathStore,
    closure: &[Arc<Target>],
    confs: &[String],
    extra: &ExtraClasspath,
) -> Vec<PathBuf> {
    let extra_paths: Vec<PathBuf> = extra
        .entries
        .iter()
        .filter(|e| confs.contains(&e.conf))
        .map(|e| e.path.clone())
        .collect();

    let closure_paths = closure.iter().flat_map(|member| {
        let paths = store.paths_for_target(member, confs);
        if paths.is_empty() {
            debug!(member = %member.address, "no classpath entries for closure member");
        }
        paths
    });

    let ordered: Vec<PathBuf> = match extra.placement {
        ExtraPlacement::Prepend => extra_paths.into_iter().chain(closure_paths).collect(),
        ExtraPlacement::Append => closure_paths.chain(extra_paths).collect(),
    };

    let mut seen = HashSet::new();
    ordered
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Map each raw classes-directory entry to the analysis file of the context
/// that owns it.
///
/// Packaged entries are skipped, as are directories no context owns.
pub fn upstream_analysis<'a, I>(contexts: I, classpath_entries: &[PathBuf]) -> BTreeMap<PathBuf, PathBuf>
where
    I: IntoIterator<Item = &'a CompileContext>,
{
    let by_classes_dir: HashMap<&Path, &CompileContext> = contexts
        .into_iter()
        .map(|cc| (cc.classes_dir.as_path(), cc))
        .collect();

    let mut upstream = BTreeMap::new();
    for entry in classpath_entries {
        if is_packaged(entry) {
            continue;
        }
        match by_classes_dir.get(entry.as_path()) {
            Some(cc) => {
                upstream.insert(cc.classes_dir.clone(), cc.analysis_file.clone());
            }
            None => debug!(entry = %entry.display(), "missing upstream analysis"),
        }
    }
    upstream
}
