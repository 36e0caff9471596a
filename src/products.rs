//! Per-target output registration
//!
//! Once a target's job has committed its analysis and packaged its classes,
//! the registry records where its outputs live. Distinct targets register
//! concurrently; each only writes its own key.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::analysis::{AnalysisError, AnalysisTools};
use crate::archive::{list_entries, ArchiveError};
use crate::context::CompileContext;

/// Errors while registering or mapping products
#[derive(Debug, Error)]
pub enum ProductError {
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Finalized outputs of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetProducts {
    pub classes_dir: PathBuf,
    /// Files under the classes dir, absolute, sorted
    pub classes: Vec<PathBuf>,
    /// Resources that exist on disk
    pub resources: Vec<PathBuf>,
    pub archive: PathBuf,
}

/// Concurrent registry of target outputs keyed by target id
#[derive(Debug, Default)]
pub struct ProductRegistry {
    by_target: DashMap<String, TargetProducts>,
}

impl ProductRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a context's outputs, replacing any earlier registration
    pub fn register(&self, context: &CompileContext) -> Result<(), ProductError> {
        let mut classes = Vec::new();
        if context.classes_dir.is_dir() {
            for entry in WalkDir::new(&context.classes_dir) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    classes.push(entry.into_path());
                }
            }
        }
        classes.sort();

        let resources = context
            .target
            .resources
            .iter()
            .filter(|r| r.exists())
            .cloned()
            .collect();

        debug!(
            target_id = %context.target.id,
            classes = classes.len(),
            "registered products"
        );
        self.by_target.insert(
            context.target.id.clone(),
            TargetProducts {
                classes_dir: context.classes_dir.clone(),
                classes,
                resources,
                archive: context.archive_file.clone(),
            },
        );
        Ok(())
    }

    pub fn get(&self, target_id: &str) -> Option<TargetProducts> {
        self.by_target.get(target_id).map(|p| p.value().clone())
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.by_target.contains_key(target_id)
    }

    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }
}

/// Class files of one target grouped by the source that produced them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassesBySource {
    /// Buildroot-relative source -> absolute class files
    pub by_source: BTreeMap<PathBuf, Vec<PathBuf>>,
    /// Archived files no analysis record claims
    pub unclaimed: Vec<PathBuf>,
}

/// Map each context's archived classes back to their sources.
///
/// Every archive entry starts unclaimed; entries listed as products in the
/// context's analysis are moved under their source. A context without an
/// analysis file reports its whole archive as unclaimed.
pub fn compute_classes_by_source<'a, I>(
    contexts: I,
    tools: &dyn AnalysisTools,
    buildroot: &Path,
) -> Result<BTreeMap<String, ClassesBySource>, ProductError>
where
    I: IntoIterator<Item = &'a CompileContext>,
{
    let mut out = BTreeMap::new();

    for context in contexts {
        let mut unclaimed: BTreeSet<PathBuf> = list_entries(&context.archive_file)?
            .into_iter()
            .map(|name| context.classes_dir.join(name))
            .collect();

        let mut mapping = ClassesBySource::default();
        if context.analysis_file.exists() {
            let products =
                tools.parse_products_from_path(&context.analysis_file, &context.classes_dir)?;
            for (source, classes) in products {
                for class in &classes {
                    unclaimed.remove(class);
                }
                let relative = source
                    .strip_prefix(buildroot)
                    .map(Path::to_path_buf)
                    .unwrap_or(source);
                mapping.by_source.insert(relative, classes);
            }
        }
        mapping.unclaimed = unclaimed.into_iter().collect();
        out.insert(context.target.id.clone(), mapping);
    }

    Ok(out)
}
