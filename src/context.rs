//! Per-target compile working paths
//!
//! A [`CompileContext`] is a value object: it is derived from the target and
//! the fixed working directories only, so computing it twice for the same
//! target always yields the same paths. Nothing here touches the filesystem;
//! callers create directories lazily.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::target::Target;

/// Hex characters of the target-id hash kept in archive names.
///
/// Short names bound classpath length. Two ids sharing this prefix would
/// share an archive path; that collision is accepted and not detected.
pub const ARCHIVE_HASH_PREFIX_LEN: usize = 12;

/// Extension of output archives
pub const ARCHIVE_EXTENSION: &str = "tar";

/// Extensions treated as packaged (non-directory) classpath entries
pub const PACKAGED_EXTENSIONS: &[&str] = &["tar", "jar", "zip"];

/// Invalid source glob
#[derive(Debug, Error)]
#[error("invalid source glob {glob:?}: {source}")]
pub struct SourceGlobError {
    glob: String,
    #[source]
    source: globset::Error,
}

/// Fixed working directories of one compile task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirs {
    pub analysis_dir: PathBuf,
    pub classes_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub archives_dir: PathBuf,
    /// Parent of per-attempt scratch directories
    pub scratch_dir: PathBuf,
}

impl WorkDirs {
    pub fn new(workdir: &Path) -> Self {
        Self {
            analysis_dir: workdir.join("isolated-analysis"),
            classes_dir: workdir.join("isolated-classes"),
            logs_dir: workdir.join("isolated-logs"),
            archives_dir: workdir.join("archives"),
            scratch_dir: workdir.join("analysis-tmp"),
        }
    }

    /// Create every working directory (idempotent)
    pub fn create_all(&self) -> io::Result<()> {
        for dir in [
            &self.analysis_dir,
            &self.classes_dir,
            &self.logs_dir,
            &self.archives_dir,
            &self.scratch_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Portable (relativized) analysis path used by the artifact cache
    pub fn portable_analysis_file(&self, target: &Target) -> PathBuf {
        self.analysis_dir
            .join(format!("{}.analysis.portable", target.id))
    }

    /// Per-target compiler log
    pub fn log_file(&self, target: &Target) -> PathBuf {
        self.logs_dir.join(format!("{}.log", target.id))
    }
}

/// Analysis file for `target` inside `dir`
pub fn analysis_for_target(dir: &Path, target: &Target) -> PathBuf {
    dir.join(format!("{}.analysis", target.id))
}

/// `<first 12 hex chars of sha256(target id)>.tar`
pub fn archive_file_name(target_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(target_id.as_bytes()));
    format!(
        "{}.{}",
        &digest[..ARCHIVE_HASH_PREFIX_LEN],
        ARCHIVE_EXTENSION
    )
}

/// Whether a classpath entry is a packaged archive rather than a directory
pub fn is_packaged(entry: &Path) -> bool {
    entry
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| PACKAGED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Working paths for one target's compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileContext {
    pub target: Arc<Target>,
    pub analysis_file: PathBuf,
    pub classes_dir: PathBuf,
    pub archive_file: PathBuf,
    pub sources: Vec<PathBuf>,
}

/// Selects which of a target's sources this compiler handles
#[derive(Debug, Clone)]
pub struct SourceFilter {
    buildroot: PathBuf,
    globs: GlobSet,
}

impl SourceFilter {
    pub fn new<S: AsRef<str>>(buildroot: &Path, globs: &[S]) -> Result<Self, SourceGlobError> {
        let mut builder = GlobSetBuilder::new();
        for glob in globs {
            let glob = glob.as_ref();
            builder.add(Glob::new(glob).map_err(|source| SourceGlobError {
                glob: glob.to_string(),
                source,
            })?);
        }
        let globs = builder.build().map_err(|source| SourceGlobError {
            glob: String::new(),
            source,
        })?;
        Ok(Self {
            buildroot: buildroot.to_path_buf(),
            globs,
        })
    }

    pub fn matches(&self, source: &Path) -> bool {
        let relative = source.strip_prefix(&self.buildroot).unwrap_or(source);
        self.globs.is_match(relative)
    }
}

/// Derives compile contexts from targets
#[derive(Debug, Clone)]
pub struct ContextFactory {
    dirs: WorkDirs,
    filter: SourceFilter,
}

impl ContextFactory {
    pub fn new(dirs: WorkDirs, filter: SourceFilter) -> Self {
        Self { dirs, filter }
    }

    pub fn dirs(&self) -> &WorkDirs {
        &self.dirs
    }

    /// Pure mapping target -> working paths
    pub fn compile_context(&self, target: &Arc<Target>) -> CompileContext {
        CompileContext {
            target: Arc::clone(target),
            analysis_file: analysis_for_target(&self.dirs.analysis_dir, target),
            classes_dir: self.dirs.classes_dir.join(&target.id),
            archive_file: self.dirs.archives_dir.join(archive_file_name(&target.id)),
            sources: target
                .sources
                .iter()
                .filter(|s| self.filter.matches(s))
                .cloned()
                .collect(),
        }
    }
}
