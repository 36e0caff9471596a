//! Artifact cache write-back
//!
//! After a target compiles, its outputs are uploaded off the main schedule:
//! the strategy builds a chain (relativize analysis, then upload) and hands
//! it to a [`BackgroundWorker`]. Chain failures are logged and counted but
//! never fail the build; the target's version unit was already updated by
//! the compile job.
//!
//! [`LocalArtifactCache`] stores each upload as
//! `<cache dir>/<target id>/<cache key>/` holding the files plus a
//! `manifest.json`, written last, that marks the entry complete. Stored paths
//! are relative to the buildroot; files outside it are not cached, and a
//! manifest naming a path that would escape the buildroot is corrupt.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use isolated_exec::{BoxError, Work};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil::{atomic_copy, atomic_write};
use crate::version::VersionUnit;

/// Schema identifier of cache manifests
pub const MANIFEST_SCHEMA_ID: &str = "isolated-compile/cache-manifest@1";

/// Commit marker of a cache entry
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Stored files live under this directory of an entry
const FILES_DIR: &str = "files";

/// Errors from the artifact cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Canonicalize(String),

    #[error("cache entry {entry} is corrupt: {message}")]
    Corrupt { entry: PathBuf, message: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Accepts finished targets' outputs for caching.
///
/// Returns the upload as deferred work, or `None` when nothing should be
/// cached.
pub trait ArtifactCacheWriter: Send + Sync {
    fn update_work(&self, units: Vec<(Arc<dyn VersionUnit>, Vec<PathBuf>)>) -> Option<Work>;
}

/// One stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryFile {
    /// Path relative to the buildroot
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// `manifest.json` of one cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub target_id: String,
    pub cache_key: String,
    pub files: Vec<CacheEntryFile>,
    /// SHA-256 of the JCS encoding of `files`
    pub files_sha256: String,
}

impl CacheManifest {
    fn files_digest(files: &[CacheEntryFile]) -> Result<String, CacheError> {
        let files = files.to_vec();
        let jcs = serde_json_canonicalizer::to_vec(&files)
            .map_err(|e| CacheError::Canonicalize(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&jcs)))
    }
}

/// Directory-backed artifact cache
#[derive(Debug, Clone)]
pub struct LocalArtifactCache {
    root: PathBuf,
    buildroot: PathBuf,
}

impl LocalArtifactCache {
    pub fn new(root: impl Into<PathBuf>, buildroot: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            buildroot: buildroot.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, target_id: &str, cache_key: &str) -> PathBuf {
        self.root.join(target_id).join(cache_key)
    }

    /// Whether a complete entry exists
    pub fn has(&self, target_id: &str, cache_key: &str) -> bool {
        self.entry_dir(target_id, cache_key)
            .join(MANIFEST_FILENAME)
            .is_file()
    }

    /// Buildroot-relative name of `file`, if it can be stored
    fn stored_name(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(&self.buildroot).ok()?.to_string_lossy().to_string();
        is_safe_relative(&rel).then_some(rel)
    }

    /// Copy `files` into a fresh entry and commit it with its manifest.
    ///
    /// Missing files are skipped with a debug log; the caller decides what is
    /// worth uploading. Files outside the buildroot are skipped with a
    /// warning. An existing entry for the same key is replaced.
    pub fn store(
        &self,
        target_id: &str,
        cache_key: &str,
        files: &[PathBuf],
    ) -> Result<CacheManifest, CacheError> {
        let entry = self.entry_dir(target_id, cache_key);
        if entry.exists() {
            fs::remove_dir_all(&entry).map_err(io_err(&entry))?;
        }
        let files_dir = entry.join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(io_err(&files_dir))?;

        let mut stored = Vec::new();
        for file in files {
            if !file.is_file() {
                debug!(file = %file.display(), "skipping missing cache input");
                continue;
            }
            let Some(name) = self.stored_name(file) else {
                warn!(file = %file.display(), "not caching file outside the buildroot");
                continue;
            };
            let dst = files_dir.join(&name);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            atomic_copy(file, &dst).map_err(io_err(file))?;
            let bytes = fs::read(&dst).map_err(io_err(&dst))?;
            stored.push(CacheEntryFile {
                path: name,
                size: bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&bytes)),
            });
        }
        stored.sort_by(|a, b| a.path.cmp(&b.path));
        stored.dedup_by(|a, b| a.path == b.path);

        let manifest = CacheManifest {
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            target_id: target_id.to_string(),
            cache_key: cache_key.to_string(),
            files_sha256: CacheManifest::files_digest(&stored)?,
            files: stored,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        let manifest_path = entry.join(MANIFEST_FILENAME);
        atomic_write(&manifest_path, &json).map_err(io_err(&manifest_path))?;

        info!(
            target_id,
            files = manifest.files.len(),
            entry = %entry.display(),
            "cached artifacts"
        );
        Ok(manifest)
    }

    /// Read and verify an entry's manifest
    pub fn manifest(&self, target_id: &str, cache_key: &str) -> Result<Option<CacheManifest>, CacheError> {
        let path = self.entry_dir(target_id, cache_key).join(MANIFEST_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let manifest: CacheManifest = serde_json::from_slice(&bytes)?;
        if CacheManifest::files_digest(&manifest.files)? != manifest.files_sha256 {
            return Err(CacheError::Corrupt {
                entry: path,
                message: "files digest mismatch".to_string(),
            });
        }
        Ok(Some(manifest))
    }

    /// Copy a complete entry's files back to their original locations.
    ///
    /// Returns `false` when there is no entry for the key. Every recorded
    /// path must stay inside the buildroot and every file must match its
    /// recorded hash before anything is written.
    pub fn restore(&self, target_id: &str, cache_key: &str) -> Result<bool, CacheError> {
        let manifest = match self.manifest(target_id, cache_key)? {
            Some(m) => m,
            None => return Ok(false),
        };
        let files_dir = self.entry_dir(target_id, cache_key).join(FILES_DIR);

        if let Some(bad) = manifest.files.iter().find(|f| !is_safe_relative(&f.path)) {
            return Err(CacheError::Corrupt {
                entry: self.entry_dir(target_id, cache_key),
                message: format!("unsafe path {:?}", bad.path),
            });
        }

        for file in &manifest.files {
            let src = files_dir.join(&file.path);
            let bytes = fs::read(&src).map_err(io_err(&src))?;
            if hex::encode(Sha256::digest(&bytes)) != file.sha256 {
                return Err(CacheError::Corrupt {
                    entry: src,
                    message: "content hash mismatch".to_string(),
                });
            }
        }

        for file in &manifest.files {
            let src = files_dir.join(&file.path);
            let dst = self.buildroot.join(&file.path);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            atomic_copy(&src, &dst).map_err(io_err(&dst))?;
        }

        debug!(target_id, files = manifest.files.len(), "restored from cache");
        Ok(true)
    }
}

impl ArtifactCacheWriter for LocalArtifactCache {
    fn update_work(&self, units: Vec<(Arc<dyn VersionUnit>, Vec<PathBuf>)>) -> Option<Work> {
        if units.is_empty() {
            return None;
        }
        let cache = self.clone();
        Some(Box::new(move || -> Result<(), BoxError> {
            for (unit, files) in units {
                cache.store(unit.target_id(), unit.cache_key(), &files)?;
            }
            Ok(())
        }))
    }
}

/// Serial background executor for write-back chains.
///
/// Each submitted chain runs its steps in order and stops at the first
/// failing step.
pub struct BackgroundWorker {
    sender: Mutex<Option<Sender<Vec<Work>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicUsize>,
}

/// A non-empty path made only of normal components
fn is_safe_relative(stored: &str) -> bool {
    let path = Path::new(stored);
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BackgroundWorker {
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Vec<Work>>();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for chain in receiver {
                    for step in chain {
                        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(step));
                        let failed = match outcome {
                            Ok(Ok(())) => false,
                            Ok(Err(e)) => {
                                warn!(error = %e, "background work failed");
                                true
                            }
                            Err(_) => {
                                warn!("background work panicked");
                                true
                            }
                        };
                        if failed {
                            counter.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            failures,
        })
    }

    /// Queue a chain of steps. A chain submitted after `join` is dropped.
    pub fn submit_chain(&self, chain: Vec<Work>) {
        match relock(&self.sender).as_ref() {
            Some(sender) => {
                if sender.send(chain).is_err() {
                    warn!("background worker is gone; dropping work");
                }
            }
            None => warn!("background worker already joined; dropping work"),
        }
    }

    /// Chains that failed so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Wait for every queued chain; returns the failure count
    pub fn join(&self) -> usize {
        relock(&self.sender).take();
        let handle = relock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("background worker thread panicked");
            }
        }
        self.failures()
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("failures", &self.failures())
            .field("joined", &relock(&self.handle).is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionedTarget;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn unit(dir: &Path) -> Arc<dyn VersionUnit> {
        Arc::new(VersionedTarget::new(
            "core",
            "abc123".to_string(),
            dir.join("versions/core.valid"),
            true,
        ))
    }

    #[test]
    fn test_store_writes_manifest_last_and_restores() {
        let dir = TempDir::new().unwrap();
        let buildroot = dir.path().join("repo");
        fs::create_dir_all(buildroot.join("out")).unwrap();
        let archive = buildroot.join("out/core.tar");
        fs::write(&archive, "tar bytes").unwrap();

        let cache = LocalArtifactCache::new(dir.path().join("cache"), &buildroot);
        assert!(!cache.has("core", "abc123"));

        let manifest = cache
            .store("core", "abc123", &[archive.clone(), buildroot.join("out/missing")])
            .unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].path, "out/core.tar");
        assert!(cache.has("core", "abc123"));

        fs::remove_file(&archive).unwrap();
        assert!(cache.restore("core", "abc123").unwrap());
        assert_eq!(fs::read_to_string(&archive).unwrap(), "tar bytes");
        assert!(!cache.restore("core", "other").unwrap());
    }

    #[test]
    fn test_tampered_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let buildroot = dir.path().join("repo");
        fs::create_dir_all(&buildroot).unwrap();
        fs::write(buildroot.join("a.class"), "a").unwrap();

        let cache = LocalArtifactCache::new(dir.path().join("cache"), &buildroot);
        cache
            .store("core", "k", &[buildroot.join("a.class")])
            .unwrap();
        fs::write(cache.entry_dir("core", "k").join("files/a.class"), "evil").unwrap();

        assert!(matches!(
            cache.restore("core", "k"),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_manifest_path_escaping_buildroot_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let buildroot = dir.path().join("repo");
        fs::create_dir_all(&buildroot).unwrap();
        fs::write(buildroot.join("a.class"), "a").unwrap();

        let cache = LocalArtifactCache::new(dir.path().join("cache"), &buildroot);
        let mut manifest = cache
            .store("core", "k", &[buildroot.join("a.class")])
            .unwrap();

        // Re-sign a manifest whose only file climbs out of the buildroot; the
        // stored bytes sit where that path resolves inside the entry.
        let entry = cache.entry_dir("core", "k");
        fs::write(entry.join("outside.txt"), "a").unwrap();
        manifest.files[0].path = "../outside.txt".to_string();
        manifest.files_sha256 = CacheManifest::files_digest(&manifest.files).unwrap();
        fs::write(
            entry.join(MANIFEST_FILENAME),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let err = cache.restore("core", "k").unwrap_err();
        assert!(matches!(&err, CacheError::Corrupt { message, .. } if message.contains("unsafe path")));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_files_outside_buildroot_are_not_stored() {
        let dir = TempDir::new().unwrap();
        let buildroot = dir.path().join("repo");
        fs::create_dir_all(&buildroot).unwrap();
        fs::write(buildroot.join("a.class"), "a").unwrap();
        let outside = dir.path().join("global.jar");
        fs::write(&outside, "jar").unwrap();

        let cache = LocalArtifactCache::new(dir.path().join("cache"), &buildroot);
        let manifest = cache
            .store("core", "k", &[buildroot.join("a.class"), outside])
            .unwrap();
        let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.class"]);
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative("out/core.tar"));
        assert!(!is_safe_relative(""));
        assert!(!is_safe_relative("../x"));
        assert!(!is_safe_relative("out/../../x"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative("./x"));
    }

    #[test]
    fn test_update_work_uses_unit_key() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.class"), "a").unwrap();
        let cache = LocalArtifactCache::new(dir.path().join("cache"), dir.path());

        assert!(cache.update_work(Vec::new()).is_none());
        let work = cache
            .update_work(vec![(unit(dir.path()), vec![dir.path().join("a.class")])])
            .unwrap();
        work().unwrap();
        assert!(cache.has("core", "abc123"));
    }

    #[test]
    fn test_background_chain_stops_at_failure_and_counts() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let worker = BackgroundWorker::new("cache-writer").unwrap();

        let step = |name: &'static str, ok: bool| -> Work {
            let ran = Arc::clone(&ran);
            Box::new(move || -> Result<(), BoxError> {
                ran.lock().unwrap().push(name);
                if ok {
                    Ok(())
                } else {
                    Err("upload refused".into())
                }
            })
        };

        worker.submit_chain(vec![step("relativize", false), step("upload", true)]);
        worker.submit_chain(vec![step("relativize-2", true), step("upload-2", true)]);

        assert_eq!(worker.join(), 1);
        assert_eq!(
            *ran.lock().unwrap(),
            vec!["relativize", "relativize-2", "upload-2"]
        );

        worker.submit_chain(vec![step("late", true)]);
        assert_eq!(ran.lock().unwrap().len(), 3);
    }
}
