//! Packaging a classes directory into one archive
//!
//! Archives are canonical tars: entries sorted by path, mtime/uid/gid zeroed
//! and modes normalized, so packaging the same tree twice yields the same
//! bytes. The archive is written to a sibling temp file and renamed into
//! place.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors while packaging or reading an archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{path} escapes classes dir {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// What went into an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub archive: PathBuf,
    /// File entries, relative to the classes dir, sorted
    pub files: Vec<PathBuf>,
    pub bytes: u64,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn canonical_header(size: u64, mode: u32, kind: EntryType) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header.set_entry_type(kind);
    header
}

/// Package every file under `classes_dir` into `archive_file`.
///
/// A missing classes dir packages as an empty archive; a target with no
/// sources still gets an archive on its classpath.
pub fn create_archive(classes_dir: &Path, archive_file: &Path) -> Result<ArchiveSummary, ArchiveError> {
    if let Some(parent) = archive_file.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let name = archive_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = archive_file.with_file_name(format!(".{}.tmp", name));

    let result = write_archive(classes_dir, &temp).and_then(|files| {
        fs::rename(&temp, archive_file).map_err(io_err(archive_file))?;
        let bytes = fs::metadata(archive_file)
            .map_err(io_err(archive_file))?
            .len();
        Ok(ArchiveSummary {
            archive: archive_file.to_path_buf(),
            files,
            bytes,
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }

    if let Ok(summary) = &result {
        debug!(
            archive = %summary.archive.display(),
            files = summary.files.len(),
            bytes = summary.bytes,
            "archived classes"
        );
    }
    result
}

fn write_archive(classes_dir: &Path, temp: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = File::create(temp).map_err(io_err(temp))?;
    let mut builder = Builder::new(BufWriter::new(file));
    let mut files = Vec::new();

    if classes_dir.is_dir() {
        for entry in WalkDir::new(classes_dir)
            .follow_links(true)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(classes_dir)
                .map_err(|_| ArchiveError::OutsideRoot {
                    path: path.to_path_buf(),
                    root: classes_dir.to_path_buf(),
                })?;
            if rel.as_os_str().is_empty() {
                continue;
            }

            if entry.file_type().is_dir() {
                let mut header = canonical_header(0, 0o755, EntryType::Directory);
                header
                    .set_path(format!("{}/", rel.display()))
                    .map_err(io_err(path))?;
                header.set_cksum();
                builder
                    .append(&header, io::empty())
                    .map_err(io_err(temp))?;
            } else {
                let contents = fs::read(path).map_err(io_err(path))?;
                let mut header =
                    canonical_header(contents.len() as u64, 0o644, EntryType::Regular);
                header.set_path(rel).map_err(io_err(path))?;
                header.set_cksum();
                builder
                    .append(&header, contents.as_slice())
                    .map_err(io_err(temp))?;
                files.push(rel.to_path_buf());
            }
        }
    }

    let mut writer = builder.into_inner().map_err(io_err(temp))?;
    writer.flush().map_err(io_err(temp))?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .and_then(|f| f.sync_all())
        .map_err(io_err(temp))?;

    Ok(files)
}

/// Relative paths of the regular files in an archive, in archive order
pub fn list_entries(archive_file: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = File::open(archive_file).map_err(io_err(archive_file))?;
    let mut archive = Archive::new(file);
    let mut out = Vec::new();
    for entry in archive.entries().map_err(io_err(archive_file))? {
        let entry = entry.map_err(io_err(archive_file))?;
        if entry.header().entry_type() == EntryType::Regular {
            out.push(entry.path().map_err(io_err(archive_file))?.into_owned());
        }
    }
    Ok(out)
}
