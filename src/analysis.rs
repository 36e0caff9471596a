//! Incremental-compiler analysis services
//!
//! The compile core treats analysis files as opaque: it only copies, commits
//! and hands them to an [`AnalysisTools`] implementation.
//!
//! [`RebasingAnalysisTools`] understands a line-oriented text format:
//!
//! ```text
//! # comment
//! product <source> -> <class file relative to the classes dir>
//! dep <source> -> <path the source depends on>
//! ```
//!
//! Portable analysis replaces the absolute buildroot with `$BUILDROOT`. Only
//! whole path prefixes are rewritten: the buildroot must start a
//! whitespace-separated token and end at `/`, whitespace or end of text, so
//! `/repository` is left alone when the buildroot is `/repo`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fsutil::atomic_write;

/// Placeholder for the buildroot in portable analysis
pub const BUILDROOT_TOKEN: &str = "$BUILDROOT";

/// Errors from analysis services
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed analysis {path} line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Result type for analysis operations
pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Source -> paths mapping read from an analysis file
pub type PathsBySource = BTreeMap<PathBuf, Vec<PathBuf>>;

/// Services over the analysis file format
pub trait AnalysisTools: Send + Sync {
    /// Write a machine-independent copy of `analysis_file` to `portable_file`
    fn relativize(&self, analysis_file: &Path, portable_file: &Path) -> AnalysisResult<()>;

    /// Inverse of [`relativize`](Self::relativize)
    fn localize(&self, portable_file: &Path, analysis_file: &Path) -> AnalysisResult<()>;

    /// Produced class files per source, resolved against `classes_dir`
    fn parse_products_from_path(
        &self,
        analysis_file: &Path,
        classes_dir: &Path,
    ) -> AnalysisResult<PathsBySource>;

    /// Dependency facts per source; relative paths resolve against
    /// `classes_dir`
    fn parse_deps_from_path(
        &self,
        analysis_file: &Path,
        classes_dir: &Path,
    ) -> AnalysisResult<PathsBySource>;

    /// Check the file is usable as a compiler input
    fn validate(&self, analysis_file: &Path) -> AnalysisResult<()>;
}

/// Text-format analysis tools rebasing paths on the buildroot
#[derive(Debug, Clone)]
pub struct RebasingAnalysisTools {
    buildroot: String,
}

enum Line<'a> {
    Product(&'a str, &'a str),
    Dep(&'a str, &'a str),
    Blank,
}

impl RebasingAnalysisTools {
    pub fn new(buildroot: &Path) -> Self {
        Self {
            buildroot: buildroot.to_string_lossy().trim_end_matches('/').to_string(),
        }
    }

    fn read(path: &Path) -> AnalysisResult<String> {
        fs::read_to_string(path).map_err(|source| AnalysisError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write(path: &Path, content: &str) -> AnalysisResult<()> {
        atomic_write(path, content.as_bytes()).map_err(|source| AnalysisError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse_line<'a>(path: &Path, number: usize, line: &'a str) -> AnalysisResult<Line<'a>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(Line::Blank);
        }

        let malformed = |message: &str| AnalysisError::Malformed {
            path: path.to_path_buf(),
            line: number,
            message: message.to_string(),
        };

        let (keyword, rest) = line
            .split_once(' ')
            .ok_or_else(|| malformed("missing fields"))?;
        let (from, to) = rest
            .split_once(" -> ")
            .ok_or_else(|| malformed("expected `<source> -> <path>`"))?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return Err(malformed("empty path"));
        }

        match keyword {
            "product" => Ok(Line::Product(from, to)),
            "dep" => Ok(Line::Dep(from, to)),
            other => Err(malformed(&format!("unknown record `{}`", other))),
        }
    }

    fn parse(&self, path: &Path, classes_dir: &Path, want_products: bool) -> AnalysisResult<PathsBySource> {
        let content = Self::read(path)?;
        let mut out = PathsBySource::new();

        for (i, raw) in content.lines().enumerate() {
            let (src, dst) = match Self::parse_line(path, i + 1, raw)? {
                Line::Product(src, class) if want_products => (src, class),
                Line::Dep(src, dep) if !want_products => (src, dep),
                _ => continue,
            };
            let dst = Path::new(dst);
            let resolved = if dst.is_absolute() {
                dst.to_path_buf()
            } else {
                classes_dir.join(dst)
            };
            out.entry(PathBuf::from(src)).or_default().push(resolved);
        }

        Ok(out)
    }
}

/// Replace `from` with `to` wherever it is the leading prefix of a path token
fn rebase(text: &str, from: &str, to: &str) -> String {
    if from.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (start, _) in text.match_indices(from) {
        let end = start + from.len();
        let starts_token = text[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        let ends_component = text[end..]
            .chars()
            .next()
            .map_or(true, |c| c == '/' || c.is_whitespace());
        if starts_token && ends_component {
            out.push_str(&text[copied..start]);
            out.push_str(to);
            copied = end;
        }
    }
    out.push_str(&text[copied..]);
    out
}

impl AnalysisTools for RebasingAnalysisTools {
    fn relativize(&self, analysis_file: &Path, portable_file: &Path) -> AnalysisResult<()> {
        let content = Self::read(analysis_file)?;
        Self::write(portable_file, &rebase(&content, &self.buildroot, BUILDROOT_TOKEN))
    }

    fn localize(&self, portable_file: &Path, analysis_file: &Path) -> AnalysisResult<()> {
        let content = Self::read(portable_file)?;
        Self::write(analysis_file, &rebase(&content, BUILDROOT_TOKEN, &self.buildroot))
    }

    fn parse_products_from_path(
        &self,
        analysis_file: &Path,
        classes_dir: &Path,
    ) -> AnalysisResult<PathsBySource> {
        self.parse(analysis_file, classes_dir, true)
    }

    fn parse_deps_from_path(
        &self,
        analysis_file: &Path,
        classes_dir: &Path,
    ) -> AnalysisResult<PathsBySource> {
        self.parse(analysis_file, classes_dir, false)
    }

    fn validate(&self, analysis_file: &Path) -> AnalysisResult<()> {
        let content = Self::read(analysis_file)?;
        for (i, raw) in content.lines().enumerate() {
            Self::parse_line(analysis_file, i + 1, raw)?;
        }
        Ok(())
    }
}
