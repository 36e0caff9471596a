//! External compiler invocation
//!
//! The core never interprets compiler semantics; it hands a
//! [`CompileRequest`] to a [`Compiler`] and treats any error as the job's
//! failure.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::config::CompilerSection;

/// Errors from a compiler invocation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to spawn compiler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("compiler exited with status {status:?} while compiling {label}")]
    ExitStatus { label: String, status: Option<i32> },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("compilation of {label} failed: {message}")]
    Failed { label: String, message: String },
}

/// Everything one compiler invocation needs
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub sources: &'a [PathBuf],
    /// Scratch analysis the compiler reads and updates in place
    pub analysis_file: &'a Path,
    /// Dependency classes dir -> its analysis file
    pub upstream_analysis: &'a BTreeMap<PathBuf, PathBuf>,
    pub classpath: &'a [PathBuf],
    pub output_dir: &'a Path,
    pub log_file: Option<&'a Path>,
    /// Progress label, usually the target address
    pub label: &'a str,
    pub platform: Option<&'a str>,
}

/// A language compiler
pub trait Compiler: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), CompileError>;
}

/// Runs a configured executable once per target.
///
/// Arguments, after the configured ones:
/// `-analysis <file> -d <dir> -classpath <p1:p2> [-upstream <dir>=<file>]...
/// [-platform <tag>] [-label <label>] -- <sources>...`
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn from_config(section: &CompilerSection) -> Self {
        Self::new(section.program.clone(), section.args.clone())
    }

    /// Run the compiler from this directory (usually the buildroot)
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Full argument vector for a request
    pub fn arguments(&self, request: &CompileRequest<'_>) -> io::Result<Vec<OsString>> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();

        args.push("-analysis".into());
        args.push(request.analysis_file.into());
        args.push("-d".into());
        args.push(request.output_dir.into());
        args.push("-classpath".into());
        args.push(
            std::env::join_paths(request.classpath)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
        );

        for (classes_dir, analysis) in request.upstream_analysis {
            let mut pair = OsString::from(classes_dir.as_os_str());
            pair.push("=");
            pair.push(analysis.as_os_str());
            args.push("-upstream".into());
            args.push(pair);
        }

        if let Some(platform) = request.platform {
            args.push("-platform".into());
            args.push(platform.into());
        }
        args.push("-label".into());
        args.push(request.label.into());

        args.push("--".into());
        args.extend(request.sources.iter().map(|s| s.as_os_str().to_owned()));

        Ok(args)
    }
}

impl Compiler for CommandCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), CompileError> {
        let args = self.arguments(request)?;
        let mut command = Command::new(&self.program);
        command.args(&args).stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        if let Some(log_path) = request.log_file {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let log = File::create(log_path)?;
            command.stdout(log.try_clone()?).stderr(log);
        }

        debug!(
            program = %self.program,
            label = request.label,
            sources = request.sources.len(),
            "invoking compiler"
        );

        let status = command.status().map_err(|source| CompileError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(CompileError::ExitStatus {
                label: request.label.to_string(),
                status: status.code(),
            })
        }
    }
}
