//! Layered configuration
//!
//! Three layers are merged, last wins:
//! 1. Built-in defaults
//! 2. Config file (`isolated-compile.toml`)
//! 3. CLI overrides
//!
//! The merged value is deserialized into a typed [`CompileConfig`].

mod defaults;
mod merge;

pub use defaults::{
    builtin_defaults, DEFAULT_COMPILER, DEFAULT_CONF, DEFAULT_SOURCE_GLOBS, DEFAULT_WORKDIR,
    DEFAULT_WORKER_COUNT,
};
pub use merge::{deep_merge, merge_layers};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default config file name, looked up in the buildroot
pub const CONFIG_FILENAME: &str = "isolated-compile.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}

/// Where extra classpath elements go relative to the closure's entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtraPlacement {
    Prepend,
    #[default]
    Append,
}

/// `[compile]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSection {
    /// Number of concurrent compile workers
    pub worker_count: usize,
    /// Capture compiler output to per-target logs
    pub capture_log: bool,
    /// Working directory holding analysis, classes, logs and archives
    pub workdir: PathBuf,
    /// Classpath configurations this compile reads and writes
    pub confs: Vec<String>,
    /// Globs selecting which of a target's sources are compiled
    pub source_globs: Vec<String>,
}

/// `[classpath]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClasspathSection {
    /// Extra compile-time classpath elements
    pub extra: Vec<PathBuf>,
    pub extra_placement: ExtraPlacement,
}

/// `[compiler]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerSection {
    pub program: String,
    pub args: Vec<String>,
}

/// `[cache]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CacheSection {
    /// Local artifact cache directory; caching is disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Typed, merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileConfig {
    pub compile: CompileSection,
    pub classpath: ClasspathSection,
    pub compiler: CompilerSection,
    #[serde(default)]
    pub cache: CacheSection,
}

/// Origin of a configuration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing layer with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            compile: CompileSection {
                worker_count: DEFAULT_WORKER_COUNT,
                capture_log: false,
                workdir: PathBuf::from(DEFAULT_WORKDIR),
                confs: vec![DEFAULT_CONF.to_string()],
                source_globs: DEFAULT_SOURCE_GLOBS.iter().map(|g| g.to_string()).collect(),
            },
            classpath: ClasspathSection {
                extra: Vec::new(),
                extra_placement: ExtraPlacement::Append,
            },
            compiler: CompilerSection {
                program: DEFAULT_COMPILER.to_string(),
                args: Vec::new(),
            },
            cache: CacheSection::default(),
        }
    }
}

impl CompileConfig {
    /// Build the effective configuration from all layers.
    ///
    /// A missing config file is skipped; an unreadable or malformed one is an
    /// error.
    pub fn load(
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<(Self, Vec<ConfigSource>), ConfigError> {
        let mut layers = vec![builtin_defaults()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = config_path {
            if path.exists() {
                let (value, digest) = load_toml_file(path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    path: Some(path.to_path_buf()),
                    digest: Some(digest),
                });
            }
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let config = Self::from_value(merge_layers(layers))?;
        Ok((config, sources))
    }

    /// Deserialize and validate a merged value
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.compile.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "compile.worker_count must be at least 1".to_string(),
            ));
        }
        if self.compile.confs.is_empty() {
            return Err(ConfigError::Invalid(
                "compile.confs must name at least one configuration".to_string(),
            ));
        }
        if self.compiler.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "compiler.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Working directory resolved against the buildroot
    pub fn workdir(&self, buildroot: &Path) -> PathBuf {
        buildroot.join(&self.compile.workdir)
    }
}

/// Parse a TOML file into a mergeable value plus the digest of its bytes
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents = String::from_utf8(bytes).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    let table: toml::Value = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    Ok((toml_to_json(table), digest))
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}
