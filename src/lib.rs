//! Isolated Compile - per-target incremental compilation
//!
//! Each target of a build compiles on its own: private classes directory,
//! private analysis file, and a classpath assembled from its closure. Targets
//! run as jobs of a dependency graph on a bounded worker pool (see the
//! `isolated-exec` crate); a failed target invalidates itself and skips its
//! dependents while unrelated targets keep compiling.

pub mod analysis;
pub mod archive;
pub mod cache;
pub mod classpath;
pub mod compiler;
pub mod config;
pub mod context;
pub mod fsutil;
pub mod logging;
pub mod pipeline;
pub mod products;
pub mod strategy;
pub mod target;
pub mod version;

pub use analysis::{AnalysisError, AnalysisTools, RebasingAnalysisTools};
pub use cache::{ArtifactCacheWriter, BackgroundWorker, CacheError, LocalArtifactCache};
pub use classpath::{compute_classpath, upstream_analysis, ClasspathEntry, ClasspathStore, ExtraClasspath};
pub use compiler::{CommandCompiler, CompileError, CompileRequest, Compiler};
pub use config::{CompileConfig, ConfigError, ExtraPlacement};
pub use context::{CompileContext, ContextFactory, WorkDirs};
pub use pipeline::{BuildPipeline, BuildSummary, PlannedJob};
pub use products::{ClassesBySource, ProductRegistry};
pub use strategy::{exec_graph_key, IsolatedCompileStrategy, StrategyError, StrategyResult};
pub use target::{PlanError, Target, TargetGraph};
pub use version::{InvalidationCheck, VersionRegistry, VersionUnit, VersionedTarget, VersionedTargetSet};
