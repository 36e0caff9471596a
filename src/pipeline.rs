//! Whole-build orchestration
//!
//! The pipeline wires the collaborators together for one build:
//!
//! - fingerprint every target and find the invalid ones
//! - restore invalid targets from the artifact cache when an entry exists
//! - compile the rest with [`IsolatedCompileStrategy`]
//! - swap classes dirs for archives and wait for cache write-back

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use isolated_exec::{ExecutionGraph, Job};
use serde::Serialize;
use tracing::{info, warn};

use crate::analysis::{AnalysisTools, RebasingAnalysisTools};
use crate::cache::{BackgroundWorker, LocalArtifactCache};
use crate::compiler::Compiler;
use crate::config::CompileConfig;
use crate::products::ClassesBySource;
use crate::strategy::{
    exec_graph_key, invalid_dependency_keys, IsolatedCompileStrategy, StrategyError,
    StrategyResult,
};
use crate::target::{Target, TargetGraph};
use crate::version::{InvalidationCheck, VersionRegistry, VersionedTargetSet};

/// Version markers live here, under the workdir
pub const VERSIONS_DIR: &str = "versions";

/// Thread name of the cache write-back worker
pub const CACHE_WORKER_NAME: &str = "cache-writer";

/// Outcome of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub targets: usize,
    /// Valid before the build started
    pub valid: Vec<String>,
    /// Restored from the artifact cache
    pub restored: Vec<String>,
    pub compiled: Vec<String>,
    /// Write-back chains that failed; never fails the build
    pub cache_failures: usize,
}

/// A job the next build would run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub key: String,
    pub target: String,
    pub dependency_keys: Vec<String>,
}

fn ids(targets: &[Arc<Target>]) -> Vec<String> {
    targets.iter().map(|t| t.id.clone()).collect()
}

/// Drives one build of a target graph
pub struct BuildPipeline {
    graph: TargetGraph,
    config: CompileConfig,
    compiler: Arc<dyn Compiler>,
    analysis_tools: Arc<dyn AnalysisTools>,
}

impl BuildPipeline {
    pub fn new(graph: TargetGraph, config: CompileConfig, compiler: Arc<dyn Compiler>) -> Self {
        let analysis_tools = Arc::new(RebasingAnalysisTools::new(graph.buildroot()));
        Self {
            graph,
            config,
            compiler,
            analysis_tools,
        }
    }

    pub fn with_analysis_tools(mut self, tools: Arc<dyn AnalysisTools>) -> Self {
        self.analysis_tools = tools;
        self
    }

    pub fn graph(&self) -> &TargetGraph {
        &self.graph
    }

    fn buildroot(&self) -> &Path {
        self.graph.buildroot()
    }

    pub fn versions(&self) -> VersionRegistry {
        VersionRegistry::new(self.config.workdir(self.buildroot()).join(VERSIONS_DIR))
    }

    /// Configured artifact cache, resolved against the buildroot
    pub fn artifact_cache(&self) -> Option<LocalArtifactCache> {
        self.config
            .cache
            .dir
            .as_ref()
            .map(|dir| LocalArtifactCache::new(self.buildroot().join(dir), self.buildroot()))
    }

    fn extra_classpath(&self) -> Vec<PathBuf> {
        self.config
            .classpath
            .extra
            .iter()
            .map(|p| self.buildroot().join(p))
            .collect()
    }

    fn strategy(&self) -> StrategyResult<IsolatedCompileStrategy> {
        IsolatedCompileStrategy::new(
            &self.config,
            self.buildroot(),
            Arc::clone(&self.compiler),
            Arc::clone(&self.analysis_tools),
        )
    }

    fn invalidation_check(&self) -> StrategyResult<InvalidationCheck> {
        let versions = self.config.workdir(self.buildroot()).join(VERSIONS_DIR);
        self.versions()
            .invalidation_check(&self.graph)
            .map_err(|source| StrategyError::Io {
                path: versions,
                source,
            })
    }

    /// Jobs the next build would run, with their dependency keys.
    ///
    /// The job graph is validated the same way a build validates it.
    pub fn plan(&self) -> StrategyResult<Vec<PlannedJob>> {
        let check = self.invalidation_check()?;
        let invalid_targets = check.invalid_targets();
        let invalid: HashSet<&str> = invalid_targets.iter().map(|t| t.id.as_str()).collect();

        let planned: Vec<PlannedJob> = invalid_targets
            .iter()
            .map(|t| PlannedJob {
                key: exec_graph_key(t),
                target: t.id.clone(),
                dependency_keys: invalid_dependency_keys(t, &self.graph.closure(t), &invalid),
            })
            .collect();

        ExecutionGraph::new(
            planned
                .iter()
                .map(|p| Job::new(p.key.clone(), || Ok(()), p.dependency_keys.clone()))
                .collect(),
        )?;
        Ok(planned)
    }

    /// Split partitions into (restored from cache, still invalid)
    fn restore_from_cache(
        &self,
        cache: Option<&LocalArtifactCache>,
        partitions: &[VersionedTargetSet],
    ) -> (Vec<VersionedTargetSet>, Vec<VersionedTargetSet>) {
        let Some(cache) = cache else {
            return (Vec::new(), partitions.to_vec());
        };

        partitions.iter().cloned().partition(|vts| {
            vts.targets.iter().all(|t| t.is_cacheable())
                && vts.units.iter().all(|unit| {
                    match cache.restore(unit.target_id(), unit.cache_key()) {
                        Ok(hit) => hit,
                        Err(e) => {
                            warn!(target_id = unit.target_id(), error = %e, "ignoring unusable cache entry");
                            false
                        }
                    }
                })
        })
    }

    /// Run the whole build
    pub fn build(&self) -> StrategyResult<BuildSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let cache = self.artifact_cache();
        let background = match cache {
            Some(_) => Some(Arc::new(BackgroundWorker::new(CACHE_WORKER_NAME).map_err(
                |source| StrategyError::Io {
                    path: PathBuf::from(CACHE_WORKER_NAME),
                    source,
                },
            )?)),
            None => None,
        };

        let mut strategy = self.strategy()?;
        if let (Some(cache), Some(background)) = (&cache, &background) {
            strategy = strategy.with_artifact_cache(Arc::new(cache.clone()), Arc::clone(background));
        }
        strategy.pre_compile()?;

        let check = self.invalidation_check()?;
        let valid = ids(&check.valid_targets());

        let (restored, remaining) =
            self.restore_from_cache(cache.as_ref(), &check.invalid_vts_partitioned);
        for vts in &restored {
            vts.update();
        }
        strategy.post_process_cached(&restored)?;
        let restored_ids: Vec<String> = restored
            .iter()
            .flat_map(|vts| vts.targets.iter().map(|t| t.id.clone()))
            .collect();

        let check = InvalidationCheck {
            all_vts: check.all_vts,
            invalid_vts_partitioned: remaining,
        };
        let invalid_targets = check.invalid_targets();

        strategy.prepare_compile(self.graph.targets())?;
        info!(
            targets = self.graph.targets().len(),
            valid = valid.len(),
            restored = restored_ids.len(),
            invalid = invalid_targets.len(),
            "invalidation complete"
        );

        let result = if invalid_targets.is_empty() {
            Ok(())
        } else {
            strategy.compile_chunk(&check, &self.graph, &invalid_targets, &self.extra_classpath())
        };
        if result.is_ok() {
            strategy.finalize_compile(self.graph.targets());
        }

        let cache_failures = background.map(|bg| bg.join()).unwrap_or(0);
        if cache_failures > 0 {
            warn!(failures = cache_failures, "artifact cache write-back failed for some targets");
        }
        strategy.shutdown();
        result?;

        let summary = BuildSummary {
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            targets: self.graph.targets().len(),
            valid,
            restored: restored_ids,
            compiled: ids(&invalid_targets),
            cache_failures,
        };
        info!(
            compiled = summary.compiled.len(),
            duration_ms = summary.duration_ms,
            "build finished"
        );
        Ok(summary)
    }

    /// Classes per source for every target with an archive
    pub fn classes_by_source(&self) -> StrategyResult<BTreeMap<String, ClassesBySource>> {
        let strategy = self.strategy()?;
        let contexts: Vec<_> = self
            .graph
            .targets()
            .iter()
            .map(|t| strategy.compile_context(t))
            .filter(|cc| cc.archive_file.exists())
            .collect();
        strategy.compute_classes_by_source(&contexts)
    }
}

impl std::fmt::Debug for BuildPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildPipeline")
            .field("buildroot", &self.graph.buildroot())
            .field("targets", &self.graph.targets().len())
            .field("config", &self.config)
            .finish()
    }
}
