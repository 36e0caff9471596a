//! Isolated compile strategy
//!
//! Every target compiles on its own, into its own classes directory and
//! analysis file, as one job of an [`ExecutionGraph`]. A job starts once
//! every invalid target in its closure has committed; it then sees those
//! targets' archives (or, for targets still valid, their classes dirs) on
//! its classpath.
//!
//! Lifecycle, driven by the caller:
//!
//! 1. [`pre_compile`](IsolatedCompileStrategy::pre_compile) creates the
//!    working directories
//! 2. [`prepare_compile`](IsolatedCompileStrategy::prepare_compile) seeds the
//!    classpath store and starts the worker pool
//! 3. [`compile_chunk`](IsolatedCompileStrategy::compile_chunk) runs the jobs
//!    for the invalid targets
//! 4. [`finalize_compile`](IsolatedCompileStrategy::finalize_compile) swaps
//!    every classes dir for its archive

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use isolated_exec::{
    BoxError, EventSink, ExecutionFailure, ExecutionGraph, GraphError, Job, PoolError,
    TracingEvents, Work, WorkerPool,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::{AnalysisError, AnalysisTools, PathsBySource};
use crate::archive::{create_archive, ArchiveError};
use crate::cache::{ArtifactCacheWriter, BackgroundWorker, CacheError};
use crate::classpath::{compute_classpath, upstream_analysis, ClasspathEntry, ClasspathStore, ExtraClasspath};
use crate::compiler::{CompileError, CompileRequest, Compiler};
use crate::config::{CompileConfig, ConfigError, ExtraPlacement};
use crate::context::{analysis_for_target, CompileContext, ContextFactory, SourceFilter, SourceGlobError, WorkDirs};
use crate::fsutil::atomic_copy;
use crate::products::{compute_classes_by_source, ClassesBySource, ProductError, ProductRegistry};
use crate::target::{PlanError, Target, TargetGraph};
use crate::version::{InvalidationCheck, VersionedTargetSet};

/// Errors surfaced by the compile strategy
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("build plan error: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    SourceGlob(#[from] SourceGlobError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("product registration error: {0}")]
    Product(#[from] ProductError),

    #[error("artifact cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid job graph: {0}")]
    Graph(#[from] GraphError),

    #[error("expected one target per partition, got {}: {}", .targets.len(), .targets.join(", "))]
    PartitionSize { targets: Vec<String> },

    #[error("no compile context for target {0}")]
    MissingContext(String),

    #[error("compile_chunk called without invalid targets")]
    NothingToCompile,

    #[error("worker pool not started; call prepare_compile first")]
    NotPrepared,

    #[error("compilation failure: {0}")]
    Compilation(ExecutionFailure),
}

impl StrategyError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StrategyError::Compilation(_) => 3,
            StrategyError::Graph(_)
            | StrategyError::PartitionSize { .. }
            | StrategyError::MissingContext(_)
            | StrategyError::NothingToCompile
            | StrategyError::NotPrepared => 2,
            _ => 1,
        }
    }
}

/// Result type for strategy operations
pub type StrategyResult<T> = Result<T, StrategyError>;

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> StrategyError + '_ {
    move |source| StrategyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Key of a target's job in the execution graph
pub fn exec_graph_key(target: &Target) -> String {
    format!("compile({})", target.address)
}

/// Job keys of the invalid members of `closure`, other than `target` itself
pub fn invalid_dependency_keys(
    target: &Target,
    closure: &[Arc<Target>],
    invalid: &HashSet<&str>,
) -> Vec<String> {
    closure
        .iter()
        .filter(|dep| dep.id != target.id && invalid.contains(dep.id.as_str()))
        .map(|dep| exec_graph_key(dep))
        .collect()
}

#[derive(Clone)]
struct CacheWriteBack {
    writer: Arc<dyn ArtifactCacheWriter>,
    background: Arc<BackgroundWorker>,
}

/// Everything a compile job needs, shared by all jobs of one chunk
#[derive(Clone)]
struct JobEnv {
    dirs: WorkDirs,
    confs: Arc<[String]>,
    capture_log: bool,
    extra: Arc<ExtraClasspath>,
    contexts: Arc<BTreeMap<String, CompileContext>>,
    compiler: Arc<dyn Compiler>,
    analysis_tools: Arc<dyn AnalysisTools>,
    classpath: Arc<ClasspathStore>,
    products: Arc<ProductRegistry>,
    write_back: Option<CacheWriteBack>,
}

impl JobEnv {
    /// Body of one target's job
    fn compile(
        &self,
        vts: &VersionedTargetSet,
        context: &CompileContext,
        closure: &[Arc<Target>],
    ) -> StrategyResult<()> {
        let target = &context.target;
        let progress = target.address.as_str();

        let cp_entries = compute_classpath(&self.classpath, closure, &self.confs, &self.extra);
        let upstream = upstream_analysis(self.contexts.values(), &cp_entries);
        let log_file = self.capture_log.then(|| self.dirs.log_file(target));

        // Mutate analysis in a private scratch dir; only a successful compile
        // is copied back over the persisted file.
        fs::create_dir_all(&self.dirs.scratch_dir).map_err(io_at(&self.dirs.scratch_dir))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", target.id))
            .tempdir_in(&self.dirs.scratch_dir)
            .map_err(io_at(&self.dirs.scratch_dir))?;
        let scratch_analysis = analysis_for_target(scratch.path(), target);
        if context.analysis_file.exists() {
            fs::copy(&context.analysis_file, &scratch_analysis)
                .map_err(io_at(&context.analysis_file))?;
        } else {
            debug!(target_id = %target.id, "no prior analysis, compiling from scratch");
        }
        fs::create_dir_all(&context.classes_dir).map_err(io_at(&context.classes_dir))?;

        info!(
            address = progress,
            sources = context.sources.len(),
            classpath = cp_entries.len(),
            upstream = upstream.len(),
            "compiling"
        );
        self.compiler.compile(&CompileRequest {
            sources: &context.sources,
            analysis_file: &scratch_analysis,
            upstream_analysis: &upstream,
            classpath: &cp_entries,
            output_dir: &context.classes_dir,
            log_file: log_file.as_deref(),
            label: progress,
            platform: target.platform.as_deref(),
        })?;

        atomic_copy(&scratch_analysis, &context.analysis_file)
            .map_err(io_at(&context.analysis_file))?;
        scratch.close().map_err(io_at(&self.dirs.scratch_dir))?;

        create_archive(&context.classes_dir, &context.archive_file)?;
        self.classpath.replace_for_target(
            target,
            &self.confs,
            &context.classes_dir,
            &context.archive_file,
        );
        self.products.register(context)?;

        if let Some(write_back) = &self.write_back {
            self.write_to_artifact_cache(write_back, vts, context, log_file);
        }
        Ok(())
    }

    /// Queue relativize + upload for a freshly compiled target
    fn write_to_artifact_cache(
        &self,
        write_back: &CacheWriteBack,
        vts: &VersionedTargetSet,
        context: &CompileContext,
        log_file: Option<PathBuf>,
    ) {
        let target = &context.target;
        if !target.is_cacheable() {
            debug!(target_id = %target.id, "not caching: target is labeled no_cache");
            return;
        }

        let portable = self.dirs.portable_analysis_file(target);
        let mut files: Vec<PathBuf> = target.resources.clone();
        if let Some(products) = self.products.get(&target.id) {
            files.extend(products.classes);
        }
        if let Some(log) = log_file.filter(|l| l.exists()) {
            files.push(log);
        }
        files.push(context.archive_file.clone());
        files.push(portable.clone());

        let units = vts
            .units
            .iter()
            .map(|unit| (Arc::clone(unit), files.clone()))
            .collect();
        let Some(upload) = write_back.writer.update_work(units) else {
            return;
        };

        let tools = Arc::clone(&self.analysis_tools);
        let analysis = context.analysis_file.clone();
        let relativize: Work = Box::new(move || -> Result<(), BoxError> {
            tools.relativize(&analysis, &portable)?;
            Ok(())
        });
        write_back.background.submit_chain(vec![relativize, upload]);
    }
}

/// Compiles each invalid target in isolation on a bounded worker pool
pub struct IsolatedCompileStrategy {
    buildroot: PathBuf,
    factory: ContextFactory,
    confs: Vec<String>,
    worker_count: usize,
    capture_log: bool,
    extra_placement: ExtraPlacement,
    compiler: Arc<dyn Compiler>,
    analysis_tools: Arc<dyn AnalysisTools>,
    classpath: Arc<ClasspathStore>,
    products: Arc<ProductRegistry>,
    write_back: Option<CacheWriteBack>,
    events: Box<dyn EventSink>,
    pool: Option<WorkerPool>,
}

impl IsolatedCompileStrategy {
    pub fn new(
        config: &CompileConfig,
        buildroot: &Path,
        compiler: Arc<dyn Compiler>,
        analysis_tools: Arc<dyn AnalysisTools>,
    ) -> StrategyResult<Self> {
        let dirs = WorkDirs::new(&config.workdir(buildroot));
        let filter = SourceFilter::new(buildroot, &config.compile.source_globs)?;

        Ok(Self {
            buildroot: buildroot.to_path_buf(),
            factory: ContextFactory::new(dirs, filter),
            confs: config.compile.confs.clone(),
            worker_count: config.compile.worker_count,
            capture_log: config.compile.capture_log,
            extra_placement: config.classpath.extra_placement,
            compiler,
            analysis_tools,
            classpath: Arc::new(ClasspathStore::new()),
            products: Arc::new(ProductRegistry::new()),
            write_back: None,
            events: Box::new(TracingEvents),
            pool: None,
        })
    }

    /// Upload compiled outputs through `writer`, off the main schedule
    pub fn with_artifact_cache(
        mut self,
        writer: Arc<dyn ArtifactCacheWriter>,
        background: Arc<BackgroundWorker>,
    ) -> Self {
        self.write_back = Some(CacheWriteBack { writer, background });
        self
    }

    pub fn with_events(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Share an existing classpath store (e.g. one seeded by earlier tasks)
    pub fn with_classpath(mut self, classpath: Arc<ClasspathStore>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn dirs(&self) -> &WorkDirs {
        self.factory.dirs()
    }

    pub fn confs(&self) -> &[String] {
        &self.confs
    }

    pub fn classpath(&self) -> &Arc<ClasspathStore> {
        &self.classpath
    }

    pub fn products(&self) -> &Arc<ProductRegistry> {
        &self.products
    }

    pub fn compile_context(&self, target: &Arc<Target>) -> CompileContext {
        self.factory.compile_context(target)
    }

    fn create_compile_contexts(&self, targets: &[Arc<Target>]) -> BTreeMap<String, CompileContext> {
        targets
            .iter()
            .map(|t| (t.id.clone(), self.compile_context(t)))
            .collect()
    }

    /// Create the working directories
    pub fn pre_compile(&self) -> StrategyResult<()> {
        let dirs = self.dirs();
        dirs.create_all().map_err(io_at(&dirs.classes_dir))?;
        debug!(analysis = %dirs.analysis_dir.display(), "working directories ready");
        Ok(())
    }

    /// Seed the classpath store with each relevant target's classes dir,
    /// drop analysis that no longer validates, and start the worker pool.
    pub fn prepare_compile(&mut self, relevant_targets: &[Arc<Target>]) -> StrategyResult<()> {
        for target in relevant_targets {
            let cc = self.compile_context(target);
            fs::create_dir_all(&cc.classes_dir).map_err(io_at(&cc.classes_dir))?;
            self.classpath.add_for_target(
                target,
                self.confs
                    .iter()
                    .map(|conf| ClasspathEntry::new(conf.clone(), cc.classes_dir.clone())),
            );
            self.validate_analysis(&cc.analysis_file)?;
        }

        if self.pool.is_none() {
            self.pool = Some(WorkerPool::new(self.worker_count)?);
        }
        Ok(())
    }

    fn validate_analysis(&self, analysis_file: &Path) -> StrategyResult<()> {
        if !analysis_file.exists() {
            return Ok(());
        }
        if let Err(e) = self.analysis_tools.validate(analysis_file) {
            warn!(
                analysis = %analysis_file.display(),
                error = %e,
                "invalid analysis, removing"
            );
            fs::remove_file(analysis_file).map_err(io_at(analysis_file))?;
        }
        Ok(())
    }

    /// One job per partition. Each job depends on the jobs of the invalid
    /// targets in its closure; success validates the partition's version
    /// units, failure invalidates them.
    pub fn create_compile_jobs(
        &self,
        graph: &TargetGraph,
        contexts: Arc<BTreeMap<String, CompileContext>>,
        extra: ExtraClasspath,
        invalid_targets: &[Arc<Target>],
        invalid_vts_partitioned: &[VersionedTargetSet],
    ) -> StrategyResult<Vec<Job>> {
        let env = JobEnv {
            dirs: self.dirs().clone(),
            confs: self.confs.clone().into(),
            capture_log: self.capture_log,
            extra: Arc::new(extra),
            contexts,
            compiler: Arc::clone(&self.compiler),
            analysis_tools: Arc::clone(&self.analysis_tools),
            classpath: Arc::clone(&self.classpath),
            products: Arc::clone(&self.products),
            write_back: self.write_back.clone(),
        };
        let invalid: HashSet<&str> = invalid_targets.iter().map(|t| t.id.as_str()).collect();

        let mut jobs = Vec::with_capacity(invalid_vts_partitioned.len());
        for vts in invalid_vts_partitioned {
            let [target] = vts.targets.as_slice() else {
                return Err(StrategyError::PartitionSize {
                    targets: vts.targets.iter().map(|t| t.id.clone()).collect(),
                });
            };
            let context = env
                .contexts
                .get(&target.id)
                .cloned()
                .ok_or_else(|| StrategyError::MissingContext(target.id.clone()))?;
            let closure = graph.closure(target);

            let dependency_keys = invalid_dependency_keys(target, &closure, &invalid);

            let work_env = env.clone();
            let work_vts = vts.clone();
            let work = move || -> Result<(), BoxError> {
                work_env
                    .compile(&work_vts, &context, &closure)
                    .map_err(BoxError::from)
            };

            let succeeded = vts.clone();
            let failed = vts.clone();
            jobs.push(
                Job::new(exec_graph_key(target), work, dependency_keys)
                    .on_success(move || succeeded.update())
                    .on_failure(move || failed.force_invalidate()),
            );
        }
        Ok(jobs)
    }

    /// Compile the invalid targets of one chunk.
    ///
    /// Contexts are built for every target of the graph so upstream
    /// analysis resolves for valid dependencies too.
    pub fn compile_chunk(
        &self,
        invalidation_check: &InvalidationCheck,
        graph: &TargetGraph,
        invalid_targets: &[Arc<Target>],
        extra_classpath_elements: &[PathBuf],
    ) -> StrategyResult<()> {
        if invalid_targets.is_empty() {
            return Err(StrategyError::NothingToCompile);
        }
        let pool = self.pool.as_ref().ok_or(StrategyError::NotPrepared)?;

        let extra = ExtraClasspath::new(extra_classpath_elements, &self.confs, self.extra_placement);
        let contexts = Arc::new(self.create_compile_contexts(graph.targets()));
        let jobs = self.create_compile_jobs(
            graph,
            contexts,
            extra,
            invalid_targets,
            &invalidation_check.invalid_vts_partitioned,
        )?;

        let exec_graph = ExecutionGraph::new(jobs)?;
        info!(
            jobs = exec_graph.len(),
            workers = pool.worker_count(),
            "executing compile graph"
        );
        exec_graph
            .execute(pool, self.events.as_ref())
            .map_err(StrategyError::Compilation)
    }

    /// Replace each target's classes dir with its archive on the classpath
    pub fn finalize_compile(&self, targets: &[Arc<Target>]) {
        for target in targets {
            let cc = self.compile_context(target);
            self.classpath
                .replace_for_target(target, &self.confs, &cc.classes_dir, &cc.archive_file);
        }
    }

    /// Localize portable analysis for targets restored from the cache
    pub fn post_process_cached(&self, cached: &[VersionedTargetSet]) -> StrategyResult<()> {
        for target in cached.iter().flat_map(|vts| vts.targets.iter()) {
            let cc = self.compile_context(target);
            let portable = self.dirs().portable_analysis_file(target);
            if portable.exists() {
                self.analysis_tools.localize(&portable, &cc.analysis_file)?;
                debug!(target_id = %target.id, "localized cached analysis");
            }
        }
        Ok(())
    }

    /// Archived classes per source, keyed by target id
    pub fn compute_classes_by_source(
        &self,
        contexts: &[CompileContext],
    ) -> StrategyResult<BTreeMap<String, ClassesBySource>> {
        Ok(compute_classes_by_source(
            contexts,
            self.analysis_tools.as_ref(),
            &self.buildroot,
        )?)
    }

    /// Dependency facts recorded in a target's analysis, with paths as written
    pub fn parse_deps(&self, context: &CompileContext) -> StrategyResult<PathsBySource> {
        Ok(self
            .analysis_tools
            .parse_deps_from_path(&context.analysis_file, Path::new(""))?)
    }

    /// Stop the worker pool; a later `prepare_compile` starts a new one
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

impl std::fmt::Debug for IsolatedCompileStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedCompileStrategy")
            .field("buildroot", &self.buildroot)
            .field("confs", &self.confs)
            .field("worker_count", &self.worker_count)
            .field("capture_log", &self.capture_log)
            .field("caching", &self.write_back.is_some())
            .field("prepared", &self.pool.is_some())
            .finish()
    }
}
