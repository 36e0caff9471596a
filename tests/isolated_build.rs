//! End-to-end isolated compile scenarios
//!
//! A scripted compiler stands in for the real one: it writes one class per
//! source plus an unclaimed `Generated.class`, appends product lines to the
//! scratch analysis, and fails for configured target addresses after
//! scribbling over its scratch analysis.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use isolated_compile::archive::list_entries;
use isolated_compile::cache::{ArtifactCacheWriter, BackgroundWorker};
use isolated_compile::{
    BuildPipeline, ClasspathEntry, CompileConfig, CompileError, CompileRequest, Compiler,
    IsolatedCompileStrategy, RebasingAnalysisTools, StrategyError, TargetGraph, VersionRegistry,
    VersionUnit,
};
use isolated_exec::{BoxError, Work};
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
struct Call {
    label: String,
    classpath: Vec<PathBuf>,
    upstream: BTreeMap<PathBuf, PathBuf>,
}

#[derive(Default)]
struct ScriptedCompiler {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedCompiler {
    fn fail(&self, label: &str) {
        self.failing.lock().unwrap().insert(label.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn call_for(&self, label: &str) -> Option<Call> {
        self.calls().into_iter().find(|c| c.label == label)
    }
}

impl Compiler for ScriptedCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), CompileError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            label: request.label.to_string(),
            classpath: request.classpath.to_vec(),
            upstream: request.upstream_analysis.clone(),
        });
        thread::sleep(Duration::from_millis(20));

        let result = (|| -> Result<(), CompileError> {
            if self.failing.lock().unwrap().contains(request.label) {
                fs::write(request.analysis_file, "half-merged garbage")?;
                return Err(CompileError::Failed {
                    label: request.label.to_string(),
                    message: "scripted failure".to_string(),
                });
            }

            let mut analysis = fs::read_to_string(request.analysis_file).unwrap_or_default();
            for source in request.sources {
                let stem = source.file_stem().unwrap().to_string_lossy().to_string();
                let class = format!("org/example/{}.class", stem);
                let out = request.output_dir.join(&class);
                fs::create_dir_all(out.parent().unwrap())?;
                fs::write(&out, format!("bytecode for {}", source.display()))?;
                let line = format!("product {} -> {}\n", source.display(), class);
                if !analysis.contains(&line) {
                    analysis.push_str(&line);
                }
            }
            fs::write(request.output_dir.join("Generated.class"), "synthetic")?;
            fs::write(request.analysis_file, analysis)?;
            Ok(())
        })();

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Records which targets reached the cache writer
#[derive(Default)]
struct RecordingCache {
    seen: Arc<Mutex<Vec<String>>>,
    fail_uploads: bool,
}

impl ArtifactCacheWriter for RecordingCache {
    fn update_work(&self, units: Vec<(Arc<dyn VersionUnit>, Vec<PathBuf>)>) -> Option<Work> {
        let seen = Arc::clone(&self.seen);
        let ids: Vec<String> = units.iter().map(|(u, _)| u.target_id().to_string()).collect();
        let fail = self.fail_uploads;
        Some(Box::new(move || -> Result<(), BoxError> {
            seen.lock().unwrap().extend(ids);
            if fail {
                return Err("upload refused".into());
            }
            Ok(())
        }))
    }
}

struct Fixture {
    _dir: TempDir,
    graph: TargetGraph,
}

impl Fixture {
    /// `(id, deps, labels)` per target; each gets `src/<id>/<Id>.java`
    fn new(targets: &[(&str, &[&str], &[&str])]) -> Self {
        let dir = TempDir::new().unwrap();
        let mut plan = Vec::new();
        for (id, deps, labels) in targets {
            let class = format!("{}{}", id[..1].to_uppercase(), &id[1..]);
            let source = format!("src/{}/{}.java", id, class);
            fs::create_dir_all(dir.path().join(format!("src/{}", id))).unwrap();
            fs::write(dir.path().join(&source), format!("class {} {{}}", class)).unwrap();
            plan.push(serde_json::json!({
                "id": id,
                "address": format!("src/{}:{}", id, id),
                "dependencies": deps,
                "sources": [source],
                "labels": labels,
                "platform": "java8",
            }));
        }
        let plan_path = dir.path().join("plan.json");
        fs::write(
            &plan_path,
            serde_json::to_vec(&serde_json::json!({ "targets": plan })).unwrap(),
        )
        .unwrap();
        let graph = TargetGraph::load(&plan_path).unwrap();
        Self { _dir: dir, graph }
    }

    /// Canonical buildroot the plan resolved to
    fn root(&self) -> &Path {
        self.graph.buildroot()
    }

    fn config(&self, workers: usize) -> CompileConfig {
        let mut config = CompileConfig::default();
        config.compile.worker_count = workers;
        config
    }

    fn versions(&self) -> VersionRegistry {
        VersionRegistry::new(self.root().join(".isolated-compile/versions"))
    }

    fn strategy(&self, compiler: &Arc<ScriptedCompiler>, workers: usize) -> IsolatedCompileStrategy {
        let mut strategy = IsolatedCompileStrategy::new(
            &self.config(workers),
            self.root(),
            Arc::clone(compiler) as Arc<dyn Compiler>,
            Arc::new(RebasingAnalysisTools::new(self.root())),
        )
        .unwrap();
        strategy.pre_compile().unwrap();
        strategy.prepare_compile(self.graph.targets()).unwrap();
        strategy
    }

    fn compile_all(&self, strategy: &IsolatedCompileStrategy) -> Result<(), StrategyError> {
        let check = self.versions().invalidation_check(&self.graph).unwrap();
        strategy.compile_chunk(&check, &self.graph, &check.invalid_targets(), &[])
    }

    fn target(&self, id: &str) -> Arc<isolated_compile::Target> {
        Arc::clone(self.graph.require(id).unwrap())
    }

    fn cached_strategy(
        &self,
        compiler: &Arc<ScriptedCompiler>,
        writer: &Arc<RecordingCache>,
        background: &Arc<BackgroundWorker>,
    ) -> IsolatedCompileStrategy {
        let mut strategy = IsolatedCompileStrategy::new(
            &self.config(2),
            self.root(),
            Arc::clone(compiler) as Arc<dyn Compiler>,
            Arc::new(RebasingAnalysisTools::new(self.root())),
        )
        .unwrap()
        .with_artifact_cache(Arc::clone(writer) as Arc<dyn ArtifactCacheWriter>, Arc::clone(background));
        strategy.pre_compile().unwrap();
        strategy.prepare_compile(self.graph.targets()).unwrap();
        strategy
    }
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

#[test]
fn test_three_targets_on_two_workers() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &[]), ("c", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 2);

    fx.compile_all(&strategy).unwrap();

    let labels: Vec<String> = compiler.calls().into_iter().map(|c| c.label).collect();
    let pos = |l: &str| labels.iter().position(|x| x == l).unwrap();
    assert_eq!(labels.len(), 3);
    assert!(pos("src/a:a") < pos("src/b:b"));
    assert!(compiler.max_running.load(Ordering::SeqCst) <= 2);

    // b compiled against a's archive, which carries no upstream analysis;
    // b's own classes dir still maps to its own analysis.
    let a = strategy.compile_context(&fx.target("a"));
    let b = strategy.compile_context(&fx.target("b"));
    let b_call = compiler.call_for("src/b:b").unwrap();
    assert_eq!(b_call.classpath, vec![b.classes_dir.clone(), a.archive_file.clone()]);
    assert!(!b_call.upstream.contains_key(&a.classes_dir));
    assert_eq!(b_call.upstream.get(&b.classes_dir), Some(&b.analysis_file));

    for target in fx.graph.targets() {
        let cc = strategy.compile_context(target);
        assert_eq!(
            strategy.classpath().get_for_target(target),
            vec![ClasspathEntry::new("default", cc.archive_file.clone())]
        );
        assert!(strategy.products().contains(&target.id));
    }

    let again = fx.versions().invalidation_check(&fx.graph).unwrap();
    assert!(again.invalid_vts_partitioned.is_empty());
}

#[test]
fn test_failure_skips_dependents_only() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &[]), ("c", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    compiler.fail("src/a:a");
    let strategy = fx.strategy(&compiler, 2);

    let err = fx.compile_all(&strategy).unwrap_err();
    let StrategyError::Compilation(failure) = &err else {
        panic!("expected compilation failure, got {err}");
    };
    assert_eq!(failure.failed, vec!["compile(src/a:a)".to_string()]);
    assert_eq!(failure.skipped, vec!["compile(src/b:b)".to_string()]);
    assert_eq!(err.exit_code(), 3);

    assert!(compiler.call_for("src/b:b").is_none());
    assert!(compiler.call_for("src/c:c").is_some());

    let check = fx.versions().invalidation_check(&fx.graph).unwrap();
    let mut invalid: Vec<String> = check.invalid_targets().iter().map(|t| t.id.clone()).collect();
    invalid.sort();
    assert_eq!(invalid, vec!["a", "b"]);
}

#[test]
fn test_failed_compile_leaves_persisted_analysis_untouched() {
    let fx = Fixture::new(&[("a", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 1);
    fx.compile_all(&strategy).unwrap();

    let analysis = strategy.compile_context(&fx.target("a")).analysis_file;
    let before = fs::read(&analysis).unwrap();

    fs::write(fx.root().join("src/a/A.java"), "class A { int changed; }").unwrap();
    compiler.fail("src/a:a");
    assert!(fx.compile_all(&strategy).is_err());

    assert_eq!(fs::read(&analysis).unwrap(), before);
}

#[test]
fn test_recompile_replaces_analysis_and_discards_scratch() {
    let fx = Fixture::new(&[("a", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 1);
    fx.compile_all(&strategy).unwrap();

    let a = fx.target("a");
    let analysis = strategy.compile_context(&a).analysis_file;
    fs::write(&analysis, format!("# prior build\n{}", fs::read_to_string(&analysis).unwrap())).unwrap();

    fs::write(fx.root().join("src/a/A.java"), "class A { int changed; }").unwrap();
    compiler.heal();
    fx.compile_all(&strategy).unwrap();

    let merged = fs::read_to_string(&analysis).unwrap();
    assert!(merged.starts_with("# prior build\n"));
    assert_eq!(merged.matches("product ").count(), 1);
    assert!(files_under(&strategy.dirs().scratch_dir).is_empty());
}

#[test]
fn test_archive_holds_every_class_exactly_once() {
    let fx = Fixture::new(&[("a", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 1);
    fx.compile_all(&strategy).unwrap();

    let cc = strategy.compile_context(&fx.target("a"));
    let mut entries = list_entries(&cc.archive_file).unwrap();
    entries.sort();
    assert_eq!(entries, files_under(&cc.classes_dir));
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_no_cache_label_never_reaches_writer() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &["no_cache"])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let writer = Arc::new(RecordingCache::default());
    let background = Arc::new(BackgroundWorker::new("cache-writer").unwrap());
    let strategy = fx.cached_strategy(&compiler, &writer, &background);

    fx.compile_all(&strategy).unwrap();
    assert_eq!(background.join(), 0);

    assert_eq!(*writer.seen.lock().unwrap(), vec!["a".to_string()]);
    let portable = strategy.dirs().portable_analysis_file(&fx.target("a"));
    assert!(fs::read_to_string(portable).unwrap().contains("$BUILDROOT/src/a/A.java"));
    assert!(!strategy
        .dirs()
        .portable_analysis_file(&fx.target("b"))
        .exists());
}

#[test]
fn test_packaging_failure_fails_job_after_analysis_commit() {
    let fx = Fixture::new(&[("a", &[], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 1);

    // A plain file where the archives dir should be makes packaging fail.
    let archives = strategy.dirs().archives_dir.clone();
    fs::remove_dir_all(&archives).ok();
    fs::write(&archives, "not a directory").unwrap();

    let err = fx.compile_all(&strategy).unwrap_err();
    let StrategyError::Compilation(failure) = &err else {
        panic!("expected compilation failure, got {err}");
    };
    assert_eq!(failure.failed, vec!["compile(src/a:a)".to_string()]);

    let a = fx.target("a");
    let cc = strategy.compile_context(&a);
    assert!(fs::read_to_string(&cc.analysis_file).unwrap().contains("product "));
    assert!(!strategy.products().contains("a"));
    assert_eq!(
        strategy.classpath().get_for_target(&a),
        vec![ClasspathEntry::new("default", cc.classes_dir.clone())]
    );

    let check = fx.versions().invalidation_check(&fx.graph).unwrap();
    let invalid: Vec<String> = check.invalid_targets().iter().map(|t| t.id.clone()).collect();
    assert_eq!(invalid, vec!["a"]);
}

#[test]
fn test_failed_upload_is_counted_but_build_succeeds() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let writer = Arc::new(RecordingCache {
        fail_uploads: true,
        ..RecordingCache::default()
    });
    let background = Arc::new(BackgroundWorker::new("cache-writer").unwrap());
    let strategy = fx.cached_strategy(&compiler, &writer, &background);

    fx.compile_all(&strategy).unwrap();
    assert_eq!(background.join(), 2);

    let mut seen = writer.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["a", "b"]);
    let again = fx.versions().invalidation_check(&fx.graph).unwrap();
    assert!(again.invalid_vts_partitioned.is_empty());
}

#[test]
fn test_valid_dependency_supplies_upstream_analysis() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let strategy = fx.strategy(&compiler, 1);
    fx.compile_all(&strategy).unwrap();

    // Only b changes; a stays valid and keeps its classes dir on the classpath.
    fs::write(fx.root().join("src/b/B.java"), "class B { A a; }").unwrap();
    let fresh = fx.strategy(&compiler, 1);
    fx.compile_all(&fresh).unwrap();

    let a = fresh.compile_context(&fx.target("a"));
    let last = compiler.calls().pop().unwrap();
    assert_eq!(last.label, "src/b:b");
    assert_eq!(last.upstream.get(&a.classes_dir), Some(&a.analysis_file));
}

#[test]
fn test_pipeline_restores_from_cache() {
    let fx = Fixture::new(&[("a", &[], &[]), ("b", &["a"], &[])]);
    let compiler = Arc::new(ScriptedCompiler::default());
    let mut config = fx.config(2);
    config.cache.dir = Some(PathBuf::from("artifact-cache"));

    let pipeline = BuildPipeline::new(
        fx.graph.clone(),
        config,
        Arc::clone(&compiler) as Arc<dyn Compiler>,
    );

    let first = pipeline.build().unwrap();
    assert_eq!(first.compiled.len(), 2);
    assert_eq!(first.cache_failures, 0);

    let second = pipeline.build().unwrap();
    assert!(second.compiled.is_empty());
    assert_eq!(second.valid.len(), 2);

    fs::remove_dir_all(fx.root().join(".isolated-compile")).unwrap();
    let third = pipeline.build().unwrap();
    let mut restored = third.restored.clone();
    restored.sort();
    assert_eq!(restored, vec!["a", "b"]);
    assert!(third.compiled.is_empty());
    assert_eq!(compiler.calls().len(), 2);

    let mapping = pipeline.classes_by_source().unwrap();
    let a = &mapping["a"];
    assert_eq!(a.by_source.len(), 1);
    assert!(a.by_source.contains_key(Path::new("src/a/A.java")));
    assert_eq!(a.unclaimed.len(), 1);
    assert!(a.unclaimed[0].ends_with("Generated.class"));
}
