//! Execution graph scheduling tests
//!
//! Covers dependency ordering, failure cascading, independent subgraphs and
//! the concurrency bound of the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use isolated_exec::{BoxError, EventSink, ExecutionGraph, Job, NoEvents, WorkerPool};

/// Records what happened to each job
#[derive(Default)]
struct Outcomes {
    ran: Mutex<Vec<String>>,
    succeeded: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
}

impl Outcomes {
    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    fn succeeded(&self) -> Vec<String> {
        let mut v = self.succeeded.lock().unwrap().clone();
        v.sort();
        v
    }

    fn failed(&self) -> Vec<String> {
        let mut v = self.failed.lock().unwrap().clone();
        v.sort();
        v
    }
}

fn tracked_job(
    outcomes: &Arc<Outcomes>,
    key: &str,
    deps: &[&str],
    fail: bool,
) -> Job {
    let run = Arc::clone(outcomes);
    let ok = Arc::clone(outcomes);
    let bad = Arc::clone(outcomes);
    let key_run = key.to_string();
    let key_ok = key.to_string();
    let key_bad = key.to_string();

    Job::new(
        key,
        move || -> Result<(), BoxError> {
            run.ran.lock().unwrap().push(key_run.clone());
            if fail {
                Err(format!("{} failed to compile", key_run).into())
            } else {
                Ok(())
            }
        },
        deps.iter().copied(),
    )
    .on_success(move || ok.succeeded.lock().unwrap().push(key_ok))
    .on_failure(move || bad.failed.lock().unwrap().push(key_bad))
}

#[derive(Default)]
struct RecordingSink {
    skipped: Mutex<Vec<(String, String)>>,
}

impl EventSink for RecordingSink {
    fn job_skipped(&self, key: &str, failed_dependency: &str) {
        self.skipped
            .lock()
            .unwrap()
            .push((key.to_string(), failed_dependency.to_string()));
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_dependency_runs_before_dependent() {
    let pool = WorkerPool::new(2).unwrap();
    let outcomes = Arc::new(Outcomes::default());

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "compile(b)", &["compile(a)"], false),
        tracked_job(&outcomes, "compile(a)", &[], false),
        tracked_job(&outcomes, "compile(c)", &[], false),
    ])
    .unwrap();

    graph.execute(&pool, &NoEvents).unwrap();

    let ran = outcomes.ran();
    assert_eq!(ran.len(), 3);
    let pos = |k: &str| ran.iter().position(|r| r == k).unwrap();
    assert!(pos("compile(a)") < pos("compile(b)"));
    assert_eq!(
        outcomes.succeeded(),
        vec!["compile(a)", "compile(b)", "compile(c)"]
    );
    assert!(outcomes.failed().is_empty());
}

#[test]
fn test_dependency_effects_visible_to_dependent() {
    let pool = WorkerPool::new(4).unwrap();
    let committed = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));

    let writer = Arc::clone(&committed);
    let reader = Arc::clone(&committed);
    let seen = Arc::clone(&observed);

    let graph = ExecutionGraph::new(vec![
        Job::new(
            "upstream",
            move || {
                thread::sleep(Duration::from_millis(20));
                writer.store(true, Ordering::SeqCst);
                Ok(())
            },
            Vec::<String>::new(),
        ),
        Job::new(
            "downstream",
            move || {
                seen.store(reader.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(())
            },
            ["upstream"],
        ),
    ])
    .unwrap();

    graph.execute(&pool, &NoEvents).unwrap();
    assert!(observed.load(Ordering::SeqCst));
}

#[test]
fn test_diamond_joins_after_both_sides() {
    let pool = WorkerPool::new(3).unwrap();
    let outcomes = Arc::new(Outcomes::default());

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "root", &[], false),
        tracked_job(&outcomes, "left", &["root"], false),
        tracked_job(&outcomes, "right", &["root"], false),
        tracked_job(&outcomes, "join", &["left", "right"], false),
    ])
    .unwrap();

    graph.execute(&pool, &NoEvents).unwrap();

    let ran = outcomes.ran();
    let pos = |k: &str| ran.iter().position(|r| r == k).unwrap();
    assert!(pos("join") > pos("left"));
    assert!(pos("join") > pos("right"));
    assert_eq!(ran.len(), 4);
}

#[test]
fn test_long_chain_completes() {
    let pool = WorkerPool::new(2).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<Job> = (0..2000)
        .map(|i| {
            let counter = Arc::clone(&counter);
            let deps: Vec<String> = if i == 0 {
                Vec::new()
            } else {
                vec![format!("job-{}", i - 1)]
            };
            Job::new(
                format!("job-{}", i),
                move || {
                    // Chain order means the counter equals our index.
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), i);
                    Ok(())
                },
                deps,
            )
        })
        .collect();

    ExecutionGraph::new(jobs)
        .unwrap()
        .execute(&pool, &NoEvents)
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2000);
}

// =============================================================================
// Failure cascading
// =============================================================================

#[test]
fn test_failure_skips_dependents_and_spares_independent_jobs() {
    let pool = WorkerPool::new(2).unwrap();
    let outcomes = Arc::new(Outcomes::default());
    let sink = RecordingSink::default();

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "compile(a)", &[], true),
        tracked_job(&outcomes, "compile(b)", &["compile(a)"], false),
        tracked_job(&outcomes, "compile(c)", &[], false),
    ])
    .unwrap();

    let failure = graph.execute(&pool, &sink).unwrap_err();

    assert_eq!(failure.failed, vec!["compile(a)"]);
    assert_eq!(failure.skipped, vec!["compile(b)"]);
    assert!(!outcomes.ran().contains(&"compile(b)".to_string()));
    assert_eq!(outcomes.succeeded(), vec!["compile(c)"]);
    assert_eq!(outcomes.failed(), vec!["compile(a)", "compile(b)"]);
    assert_eq!(
        sink.skipped.lock().unwrap().clone(),
        vec![("compile(b)".to_string(), "compile(a)".to_string())]
    );
}

#[test]
fn test_failure_propagates_transitively() {
    let pool = WorkerPool::new(2).unwrap();
    let outcomes = Arc::new(Outcomes::default());

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "a", &[], true),
        tracked_job(&outcomes, "b", &["a"], false),
        tracked_job(&outcomes, "c", &["b"], false),
        tracked_job(&outcomes, "d", &["c", "e"], false),
        tracked_job(&outcomes, "e", &[], false),
    ])
    .unwrap();

    let failure = graph.execute(&pool, &NoEvents).unwrap_err();

    let mut skipped = failure.skipped.clone();
    skipped.sort();
    assert_eq!(failure.failed, vec!["a"]);
    assert_eq!(skipped, vec!["b", "c", "d"]);
    assert_eq!(outcomes.ran().len(), 2, "only a and e run");
    assert_eq!(outcomes.succeeded(), vec!["e"]);
    assert_eq!(outcomes.failed(), vec!["a", "b", "c", "d"]);
}

#[test]
fn test_two_failures_reported_together() {
    let pool = WorkerPool::new(3).unwrap();
    let outcomes = Arc::new(Outcomes::default());

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "x", &[], true),
        tracked_job(&outcomes, "y", &[], true),
        tracked_job(&outcomes, "z", &["x", "y"], false),
    ])
    .unwrap();

    let failure = graph.execute(&pool, &NoEvents).unwrap_err();
    let mut failed = failure.failed.clone();
    failed.sort();
    assert_eq!(failed, vec!["x", "y"]);
    assert_eq!(failure.skipped, vec!["z"]);
    // z's on_failure runs exactly once even though two dependencies failed.
    assert_eq!(outcomes.failed(), vec!["x", "y", "z"]);
}

#[test]
fn test_panicking_work_is_a_job_failure() {
    let pool = WorkerPool::new(1).unwrap();
    let outcomes = Arc::new(Outcomes::default());

    let bad = Arc::clone(&outcomes);
    let graph = ExecutionGraph::new(vec![
        Job::new("p", || -> Result<(), BoxError> { panic!("compiler crashed") }, Vec::<String>::new())
            .on_failure(move || bad.failed.lock().unwrap().push("p".to_string())),
        tracked_job(&outcomes, "q", &["p"], false),
        tracked_job(&outcomes, "r", &[], false),
    ])
    .unwrap();

    let failure = graph.execute(&pool, &NoEvents).unwrap_err();
    assert_eq!(failure.failed, vec!["p"]);
    assert_eq!(failure.skipped, vec!["q"]);
    assert_eq!(outcomes.succeeded(), vec!["r"]);
}

#[test]
fn test_every_job_reaches_exactly_one_terminal_state() {
    let pool = WorkerPool::new(4).unwrap();
    let hooks: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut jobs = Vec::new();
    for i in 0..30usize {
        let deps: Vec<String> = (0..i)
            .filter(|d| (i + d) % 7 == 0)
            .map(|d| format!("n{}", d))
            .collect();
        let ok = Arc::clone(&hooks);
        let bad = Arc::clone(&hooks);
        let key = format!("n{}", i);
        let (k1, k2) = (key.clone(), key.clone());
        jobs.push(
            Job::new(
                key,
                move || -> Result<(), BoxError> {
                    if i % 11 == 3 {
                        Err("boom".into())
                    } else {
                        Ok(())
                    }
                },
                deps,
            )
            .on_success(move || *ok.lock().unwrap().entry(k1).or_default() += 1)
            .on_failure(move || *bad.lock().unwrap().entry(k2).or_default() += 1),
        );
    }

    let _ = ExecutionGraph::new(jobs).unwrap().execute(&pool, &NoEvents);

    let hooks = hooks.lock().unwrap();
    assert_eq!(hooks.len(), 30);
    assert!(hooks.values().all(|&count| count == 1));
}

// =============================================================================
// Concurrency bound
// =============================================================================

#[test]
fn test_running_jobs_never_exceed_pool_size() {
    for pool_size in [1usize, 2, 3] {
        let pool = WorkerPool::new(pool_size).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<Job> = (0..10)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                Job::new(
                    format!("wide-{}", i),
                    move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    Vec::<String>::new(),
                )
            })
            .collect();

        ExecutionGraph::new(jobs)
            .unwrap()
            .execute(&pool, &NoEvents)
            .unwrap();
        assert!(
            peak.load(Ordering::SeqCst) <= pool_size,
            "peak {} exceeded pool size {}",
            peak.load(Ordering::SeqCst),
            pool_size
        );
    }
}

#[test]
fn test_shut_down_pool_fails_jobs_instead_of_hanging() {
    let mut pool = WorkerPool::new(1).unwrap();
    pool.shutdown();
    let outcomes = Arc::new(Outcomes::default());

    let graph = ExecutionGraph::new(vec![
        tracked_job(&outcomes, "a", &[], false),
        tracked_job(&outcomes, "b", &["a"], false),
    ])
    .unwrap();

    let failure = graph.execute(&pool, &NoEvents).unwrap_err();
    assert_eq!(failure.failed, vec!["a"]);
    assert_eq!(failure.skipped, vec!["b"]);
    assert!(outcomes.ran().is_empty());
}
