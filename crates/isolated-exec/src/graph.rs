//! Dependency-aware job graph
//!
//! Jobs are keyed by a stable string and declare the keys they depend on.
//! `ExecutionGraph::execute` submits every job with no unresolved
//! dependencies to a [`WorkerPool`], then reacts to completion notifications:
//!
//! - success: run `on_success`, release dependents whose dependencies have all
//!   succeeded
//! - failure: run `on_failure`, then mark every transitive dependent as
//!   skipped and run its `on_failure` without ever running its work
//!
//! Unrelated parts of the graph keep running after a failure. `execute`
//! returns once every job is terminal and reports all failed and skipped keys
//! in a single [`ExecutionFailure`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::pool::WorkerPool;

/// Error type returned by job work
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Body of a job
pub type Work = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

/// Completion hook
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Errors detected while building a graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate job key: {0}")]
    DuplicateKey(String),

    #[error("job {job} depends on unknown key {dependency}")]
    UnknownDependency { job: String, dependency: String },

    #[error("dependency cycle among jobs: {}", .keys.join(", "))]
    Cycle { keys: Vec<String> },
}

/// Aggregate failure raised once the graph has settled
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    /// Jobs whose work raised
    pub failed: Vec<String>,
    /// Jobs never run because a dependency failed
    pub skipped: Vec<String>,
}

impl ExecutionFailure {
    /// Every failed or skipped key, failed first
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.failed
            .iter()
            .chain(self.skipped.iter())
            .map(String::as_str)
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed jobs: {}", self.failed.join(", "))?;
        if !self.skipped.is_empty() {
            write!(
                f,
                "; skipped due to failed dependencies: {}",
                self.skipped.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Terminal and intermediate job states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Observer of job transitions
///
/// Every method defaults to a no-op. Calls are made from the thread driving
/// `execute`, never from worker threads.
pub trait EventSink {
    fn job_submitted(&self, _key: &str) {}
    fn job_succeeded(&self, _key: &str) {}
    fn job_failed(&self, _key: &str, _error: &(dyn std::error::Error + Send + Sync)) {}
    fn job_skipped(&self, _key: &str, _failed_dependency: &str) {}
}

/// Sink that drops every event
pub struct NoEvents;

impl EventSink for NoEvents {}

/// Sink that logs every transition through `tracing`
pub struct TracingEvents;

impl EventSink for TracingEvents {
    fn job_submitted(&self, key: &str) {
        debug!(job = key, "submitted");
    }

    fn job_succeeded(&self, key: &str) {
        info!(job = key, "succeeded");
    }

    fn job_failed(&self, key: &str, error: &(dyn std::error::Error + Send + Sync)) {
        error!(job = key, %error, "failed");
    }

    fn job_skipped(&self, key: &str, failed_dependency: &str) {
        error!(job = key, dependency = failed_dependency, "skipped: dependency failed");
    }
}

/// A unit of scheduling
pub struct Job {
    key: String,
    work: Work,
    dependency_keys: BTreeSet<String>,
    on_success: Option<Hook>,
    on_failure: Option<Hook>,
}

impl Job {
    /// Create a job with the given key, body and dependencies.
    pub fn new<F, I, S>(key: impl Into<String>, work: F, dependency_keys: I) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            work: Box::new(work),
            dependency_keys: dependency_keys.into_iter().map(Into::into).collect(),
            on_success: None,
            on_failure: None,
        }
    }

    /// Hook run after the work succeeds
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_success = Some(Box::new(hook));
        self
    }

    /// Hook run after the work fails, or when a dependency failed
    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_failure = Some(Box::new(hook));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dependency_keys(&self) -> &BTreeSet<String> {
        &self.dependency_keys
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("dependency_keys", &self.dependency_keys)
            .finish_non_exhaustive()
    }
}

struct Node {
    job: Job,
    work: Option<Work>,
    dependents: Vec<usize>,
    remaining: usize,
    status: JobStatus,
}

/// A validated DAG of jobs
pub struct ExecutionGraph {
    nodes: Vec<Node>,
}

impl fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("jobs", &self.nodes.iter().map(|node| &node.job).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

type Completion = (usize, Result<(), BoxError>);

impl ExecutionGraph {
    /// Build a graph, rejecting duplicate keys, dangling dependencies and
    /// cycles.
    pub fn new(jobs: Vec<Job>) -> Result<Self, GraphError> {
        let mut index_by_key = HashMap::with_capacity(jobs.len());
        for (index, job) in jobs.iter().enumerate() {
            if index_by_key.insert(job.key.clone(), index).is_some() {
                return Err(GraphError::DuplicateKey(job.key.clone()));
            }
        }

        let mut nodes: Vec<Node> = jobs
            .into_iter()
            .map(|mut job| {
                let work = std::mem::replace(&mut job.work, Box::new(|| Ok(())));
                Node {
                    remaining: job.dependency_keys.len(),
                    job,
                    work: Some(work),
                    dependents: Vec::new(),
                    status: JobStatus::Pending,
                }
            })
            .collect();

        for index in 0..nodes.len() {
            let dependencies: Vec<usize> = nodes[index]
                .job
                .dependency_keys
                .iter()
                .map(|dep| {
                    index_by_key
                        .get(dep)
                        .copied()
                        .ok_or_else(|| GraphError::UnknownDependency {
                            job: nodes[index].job.key.clone(),
                            dependency: dep.clone(),
                        })
                })
                .collect::<Result<_, _>>()?;
            for dep in dependencies {
                nodes[dep].dependents.push(index);
            }
        }

        let graph = Self { nodes };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm over the in-degree counts; anything left unvisited
    /// sits on a cycle or behind one.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.remaining).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut visited = 0;

        while let Some(index) = queue.pop_front() {
            visited += 1;
            for &dependent in &self.nodes[index].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if visited == self.nodes.len() {
            return Ok(());
        }

        let mut keys: Vec<String> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| self.nodes[i].job.key.clone())
            .collect();
        keys.sort();
        Err(GraphError::Cycle { keys })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Jobs in insertion order
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.nodes.iter().map(|n| &n.job)
    }

    /// Run every job to a terminal state.
    ///
    /// Blocks the caller; the calling thread only waits on completion
    /// notifications sent by the pool's workers.
    pub fn execute(mut self, pool: &WorkerPool, events: &dyn EventSink) -> Result<(), ExecutionFailure> {
        let (tx, rx) = mpsc::channel::<Completion>();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].remaining == 0)
            .collect();
        let mut failure = ExecutionFailure {
            failed: Vec::new(),
            skipped: Vec::new(),
        };
        let mut running = 0usize;

        loop {
            while let Some(index) = ready.pop_front() {
                match self.submit(index, pool, &tx, events) {
                    Ok(()) => running += 1,
                    Err(e) => self.settle(index, Err(e), &mut ready, &mut failure, events),
                }
            }

            if running == 0 {
                break;
            }

            // `tx` is still alive here, so recv only returns once a unit
            // reports back.
            let Ok((index, result)) = rx.recv() else {
                break;
            };
            running -= 1;
            self.settle(index, result, &mut ready, &mut failure, events);
        }

        debug_assert!(self
            .nodes
            .iter()
            .all(|n| !matches!(n.status, JobStatus::Pending | JobStatus::Running)));

        if failure.failed.is_empty() && failure.skipped.is_empty() {
            Ok(())
        } else {
            Err(failure)
        }
    }

    fn submit(
        &mut self,
        index: usize,
        pool: &WorkerPool,
        tx: &Sender<Completion>,
        events: &dyn EventSink,
    ) -> Result<(), BoxError> {
        let node = &mut self.nodes[index];
        let work = node
            .work
            .take()
            .ok_or_else(|| BoxError::from(format!("job {} was already submitted", node.job.key)))?;
        node.status = JobStatus::Running;
        events.job_submitted(&node.job.key);

        let tx = tx.clone();
        pool.submit(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(payload) => Err(panic_message(payload.as_ref()).into()),
            };
            // The receiver only goes away once execute has returned.
            let _ = tx.send((index, result));
        })
        .map_err(BoxError::from)
    }

    fn settle(
        &mut self,
        index: usize,
        result: Result<(), BoxError>,
        ready: &mut VecDeque<usize>,
        failure: &mut ExecutionFailure,
        events: &dyn EventSink,
    ) {
        match result {
            Ok(()) => {
                let node = &mut self.nodes[index];
                node.status = JobStatus::Succeeded;
                events.job_succeeded(&node.job.key);
                if let Some(hook) = node.job.on_success.take() {
                    hook();
                }

                let dependents = node.dependents.clone();
                for dependent in dependents {
                    let dep_node = &mut self.nodes[dependent];
                    dep_node.remaining -= 1;
                    if dep_node.remaining == 0 && dep_node.status == JobStatus::Pending {
                        ready.push_back(dependent);
                    }
                }
            }
            Err(error) => {
                let node = &mut self.nodes[index];
                node.status = JobStatus::Failed;
                events.job_failed(&node.job.key, error.as_ref());
                if let Some(hook) = node.job.on_failure.take() {
                    hook();
                }
                let failed_key = node.job.key.clone();
                failure.failed.push(failed_key.clone());

                let mut stack = node.dependents.clone();
                while let Some(dependent) = stack.pop() {
                    let dep_node = &mut self.nodes[dependent];
                    if dep_node.status != JobStatus::Pending {
                        continue;
                    }
                    dep_node.status = JobStatus::Skipped;
                    dep_node.work = None;
                    events.job_skipped(&dep_node.job.key, &failed_key);
                    if let Some(hook) = dep_node.job.on_failure.take() {
                        hook();
                    }
                    failure.skipped.push(dep_node.job.key.clone());
                    stack.extend(dep_node.dependents.iter().copied());
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}
