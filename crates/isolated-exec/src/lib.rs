//! Isolated Exec - dependency-aware job scheduling
//!
//! A [`WorkerPool`] bounds how many units of work run at once; an
//! [`ExecutionGraph`] drives a DAG of [`Job`]s on that pool, running each
//! job only after all of its dependencies succeeded and cascading failures
//! forward without running the affected jobs.
//!
//! The scheduler knows only keys, work and pass/fail hooks. Callers attach
//! their own bookkeeping through `on_success` / `on_failure`.

pub mod graph;
pub mod pool;

pub use graph::{
    BoxError, EventSink, ExecutionFailure, ExecutionGraph, GraphError, Hook, Job, JobStatus,
    NoEvents, TracingEvents, Work,
};
pub use pool::{PoolError, PoolResult, Unit, WorkerPool};
