//! Execution of the sealed leaf-task graph.
//!
//! The walker releases a leaf once its dependencies reached a terminal
//! state; released leaves sit in a weight-ordered ready queue until one of
//! the N worker permits frees up. Each dispatch goes to the visitor over a
//! channel with a oneshot callback carrying the outcome. A leaf whose
//! dependencies failed is flagged so the visitor can record it as skipped
//! instead of running it.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::prelude::*;
use railyard_graph_utils::Walker;
use railyard_task_id::TaskId;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use crate::{Built, Engine};

pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

/// One leaf task offered to the visitor.
#[derive(Debug)]
pub struct TaskDispatch {
    /// Task-graph index of the leaf; resolve details through the engine.
    pub leaf: NodeIndex,
    pub task_id: TaskId<'static>,
    /// True when some dependency failed or was skipped: the task must not
    /// run and should be recorded as not-run.
    pub deps_failed: bool,
    /// Time spent between becoming ready and being dispatched.
    pub queue_wait: Duration,
}

/// What the visitor reports back for a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The task ran and succeeded, was up-to-date, or was deliberately
    /// skipped without failing.
    Success,
    /// The task failed (or was skipped because a dependency failed);
    /// dependents must not run.
    Failed,
}

/// Sentinel returned by the visitor on an internal error: stop scheduling
/// new tasks entirely. Tasks already running are not interrupted here; the
/// process layer handles that.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

type VisitorResult = Result<ExecOutcome, StopExecution>;

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Visitor closed its channel before the walk finished")]
    Visitor,
}

/// A leaf waiting for a worker permit. Ordered by weight, ties broken by
/// arrival order.
struct ReadyTask {
    weight: u64,
    seq: u64,
    exec_index: NodeIndex,
    enqueued_at: Instant,
    done: oneshot::Sender<()>,
}

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight && self.seq == other.seq
    }
}
impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: heavier first, then first-come-first-served.
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Engine<Built> {
    /// Drains the leaf graph with `options.concurrency` workers, sending each
    /// ready task to `visitor` and waiting for its callback before releasing
    /// dependents.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<TaskDispatch, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let (walker, mut nodes) = Walker::new(self.exec_graph()).walk();
        let walker = Arc::new(Mutex::new(walker));
        let failed: Arc<Mutex<HashSet<NodeIndex>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut ready: BinaryHeap<ReadyTask> = BinaryHeap::new();
        let mut seq = 0u64;
        let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();
        let mut walk_done = false;

        loop {
            // Dispatch while a permit and a ready task are both available.
            while !ready.is_empty() {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let ReadyTask {
                    exec_index,
                    enqueued_at,
                    done,
                    ..
                } = ready.pop().expect("ready heap is non-empty");

                let task_index = self.exec_graph()[exec_index];
                let deps_failed = {
                    let failed = failed.lock().expect("failure set poisoned");
                    self.exec_graph()
                        .neighbors_directed(exec_index, Direction::Outgoing)
                        .any(|dep| failed.contains(&dep))
                };
                let task_id = self
                    .task(task_index)
                    .task_id()
                    .expect("leaf tasks are named");
                let dispatch = TaskDispatch {
                    leaf: task_index,
                    task_id,
                    deps_failed,
                    queue_wait: enqueued_at.elapsed(),
                };

                let visitor = visitor.clone();
                let walker = walker.clone();
                let failed = failed.clone();
                in_flight.push(tokio::spawn(async move {
                    let _permit = permit;
                    let (message, result) = Message::new(dispatch);
                    visitor.send(message).await.map_err(|_| ExecuteError::Visitor)?;

                    match result.await.unwrap_or_else(|_| {
                        // A dropped callback counts as a finished task.
                        trace!("visitor dropped callback without a result");
                        Ok(ExecOutcome::Success)
                    }) {
                        Ok(ExecOutcome::Success) => (),
                        Ok(ExecOutcome::Failed) => {
                            failed
                                .lock()
                                .expect("failure set poisoned")
                                .insert(exec_index);
                        }
                        Err(StopExecution) => {
                            failed
                                .lock()
                                .expect("failure set poisoned")
                                .insert(exec_index);
                            if walker
                                .lock()
                                .expect("walker lock poisoned")
                                .cancel()
                                .is_err()
                            {
                                debug!("unable to cancel graph walk");
                            }
                        }
                    }
                    // The failure set must be updated before dependents are
                    // released, so `done` fires last.
                    if done.send(()).is_err() {
                        debug!("walker done receiver closed before task finished");
                    }
                    Ok(())
                }));
            }

            tokio::select! {
                message = nodes.recv(), if !walk_done => {
                    match message {
                        Some((exec_index, done)) => {
                            let weight = self.weight(self.exec_graph()[exec_index]);
                            ready.push(ReadyTask {
                                weight,
                                seq,
                                exec_index,
                                enqueued_at: Instant::now(),
                                done,
                            });
                            seq += 1;
                        }
                        None => walk_done = true,
                    }
                }
                Some(result) = in_flight.next(), if !in_flight.is_empty() => {
                    result.expect("task dispatch panicked")?;
                }
                else => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::{Utf8Path, Utf8PathBuf};
    use railyard_config::BuildConfig;
    use railyard_repository::{
        package_graph::{PackageGraph, PackageGraphBuilder, PackageInfo, PackageName},
        package_json::PackageJson,
    };
    use railyard_task_id::TaskName;

    use super::*;
    use crate::EngineBuilder;

    fn package(manifest: &str) -> PackageInfo {
        let package_json: PackageJson = serde_json::from_str(manifest).expect("valid manifest");
        let name = package_json.name.clone();
        PackageInfo {
            package_json,
            package_dir: Utf8PathBuf::from(format!("/repo/packages/{name}")),
            release_group: None,
            is_release_group_root: false,
        }
    }

    fn chain_engine() -> Arc<Engine<Built>> {
        // gamma -> beta -> alpha
        let config: BuildConfig =
            serde_json::from_str(r#"{"tasks": {"build": ["^build"]}}"#).unwrap();
        let packages = vec![
            package(r#"{"name": "alpha", "version": "1.0.0", "scripts": {"build": "tsc"}}"#),
            package(
                r#"{"name": "beta", "version": "1.0.0",
                    "dependencies": {"alpha": "workspace:~"},
                    "scripts": {"build": "tsc"}}"#,
            ),
            package(
                r#"{"name": "gamma", "version": "1.0.0",
                    "dependencies": {"beta": "workspace:~"},
                    "scripts": {"build": "tsc"}}"#,
            ),
        ];
        let pkg_graph: PackageGraph = PackageGraphBuilder::from_packages(
            Utf8Path::new("/repo"),
            &config,
            packages,
            BTreeMap::new(),
        )
        .build()
        .unwrap();

        let engine = EngineBuilder::new(&pkg_graph, &config)
            .with_workspaces(vec![PackageName::from("gamma")])
            .with_tasks([TaskName::from("build".to_string())])
            .build()
            .unwrap();
        Arc::new(engine)
    }

    async fn drive<F>(engine: Arc<Engine<Built>>, concurrency: usize, mut respond: F) -> Vec<String>
    where
        F: FnMut(&TaskDispatch) -> VisitorResult,
    {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(concurrency), tx));

        let mut order = Vec::new();
        while let Some(message) = rx.recv().await {
            order.push(message.info.task_id.to_string());
            let result = respond(&message.info);
            message.callback.send(result).ok();
        }
        handle.await.unwrap().unwrap();
        order
    }

    #[tokio::test]
    async fn test_dependencies_run_first() {
        let engine = chain_engine();
        let order = drive(engine, 4, |_| Ok(ExecOutcome::Success)).await;
        assert_eq!(order, ["alpha#build", "beta#build", "gamma#build"]);
    }

    #[tokio::test]
    async fn test_failed_dependency_flags_dependents() {
        let engine = chain_engine();
        let mut flagged = Vec::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(2), tx));

        while let Some(message) = rx.recv().await {
            flagged.push((message.info.task_id.to_string(), message.info.deps_failed));
            // Mirror the real visitor: a task whose dependencies failed is
            // recorded as not-run and reported failed to the scheduler.
            let result = if message.info.task_id.package() == "alpha" || message.info.deps_failed {
                Ok(ExecOutcome::Failed)
            } else {
                Ok(ExecOutcome::Success)
            };
            message.callback.send(result).ok();
        }
        handle.await.unwrap().unwrap();

        assert_eq!(
            flagged,
            [
                ("alpha#build".to_string(), false),
                ("beta#build".to_string(), true),
                ("gamma#build".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_execution_stops_scheduling() {
        let engine = chain_engine();
        let order = drive(engine, 1, |_| Err(StopExecution)).await;
        // Only the first task is offered; the walk is cancelled before its
        // dependents are released.
        assert_eq!(order, ["alpha#build"]);
    }

    #[tokio::test]
    async fn test_dropped_callback_counts_as_success() {
        let engine = chain_engine();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(engine.execute(ExecutionOptions::new(1), tx));

        let mut count = 0;
        while let Some(message) = rx.recv().await {
            count += 1;
            drop(message.callback);
        }
        handle.await.unwrap().unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_ready_ordering_prefers_weight_then_fifo() {
        fn ready(weight: u64, seq: u64) -> ReadyTask {
            let (done, _rx) = oneshot::channel();
            ReadyTask {
                weight,
                seq,
                exec_index: NodeIndex::new(seq as usize),
                enqueued_at: Instant::now(),
                done,
            }
        }

        let mut heap = BinaryHeap::new();
        heap.push(ready(1, 0));
        heap.push(ready(5, 1));
        heap.push(ready(5, 2));
        heap.push(ready(2, 3));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|task| task.seq)).collect();
        // Heaviest first; equal weights in arrival order.
        assert_eq!(order, [1, 2, 3, 0]);
    }
}
