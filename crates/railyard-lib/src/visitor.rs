//! Receives dispatches from the engine executor and runs each leaf task:
//! the up-to-date short circuit, the subprocess (or pooled worker), the
//! donefile write on success, and the outcome records for the summary.

use std::{collections::HashMap, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::prelude::NodeIndex;
use railyard_engine::{
    Engine, ExecOutcome, ExecutionOptions, Message, StopExecution, TaskDispatch,
};
use railyard_process::{ChildExit, Command, ProcessManager};
use railyard_task_hash::{write_donefile, FileHashes, IncrementalChecker, TaskInputSpec};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    summary::{ExecutionTracker, SummaryState, TaskOutcome, TaskSummary, TaskTracker},
    worker_pool::{WorkerPool, WorkerRequest},
    BuildOptions, Error,
};

/// Everything the visitor needs to run one leaf, computed during the
/// incremental phase.
#[derive(Debug, Clone)]
pub(crate) struct LeafPlan {
    pub command: String,
    pub package_dir: Utf8PathBuf,
    pub spec: Option<TaskInputSpec>,
    /// Donefile matched and every dependency is up-to-date: skip without
    /// running.
    pub up_to_date: bool,
}

pub(crate) struct Visitor {
    engine: Arc<Engine>,
    plans: HashMap<NodeIndex, LeafPlan>,
    manager: ProcessManager,
    file_hashes: Arc<FileHashes>,
    repo_root: Utf8PathBuf,
    worker_pool: Option<Arc<WorkerPool>>,
    options: BuildOptions,
}

/// The per-task slice of visitor state that moves into each task future.
#[derive(Clone)]
struct TaskContext {
    manager: ProcessManager,
    file_hashes: Arc<FileHashes>,
    repo_root: Utf8PathBuf,
    worker_pool: Option<Arc<WorkerPool>>,
    dry_run: bool,
    tail_lines: usize,
}

impl Visitor {
    pub(crate) fn new(
        engine: Arc<Engine>,
        plans: HashMap<NodeIndex, LeafPlan>,
        file_hashes: Arc<FileHashes>,
        repo_root: Utf8PathBuf,
        worker_pool: Option<Arc<WorkerPool>>,
        options: BuildOptions,
    ) -> Self {
        Self {
            engine,
            plans,
            manager: ProcessManager::new(),
            file_hashes,
            repo_root,
            worker_pool,
            options,
        }
    }

    pub(crate) async fn visit(self) -> Result<(SummaryState, Vec<TaskSummary>), Error> {
        let concurrency = self.options.concurrency.max(1);
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = self.engine.clone();
            tokio::spawn(engine.execute(ExecutionOptions::new(concurrency), node_sender))
        };

        let tracker = ExecutionTracker::new();
        let mut tasks = FuturesUnordered::new();

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let task_tracker = tracker.tracker(info.task_id.clone(), info.queue_wait);

            let Some(plan) = self.plans.get(&info.leaf).cloned() else {
                // Every leaf got a plan during classification; a miss is a
                // scheduler bug, so stop the build.
                callback.send(Err(StopExecution)).ok();
                self.manager.stop().await;
                return Err(Error::Internal(format!(
                    "no execution plan for task {}",
                    info.task_id
                )));
            };

            let context = TaskContext {
                manager: self.manager.clone(),
                file_hashes: self.file_hashes.clone(),
                repo_root: self.repo_root.clone(),
                worker_pool: self.worker_pool.clone(),
                dry_run: self.options.dry_run,
                tail_lines: self.options.output_tail_lines,
            };
            tasks.push(tokio::spawn(execute_task(
                context,
                info,
                plan,
                task_tracker,
                callback,
            )));
        }

        let engine_result = engine_handle.await.expect("engine execution panicked");
        while let Some(result) = tasks.next().await {
            result.expect("task future panicked");
        }
        if let Err(err) = engine_result {
            self.manager.stop().await;
            return Err(err.into());
        }

        Ok(tracker.finish().await)
    }
}

async fn execute_task(
    context: TaskContext,
    dispatch: TaskDispatch,
    plan: LeafPlan,
    tracker: TaskTracker,
    callback: tokio::sync::oneshot::Sender<Result<ExecOutcome, StopExecution>>,
) {
    if dispatch.deps_failed {
        debug!("{}: not run, an upstream task failed", dispatch.task_id);
        tracker.finish(TaskOutcome::NotRun, None).await;
        // Report failed so transitive dependents are skipped as well.
        callback.send(Ok(ExecOutcome::Failed)).ok();
        return;
    }

    if plan.up_to_date {
        debug!("{}: up to date", dispatch.task_id);
        tracker.finish(TaskOutcome::UpToDate, None).await;
        callback.send(Ok(ExecOutcome::Success)).ok();
        return;
    }

    if context.dry_run {
        tracker.finish(TaskOutcome::WouldRun, None).await;
        callback.send(Ok(ExecOutcome::Success)).ok();
        return;
    }

    match run_command(&context, &dispatch, &plan).await {
        TaskRun::Succeeded => {
            if let Some(spec) = &plan.spec {
                record_donefile(&context, &dispatch, &plan, spec).await;
            }
            tracker.finish(TaskOutcome::Succeeded, None).await;
            callback.send(Ok(ExecOutcome::Success)).ok();
        }
        TaskRun::Failed { output_tail } => {
            tracker.finish(TaskOutcome::Failed, output_tail).await;
            callback.send(Ok(ExecOutcome::Failed)).ok();
        }
    }
}

enum TaskRun {
    Succeeded,
    Failed { output_tail: Option<String> },
}

async fn run_command(context: &TaskContext, dispatch: &TaskDispatch, plan: &LeafPlan) -> TaskRun {
    // A known task kind may run inside the shared worker pool; a saturated
    // pool falls back to the subprocess below.
    if let Some(pool) = &context.worker_pool {
        let executable = plan.command.split_whitespace().next().unwrap_or_default();
        if pool.supports(executable) {
            let request = WorkerRequest {
                command: plan.command.clone(),
                package_dir: plan.package_dir.clone(),
            };
            match pool.try_execute(executable, request).await {
                Some(Ok(0)) => return TaskRun::Succeeded,
                Some(Ok(code)) => {
                    return TaskRun::Failed {
                        output_tail: Some(format!("worker exited with code {code}")),
                    }
                }
                Some(Err(err)) => {
                    return TaskRun::Failed {
                        output_tail: Some(err.to_string()),
                    }
                }
                None => debug!("{}: worker pool saturated", dispatch.task_id),
            }
        }
    }

    let Some(spawned) = context
        .manager
        .spawn(shell_command(&plan.command, &plan.package_dir))
    else {
        // The manager is closing: the build was cancelled.
        return TaskRun::Failed {
            output_tail: Some("cancelled".to_string()),
        };
    };
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            return TaskRun::Failed {
                output_tail: Some(format!("failed to spawn: {err}")),
            }
        }
    };

    let mut output = Vec::new();
    let exit = match child.wait_with_piped_outputs(&mut output).await {
        Ok(exit) => exit,
        Err(err) => {
            return TaskRun::Failed {
                output_tail: Some(format!("failed to read output: {err}")),
            }
        }
    };

    match exit {
        Some(ChildExit::Finished(Some(0))) => TaskRun::Succeeded,
        exit => {
            debug!("{}: exited with {exit:?}", dispatch.task_id);
            TaskRun::Failed {
                output_tail: tail_of(&output, context.tail_lines),
            }
        }
    }
}

/// Re-hashes the inputs after the run (dependency outputs may have changed)
/// and persists the donefile. Failures only cost the next build a cache hit.
async fn record_donefile(
    context: &TaskContext,
    dispatch: &TaskDispatch,
    plan: &LeafPlan,
    spec: &TaskInputSpec,
) {
    let checker = IncrementalChecker::new(&context.file_hashes, &context.repo_root);
    let check = checker
        .check(&dispatch.task_id, &plan.command, &plan.package_dir, Some(spec))
        .await;
    let Some(fingerprint) = check.fingerprint else {
        return;
    };
    if let Err(err) = write_donefile(
        &plan.package_dir,
        dispatch.task_id.task(),
        &plan.command,
        &fingerprint,
    ) {
        warn!("{}: unable to write donefile: {err}", dispatch.task_id);
    }
}

fn shell_command(command: &str, package_dir: &Utf8Path) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    cmd.current_dir(package_dir.as_std_path().to_path_buf());
    cmd
}

fn tail_of(output: &[u8], lines: usize) -> Option<String> {
    let text = String::from_utf8_lossy(output);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    let tail = all[start..].join("\n");
    (!tail.is_empty()).then_some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_lines() {
        let output = b"one\ntwo\nthree\nfour\n";
        assert_eq!(tail_of(output, 2).as_deref(), Some("three\nfour"));
        assert_eq!(tail_of(output, 10).as_deref(), Some("one\ntwo\nthree\nfour"));
        assert_eq!(tail_of(b"", 10), None);
    }
}
