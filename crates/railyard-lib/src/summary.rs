//! Per-task outcome records and the aggregate build summary.
//!
//! Outcome events flow over a channel to a single state task, so trackers
//! handed to concurrently running tasks never contend on a lock. The failure
//! collector is the one write-locked structure; failed tasks push their
//! record as they finish.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Local};
use console::style;
use railyard_task_id::TaskId;
use tokio::sync::mpsc;

/// The terminal state a task reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// Skipped by the incremental check; never entered running.
    UpToDate,
    Failed,
    /// Skipped because an upstream task failed.
    NotRun,
    /// Dry-run only: the task would have executed.
    WouldRun,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::UpToDate => "up-to-date",
            TaskOutcome::Failed => "failed",
            TaskOutcome::NotRun => "not run",
            TaskOutcome::WouldRun => "would run",
        };
        f.write_str(label)
    }
}

/// One task's record for the report.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub outcome: TaskOutcome,
    /// Time between becoming ready and being dispatched to a worker.
    pub queue_wait: Duration,
    pub execution_time: Duration,
    /// Tail of the captured output; only kept for failed tasks.
    pub output_tail: Option<String>,
}

/// Aggregate counts over the whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SummaryState {
    pub attempted: usize,
    pub succeeded: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub not_run: usize,
    pub would_run: usize,
}

impl SummaryState {
    fn record(&mut self, outcome: TaskOutcome) {
        self.attempted += 1;
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::UpToDate => self.up_to_date += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::NotRun => self.not_run += 1,
            TaskOutcome::WouldRun => self.would_run += 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }
}

/// Collects outcome events from every task tracker.
pub struct ExecutionTracker {
    sender: mpsc::Sender<TaskOutcome>,
    state_task: tokio::task::JoinHandle<SummaryState>,
    failures: Arc<Mutex<Vec<TaskSummary>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        // Events are a byte each; a deep buffer keeps trackers from ever
        // waiting on the state task.
        let (sender, mut receiver) = mpsc::channel(128);
        let state_task = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(outcome) = receiver.recv().await {
                state.record(outcome);
            }
            state
        });
        Self {
            sender,
            state_task,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn tracker(&self, task_id: TaskId<'static>, queue_wait: Duration) -> TaskTracker {
        TaskTracker {
            sender: self.sender.clone(),
            failures: self.failures.clone(),
            task_id,
            queue_wait,
            started_at: Local::now(),
        }
    }

    /// Waits for every tracker to report and returns the final counts plus
    /// the failure records.
    pub async fn finish(self) -> (SummaryState, Vec<TaskSummary>) {
        let Self {
            sender,
            state_task,
            failures,
        } = self;
        // Dropping our sender closes the channel once all trackers finished.
        drop(sender);
        let state = state_task.await.expect("summary state task panicked");
        let failures = Arc::into_inner(failures)
            .expect("all trackers dropped before finish")
            .into_inner()
            .expect("failure collector poisoned");
        (state, failures)
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to each task; reports exactly one terminal outcome.
pub struct TaskTracker {
    sender: mpsc::Sender<TaskOutcome>,
    failures: Arc<Mutex<Vec<TaskSummary>>>,
    task_id: TaskId<'static>,
    queue_wait: Duration,
    started_at: DateTime<Local>,
}

impl TaskTracker {
    pub async fn finish(self, outcome: TaskOutcome, output_tail: Option<String>) -> TaskSummary {
        let execution_time = Local::now()
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default();
        let summary = TaskSummary {
            task_id: self.task_id,
            outcome,
            queue_wait: self.queue_wait,
            execution_time,
            output_tail,
        };
        if outcome == TaskOutcome::Failed || outcome == TaskOutcome::NotRun {
            self.failures
                .lock()
                .expect("failure collector poisoned")
                .push(summary.clone());
        }
        self.sender
            .send(outcome)
            .await
            .expect("summary state task finished early");
        summary
    }
}

/// Renders the human-readable end-of-build report.
pub fn print_summary(state: &SummaryState, failures: &[TaskSummary]) {
    println!();
    if state.failed == 0 && state.not_run == 0 {
        println!(
            "{} {} succeeded, {} up-to-date, {} total",
            style("Build succeeded:").green().bold(),
            state.succeeded,
            state.up_to_date,
            state.attempted,
        );
        if state.would_run > 0 {
            println!("{} tasks would run (dry run)", state.would_run);
        }
        return;
    }

    println!("{}", style("Build failed").red().bold());
    for failure in failures
        .iter()
        .filter(|failure| failure.outcome == TaskOutcome::Failed)
    {
        println!(
            "{} {}",
            style(format!("{}:", failure.task_id)).red(),
            style("failed").dim()
        );
        if let Some(tail) = &failure.output_tail {
            for line in tail.lines() {
                println!("    {line}");
            }
        }
    }
    if state.not_run > 0 {
        println!(
            "Did not run {} tasks due to prior failures",
            state.not_run
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_counts_accumulate() {
        let tracker = ExecutionTracker::new();
        let outcomes = [
            TaskOutcome::Succeeded,
            TaskOutcome::Succeeded,
            TaskOutcome::UpToDate,
            TaskOutcome::Failed,
            TaskOutcome::NotRun,
        ];
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let task = tracker.tracker(
                TaskId::from_owned(format!("pkg-{index}"), "build".to_string()),
                Duration::ZERO,
            );
            task.finish(outcome, None).await;
        }

        let (state, failures) = tracker.finish().await;
        assert_eq!(state.attempted, 5);
        assert_eq!(state.succeeded, 2);
        assert_eq!(state.up_to_date, 1);
        assert_eq!(state.failed, 1);
        assert_eq!(state.not_run, 1);
        assert!(!state.is_success());
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_trackers() {
        let tracker = ExecutionTracker::new();
        let mut joins = Vec::new();
        for index in 0..16 {
            let task = tracker.tracker(
                TaskId::from_owned(format!("pkg-{index}"), "build".to_string()),
                Duration::ZERO,
            );
            joins.push(tokio::spawn(async move {
                task.finish(TaskOutcome::Succeeded, None).await;
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        let (state, failures) = tracker.finish().await;
        assert_eq!(state.attempted, 16);
        assert_eq!(state.succeeded, 16);
        assert!(failures.is_empty());
        assert!(state.is_success());
    }

    #[tokio::test]
    async fn test_failed_task_keeps_output_tail() {
        let tracker = ExecutionTracker::new();
        let task = tracker.tracker(TaskId::new("pkg", "build").into_owned(), Duration::ZERO);
        task.finish(TaskOutcome::Failed, Some("error TS2304".to_string()))
            .await;
        let (_, failures) = tracker.finish().await;
        assert_eq!(failures[0].output_tail.as_deref(), Some("error TS2304"));
    }
}
