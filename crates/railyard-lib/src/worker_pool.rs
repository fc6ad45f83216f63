//! An optional in-process worker pool for task kinds that are cheaper to run
//! inside a persistent worker than as a fresh subprocess (a compiler that
//! amortizes its startup, for instance).
//!
//! The pool is bounded per kind. A saturated pool is not an error: callers
//! fall back to the ordinary subprocess path.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::Semaphore;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("worker failed: {0}")]
pub struct WorkerError(pub String);

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub command: String,
    pub package_dir: Utf8PathBuf,
}

/// A reusable in-process executor for one task kind.
#[async_trait]
pub trait Worker: Send {
    /// Runs one task, returning its exit code.
    async fn run(&mut self, request: WorkerRequest) -> Result<i32, WorkerError>;

    /// Clears per-task state. Called between tasks so one task's state never
    /// leaks into the next.
    fn reset(&mut self);
}

type WorkerFactory = Box<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

struct KindPool {
    factory: WorkerFactory,
    idle: Mutex<Vec<Box<dyn Worker>>>,
    /// Bounds live workers for this kind.
    slots: Arc<Semaphore>,
    capacity: usize,
    created: Mutex<usize>,
}

#[derive(Default)]
pub struct WorkerPool {
    kinds: HashMap<String, KindPool>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker factory for the executable `kind`, with at most
    /// `capacity` concurrent workers.
    pub fn register<F>(&mut self, kind: impl Into<String>, capacity: usize, factory: F)
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        self.kinds.insert(
            kind.into(),
            KindPool {
                factory: Box::new(factory),
                idle: Mutex::new(Vec::new()),
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                created: Mutex::new(0),
            },
        );
    }

    pub fn supports(&self, executable: &str) -> bool {
        self.kinds.contains_key(executable)
    }

    /// Runs the request in a pooled worker if one is available.
    ///
    /// Returns `None` when the kind is unknown or every worker is busy; the
    /// caller then spawns a subprocess instead.
    pub async fn try_execute(
        &self,
        executable: &str,
        request: WorkerRequest,
    ) -> Option<Result<i32, WorkerError>> {
        let kind = self.kinds.get(executable)?;
        let Ok(permit) = kind.slots.clone().try_acquire_owned() else {
            debug!("worker pool for '{executable}' saturated; falling back to subprocess");
            return None;
        };

        let mut worker = {
            let mut idle = kind.idle.lock().expect("worker pool poisoned");
            match idle.pop() {
                Some(worker) => worker,
                None => {
                    let mut created = kind.created.lock().expect("worker pool poisoned");
                    debug_assert!(*created < kind.capacity);
                    *created += 1;
                    (kind.factory)()
                }
            }
        };

        let result = worker.run(request).await;
        worker.reset();
        kind.idle
            .lock()
            .expect("worker pool poisoned")
            .push(worker);
        drop(permit);

        Some(result)
    }
}
