//! Spawning and managing the child processes that run leaf tasks.
//!
//! Each task subprocess is wrapped in a [`Child`] whose lifetime is driven by
//! a small actor: the actor waits for either the process to exit or a
//! stop/kill command, and publishes the exit state on a watch channel. The
//! [`ProcessManager`] tracks every live child so a global cancellation can
//! shut them all down.

mod child;
mod command;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinSet;
use tracing::{debug, trace};

pub use crate::{
    child::{Child, ChildExit, ShutdownStyle},
    command::Command,
};

/// How long a child gets between the interrupt and the kill when the manager
/// stops it.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerInner {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawns a child for `command`. Returns `None` if the manager is already
    /// closing and no new work should start.
    pub fn spawn(&self, command: Command) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager lock poisoned");
        if state.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(DEFAULT_GRACE_PERIOD));
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every running child: interrupt first, kill after the grace
    /// period. New spawns are refused from the moment this is called.
    pub async fn stop(&self) {
        self.close(|mut child| async move { child.stop().await })
            .await
    }

    /// Waits for every running child to finish on its own. New spawns are
    /// refused while waiting.
    pub async fn wait(&self) {
        self.close(|mut child| async move { child.wait().await })
            .await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C,
        C: std::future::Future<Output = Option<ChildExit>> + Send + 'static,
    {
        let children = {
            let mut state = self.state.lock().expect("process manager lock poisoned");
            state.is_closing = true;
            state.children.clone()
        };

        let mut set = JoinSet::new();
        for child in children {
            set.spawn(callback(child));
        }
        debug!("waiting for {} processes to exit", set.len());
        while let Some(out) = set.join_next().await {
            trace!("process exited: {out:?}");
        }

        let mut state = self.state.lock().expect("process manager lock poisoned");
        state.children.clear();
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_command(seconds: u32) -> Command {
        let mut command = Command::new("sleep");
        command.arg(seconds.to_string());
        command
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = ProcessManager::new();
        let mut command = Command::new("echo");
        command.arg("hello");
        let mut child = manager.spawn(command).unwrap().unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(0))));
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_children() {
        let manager = ProcessManager::new();
        manager.spawn(sleep_command(60)).unwrap().unwrap();
        // The sleep cannot finish in the grace period, so stop must kill it
        // rather than hang.
        tokio::time::timeout(Duration::from_secs(5), manager.stop())
            .await
            .expect("stop must not wait for the full sleep");
    }

    #[tokio::test]
    async fn test_no_spawns_after_stop() {
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager.spawn(sleep_command(1)).is_none());
    }
}
