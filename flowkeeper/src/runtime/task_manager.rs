use std::{
    future::Future,
    time::{Duration, Instant},
};

use futures::{StreamExt, stream::FuturesUnordered};
use tokio::{sync::broadcast, task::JoinHandle, time::timeout};
use tracing::{debug, error, info, warn};

use crate::metrics::registry::{
    SHUTDOWN_DURATION_SECONDS, SHUTDOWN_TIMEOUTS_TOTAL, TASKMANAGER_TASKS_TOTAL,
    TASKS_ACTIVE_BY_NAME,
};

/// Grace period given to aborted tasks to unwind after a timed-out shutdown.
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Panicked,
}

#[derive(Debug)]
struct TrackedTask {
    id: u64,
    name: String,
    handle: JoinHandle<()>,
    state: TaskState,
}

impl TrackedTask {
    fn finish(&mut self, state: TaskState) {
        self.state = state;
        let status = match state {
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Panicked => "panicked",
            TaskState::Running => return,
        };
        TASKMANAGER_TASKS_TOTAL.with_label_values(&[status]).inc();
        TASKS_ACTIVE_BY_NAME.with_label_values(&[&self.name]).dec();
    }
}

/// Owns every long-running pipeline task and the shutdown broadcast they listen on.
///
/// Shutdown is two-phase: the signal is broadcast and tasks get `timeout` to
/// drain and return; whatever is still running afterwards is aborted.
pub struct TaskManager {
    tasks: Vec<TrackedTask>,
    next_task_id: u64,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            tasks: Vec::new(),
            next_task_id: 1,
            shutdown_tx,
        }
    }

    /// A fresh receiver for the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn<F>(&mut self, name: &str, future: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_task_id;
        self.next_task_id += 1;

        self.tasks.push(TrackedTask {
            id,
            name: name.to_string(),
            handle: tokio::spawn(future),
            state: TaskState::Running,
        });

        TASKMANAGER_TASKS_TOTAL.with_label_values(&["spawned"]).inc();
        TASKS_ACTIVE_BY_NAME.with_label_values(&[name]).inc();

        debug!(
            event.name = "task.spawned",
            task.id = id,
            task.name = %name,
            "task spawned and registered"
        );

        id
    }

    /// Spawns a task that is handed its own shutdown receiver.
    pub fn spawn_with_shutdown<F, Fut>(&mut self, name: &str, task: F) -> u64
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = task(self.shutdown_tx.subscribe());
        self.spawn(name, future)
    }

    pub fn state(&self, task_id: u64) -> Option<TaskState> {
        self.tasks.iter().find(|t| t.id == task_id).map(|t| t.state)
    }

    pub fn running(&self) -> usize {
        self.count(TaskState::Running)
    }

    fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    /// Broadcasts shutdown, waits up to `timeout_duration`, then aborts the stragglers.
    pub async fn shutdown_with_timeout(mut self, timeout_duration: Duration) -> ShutdownResult {
        let started = Instant::now();

        info!(
            event.name = "task_manager.shutdown_started",
            timeout_ms = timeout_duration.as_millis() as u64,
            active_tasks = self.running(),
            "starting graceful shutdown sequence"
        );

        let _ = self.shutdown_tx.send(());

        let graceful = timeout(timeout_duration, self.wait_for_running_tasks())
            .await
            .is_ok();

        if !graceful {
            warn!(
                event.name = "task_manager.shutdown_timeout",
                timeout_ms = timeout_duration.as_millis() as u64,
                still_running = self.running(),
                "graceful shutdown timed out, aborting remaining tasks"
            );
            SHUTDOWN_TIMEOUTS_TOTAL.inc();

            for task in self.tasks.iter().filter(|t| t.state == TaskState::Running) {
                task.handle.abort();
            }
            let _ = timeout(ABORT_GRACE, self.wait_for_running_tasks()).await;
        }

        let duration = started.elapsed();
        SHUTDOWN_DURATION_SECONDS.observe(duration.as_secs_f64());

        let tasks_completed = self.count(TaskState::Completed);
        if graceful {
            info!(
                event.name = "task_manager.shutdown_completed",
                duration_ms = duration.as_millis() as u64,
                tasks_completed,
                "all tasks completed gracefully"
            );
            ShutdownResult::Graceful {
                duration,
                tasks_completed,
            }
        } else {
            ShutdownResult::ForcedCancellation {
                duration,
                tasks_cancelled: self.count(TaskState::Cancelled),
                tasks_completed,
            }
        }
    }

    async fn wait_for_running_tasks(&mut self) {
        let mut pending: FuturesUnordered<_> = self
            .tasks
            .iter_mut()
            .filter(|t| t.state == TaskState::Running)
            .map(|task| async move {
                let result = (&mut task.handle).await;
                (task, result)
            })
            .collect();

        while let Some((task, result)) = pending.next().await {
            match result {
                Ok(()) => {
                    task.finish(TaskState::Completed);
                    debug!(event.name = "task.completed", task.id = task.id, task.name = %task.name, "task completed");
                }
                Err(e) if e.is_cancelled() => {
                    task.finish(TaskState::Cancelled);
                    warn!(event.name = "task.cancelled", task.id = task.id, task.name = %task.name, "task cancelled forcefully");
                }
                Err(e) => {
                    task.finish(TaskState::Panicked);
                    error!(event.name = "task.panic", task.id = task.id, task.name = %task.name, error.message = ?e, "task panicked");
                }
            }
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub enum ShutdownResult {
    Graceful {
        duration: Duration,
        tasks_completed: usize,
    },
    ForcedCancellation {
        duration: Duration,
        tasks_cancelled: usize,
        tasks_completed: usize,
    },
}

impl ShutdownResult {
    pub fn is_graceful(&self) -> bool {
        matches!(self, ShutdownResult::Graceful { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn spawned_task_is_tracked_as_running() {
        let mut manager = TaskManager::new();
        let id = manager.spawn("sleeper", async {
            sleep(Duration::from_millis(50)).await;
        });

        assert_eq!(manager.state(id), Some(TaskState::Running));
        assert_eq!(manager.running(), 1);
        assert_eq!(manager.state(id + 1), None);
    }

    #[tokio::test]
    async fn cooperative_tasks_shut_down_gracefully() {
        let mut manager = TaskManager::new();
        let drained = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let drained = drained.clone();
            manager.spawn_with_shutdown(&format!("stage-{i}"), move |mut shutdown_rx| async move {
                tokio::select! {
                    _ = sleep(Duration::from_secs(30)) => {}
                    _ = shutdown_rx.recv() => {
                        drained.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        let result = manager.shutdown_with_timeout(Duration::from_secs(2)).await;
        match result {
            ShutdownResult::Graceful { tasks_completed, .. } => assert_eq!(tasks_completed, 4),
            other => panic!("expected graceful shutdown, got {other:?}"),
        }
        assert_eq!(drained.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stubborn_tasks_are_aborted_after_timeout() {
        let mut manager = TaskManager::new();
        manager.spawn_with_shutdown("cooperative", |mut rx| async move {
            let _ = rx.recv().await;
        });
        manager.spawn("stubborn", async {
            sleep(Duration::from_secs(30)).await;
        });

        let started = Instant::now();
        let result = manager.shutdown_with_timeout(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        match result {
            ShutdownResult::ForcedCancellation {
                tasks_cancelled,
                tasks_completed,
                ..
            } => {
                assert_eq!(tasks_completed, 1);
                assert_eq!(tasks_cancelled, 1);
            }
            other => panic!("expected forced cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_task_does_not_block_shutdown() {
        let mut manager = TaskManager::new();
        manager.spawn("boom", async {
            panic!("stage failed");
        });
        sleep(Duration::from_millis(10)).await;

        let result = manager.shutdown_with_timeout(Duration::from_secs(1)).await;
        assert!(result.is_graceful());
    }
}
