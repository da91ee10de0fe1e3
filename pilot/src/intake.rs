//! Task intake: producers enqueue, one worker thread owns the planner.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::StopSignal;
use crate::core::types::{Task, TaskSource};
use crate::events::EventSink;
use crate::io::config::SafetyConfig;
use crate::planner::{Planner, PlannerOutcome};

/// What happened to a submitted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Queued { task_id: Uuid },
    /// The message was a kill word; the running task is being stopped.
    StopRequested,
    Rejected { reason: String },
}

/// Cloneable producer handle over a bounded queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: SyncSender<Task>,
    stop: StopSignal,
    safety: SafetyConfig,
    events: Arc<EventSink>,
}

impl TaskQueue {
    pub fn new(
        capacity: usize,
        safety: SafetyConfig,
        stop: StopSignal,
        events: Arc<EventSink>,
    ) -> (Self, Receiver<Task>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (
            Self {
                tx,
                stop,
                safety,
                events,
            },
            rx,
        )
    }

    /// Enqueue `text`, or raise the stop signal if it is a kill word.
    ///
    /// Never blocks: a full queue rejects the task.
    pub fn submit(&self, text: &str, source: TaskSource) -> Submission {
        let text = text.trim();
        if text.is_empty() {
            return Submission::Rejected {
                reason: "empty task".to_string(),
            };
        }
        if self.safety.is_kill_word(text) {
            info!(%source, "kill word received");
            self.request_stop(source);
            return Submission::StopRequested;
        }
        let task = Task::new(text, source);
        let task_id = task.id;
        match self.tx.try_send(task) {
            Ok(()) => {
                debug!(%task_id, %source, "task queued");
                self.events.emit(
                    "task_queued",
                    json!({"task_id": task_id, "source": source, "text": text}),
                );
                Submission::Queued { task_id }
            }
            Err(TrySendError::Full(_)) => {
                warn!(%source, "task queue full");
                Submission::Rejected {
                    reason: "busy: task queue is full".to_string(),
                }
            }
            Err(TrySendError::Disconnected(_)) => Submission::Rejected {
                reason: "worker is not running".to_string(),
            },
        }
    }

    /// Stop the running task without enqueueing anything.
    pub fn request_stop(&self, source: TaskSource) {
        self.stop.stop();
        self.events
            .emit("stop_requested", json!({"source": source}));
    }
}

/// Run tasks one at a time until every producer handle is dropped.
///
/// The stop signal is cleared before each task so a kill word only affects
/// the task that was running when it arrived.
pub fn spawn_worker<F>(
    mut planner: Planner,
    tasks: Receiver<Task>,
    stop: StopSignal,
    mut on_outcome: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(&Task, &PlannerOutcome) + Send + 'static,
{
    thread::Builder::new()
        .name("planner".to_string())
        .spawn(move || {
            for task in tasks {
                stop.clear();
                let submitted = task.clone();
                let outcome = planner.think(task);
                on_outcome(&submitted, &outcome);
            }
            debug!("task queue closed; worker exiting");
        })
        .context("spawn planner worker")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (TaskQueue, Receiver<Task>, StopSignal, Arc<EventSink>) {
        let stop = StopSignal::new();
        let events = Arc::new(EventSink::new(10));
        let (queue, rx) = TaskQueue::new(capacity, SafetyConfig::default(), stop.clone(), events.clone());
        (queue, rx, stop, events)
    }

    #[test]
    fn queues_tasks_in_order() {
        let (queue, rx, _, events) = queue(4);
        let first = queue.submit("  list files in /tmp ", TaskSource::Cli);
        queue.submit("second", TaskSource::Dashboard);
        let Submission::Queued { task_id } = first else {
            panic!("expected queued, got {first:?}");
        };
        let task = rx.recv().expect("task");
        assert_eq!(task.id, task_id);
        assert_eq!(task.text, "list files in /tmp");
        assert_eq!(rx.recv().expect("task").source, TaskSource::Dashboard);
        assert_eq!(events.history()[0].kind, "task_queued");
    }

    #[test]
    fn kill_word_sets_stop_without_enqueueing() {
        let (queue, rx, stop, _) = queue(4);
        assert_eq!(queue.submit("STOP", TaskSource::Message), Submission::StopRequested);
        assert!(stop.is_stopped());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_and_empty_text_are_rejected() {
        let (queue, _rx, _, _) = queue(1);
        assert!(matches!(queue.submit("   ", TaskSource::Cli), Submission::Rejected { .. }));
        assert!(matches!(queue.submit("one", TaskSource::Cli), Submission::Queued { .. }));
        assert!(matches!(queue.submit("two", TaskSource::Cli), Submission::Rejected { .. }));
    }

    #[test]
    fn dropped_worker_rejects() {
        let (queue, rx, _, _) = queue(1);
        drop(rx);
        assert_eq!(
            queue.submit("task", TaskSource::Cli),
            Submission::Rejected {
                reason: "worker is not running".to_string()
            }
        );
    }
}
