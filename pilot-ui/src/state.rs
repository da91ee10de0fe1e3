//! Shared application state for the dashboard server.

use std::sync::Arc;

use pilot::events::{Event, EventSink};
use pilot::fix_registry::FixRegistry;
use pilot::intake::TaskQueue;
use pilot::tools::ToolSpec;
use tokio::sync::broadcast;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Producer side of the planner's task queue.
    pub queue: TaskQueue,
    pub events: Arc<EventSink>,
    pub fixes: Arc<FixRegistry>,
    /// Tools the planner advertises, including deploy and terminal tools.
    pub tools: Arc<Vec<ToolSpec>>,
    /// Fan-out of sink events to SSE clients.
    pub event_tx: Arc<broadcast::Sender<Event>>,
}

impl AppState {
    pub fn new(
        queue: TaskQueue,
        events: Arc<EventSink>,
        fixes: Arc<FixRegistry>,
        tools: Vec<ToolSpec>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            queue,
            events,
            fixes,
            tools: Arc::new(tools),
            event_tx: Arc::new(event_tx),
        }
    }
}
