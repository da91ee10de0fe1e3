//! Server-Sent Events stream and the bridge from the event sink.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::AppState;

/// Forward every sink event into the broadcast channel.
///
/// The sink delivers over a bounded std channel, so the forwarding loop runs
/// on the blocking pool. It ends when the sink is closed.
pub fn start_event_bridge(state: &AppState, capacity: usize) -> JoinHandle<()> {
    let rx = state.events.subscribe(capacity);
    let tx = state.event_tx.clone();
    tokio::task::spawn_blocking(move || {
        for event in rx {
            // No SSE clients is not an error.
            let _ = tx.send(event);
        }
        debug!("event sink closed; bridge exiting");
    })
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event(event.kind.as_str()).data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pilot::cancel::StopSignal;
    use pilot::events::EventSink;
    use pilot::fix_registry::FixRegistry;
    use pilot::intake::TaskQueue;
    use pilot::io::config::SafetyConfig;
    use serde_json::json;

    use super::*;

    fn state() -> AppState {
        let events = Arc::new(EventSink::new(10));
        let (queue, _rx) = TaskQueue::new(1, SafetyConfig::default(), StopSignal::new(), events.clone());
        let fixes = Arc::new(FixRegistry::in_memory(10, events.clone()));
        AppState::new(queue, events, fixes, Vec::new())
    }

    #[tokio::test]
    async fn bridge_forwards_sink_events_until_close() {
        let state = state();
        let mut rx = state.event_tx.subscribe();
        let bridge = start_event_bridge(&state, 16);

        state.events.emit("tool_called", json!({"tool_name": "list_files"}));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(event.kind, "tool_called");
        assert_eq!(event.data["tool_name"], "list_files");

        state.events.close();
        tokio::time::timeout(Duration::from_secs(5), bridge)
            .await
            .expect("bridge exits")
            .expect("bridge task");
    }
}
