//! Fire-and-forget event sink for live observers (dashboard, CLI).
//!
//! `emit` never blocks on a subscriber and never fails. Each subscriber owns a
//! bounded channel: a full channel drops the event for that subscriber only, a
//! disconnected one is removed on the next emit. A bounded replay history lets
//! late subscribers catch up.
//!
//! Events are product output. Developer diagnostics go through `tracing`.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// One observable occurrence, serialized as `{type, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Running counters, derived from emitted events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub emitted: u64,
    /// Deliveries dropped because a subscriber channel was full.
    pub dropped: u64,
    pub tool_successes: u64,
    pub tool_failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

struct Subscriber {
    id: u64,
    tx: SyncSender<Event>,
}

struct SinkState {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    history: VecDeque<Event>,
    stats: EventStats,
}

pub struct EventSink {
    state: Mutex<SinkState>,
    history_capacity: usize,
}

impl EventSink {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: Mutex::new(SinkState {
                subscribers: Vec::new(),
                next_id: 0,
                history: VecDeque::with_capacity(history_capacity.min(1024)),
                stats: EventStats::default(),
            }),
            history_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to every subscriber.
    pub fn emit(&self, kind: &str, data: Value) {
        let event = Event {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            data,
        };
        let mut state = self.lock();
        update_stats(&mut state.stats, &event);

        let mut dropped = 0;
        state.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(subscriber = sub.id, "removing disconnected subscriber");
                false
            }
        });
        state.stats.dropped += dropped;

        if self.history_capacity > 0 {
            if state.history.len() == self.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(event);
        }
    }

    /// Register a bounded receiver. Events that do not fit are dropped.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Event> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, tx });
        rx
    }

    /// Run `callback` for every event on a dedicated thread.
    ///
    /// A panicking callback is logged and the thread keeps consuming.
    pub fn subscribe_fn<F>(&self, capacity: usize, callback: F) -> JoinHandle<()>
    where
        F: Fn(&Event) + Send + 'static,
    {
        let rx = self.subscribe(capacity);
        thread::spawn(move || {
            for event in rx {
                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    warn!(event = %event.kind, "event subscriber panicked");
                }
            }
        })
    }

    /// Drop every subscriber; their receivers see a closed channel.
    pub fn close(&self) {
        self.lock().subscribers.clear();
    }

    /// Most recent events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn stats(&self) -> EventStats {
        self.lock().stats.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(500)
    }
}

fn update_stats(stats: &mut EventStats, event: &Event) {
    stats.emitted += 1;
    match event.kind.as_str() {
        "tool_result" => {
            if event.data["success"].as_bool().unwrap_or(false) {
                stats.tool_successes += 1;
            } else {
                stats.tool_failures += 1;
            }
        }
        "llm_usage" => {
            stats.input_tokens += event.data["input_tokens"].as_u64().unwrap_or(0);
            stats.output_tokens += event.data["output_tokens"].as_u64().unwrap_or(0);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn subscribers_receive_events_in_order() {
        let sink = EventSink::new(10);
        let rx = sink.subscribe(8);
        sink.emit("a", json!({"n": 1}));
        sink.emit("b", json!({"n": 2}));
        let kinds: Vec<String> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["a", "b"]);
    }

    #[test]
    fn full_subscriber_drops_without_blocking() {
        let sink = EventSink::new(0);
        let slow = sink.subscribe(1);
        let fast = sink.subscribe(16);
        for n in 0..5 {
            sink.emit("tick", json!({"n": n}));
        }
        assert_eq!(slow.try_iter().count(), 1);
        assert_eq!(fast.try_iter().count(), 5);
        assert_eq!(sink.stats().dropped, 4);
    }

    #[test]
    fn disconnected_subscriber_is_removed() {
        let sink = EventSink::new(0);
        let rx = sink.subscribe(4);
        assert_eq!(sink.subscriber_count(), 1);
        drop(rx);
        sink.emit("x", Value::Null);
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let sink = EventSink::new(3);
        for n in 0..5 {
            sink.emit("tick", json!(n));
        }
        let history = sink.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data, json!(2));
        assert_eq!(history[2].data, json!(4));
    }

    #[test]
    fn stats_count_tool_results_and_tokens() {
        let sink = EventSink::new(0);
        sink.emit("tool_result", json!({"success": true}));
        sink.emit("tool_result", json!({"success": false}));
        sink.emit("llm_usage", json!({"input_tokens": 10, "output_tokens": 3}));
        let stats = sink.stats();
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.tool_successes, 1);
        assert_eq!(stats.tool_failures, 1);
        assert_eq!(stats.input_tokens, 10);
        assert_eq!(stats.output_tokens, 3);
    }

    #[test]
    fn panicking_callback_keeps_consuming() {
        let sink = Arc::new(EventSink::new(0));
        let (tx, rx) = mpsc::channel();
        let handle = sink.subscribe_fn(8, move |event| {
            if event.kind == "boom" {
                panic!("subscriber failure");
            }
            let _ = tx.send(event.kind.clone());
        });
        sink.emit("boom", Value::Null);
        sink.emit("ok", Value::Null);
        let got = rx.recv_timeout(Duration::from_secs(5)).expect("delivered");
        assert_eq!(got, "ok");
        sink.close();
        handle.join().expect("thread exits");
    }

    #[test]
    fn serializes_with_type_key() {
        let sink = EventSink::new(1);
        sink.emit("tool_called", json!({"tool_name": "think"}));
        let value = serde_json::to_value(&sink.history()[0]).expect("serialize");
        assert_eq!(value["type"], "tool_called");
        assert!(value["timestamp"].is_string());
    }
}
