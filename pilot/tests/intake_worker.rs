//! Queue-fed worker: tasks run one at a time and kill words stop the active one.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use pilot::core::types::{TaskSource, ToolInvocation, ToolResult};
use pilot::events::EventSink;
use pilot::intake::{self, Submission, TaskQueue};
use pilot::llm::{LlmBackend, LlmResponse};
use pilot::runtime::Runtime;
use pilot::test_support::{ScriptedBackend, call, test_config, tool_calls};
use pilot::tools::{Handler, ToolId};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn worker_answers_queued_tasks_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend: Arc<dyn LlmBackend> = Arc::new(ScriptedBackend::new(
        "scripted",
        vec![LlmResponse::text("first answer"), LlmResponse::text("second answer")],
    ));
    let runtime = Runtime::with_parts(
        test_config(dir.path()),
        Arc::new(EventSink::new(100)),
        backend,
        Vec::new(),
    )
    .expect("runtime");
    let (queue, tasks) = TaskQueue::new(
        4,
        runtime.config.safety.clone(),
        runtime.stop.clone(),
        runtime.events.clone(),
    );
    let (done_tx, done_rx) = mpsc::channel();
    let worker = intake::spawn_worker(
        runtime.planner().expect("planner"),
        tasks,
        runtime.stop.clone(),
        move |task, outcome| {
            let _ = done_tx.send((task.text.clone(), outcome.response.clone()));
        },
    )
    .expect("worker");

    assert!(matches!(queue.submit("one", TaskSource::Cli), Submission::Queued { .. }));
    assert!(matches!(queue.submit("two", TaskSource::Dashboard), Submission::Queued { .. }));

    assert_eq!(
        done_rx.recv_timeout(WAIT).expect("first outcome"),
        ("one".to_string(), "first answer".to_string())
    );
    assert_eq!(
        done_rx.recv_timeout(WAIT).expect("second outcome"),
        ("two".to_string(), "second answer".to_string())
    );
    drop(queue);
    worker.join().expect("worker exits once the queue closes");
}

#[test]
fn kill_word_stops_the_running_task_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let handler: Arc<dyn Handler> = {
        let entered = entered.clone();
        let release = release.clone();
        Arc::new(move |_: &ToolInvocation| -> Result<ToolResult> {
            entered.wait();
            release.wait();
            Ok(ToolResult::ok("a.txt"))
        })
    };
    let backend: Arc<dyn LlmBackend> = Arc::new(ScriptedBackend::new(
        "scripted",
        vec![
            tool_calls(vec![call("list_files", json!({"path": "/tmp"}))]),
            LlmResponse::text("next task answered"),
        ],
    ));
    let runtime = Runtime::with_parts(
        test_config(dir.path()),
        Arc::new(EventSink::new(100)),
        backend,
        vec![(ToolId::ListFiles, handler)],
    )
    .expect("runtime");
    let (queue, tasks) = TaskQueue::new(
        4,
        runtime.config.safety.clone(),
        runtime.stop.clone(),
        runtime.events.clone(),
    );
    let (done_tx, done_rx) = mpsc::channel();
    let worker = intake::spawn_worker(
        runtime.planner().expect("planner"),
        tasks,
        runtime.stop.clone(),
        move |_, outcome| {
            let _ = done_tx.send((outcome.complete, outcome.response.clone()));
        },
    )
    .expect("worker");

    queue.submit("list /tmp forever", TaskSource::Message);
    entered.wait();
    assert_eq!(queue.submit("Stop", TaskSource::Message), Submission::StopRequested);
    release.wait();

    assert_eq!(
        done_rx.recv_timeout(WAIT).expect("stopped outcome"),
        (false, "stopped by operator".to_string())
    );

    queue.submit("something else", TaskSource::Message);
    assert_eq!(
        done_rx.recv_timeout(WAIT).expect("next outcome"),
        (true, "next task answered".to_string())
    );
    assert!(
        runtime
            .events
            .history()
            .iter()
            .any(|event| event.kind == "stop_requested")
    );
    drop(queue);
    worker.join().expect("worker exits");
}
