mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{Notify, mpsc};
use weft_core::{
    Engine, ExecutionInput, ScriptedModel, ScriptedTurn, Tool, ToolOutput, spawn_broadcaster,
};
use weft_types::{BlockType, ErrorKind, ExecutionStatus, Role, StopReason, StreamEvent};

use common::{calc_tool, ping_tool, roles, tool_results};

fn batched_script() -> ScriptedModel {
    ScriptedModel::new([
        ScriptedTurn::text("Let me add those.")
            .with_tool_call("calc", json!({"a": 2, "b": 3}))
            .with_tool_call("calc", json!({"a": 1, "b": 1})),
        ScriptedTurn::text("The sums are 5 and 2."),
    ])
    .with_chunk_size(4)
}

fn engine_with(model: ScriptedModel) -> Engine {
    Engine::builder()
        .model(model)
        .tool(calc_tool())
        .tool(ping_tool())
        .build()
        .unwrap()
}

fn position(events: &[StreamEvent], pred: impl Fn(&StreamEvent) -> bool) -> usize {
    events.iter().position(|e| pred(e)).unwrap()
}

#[tokio::test]
async fn test_streaming_and_buffered_timelines_match() {
    let buffered = engine_with(batched_script())
        .execute(ExecutionInput::user("add"))
        .await
        .unwrap();
    let streamed = engine_with(batched_script())
        .stream(ExecutionInput::user("add"))
        .await
        .unwrap()
        .collect_output()
        .await
        .unwrap();

    assert_eq!(buffered.ticks, streamed.ticks);
    assert_eq!(buffered.stop_reason, streamed.stop_reason);
    assert_eq!(buffered.final_text, streamed.final_text);
    assert_eq!(buffered.timeline.len(), streamed.timeline.len());
    for (left, right) in buffered.timeline.iter().zip(&streamed.timeline) {
        assert!(left.same_content(right), "{left:?} != {right:?}");
    }
}

#[tokio::test]
async fn test_event_order_for_a_two_tick_run() {
    let events: Vec<StreamEvent> = engine_with(batched_script())
        .stream(ExecutionInput::user("add").with_context(
            weft_core::ExecutionContext::new().with_thread("thread-9"),
        ))
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(
        &events[0],
        StreamEvent::ExecutionStart { thread_id: Some(t), .. } if t == "thread-9"
    ));
    assert_eq!(events[1], StreamEvent::TickStart { tick: 1 });

    let text: String = events
        .iter()
        .take_while(|e| !matches!(e, StreamEvent::TickEnd { .. }))
        .filter_map(|e| match e {
            StreamEvent::ContentDelta {
                block_type: BlockType::Text,
                delta,
                ..
            } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Let me add those.");

    let message_end = position(&events, |e| matches!(e, StreamEvent::MessageEnd { .. }));
    let first_call = position(&events, |e| matches!(e, StreamEvent::ToolCall { .. }));
    let first_result = position(&events, |e| matches!(e, StreamEvent::ToolResult { .. }));
    let tick_end = position(&events, |e| matches!(e, StreamEvent::TickEnd { tick: 1, .. }));
    assert!(message_end < first_call);
    assert!(first_call < first_result);
    assert!(first_result < tick_end);

    let results = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolResult { .. }))
        .count();
    assert_eq!(results, 2);

    match events.last().unwrap() {
        StreamEvent::ExecutionEnd { summary } => {
            assert_eq!(summary.status, ExecutionStatus::Completed);
            assert_eq!(summary.ticks, 2);
            assert_eq!(summary.stop_reason, StopReason::Stop);
            assert_eq!(summary.final_text, "The sums are 5 and 2.");
        }
        other => panic!("unexpected last event {other:?}"),
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_stream_failure_ends_with_error_event() {
    let mut stream = engine_with(ScriptedModel::new([
        ScriptedTurn::tool_call("ping", json!({})),
        ScriptedTurn::failing("provider overloaded"),
    ]))
    .stream(ExecutionInput::user("go"))
    .await
    .unwrap();
    let handle = stream.handle().clone();

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    match events.last().unwrap() {
        StreamEvent::Error {
            kind, message, tick, ..
        } => {
            assert_eq!(*kind, ErrorKind::Adapter);
            assert!(message.contains("provider overloaded"));
            assert_eq!(*tick, Some(2));
        }
        other => panic!("unexpected last event {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::ExecutionEnd { .. })));
    assert_eq!(handle.wait().await, ExecutionStatus::Failed);

    let err = stream.collect_output().await.unwrap_err();
    assert_eq!(err.ticks, 2);
    assert_eq!(err.timeline.len(), 3);
}

#[tokio::test]
async fn test_cancelled_stream_reports_failed_status() {
    let started = Arc::new(Notify::new());
    let slow = Tool::server("slow", "Blocks", json!({}), {
        let started = Arc::clone(&started);
        move |_input, _ctx| {
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_secs(30)).await;
                ToolOutput::success(json!(null))
            }
        }
    });
    let engine = Engine::builder()
        .model(ScriptedModel::new([ScriptedTurn::tool_call("slow", json!({}))]))
        .tool(slow)
        .build()
        .unwrap();

    let stream = engine.stream(ExecutionInput::user("go")).await.unwrap();
    let handle = stream.handle().clone();
    assert_eq!(handle.status(), ExecutionStatus::Running);
    let consumer = tokio::spawn(stream.collect::<Vec<StreamEvent>>());

    started.notified().await;
    handle.cancel();
    let events = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error {
            kind: ErrorKind::Cancelled,
            ..
        })
    ));
    let canceled = events.iter().any(|e| {
        matches!(e, StreamEvent::ToolResult { result } if result.is_error && result.name == "slow")
    });
    assert!(canceled);
    assert_eq!(handle.wait().await, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_confirmation_rejection_denies_call() {
    let engine = Engine::builder()
        .model(ScriptedModel::new([
            ScriptedTurn::tool_call("calc", json!({"a": 1, "b": 2})),
            ScriptedTurn::text("ok, skipped"),
        ]))
        .tool(calc_tool().with_confirmation())
        .build()
        .unwrap();
    let broker = engine.broker().clone();

    let mut stream = engine.stream(ExecutionInput::user("add")).await.unwrap();
    let pid = stream.handle().pid();
    let mut asked = 0;
    while let Some(event) = stream.next().await {
        if let StreamEvent::ToolConfirmationRequired { call } = &event {
            asked += 1;
            assert!(broker.confirm(pid, &call.id, false));
        }
    }
    assert_eq!(asked, 1);

    let output = stream.collect_output().await.unwrap();
    let messages = output.messages();
    assert_eq!(
        roles(messages.iter().copied()),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    let results = tool_results(messages[2]);
    assert!(results[0].1);
    assert!(results[0].2.contains("denied"));
}

#[tokio::test]
async fn test_broadcaster_feeds_every_subscriber() {
    let stream = engine_with(batched_script())
        .stream(ExecutionInput::user("add"))
        .await
        .unwrap();
    let (render_tx, mut render_rx) = mpsc::channel(256);
    let (persist_tx, mut persist_rx) = mpsc::channel(256);

    let task = spawn_broadcaster(stream, vec![render_tx, persist_tx]);
    let output = task.await.unwrap().unwrap();
    assert_eq!(output.ticks, 2);

    let mut rendered = Vec::new();
    while let Some(event) = render_rx.recv().await {
        rendered.push(event);
    }
    let mut persisted = Vec::new();
    while let Some(event) = persist_rx.recv().await {
        persisted.push(event);
    }
    assert_eq!(rendered, persisted);
    assert!(rendered.last().unwrap().is_terminal());
}
