//! Tool calls answered end to end through the dispatcher.

mod common;

use common::{WAIT, connected, events, next_event};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use voice_session::tools::{RENDER_TOOL, RenderTool, render_declaration};
use voice_session::{
    AsyncToolHandler, DispatcherConfig, ErrorKind, EventKind, SessionConfig, SessionEvent,
    ToolCallDispatcher, ToolDeclaration,
};

fn quick() -> DispatcherConfig {
    DispatcherConfig::default().with_debounce(Duration::from_millis(100))
}

async fn call(peer: &voice_session::transport::MemoryPeer, calls: Value) {
    peer.send_json(&json!({ "type": "tool_call", "calls": calls })).await.unwrap();
}

fn responses(message: &Value) -> Vec<Value> {
    message["responses"].as_array().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_unhandled_call_answered_with_failure() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let _dispatcher = ToolCallDispatcher::new(&session, quick());

    let sent = tokio::time::Instant::now();
    call(&peer, json!([{ "id": "a", "name": "log_question_start", "args": { "question": "why?" } }])).await;

    let message = peer.recv_type("tool_response", WAIT).await.expect("tool response");
    assert!(sent.elapsed() < Duration::from_secs(1));
    let responses = responses(&message);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["id"], "a");
    assert_eq!(responses[0]["name"], "log_question_start");
    assert_eq!(responses[0]["output"]["success"], false);
    assert!(session.outstanding_calls().is_empty());
}

#[tokio::test]
async fn test_mixed_batch_answered_once_per_call() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let dispatcher = ToolCallDispatcher::new(&session, quick());
    dispatcher.register_fn("fast", |call| Ok(json!({ "echo": call.args["n"] })));
    dispatcher.register(
        "slow",
        AsyncToolHandler::new(|_call| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(json!("done"))
        }),
    );

    call(
        &peer,
        json!([
            { "id": "1", "name": "fast", "args": { "n": 7 } },
            { "id": "2", "name": "missing", "args": {} },
            { "id": "3", "name": "slow", "args": {} }
        ]),
    )
    .await;

    let first = responses(&peer.recv_type("tool_response", WAIT).await.expect("first flush"));
    let mut ids: Vec<&str> = first.iter().filter_map(|r| r["id"].as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["1", "2"]);
    let fast = first.iter().find(|r| r["id"] == "1").unwrap();
    assert_eq!(fast["output"], json!({ "echo": 7, "success": true }));
    let missing = first.iter().find(|r| r["id"] == "2").unwrap();
    assert_eq!(missing["output"]["success"], false);

    let late = responses(&peer.recv_type("tool_response", WAIT).await.expect("late flush"));
    assert_eq!(late.len(), 1);
    assert_eq!(late[0]["id"], "3");
    assert_eq!(late[0]["output"], json!({ "success": true, "result": "done" }));

    assert!(peer.recv_type("tool_response", Duration::from_millis(200)).await.is_none());
    assert!(session.outstanding_calls().is_empty());
}

#[tokio::test]
async fn test_handler_timeout_yields_failure() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let mut errors = events(&session, EventKind::Error);
    let dispatcher = ToolCallDispatcher::new(
        &session,
        DispatcherConfig::default()
            .with_debounce(Duration::from_millis(50))
            .with_handler_timeout(Duration::from_millis(100)),
    );
    dispatcher.register(
        "stuck",
        AsyncToolHandler::new(|_call| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }),
    );

    call(&peer, json!([{ "id": "t", "name": "stuck", "args": {} }])).await;

    let message = peer.recv_type("tool_response", WAIT).await.expect("timeout response");
    let responses = responses(&message);
    assert_eq!(responses[0]["id"], "t");
    assert_eq!(responses[0]["output"]["success"], false);

    let SessionEvent::Error { kind, .. } = next_event(&mut errors).await else {
        panic!("expected error event");
    };
    assert_eq!(kind, ErrorKind::ToolTimeout);
}

#[tokio::test]
async fn test_schema_mismatch_skips_handler() {
    let declaration = ToolDeclaration::new("log_question_start").with_parameters(json!({
        "type": "object",
        "properties": { "question": { "type": "string" } },
        "required": ["question"]
    }));
    let (session, mut peer, _peers) = connected(SessionConfig::default().with_tool(declaration)).await;
    let mut errors = events(&session, EventKind::Error);
    let dispatcher = ToolCallDispatcher::new(&session, quick());
    let invoked = Arc::new(AtomicBool::new(false));
    {
        let invoked = invoked.clone();
        dispatcher.register_fn("log_question_start", move |_| {
            invoked.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });
    }

    call(&peer, json!([{ "id": "q", "name": "log_question_start", "args": { "question": 42 } }])).await;

    let message = peer.recv_type("tool_response", WAIT).await.expect("tool response");
    assert_eq!(responses(&message)[0]["output"]["success"], false);
    let SessionEvent::Error { kind, .. } = next_event(&mut errors).await else {
        panic!("expected error event");
    };
    assert_eq!(kind, ErrorKind::Protocol);
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_render_tool_forwards_payload() {
    let config = SessionConfig::builder().tool(render_declaration()).build().unwrap();
    let (session, mut peer, _peers) = connected(config).await;
    let dispatcher = ToolCallDispatcher::new(&session, quick());
    let (render, mut charts) = RenderTool::channel(4);
    dispatcher.register(RENDER_TOOL, render);

    let chart = r#"{"mark":"bar","data":[1,2,3]}"#;
    call(&peer, json!([{ "id": "r1", "name": "render", "args": { "payload": chart } }])).await;

    let forwarded = tokio::time::timeout(WAIT, charts.recv()).await.unwrap().unwrap();
    assert_eq!(forwarded, chart);
    let message = peer.recv_type("tool_response", WAIT).await.expect("tool response");
    assert_eq!(responses(&message)[0]["output"], json!({ "success": true }));
}

#[tokio::test]
async fn test_reregistering_replaces_handler() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let dispatcher = ToolCallDispatcher::new(&session, quick());
    dispatcher.register_fn("version", |_| Ok(json!(1)));
    dispatcher.register_fn("version", |_| Ok(json!(2)));
    assert!(dispatcher.has_handler("version"));

    call(&peer, json!([{ "id": "v", "name": "version", "args": {} }])).await;

    let message = peer.recv_type("tool_response", WAIT).await.expect("tool response");
    assert_eq!(responses(&message)[0]["output"], json!({ "success": true, "result": 2 }));

    assert!(dispatcher.unregister("version"));
    assert!(!dispatcher.has_handler("version"));
}

#[tokio::test]
async fn test_disconnect_abandons_inflight_calls() {
    let (session, mut peer, _peers) = connected(SessionConfig::default()).await;
    let mut calls = events(&session, EventKind::ToolCall);
    let dispatcher = ToolCallDispatcher::new(&session, quick());
    dispatcher.register(
        "slow",
        AsyncToolHandler::new(|_call| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Null)
        }),
    );

    call(&peer, json!([{ "id": "s", "name": "slow", "args": {} }])).await;
    next_event(&mut calls).await;
    session.disconnect().await.unwrap();

    assert!(peer.recv_type("tool_response", Duration::from_millis(600)).await.is_none());
    assert!(session.outstanding_calls().is_empty());
}
