//! End-to-end router behavior against an in-memory peer.
//!
//! Each test drives the router through the raw line protocol the way a real
//! peer process would, and checks the exact lines written back.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{CapturedLogs, Peer, settle};
use common::RECV_TIMEOUT;
use linerpc::{
    ErrorKind, LOGGING_METHOD, LogLevel, PROGRESS_METHOD, RequestId, Router, RouterConfig,
    RouterState, RpcError, handler_fn, notification_handler,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tracing::Level;

fn echo_handler() -> impl linerpc::MessageHandler {
    handler_fn(|request| async move {
        match request.method.as_str() {
            "echo" => Ok(request.params.unwrap_or(Value::Null)),
            "sleep" => {
                let ms = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("ms"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "fail" => Err(RpcError::internal("disk on fire")),
            "explode" => panic!("handler blew up"),
            other => Err(RpcError::method_not_found(other)),
        }
    })
}

// ---------------------------------------------------------------------------
// Request dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_request_result_echoes_id() {
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());

    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {"a": 1}}))
        .await;
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"a": 1}})
    );

    peer.send_json(json!({"jsonrpc": "2.0", "id": "abc", "method": "echo", "params": [true]}))
        .await;
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": "abc", "result": [true]})
    );
}

#[tokio::test]
async fn test_request_without_handler() {
    let mut peer = Peer::started().await;

    peer.send_json(json!({"jsonrpc": "2.0", "id": 4, "method": "anything"}))
        .await;
    assert_eq!(
        peer.recv().await,
        json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32603, "message": "No message handler registered"}
        })
    );
}

#[tokio::test]
async fn test_handler_failures_become_error_responses() {
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());

    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "fail"}))
        .await;
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32603, "message": "disk on fire"}})
    );

    peer.send_json(json!({"jsonrpc": "2.0", "id": 2, "method": "missing"}))
        .await;
    let response = peer.recv().await;
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["error"]["code"], json!(-32601));

    peer.send_json(json!({"jsonrpc": "2.0", "id": 3, "method": "explode"}))
        .await;
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32603, "message": "handler blew up"}})
    );

    // Still serving after a panic
    peer.send_json(json!({"jsonrpc": "2.0", "id": 4, "method": "echo", "params": 1}))
        .await;
    assert_eq!(peer.recv().await["result"], json!(1));
}

#[tokio::test]
async fn test_responses_follow_handler_completion_order() {
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());

    peer.send_json(json!({"jsonrpc": "2.0", "id": "slow", "method": "sleep", "params": {"ms": 200}}))
        .await;
    peer.send_json(json!({"jsonrpc": "2.0", "id": "fast", "method": "echo", "params": "hi"}))
        .await;

    assert_eq!(peer.recv().await["id"], json!("fast"));
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": "slow", "result": {"slept": 200}})
    );
}

#[tokio::test]
async fn test_replacing_the_handler() {
    let mut peer = Peer::started().await;
    peer.router
        .set_message_handler(handler_fn(|_| async { Ok::<_, RpcError>(json!("first")) }));
    peer.router
        .set_message_handler(handler_fn(|_| async { Ok::<_, RpcError>(json!("second")) }));

    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "who"}))
        .await;
    assert_eq!(peer.recv().await["result"], json!("second"));
}

#[tokio::test]
async fn test_handler_can_call_back_into_peer() {
    let mut peer = Peer::started().await;
    let router = peer.router.clone();
    peer.router.set_message_handler(handler_fn(move |request| {
        let router = router.clone();
        async move {
            let inner = router
                .send_request("relay/echo", request.params.clone())
                .await?;
            Ok::<_, RpcError>(json!({ "relayed": inner }))
        }
    }));

    peer.send_json(json!({"jsonrpc": "2.0", "id": 10, "method": "relay", "params": {"x": 1}}))
        .await;

    let outgoing = peer.recv().await;
    assert_eq!(outgoing["method"], json!("relay/echo"));
    assert_eq!(outgoing["params"], json!({"x": 1}));
    peer.send_json(json!({"jsonrpc": "2.0", "id": outgoing["id"], "result": "pong"}))
        .await;

    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 10, "result": {"relayed": "pong"}})
    );
}

// ---------------------------------------------------------------------------
// Outgoing requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_send_request_resolves_and_ignores_duplicates() {
    let (logs, _guard) = CapturedLogs::install();
    let mut peer = Peer::started().await;

    let router = peer.router.clone();
    let call = tokio::spawn(async move { router.send_request("sum", Some(json!([1, 2]))).await });

    let request = peer.recv().await;
    assert_eq!(request["jsonrpc"], json!("2.0"));
    assert_eq!(request["method"], json!("sum"));
    assert_eq!(request["params"], json!([1, 2]));
    assert!(request["id"].is_string(), "outgoing ids are strings");
    assert_eq!(peer.router.pending_requests(), 1);

    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": 3});
    peer.send_json(reply.clone()).await;
    assert_eq!(call.await.unwrap().unwrap(), json!(3));
    assert_eq!(peer.router.pending_requests(), 0);

    peer.send_json(reply).await;
    peer.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(
        logs.at(Level::WARN),
        vec!["Received response for unknown request".to_string()]
    );
}

#[tokio::test]
async fn test_send_request_error_response() {
    let mut peer = Peer::started().await;

    let router = peer.router.clone();
    let call = tokio::spawn(async move { router.send_request("sum", None).await });

    let request = peer.recv().await;
    peer.send_json(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": {"code": -32602, "message": "need numbers"}
    }))
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidParams);
    assert_eq!(err.message, "need numbers");
}

#[tokio::test]
async fn test_send_request_timeout() {
    let mut peer = Peer::started().await;

    let router = peer.router.clone();
    let call = tokio::spawn(async move {
        router
            .send_request_with_timeout("ping", Some(json!({})), Duration::from_millis(50))
            .await
    });

    let request = peer.recv().await;
    assert_eq!(request["method"], json!("ping"));

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert!(err.message.contains("ping"), "{}", err.message);
    assert!(err.message.contains("50ms"), "{}", err.message);
    assert_eq!(peer.router.pending_requests(), 0);

    // A late reply is a stray
    peer.send_json(json!({"jsonrpc": "2.0", "id": request["id"], "result": {}}))
        .await;
    peer.expect_silence(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_default_timeout_comes_from_config() {
    let config = RouterConfig::builder()
        .request_timeout(Duration::from_millis(30))
        .build();
    let mut peer = Peer::with_config(config);
    peer.router.start().await.unwrap();

    let router = peer.router.clone();
    let call = tokio::spawn(async move { router.send_request("ping", None).await });
    peer.recv().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.message.contains("30ms"), "{}", err.message);
}

#[tokio::test]
async fn test_pending_limit_rejects_excess() {
    let config = RouterConfig::builder().max_pending_requests(1).build();
    let mut peer = Peer::with_config(config);
    peer.router.start().await.unwrap();

    let router = peer.router.clone();
    let first = tokio::spawn(async move { router.send_request("a", None).await });
    let request = peer.recv().await;

    let err = peer.router.send_request("b", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Overloaded);

    peer.send_json(json!({"jsonrpc": "2.0", "id": request["id"], "result": null}))
        .await;
    assert_eq!(first.await.unwrap().unwrap(), Value::Null);
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unparseable_line_without_id() {
    let (logs, _guard) = CapturedLogs::install();
    let mut peer = Peer::started().await;

    peer.send_line("{not json").await;
    peer.expect_silence(Duration::from_millis(100)).await;

    assert_eq!(logs.at(Level::ERROR).len(), 1);
    assert!(peer.router.is_active());
}

#[tokio::test]
async fn test_unparseable_line_with_recoverable_id() {
    let mut peer = Peer::started().await;

    peer.send_line(r#"{"jsonrpc": "2.0", "id": 5, "method": "x", "#)
        .await;
    let response = peer.recv().await;
    assert_eq!(response["id"], json!(5));
    assert_eq!(response["error"]["code"], json!(-32700));
}

#[tokio::test]
async fn test_wrong_version_with_id() {
    let mut peer = Peer::started().await;

    peer.send_line(r#"{"id":7,"jsonrpc":"1.0"}"#).await;
    let response = peer.recv().await;
    assert_eq!(response["jsonrpc"], json!("2.0"));
    assert_eq!(response["id"], json!(7));
    assert_eq!(response["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_unaddressable_lines_are_dropped() {
    let mut peer = Peer::started().await;

    peer.send_line("[1, 2, 3]").await;
    peer.send_line(r#"{"jsonrpc":"1.0","method":"old"}"#).await;
    peer.send_line("   ").await;
    peer.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_malformed_envelope_with_id() {
    let mut peer = Peer::started().await;

    peer.send_line(r#"{"jsonrpc":"2.0","id":"q"}"#).await;
    let response = peer.recv().await;
    assert_eq!(response["id"], json!("q"));
    assert_eq!(response["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_oversized_line() {
    let config = RouterConfig::builder().max_message_size(64).build();
    let mut peer = Peer::with_config(config);
    peer.router.start().await.unwrap();

    let padding = "x".repeat(200);
    peer.send_line(&format!(
        r#"{{"jsonrpc":"2.0","id":9,"method":"big","params":"{padding}"}}"#
    ))
    .await;

    let response = peer.recv().await;
    assert_eq!(response["id"], json!(9));
    assert_eq!(response["error"]["code"], json!(-32600));
    assert!(
        response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("64 bytes")
    );
}

#[tokio::test]
async fn test_huge_line_is_rejected_and_reading_continues() {
    let config = RouterConfig::builder().max_message_size(64).build();
    let mut peer = Peer::with_config(config);
    peer.router.set_message_handler(echo_handler());
    peer.router.start().await.unwrap();

    let padding = "x".repeat(512 * 1024);
    peer.send_line(&format!(
        r#"{{"jsonrpc":"2.0","id":11,"method":"big","params":"{padding}"}}"#
    ))
    .await;
    peer.send_json(json!({"jsonrpc": "2.0", "id": 12, "method": "echo", "params": "small"}))
        .await;

    let rejected = peer.recv().await;
    assert_eq!(rejected["id"], json!(11));
    assert_eq!(rejected["error"]["code"], json!(-32600));
    assert_eq!(peer.recv().await["result"], json!("small"));
}

#[tokio::test]
async fn test_invalid_utf8_line_gets_parse_error() {
    let (logs, _guard) = CapturedLogs::install();
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());

    peer.send_bytes(b"{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"echo\",\"params\":\"\xff\"}")
        .await;
    let response = peer.recv().await;
    assert_eq!(response["id"], json!(4));
    assert_eq!(response["error"]["code"], json!(-32700));
    assert_eq!(logs.at(Level::ERROR).len(), 1);

    peer.send_bytes(b"\xfe\xfd").await;
    peer.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(logs.at(Level::ERROR).len(), 2);

    peer.send_json(json!({"jsonrpc": "2.0", "id": 5, "method": "echo", "params": "fine"}))
        .await;
    assert_eq!(peer.recv().await["result"], json!("fine"));
}

#[tokio::test]
async fn test_malformed_response_is_never_answered() {
    let (logs, _guard) = CapturedLogs::install();
    let mut peer = Peer::started().await;

    peer.send_line(r#"{"jsonrpc":"2.0","id":9,"error":"boom"}"#).await;
    peer.send_line(r#"{"jsonrpc":"2.0","id":9,"result":1,"error":{"code":1,"message":"m"}}"#)
        .await;
    peer.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(logs.at(Level::WARN).len(), 2);
}

#[tokio::test]
async fn test_malformed_response_fails_the_waiting_call() {
    let mut peer = Peer::started().await;

    let router = peer.router.clone();
    let call = tokio::spawn(async move { router.send_request("lookup", None).await });
    let outgoing = peer.recv().await;
    peer.send_json(json!({"jsonrpc": "2.0", "id": outgoing["id"], "error": 42}))
        .await;

    let err = tokio::time::timeout(RECV_TIMEOUT, call)
        .await
        .expect("call resolves without waiting for its timeout")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert_eq!(peer.router.pending_requests(), 0);
    peer.expect_silence(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_notification_fan_out_survives_failures() {
    let (logs, _guard) = CapturedLogs::install();
    let mut peer = Peer::started().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = seen.clone();
    peer.router.on_notification(
        "progress",
        notification_handler(move |_| {
            first.lock().push("first");
            Err(RpcError::internal("first handler failed"))
        }),
    );
    let second = seen.clone();
    peer.router.on_notification(
        "progress",
        notification_handler(move |n| {
            second.lock().push("second");
            assert_eq!(n.params, Some(json!({"pct": 50})));
            Ok(())
        }),
    );

    peer.send_json(json!({"jsonrpc": "2.0", "method": "progress", "params": {"pct": 50}}))
        .await;
    peer.expect_silence(Duration::from_millis(100)).await;

    assert_eq!(*seen.lock(), vec!["first", "second"]);
    assert_eq!(
        logs.at(Level::ERROR),
        vec!["Notification handler failed".to_string()]
    );
    assert!(peer.router.is_active());
}

#[tokio::test]
async fn test_off_notification() {
    let mut peer = Peer::started().await;
    let count = Arc::new(Mutex::new(0));

    let counter = count.clone();
    let handler = notification_handler(move |_| {
        *counter.lock() += 1;
        Ok(())
    });
    peer.router.on_notification("tick", handler.clone());

    peer.send_json(json!({"jsonrpc": "2.0", "method": "tick"})).await;
    settle().await;
    assert!(peer.router.off_notification("tick", &handler));
    assert!(!peer.router.off_notification("tick", &handler));

    peer.send_json(json!({"jsonrpc": "2.0", "method": "tick"})).await;
    settle().await;
    assert_eq!(*count.lock(), 1);
}

// ---------------------------------------------------------------------------
// Outbound helpers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_log_level_threshold() {
    let mut peer = Peer::started().await;
    peer.router.set_log_level(LogLevel::Warning);
    assert_eq!(peer.router.log_level(), LogLevel::Warning);

    peer.router.log(LogLevel::Info, "chatty", None).unwrap();
    peer.expect_silence(Duration::from_millis(50)).await;

    peer.router
        .log(LogLevel::Error, "broken", Some(json!({"file": "a.txt"})))
        .unwrap();
    assert_eq!(
        peer.recv().await,
        json!({
            "jsonrpc": "2.0",
            "method": LOGGING_METHOD,
            "params": {
                "level": "error",
                "logger": "linerpc",
                "data": {"file": "a.txt", "message": "broken"}
            }
        })
    );
}

#[tokio::test]
async fn test_progress_and_plain_notifications() {
    let mut peer = Peer::started().await;

    peer.router.send_progress("job-1", 2.0, Some(4.0)).unwrap();
    assert_eq!(
        peer.recv().await,
        json!({
            "jsonrpc": "2.0",
            "method": PROGRESS_METHOD,
            "params": {"progressToken": "job-1", "progress": 2.0, "total": 4.0}
        })
    );

    peer.router
        .send_notification("custom/event", Some(json!({"k": "v"})))
        .unwrap();
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "method": "custom/event", "params": {"k": "v"}})
    );

    peer.router.send_notification("bare", None).unwrap();
    assert_eq!(peer.recv().await, json!({"jsonrpc": "2.0", "method": "bare"}));
}

#[tokio::test]
async fn test_send_response_directly() {
    let mut peer = Peer::started().await;

    peer.router
        .send_response(RequestId::Number(3), Ok(json!("done")))
        .unwrap();
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 3, "result": "done"})
    );

    peer.router
        .send_response(
            RequestId::from("r"),
            Err(linerpc::JsonRpcError::invalid_params("bad")),
        )
        .unwrap();
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": "r", "error": {"code": -32602, "message": "bad"}})
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_is_idempotent() {
    let peer = Peer::new();
    assert_eq!(peer.router.state(), RouterState::Stopped);
    assert!(!peer.router.is_active());

    peer.router.start().await.unwrap();
    peer.router.start().await.unwrap();
    assert_eq!(peer.router.state(), RouterState::Running);
}

#[tokio::test]
async fn test_stop_rejects_pending_requests() {
    let mut peer = Peer::started().await;

    let a = {
        let router = peer.router.clone();
        tokio::spawn(async move { router.send_request("a", None).await })
    };
    let b = {
        let router = peer.router.clone();
        tokio::spawn(async move { router.send_request("b", None).await })
    };
    peer.recv().await;
    peer.recv().await;
    assert_eq!(peer.router.pending_requests(), 2);

    peer.router.stop().await;
    let err_a = a.await.unwrap().unwrap_err();
    let err_b = b.await.unwrap().unwrap_err();
    assert!(err_a.is_stopped());
    assert_eq!(err_a.message, err_b.message);
    assert_eq!(err_a.message, "Router stopped");
    assert_eq!(peer.router.pending_requests(), 0);
    assert!(!peer.router.is_active());

    // Second stop is a no-op
    peer.router.stop().await;
    assert_eq!(peer.router.state(), RouterState::Stopped);
}

#[tokio::test]
async fn test_writes_after_stop_are_dropped() {
    let mut peer = Peer::started().await;
    peer.router.stop().await;

    peer.router.send_notification("late", None).unwrap();
    peer.router.log(LogLevel::Emergency, "late", None).unwrap();
    peer.expect_silence(Duration::from_millis(50)).await;

    let err = peer.router.send_request("late", None).await.unwrap_err();
    assert!(err.is_stopped());
}

#[tokio::test]
async fn test_restart_keeps_handlers() {
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());
    let ticks = Arc::new(Mutex::new(0));
    let counter = ticks.clone();
    peer.router.on_notification(
        "tick",
        notification_handler(move |_| {
            *counter.lock() += 1;
            Ok(())
        }),
    );

    peer.router.stop().await;
    peer.router.start().await.unwrap();

    peer.send_json(json!({"jsonrpc": "2.0", "method": "tick"})).await;
    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": "again"}))
        .await;
    assert_eq!(peer.recv().await["result"], json!("again"));
    assert_eq!(*ticks.lock(), 1);
}

#[tokio::test]
async fn test_lines_sent_while_stopped_are_read_after_restart() {
    let mut peer = Peer::new();
    peer.router.set_message_handler(echo_handler());

    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": "queued"}))
        .await;
    peer.expect_silence(Duration::from_millis(50)).await;

    peer.router.start().await.unwrap();
    assert_eq!(peer.recv().await["result"], json!("queued"));
}

#[tokio::test]
async fn test_end_of_input_stops_router() {
    let mut peer = Peer::started().await;

    let router = peer.router.clone();
    let call = tokio::spawn(async move { router.send_request("orphan", None).await });
    peer.recv().await;

    peer.close_input();
    assert!(call.await.unwrap().unwrap_err().is_stopped());
    tokio::time::timeout(RECV_TIMEOUT, peer.router.stopped())
        .await
        .expect("router stops on its own");
    assert_eq!(peer.router.state(), RouterState::Stopped);
    assert_eq!(peer.router.pending_requests(), 0);

    let err = peer.router.start().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Transport);
}

#[tokio::test]
async fn test_end_of_input_answers_requests_in_flight() {
    let mut peer = Peer::started().await;
    peer.router.set_message_handler(echo_handler());

    peer.send_json(json!({"jsonrpc": "2.0", "id": 1, "method": "sleep", "params": {"ms": 30}}))
        .await;
    peer.send_json(json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": "now"}))
        .await;
    peer.close_input();

    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 2, "result": "now"})
    );
    assert_eq!(
        peer.recv().await,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"slept": 30}})
    );
    tokio::time::timeout(RECV_TIMEOUT, peer.router.stopped())
        .await
        .expect("router stops once responses are written");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_of_input_right_after_request_still_answers() {
    for round in 0..20 {
        let mut peer = Peer::started().await;
        peer.router.set_message_handler(echo_handler());

        peer.send_json(json!({"jsonrpc": "2.0", "id": round, "method": "echo", "params": round}))
            .await;
        peer.close_input();

        assert_eq!(peer.recv().await["result"], json!(round));
        peer.router.stop().await;
    }
}

#[tokio::test]
async fn test_calls_made_after_end_of_input_fail_fast() {
    let mut peer = Peer::started().await;
    let router = peer.router.downgrade();
    peer.router.set_message_handler(handler_fn(move |_request| {
        let router = router.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let router = router.upgrade().ok_or_else(RpcError::stopped)?;
            router.send_request("too/late", None).await
        }
    }));

    peer.send_json(json!({"jsonrpc": "2.0", "id": 3, "method": "relay"}))
        .await;
    peer.close_input();

    let response = peer.recv().await;
    assert_eq!(response["id"], json!(3));
    assert_eq!(response["error"]["message"], json!("Router stopped"));
}

#[tokio::test]
async fn test_weak_handle_lets_router_drop() {
    let peer = Peer::new();
    let weak = peer.router.downgrade();
    let handle = weak.clone();
    peer.router.set_message_handler(handler_fn(move |_request| {
        let router = handle.clone();
        async move {
            let router = router.upgrade().ok_or_else(RpcError::stopped)?;
            router.send_request("back", None).await
        }
    }));
    peer.router.start().await.unwrap();
    peer.router.stop().await;

    assert!(weak.upgrade().is_some());
    drop(peer);
    assert!(weak.upgrade().is_none());
}

/// Router whose peer never reads what it writes.
fn router_with_stalled_peer(flush_timeout: Duration) -> (Router, DuplexStream, DuplexStream) {
    let (router_in, to_router) = tokio::io::duplex(1024);
    let (router_out, from_router) = tokio::io::duplex(64);
    let config = RouterConfig::builder().flush_timeout(flush_timeout).build();
    (Router::new(router_in, router_out, config), to_router, from_router)
}

#[tokio::test]
async fn test_stop_gives_up_on_a_peer_that_stopped_reading() {
    let (router, _to_router, _from_router) = router_with_stalled_peer(Duration::from_millis(100));
    router.start().await.unwrap();
    for i in 0..100 {
        router.log(LogLevel::Error, format!("queued message {i}"), None).unwrap();
    }
    settle().await;

    tokio::time::timeout(RECV_TIMEOUT, router.stop())
        .await
        .expect("stop finishes despite the stalled peer");
    assert_eq!(router.state(), RouterState::Stopped);

    router.start().await.expect("stream halves were recovered");
    assert!(router.is_active());
}

#[tokio::test]
async fn test_cancelled_stop_keeps_the_stream() {
    let (router, _to_router, from_router) = router_with_stalled_peer(Duration::from_secs(30));
    router.start().await.unwrap();
    for i in 0..100 {
        router.log(LogLevel::Error, format!("queued message {i}"), None).unwrap();
    }
    settle().await;

    let first = tokio::time::timeout(Duration::from_millis(20), router.stop()).await;
    assert!(first.is_err(), "writer is still blocked");
    assert_eq!(router.state(), RouterState::Stopped);

    let mut lines = BufReader::new(from_router).lines();
    let mut queued = 0;
    while queued < 100 {
        let line = tokio::time::timeout(RECV_TIMEOUT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(line.contains(&format!("queued message {queued}")));
        queued += 1;
    }

    tokio::time::timeout(RECV_TIMEOUT, router.stop())
        .await
        .expect("second stop completes once the peer reads");
    router.start().await.expect("writer was not lost");
    router.send_notification("after/restart", None).unwrap();

    let line = tokio::time::timeout(RECV_TIMEOUT, lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(line.contains("after/restart"));
}
