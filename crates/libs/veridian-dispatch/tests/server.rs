//! End-to-end dispatch tests over real TCP connections, with workers
//! played by the test.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use veridian_dispatch::codec::{read_frame, write_frame};
use veridian_dispatch::frames::wire_error_value;
use veridian_dispatch::{
    DispatchConfig, DispatchError, DispatchServer, MasterFrame, WorkerFrame, WorkerRequest,
};
use veridian_ipc::AppError;

async fn start(
    config: DispatchConfig,
) -> (Arc<DispatchServer>, mpsc::Receiver<WorkerRequest>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (server, requests) = DispatchServer::new(config);
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, requests, addr)
}

async fn wait_for_workers(server: &DispatchServer, count: usize) {
    for _ in 0..200 {
        if server.worker_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker pool never reached {count}");
}

struct TestWorker {
    stream: TcpStream,
}

impl TestWorker {
    async fn join(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        write_frame(&mut stream, &WorkerFrame::Subscribe).await.expect("subscribe");
        Self { stream }
    }

    async fn recv(&mut self) -> MasterFrame {
        read_frame(&mut self.stream).await.expect("master frame")
    }

    async fn send(&mut self, frame: &WorkerFrame) {
        write_frame(&mut self.stream, frame).await.expect("worker frame");
    }

    /// The four control frames replayed on every subscribe.
    async fn drain_replay(&mut self) -> Vec<MasterFrame> {
        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(self.recv().await);
        }
        frames
    }
}

#[tokio::test]
async fn results_reach_their_own_callers_even_when_answered_out_of_order() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;
    wait_for_workers(&server, 1).await;

    let worker_task = tokio::spawn(async move {
        let mut calls = Vec::new();
        for _ in 0..8 {
            match worker.recv().await {
                MasterFrame::FunctionCall { correlation_id, args, .. } => {
                    calls.push((correlation_id, args));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        calls.reverse();
        for (correlation_id, args) in calls {
            let parsed: JsonValue = serde_json::from_str(&args).expect("args json");
            worker
                .send(&WorkerFrame::Result {
                    correlation_id,
                    result: Some(parsed),
                    error: None,
                })
                .await;
        }
    });

    let mut callers = Vec::new();
    for seq in 0..8u32 {
        let server = Arc::clone(&server);
        callers.push(tokio::spawn(async move {
            let result = server
                .dispatch("identity", "updateIal", json!({ "seq": seq }), None)
                .await
                .expect("dispatch");
            assert_eq!(result, json!({ "seq": seq }));
        }));
    }
    for caller in callers {
        caller.await.expect("caller");
    }
    worker_task.await.expect("worker");
}

#[tokio::test]
async fn round_robin_cycles_the_pool_and_explicit_index_pins_a_worker() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut echo_tasks = Vec::new();
    for idx in 0..3u64 {
        let mut worker = TestWorker::join(addr).await;
        wait_for_workers(&server, idx as usize + 1).await;
        echo_tasks.push(tokio::spawn(async move {
            worker.drain_replay().await;
            loop {
                let frame: MasterFrame = match read_frame(&mut worker.stream).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if let MasterFrame::FunctionCall { correlation_id, .. } = frame {
                    worker
                        .send(&WorkerFrame::Result {
                            correlation_id,
                            result: Some(json!({ "worker": idx })),
                            error: None,
                        })
                        .await;
                }
            }
        }));
    }

    let mut order = Vec::new();
    for _ in 0..6 {
        let result = server
            .dispatch("common", "createRequest", json!({}), None)
            .await
            .expect("dispatch");
        order.push(result["worker"].as_u64().expect("worker index"));
    }
    assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(server.round_robin_position(), 0, "six dispatches wrap a pool of three");

    for _ in 0..2 {
        let result = server
            .dispatch("common", "createRequest", json!({}), Some(1))
            .await
            .expect("pinned dispatch");
        assert_eq!(result["worker"], 1);
    }
    assert_eq!(server.round_robin_position(), 0, "explicit selection leaves the counter alone");

    let err = server
        .dispatch("common", "createRequest", json!({}), Some(7))
        .await
        .expect_err("out of range");
    assert!(matches!(err, DispatchError::NoSuchWorker { index: 7 }));
}

#[tokio::test]
async fn late_subscriber_replays_current_control_values_only() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    server.set_signing_endpoint("https://signer.internal/v1".to_string()).await;
    server.set_signing_endpoint("https://signer.internal/v2".to_string()).await;
    let mut endpoints = BTreeMap::new();
    endpoints.insert("accessor_sign".to_string(), "https://cb.internal/accessor".to_string());
    server.set_callback_endpoints(endpoints.clone()).await;
    assert_eq!(server.reinit_keys().await, 1);
    assert_eq!(server.reinit_keys().await, 2);
    server.invalidate_schema("svc-bank-statement".to_string()).await;

    let mut worker = TestWorker::join(addr).await;
    let frames = worker.drain_replay().await;
    assert_eq!(
        frames[0],
        MasterFrame::SigningEndpointChanged { endpoint: "https://signer.internal/v2".to_string() }
    );
    assert_eq!(frames[1], MasterFrame::CallbackEndpointsChanged { endpoints });
    assert_eq!(frames[2], MasterFrame::KeysReinitialized { epoch: 2 });
    let schema_ids: BTreeSet<String> = ["svc-bank-statement".to_string()].into();
    assert_eq!(frames[3], MasterFrame::SchemaCacheInvalidated { schema_ids });

    let extra = tokio::time::timeout(Duration::from_millis(100), worker.recv()).await;
    assert!(extra.is_err(), "nothing beyond the four replay frames");
}

#[tokio::test]
async fn control_changes_are_pushed_to_connected_workers() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;
    wait_for_workers(&server, 1).await;

    server.set_signing_endpoint("https://signer.internal/rotated".to_string()).await;
    assert_eq!(
        worker.recv().await,
        MasterFrame::SigningEndpointChanged {
            endpoint: "https://signer.internal/rotated".to_string()
        }
    );

    server.invalidate_schema("svc-utility-bill".to_string()).await;
    let schema_ids: BTreeSet<String> = ["svc-utility-bill".to_string()].into();
    assert_eq!(worker.recv().await, MasterFrame::SchemaCacheInvalidated { schema_ids });
}

#[tokio::test]
async fn calls_wait_for_a_worker_to_appear_and_then_complete() {
    let config =
        DispatchConfig { retry_interval: Duration::from_millis(50), ..Default::default() };
    let (server, _requests, addr) = start(config).await;

    let call = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server.dispatch("rp", "getDataFromAS", json!({ "request_id": "req-9" }), None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!call.is_finished(), "call keeps retrying while the pool is empty");

    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;
    loop {
        let frame: MasterFrame = read_frame(&mut worker.stream).await.expect("frame");
        if let MasterFrame::FunctionCall { correlation_id, args, .. } = frame {
            let parsed: JsonValue = serde_json::from_str(&args).expect("args json");
            worker
                .send(&WorkerFrame::Result { correlation_id, result: Some(parsed), error: None })
                .await;
            break;
        }
    }

    let result = call.await.expect("join").expect("dispatch");
    assert_eq!(result, json!({ "request_id": "req-9" }));
}

#[tokio::test]
async fn bounded_retry_gives_up_when_no_worker_appears() {
    let config = DispatchConfig {
        retry_interval: Duration::from_millis(10),
        max_retry_attempts: Some(3),
        ..Default::default()
    };
    let (server, _requests, _addr) = start(config).await;
    let err = server
        .dispatch("as", "processDataForRP", json!({}), None)
        .await
        .expect_err("no workers");
    assert!(matches!(err, DispatchError::NoWorkerAvailable { attempts: 3 }));
}

#[tokio::test]
async fn remote_errors_are_reconstructed_as_structured_app_errors() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;
    wait_for_workers(&server, 1).await;

    let app = AppError::new(35001, "identity not found").with_cause("ledger query miss");
    let structured = wire_error_value(&app);
    let worker_task = tokio::spawn(async move {
        for error in [structured, json!({ "message": "exploded without structure" })] {
            match worker.recv().await {
                MasterFrame::FunctionCall { correlation_id, .. } => {
                    worker
                        .send(&WorkerFrame::Result {
                            correlation_id,
                            result: None,
                            error: Some(error),
                        })
                        .await;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    });

    let err = server
        .dispatch("identity", "getIdentityInfo", json!({}), None)
        .await
        .expect_err("structured failure");
    match err {
        DispatchError::Remote(received) => assert_eq!(received, app),
        other => panic!("expected structured error, got {other:?}"),
    }

    let err = server
        .dispatch("identity", "getIdentityInfo", json!({}), None)
        .await
        .expect_err("raw failure");
    match err {
        DispatchError::RemoteRaw(payload) => {
            assert_eq!(payload["message"], "exploded without structure");
        }
        other => panic!("expected raw error, got {other:?}"),
    }
    worker_task.await.expect("worker");
}

#[tokio::test]
async fn unanswered_calls_resolve_through_the_timeout_bound() {
    let config =
        DispatchConfig { call_timeout: Some(Duration::from_millis(100)), ..Default::default() };
    let (server, _requests, addr) = start(config).await;
    let worker = TestWorker::join(addr).await;
    wait_for_workers(&server, 1).await;

    // The worker holds the call open and never answers.
    let err = server
        .dispatch("idp", "requestChallengeAndCreateResponse", json!({}), None)
        .await
        .expect_err("timeout");
    assert!(matches!(err, DispatchError::CallTimeout { .. }));
    drop(worker);
}

#[tokio::test]
async fn unknown_functions_are_rejected_before_worker_selection() {
    // No workers connected: a call that reached selection would hang.
    let (server, _requests, _addr) = start(DispatchConfig::default()).await;
    let err = server
        .dispatch("identity", "doesNotExist", json!({}), None)
        .await
        .expect_err("unknown function");
    assert!(matches!(err, DispatchError::UnknownFunction { .. }));

    let err = server
        .dispatch("bogus", "updateIal", json!({}), None)
        .await
        .expect_err("unknown namespace");
    assert!(matches!(err, DispatchError::UnknownFunction { .. }));
}

#[tokio::test]
async fn reverse_channel_requests_reach_the_orchestrator_in_order() {
    let (_server, mut requests, addr) = start(DispatchConfig::default()).await;
    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;

    worker
        .send(&WorkerFrame::LedgerCall {
            fn_name: "GetNodePublicKey".to_string(),
            args: json!({ "node_id": "idp-1" }),
        })
        .await;
    worker.send(&WorkerFrame::CallbackDelivery { args: json!({ "url": "https://cb" }) }).await;
    worker.send(&WorkerFrame::MqSend { args: json!({ "receiver": "rp-2" }) }).await;

    assert_eq!(
        requests.recv().await,
        Some(WorkerRequest::LedgerCall {
            fn_name: "GetNodePublicKey".to_string(),
            args: json!({ "node_id": "idp-1" }),
        })
    );
    assert_eq!(
        requests.recv().await,
        Some(WorkerRequest::CallbackDelivery { args: json!({ "url": "https://cb" }) })
    );
    assert_eq!(
        requests.recv().await,
        Some(WorkerRequest::MqSend { args: json!({ "receiver": "rp-2" }) })
    );
}

#[tokio::test]
async fn disconnects_shrink_the_pool() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let first = TestWorker::join(addr).await;
    wait_for_workers(&server, 1).await;
    let second = TestWorker::join(addr).await;
    wait_for_workers(&server, 2).await;

    drop(first);
    wait_for_workers(&server, 1).await;
    drop(second);
    wait_for_workers(&server, 0).await;
}

#[tokio::test]
async fn connections_that_skip_subscribe_never_join_the_pool() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    write_frame(&mut stream, &WorkerFrame::MqSend { args: json!({}) })
        .await
        .expect("premature frame");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.worker_count(), 0);
}

#[tokio::test]
async fn embedded_errors_in_call_arguments_arrive_transport_safe() {
    let (server, _requests, addr) = start(DispatchConfig::default()).await;
    let mut worker = TestWorker::join(addr).await;
    worker.drain_replay().await;
    wait_for_workers(&server, 1).await;

    let app = AppError::new(10500, "callback target unreachable");
    let args = json!({ "error": serde_json::to_value(&app).expect("app error json") });
    let worker_task = tokio::spawn(async move {
        match worker.recv().await {
            MasterFrame::FunctionCall { correlation_id, args, .. } => {
                let parsed: JsonValue = serde_json::from_str(&args).expect("args json");
                assert_eq!(parsed["error"]["kind"], "app_error");
                assert_eq!(parsed["error"]["code"], 10500);
                worker
                    .send(&WorkerFrame::Result {
                        correlation_id,
                        result: Some(JsonValue::Null),
                        error: None,
                    })
                    .await;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    });

    let result = server
        .dispatch("proxy", "handleMessageFromQueue", args, None)
        .await
        .expect("dispatch");
    assert!(result.is_null());
    worker_task.await.expect("worker");
}
