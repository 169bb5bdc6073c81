//! Veridian node daemon.
//!
//! Wires the secure message queue engine and the worker-dispatch server
//! together: inbound queue messages are handed to a worker via dispatch,
//! and workers reach orchestrator-only capabilities (ledger lookups,
//! callback delivery, queue sends) through the reverse channel.

mod config;
mod keys;
mod ledger;
mod storage;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use veridian_dispatch::{DispatchServer, WorkerRequest};
use veridian_ipc::{LedgerClient, Receiver};
use veridian_mq::{MqEngine, MqEngineConfig, MqEvent};

use crate::config::DaemonConfig;
use crate::ledger::DirectoryLedger;
use crate::storage::SqliteStore;
use crate::transport::TcpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("veridiand.toml"));
    let config = DaemonConfig::from_path(&config_path)
        .with_context(|| format!("cannot load config from {}", config_path.display()))?;
    log::info!("starting veridiand: node={} role={:?}", config.node_id, config.role);

    let node_keys = keys::load_or_create(&config.data_dir).context("cannot load key material")?;
    let store = Arc::new(
        SqliteStore::open(&config.data_dir.join("veridian.db"))
            .context("cannot open durable store")?,
    );
    let ledger = Arc::new(
        DirectoryLedger::from_hex_keys(&config.ledger.node_keys)
            .context("invalid ledger key directory")?,
    );

    let engine = Arc::new(MqEngine::new(
        Arc::new(TcpTransport::new(config.node_id.clone())),
        ledger.clone(),
        store.clone(),
        node_keys.signing_key,
        node_keys.decrypt_key,
        MqEngineConfig { dedup_ttl: config.mq.dedup_ttl() },
    ));

    // Accept queue traffic immediately; inbound messages buffer in the
    // engine until the ledger is marked ready below.
    let mq_listener = TcpListener::bind(&config.mq.listen)
        .await
        .with_context(|| format!("cannot bind message queue listener on {}", config.mq.listen))?;
    tokio::spawn(transport::run_mq_listener(
        mq_listener,
        Arc::clone(&engine),
        config.mq.max_message_size,
    ));

    // The static key directory has no sync phase; readiness follows
    // startup recovery directly.
    ledger.set_ready(true);
    engine.recover().await.context("startup recovery failed")?;
    engine.on_ledger_ready().await;

    let (dispatch, worker_requests) = DispatchServer::new(config.dispatch.to_dispatch_config());
    let dispatch_listener = TcpListener::bind(&config.dispatch.listen)
        .await
        .with_context(|| format!("cannot bind dispatch listener on {}", config.dispatch.listen))?;
    tokio::spawn(Arc::clone(&dispatch).serve(dispatch_listener));

    tokio::spawn(drain_worker_requests(worker_requests, Arc::clone(&engine), ledger.clone()));
    tokio::spawn(forward_queue_events(engine.subscribe(), Arc::clone(&dispatch)));

    tokio::signal::ctrl_c().await.context("cannot listen for shutdown signal")?;
    log::info!("shutdown signal received");
    engine.close();
    Ok(())
}

/// Hands each verified queue message to a worker; failures are logged,
/// the message itself has already reached its terminal state in the
/// engine.
async fn forward_queue_events(
    mut events: broadcast::Receiver<MqEvent>,
    dispatch: Arc<DispatchServer>,
) {
    loop {
        match events.recv().await {
            Ok(MqEvent::Message(body)) => {
                let args = serde_json::json!({ "message": body });
                if let Err(err) =
                    dispatch.dispatch("proxy", "handleMessageFromQueue", args, None).await
                {
                    log::error!("cannot hand queue message to a worker: {err}");
                }
            }
            Ok(MqEvent::Error(err)) => {
                log::error!("message queue error: {err}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("queue event stream lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn drain_worker_requests(
    mut requests: mpsc::Receiver<WorkerRequest>,
    engine: Arc<MqEngine>,
    ledger: Arc<DirectoryLedger>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::MqSend { args } => handle_mq_send(&engine, args).await,
            WorkerRequest::LedgerCall { fn_name, args } => {
                handle_ledger_call(&ledger, &fn_name, &args).await;
            }
            WorkerRequest::CallbackDelivery { args } => {
                // Callback delivery to external parties is a worker-side
                // HTTP concern; the orchestrator only records the request.
                log::info!("callback delivery requested: {args}");
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct MqSendArgs {
    receivers: Vec<Receiver>,
    message: JsonValue,
}

async fn handle_mq_send(engine: &MqEngine, args: JsonValue) {
    let parsed: MqSendArgs = match serde_json::from_value(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::error!("malformed queue send request from worker: {err}");
            return;
        }
    };
    if let Err(err) = engine.send(&parsed.receivers, &parsed.message).await {
        log::error!("queue send failed: {err}");
    }
}

async fn handle_ledger_call(ledger: &DirectoryLedger, fn_name: &str, args: &JsonValue) {
    if fn_name != "GetNodePublicKey" {
        log::warn!("unsupported ledger call from worker: {fn_name}");
        return;
    }
    let node_id = args.get("node_id").and_then(JsonValue::as_str).unwrap_or_default();
    match ledger.node_public_key(node_id).await {
        Ok(key) => log::debug!("ledger key for {node_id}: {}", hex::encode(key)),
        Err(err) => log::warn!("ledger call for {node_id} failed: {err}"),
    }
}
