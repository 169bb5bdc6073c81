//! Worker-pool listener and call routing.
//!
//! Workers connect over TCP, subscribe, and stay in an ordered pool.
//! Each dispatched call goes to exactly one worker — an explicit index
//! or the next round-robin slot — and completes through a correlation
//! table mapping the call's random id to a oneshot completion handle, so
//! results can never cross-wire between concurrent calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use serde_json::Value as JsonValue;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::catalog::FunctionCatalog;
use crate::codec::{read_frame, write_frame};
use crate::control::ControlState;
use crate::error::DispatchError;
use crate::frames::{self, MasterFrame, WorkerFrame};

const WORKER_CHANNEL_CAPACITY: usize = 32;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Default delay between retries when no worker is connected. A fixed
/// interval with no backoff growth: the pool is small and trusted, and
/// availability wins over latency here.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry_interval: Duration,
    /// `None` retries indefinitely, matching the platform's historical
    /// behavior for a small trusted pool.
    pub max_retry_attempts: Option<u32>,
    /// `None` waits forever for a result. A call routed to a crashed
    /// worker only resolves through this bound.
    pub call_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { retry_interval: DEFAULT_RETRY_INTERVAL, max_retry_attempts: None, call_timeout: None }
    }
}

/// Reverse-channel requests from workers. The orchestrator's handlers
/// for these are external collaborators; the server only surfaces them.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    LedgerCall { fn_name: String, args: JsonValue },
    CallbackDelivery { args: JsonValue },
    MqSend { args: JsonValue },
}

type CallOutcome = Result<JsonValue, DispatchError>;

struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<MasterFrame>,
}

struct PoolState {
    workers: Vec<WorkerHandle>,
    counter: usize,
    control: ControlState,
    next_worker_id: u64,
}

pub struct DispatchServer {
    pool: Mutex<PoolState>,
    pending: Mutex<HashMap<String, oneshot::Sender<CallOutcome>>>,
    requests: mpsc::Sender<WorkerRequest>,
    catalog: FunctionCatalog,
    config: DispatchConfig,
}

impl DispatchServer {
    /// Builds the server and the receiver for reverse-channel requests.
    pub fn new(config: DispatchConfig) -> (Arc<Self>, mpsc::Receiver<WorkerRequest>) {
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let server = Arc::new(Self {
            pool: Mutex::new(PoolState {
                workers: Vec::new(),
                counter: 0,
                control: ControlState::default(),
                next_worker_id: 0,
            }),
            pending: Mutex::new(HashMap::new()),
            requests,
            catalog: FunctionCatalog::new(),
            config,
        });
        (server, requests_rx)
    }

    /// Accept loop; runs until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        log::info!("dispatch server listening on {:?}", listener.local_addr().ok());
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(server.handle_worker(stream));
                }
                Err(err) => {
                    log::warn!("dispatch accept failed: {err}");
                }
            }
        }
    }

    /// Routes one call to one worker and waits for its correlated result.
    pub async fn dispatch(
        &self,
        namespace: &str,
        fn_name: &str,
        args: JsonValue,
        worker_index: Option<usize>,
    ) -> Result<JsonValue, DispatchError> {
        if !self.catalog.contains(namespace, fn_name) {
            return Err(DispatchError::UnknownFunction {
                namespace: namespace.to_string(),
                fn_name: fn_name.to_string(),
            });
        }
        let worker_tx = self.wait_for_worker(namespace, fn_name, worker_index).await?;

        let mut args = args;
        frames::rewrite_embedded_errors(&mut args);
        let args_payload =
            serde_json::to_string(&args).map_err(|err| DispatchError::Encode(err.to_string()))?;

        let correlation_id = random_correlation_id();
        let (result_tx, result_rx) = oneshot::channel();
        lock(&self.pending).insert(correlation_id.clone(), result_tx);
        log::debug!("dispatching {namespace}.{fn_name} as {correlation_id}");

        let frame = MasterFrame::FunctionCall {
            namespace: namespace.to_string(),
            fn_name: fn_name.to_string(),
            correlation_id: correlation_id.clone(),
            args: args_payload,
        };
        if worker_tx.send(frame).await.is_err() {
            lock(&self.pending).remove(&correlation_id);
            return Err(DispatchError::ChannelClosed);
        }

        match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, result_rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(DispatchError::ChannelClosed),
                Err(_) => {
                    lock(&self.pending).remove(&correlation_id);
                    Err(DispatchError::CallTimeout { correlation_id })
                }
            },
            None => result_rx.await.unwrap_or(Err(DispatchError::ChannelClosed)),
        }
    }

    /// Pushes a new accessor-signing endpoint to every worker.
    pub async fn set_signing_endpoint(&self, endpoint: String) {
        log::debug!("control: signing endpoint changed");
        let (frame, targets) = {
            let mut pool = lock(&self.pool);
            pool.control.signing_endpoint = endpoint.clone();
            (MasterFrame::SigningEndpointChanged { endpoint }, worker_channels(&pool))
        };
        push_to_workers(frame, targets).await;
    }

    /// Pushes a new callback-endpoint map to every worker.
    pub async fn set_callback_endpoints(&self, endpoints: BTreeMap<String, String>) {
        log::debug!("control: callback endpoints changed");
        let (frame, targets) = {
            let mut pool = lock(&self.pool);
            pool.control.callback_endpoints = endpoints.clone();
            (MasterFrame::CallbackEndpointsChanged { endpoints }, worker_channels(&pool))
        };
        push_to_workers(frame, targets).await;
    }

    /// Tells every worker to reload its key material; returns the new epoch.
    pub async fn reinit_keys(&self) -> u64 {
        log::debug!("control: key material reinitialized");
        let (epoch, frame, targets) = {
            let mut pool = lock(&self.pool);
            pool.control.key_reinit_epoch += 1;
            let epoch = pool.control.key_reinit_epoch;
            (epoch, MasterFrame::KeysReinitialized { epoch }, worker_channels(&pool))
        };
        push_to_workers(frame, targets).await;
        epoch
    }

    /// Marks a data-schema cache entry invalid on every worker.
    pub async fn invalidate_schema(&self, schema_id: String) {
        log::debug!("control: schema cache invalidated for {schema_id}");
        let (frame, targets) = {
            let mut pool = lock(&self.pool);
            pool.control.invalidated_schema_ids.insert(schema_id);
            let schema_ids = pool.control.invalidated_schema_ids.clone();
            (MasterFrame::SchemaCacheInvalidated { schema_ids }, worker_channels(&pool))
        };
        push_to_workers(frame, targets).await;
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.pool).workers.len()
    }

    /// Position of the shared round-robin counter; advances by exactly
    /// one per non-explicit dispatch, wrapping modulo the pool size.
    pub fn round_robin_position(&self) -> usize {
        lock(&self.pool).counter
    }

    pub fn control_state(&self) -> ControlState {
        lock(&self.pool).control.clone()
    }

    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    async fn handle_worker(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, writer) = stream.into_split();
        match read_frame::<_, WorkerFrame>(&mut reader).await {
            Ok(WorkerFrame::Subscribe) => {}
            Ok(_) => {
                log::warn!("worker sent frames before subscribing, dropping connection");
                return;
            }
            Err(err) => {
                log::warn!("worker handshake failed: {err}");
                return;
            }
        }

        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let (worker_id, replay) = {
            let mut pool = lock(&self.pool);
            let worker_id = pool.next_worker_id;
            pool.next_worker_id += 1;
            pool.workers.push(WorkerHandle { id: worker_id, tx: tx.clone() });
            (worker_id, pool.control.replay_frames())
        };
        log::info!("worker {worker_id} subscribed");

        // Late joiners converge by replaying the current control values
        // before anything else is written on this channel.
        for frame in replay {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        let writer_task = tokio::spawn(write_loop(worker_id, writer, rx));

        loop {
            match read_frame::<_, WorkerFrame>(&mut reader).await {
                Ok(frame) => self.handle_worker_frame(worker_id, frame).await,
                Err(err) => {
                    if err.kind() != std::io::ErrorKind::UnexpectedEof {
                        log::warn!("worker {worker_id} read error: {err}");
                    }
                    break;
                }
            }
        }

        lock(&self.pool).workers.retain(|worker| worker.id != worker_id);
        drop(tx);
        let _ = writer_task.await;
        log::info!("worker {worker_id} disconnected, {} in pool", self.worker_count());
    }

    async fn handle_worker_frame(&self, worker_id: u64, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Subscribe => {
                log::warn!("worker {worker_id} re-subscribed, ignoring");
            }
            WorkerFrame::Result { correlation_id, result, error } => {
                self.complete_call(&correlation_id, result, error);
            }
            WorkerFrame::LedgerCall { fn_name, args } => {
                let _ = self.requests.send(WorkerRequest::LedgerCall { fn_name, args }).await;
            }
            WorkerFrame::CallbackDelivery { args } => {
                let _ = self.requests.send(WorkerRequest::CallbackDelivery { args }).await;
            }
            WorkerFrame::MqSend { args } => {
                let _ = self.requests.send(WorkerRequest::MqSend { args }).await;
            }
        }
    }

    fn complete_call(
        &self,
        correlation_id: &str,
        result: Option<JsonValue>,
        error: Option<JsonValue>,
    ) {
        let Some(sender) = lock(&self.pending).remove(correlation_id) else {
            log::debug!("no pending call for result {correlation_id}");
            return;
        };
        let outcome = match error {
            Some(payload) if !payload.is_null() => {
                Err(match frames::reconstruct_app_error(&payload) {
                    Some(app) => DispatchError::Remote(app),
                    None => DispatchError::RemoteRaw(payload),
                })
            }
            _ => Ok(result.unwrap_or(JsonValue::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn wait_for_worker(
        &self,
        namespace: &str,
        fn_name: &str,
        worker_index: Option<usize>,
    ) -> Result<mpsc::Sender<MasterFrame>, DispatchError> {
        let mut attempts = 0u32;
        loop {
            let selected = {
                let mut pool = lock(&self.pool);
                if pool.workers.is_empty() {
                    None
                } else if let Some(index) = worker_index {
                    if index >= pool.workers.len() {
                        return Err(DispatchError::NoSuchWorker { index });
                    }
                    Some(pool.workers[index].tx.clone())
                } else {
                    let index = pool.counter % pool.workers.len();
                    pool.counter = (pool.counter + 1) % pool.workers.len();
                    Some(pool.workers[index].tx.clone())
                }
            };
            if let Some(tx) = selected {
                return Ok(tx);
            }
            attempts = attempts.saturating_add(1);
            if let Some(max) = self.config.max_retry_attempts {
                if attempts >= max {
                    return Err(DispatchError::NoWorkerAvailable { attempts });
                }
            }
            log::info!(
                "no worker connected, retrying {namespace}.{fn_name} in {:?}",
                self.config.retry_interval
            );
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}

async fn write_loop(
    worker_id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<MasterFrame>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            log::warn!("write to worker {worker_id} failed: {err}");
            break;
        }
    }
}

fn worker_channels(pool: &PoolState) -> Vec<mpsc::Sender<MasterFrame>> {
    pool.workers.iter().map(|worker| worker.tx.clone()).collect()
}

async fn push_to_workers(frame: MasterFrame, targets: Vec<mpsc::Sender<MasterFrame>>) {
    for tx in targets {
        let _ = tx.send(frame.clone()).await;
    }
}

/// 16 random bytes, url-safe encoded: pairs one dispatched call with its
/// eventual result.
fn random_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
