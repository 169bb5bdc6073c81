use serde_json::Value as JsonValue;
use veridian_ipc::AppError;

/// Failures surfaced through a dispatched call's result future.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown function {namespace}.{fn_name}")]
    UnknownFunction { namespace: String, fn_name: String },

    /// Only produced when a retry bound is configured; with the default
    /// unbounded configuration the dispatcher waits forever instead.
    #[error("no worker available after {attempts} attempts")]
    NoWorkerAvailable { attempts: u32 },

    #[error("no worker at index {index}")]
    NoSuchWorker { index: usize },

    #[error("call {correlation_id} timed out")]
    CallTimeout { correlation_id: String },

    #[error("worker channel closed before a result arrived")]
    ChannelClosed,

    /// A structured application error reconstructed from the worker's
    /// error payload, carrying the original kind, code, and cause.
    #[error(transparent)]
    Remote(AppError),

    /// The worker reported an error payload that is not a structured
    /// application error.
    #[error("remote call failed: {0}")]
    RemoteRaw(JsonValue),

    #[error("cannot encode call arguments: {0}")]
    Encode(String),
}
