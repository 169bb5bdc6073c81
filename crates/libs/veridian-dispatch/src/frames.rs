//! Wire frames for the master/worker channel, plus the one place where
//! embedded application errors are rewritten into a transport-safe shape.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use veridian_ipc::AppError;

/// Discriminant marking a JSON object as a serialized application error.
pub const WIRE_ERROR_KIND: &str = "app_error";

/// Frames the orchestrator writes to a worker: either a routed function
/// call or one of the four control-plane pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFrame {
    FunctionCall {
        namespace: String,
        fn_name: String,
        correlation_id: String,
        /// Serialized JSON arguments, rewritten error-safe.
        args: String,
    },
    SigningEndpointChanged {
        endpoint: String,
    },
    CallbackEndpointsChanged {
        endpoints: BTreeMap<String, String>,
    },
    KeysReinitialized {
        epoch: u64,
    },
    SchemaCacheInvalidated {
        schema_ids: BTreeSet<String>,
    },
}

/// Frames a worker writes to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on every connection; joins the worker pool.
    Subscribe,
    /// Result of a previously routed call.
    Result {
        correlation_id: String,
        result: Option<JsonValue>,
        error: Option<JsonValue>,
    },
    /// Reverse channel: ask the orchestrator to perform a ledger call.
    LedgerCall { fn_name: String, args: JsonValue },
    /// Reverse channel: deliver an outbound callback to an external party.
    CallbackDelivery { args: JsonValue },
    /// Reverse channel: send a message over the secure queue.
    MqSend { args: JsonValue },
}

/// Transport-safe application-error shape embedded in call arguments and
/// result error payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    pub code: u32,
    pub client_caused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl From<&AppError> for WireError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: WIRE_ERROR_KIND.to_string(),
            message: err.message.clone(),
            code: err.code,
            client_caused: err.client_caused,
            details: err.details.clone(),
            cause: err.cause.clone(),
        }
    }
}

impl WireError {
    pub fn into_app_error(self) -> AppError {
        AppError {
            code: self.code,
            message: self.message,
            client_caused: self.client_caused,
            details: self.details,
            cause: self.cause,
        }
    }
}

/// Recursively rewrites any embedded application error into the
/// transport-safe [`WireError`] shape before serialization.
///
/// An "embedded error" is an object field named `error` whose value
/// deserializes as [`AppError`]; it is replaced in place and gains the
/// `kind` discriminant so the receiving side can reconstruct it.
pub fn rewrite_embedded_errors(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key == "error" {
                    if let Ok(app) = serde_json::from_value::<AppError>(entry.clone()) {
                        *entry = wire_error_value(&app);
                        continue;
                    }
                }
                rewrite_embedded_errors(entry);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                rewrite_embedded_errors(item);
            }
        }
        _ => {}
    }
}

/// Serializes an application error with the wire discriminant attached.
pub fn wire_error_value(err: &AppError) -> JsonValue {
    serde_json::to_value(WireError::from(err)).unwrap_or_else(|_| {
        // WireError serialization cannot fail; keep a minimal shape if it
        // ever does.
        serde_json::json!({ "kind": WIRE_ERROR_KIND, "message": err.message, "code": err.code })
    })
}

/// Reconstructs a structured application error from a result's error
/// payload, or `None` when the payload is not marked as one.
pub fn reconstruct_app_error(error_payload: &JsonValue) -> Option<AppError> {
    if error_payload.get("kind")?.as_str()? != WIRE_ERROR_KIND {
        return None;
    }
    serde_json::from_value::<WireError>(error_payload.clone())
        .ok()
        .map(WireError::into_app_error)
}
