//! Last-value-wins control-plane state.
//!
//! Four configuration categories are broadcast to workers on change and
//! replayed in full to every newly subscribing worker, so late joiners
//! converge on the current values without a separate query protocol.

use std::collections::{BTreeMap, BTreeSet};

use crate::frames::MasterFrame;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlState {
    /// Endpoint of the external accessor-signing service.
    pub signing_endpoint: String,
    /// Callback endpoints keyed by callback kind.
    pub callback_endpoints: BTreeMap<String, String>,
    /// Bumped whenever key material must be reloaded by every worker.
    pub key_reinit_epoch: u64,
    /// Data-schema cache entries workers must discard.
    pub invalidated_schema_ids: BTreeSet<String>,
}

impl ControlState {
    /// Current value of each control category, one frame per category,
    /// for replay to a newly subscribed worker.
    pub fn replay_frames(&self) -> Vec<MasterFrame> {
        vec![
            MasterFrame::SigningEndpointChanged { endpoint: self.signing_endpoint.clone() },
            MasterFrame::CallbackEndpointsChanged { endpoints: self.callback_endpoints.clone() },
            MasterFrame::KeysReinitialized { epoch: self.key_reinit_epoch },
            MasterFrame::SchemaCacheInvalidated {
                schema_ids: self.invalidated_schema_ids.clone(),
            },
        ]
    }
}
