//! Callable functions grouped by role namespace.
//!
//! The catalog is the dispatch allow-list: a call naming a function
//! outside it is rejected before any worker is selected. Function names
//! are wire identifiers shared with the workers.

use std::collections::BTreeMap;

const AS_FUNCTIONS: &[&str] =
    &["registerOrUpdateASService", "getServiceDetail", "processDataForRP"];

const RP_FUNCTIONS: &[&str] = &[
    "removeDataFromAS",
    "removeAllDataFromAS",
    "getRequestIdByReferenceId",
    "getDataFromAS",
];

const IDP_FUNCTIONS: &[&str] = &["requestChallengeAndCreateResponse"];

const OPERATOR_FUNCTIONS: &[&str] = &[
    "registerNode",
    "initPlatform",
    "endInit",
    "updateNode",
    "enableNode",
    "disableNode",
    "setNodeToken",
    "addNodeToken",
    "reduceNodeToken",
    "addNamespace",
    "enableNamespace",
    "disableNamespace",
    "addService",
    "updateService",
    "enableService",
    "setValidator",
    "setTimeoutBlockRegisterIdentity",
    "approveService",
    "enableServiceDestination",
    "disableServiceDestination",
    "addNodeToProxyNode",
    "updateNodeProxyNode",
    "removeNodeFromProxyNode",
    "setLastBlock",
];

const PROXY_FUNCTIONS: &[&str] = &["handleMessageFromQueue", "handleLedgerNewBlock"];

const COMMON_FUNCTIONS: &[&str] =
    &["closeRequest", "createRequest", "getPrivateMessages", "removePrivateMessages"];

const IDENTITY_FUNCTIONS: &[&str] = &[
    "createIdentity",
    "getCreateIdentityDataByReferenceId",
    "getRevokeAccessorDataByReferenceId",
    "getIdentityInfo",
    "updateIal",
    "addAccessorMethodForAssociatedIdp",
    "revokeAccessorMethodForAssociatedIdp",
    "calculateSecret",
];

#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    namespaces: BTreeMap<&'static str, &'static [&'static str]>,
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert("as", AS_FUNCTIONS);
        namespaces.insert("rp", RP_FUNCTIONS);
        namespaces.insert("idp", IDP_FUNCTIONS);
        namespaces.insert("operator", OPERATOR_FUNCTIONS);
        namespaces.insert("proxy", PROXY_FUNCTIONS);
        namespaces.insert("common", COMMON_FUNCTIONS);
        namespaces.insert("identity", IDENTITY_FUNCTIONS);
        Self { namespaces }
    }
}

impl FunctionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, namespace: &str, fn_name: &str) -> bool {
        self.namespaces
            .get(namespace)
            .is_some_and(|functions| functions.contains(&fn_name))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.namespaces.keys().copied()
    }

    pub fn functions(&self, namespace: &str) -> &[&'static str] {
        self.namespaces.get(namespace).copied().unwrap_or(&[])
    }
}
