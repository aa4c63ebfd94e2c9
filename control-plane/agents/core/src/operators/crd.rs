//! The custom resources the operators reconcile, in the api group
//! `openebs.io/v1alpha1`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A storage node, registered by writing its grpc endpoint into the spec.
/// An empty endpoint means the node has been deregistered.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "MayastorNode",
    plural = "mayastornodes",
    shortname = "msn",
    namespaced
)]
#[kube(status = "MayastorNodeStatus")]
#[serde(rename_all = "camelCase")]
pub(crate) struct MayastorNodeSpec {
    /// grpc endpoint of the io-engine instance on the node
    pub(crate) grpc_endpoint: String,
}

/// Deemed state of the node, mirrored from the registry
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MayastorNodeStatus {
    /// the node keeps its sync deadline
    Online,
    /// the node is out of sync
    Offline,
    /// nothing is known about the node
    Unknown,
}

impl Default for MayastorNodeStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// A storage pool on one node, built from local disk devices
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "MayastorPool",
    plural = "mayastorpools",
    shortname = "msp",
    namespaced
)]
#[kube(status = "MayastorPoolStatus")]
#[serde(rename_all = "camelCase")]
pub(crate) struct MayastorPoolSpec {
    /// name of the node the pool is placed on
    pub(crate) node: String,
    /// disk devices claimed by the pool
    pub(crate) disks: Vec<String>,
}

/// Observed state of the pool
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MayastorPoolStatus {
    /// state of the pool
    pub(crate) state: MayastorPoolState,
    /// single-line explanation of the state, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reason: Option<String>,
    /// disks actually used by the pool, with their transport prefix
    pub(crate) disks: Vec<String>,
    /// size of the pool in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) capacity: Option<u64>,
    /// used bytes from the pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) used: Option<u64>,
    /// the spec the pool was created from; mutations of the resource spec
    /// after creation are ignored in favour of this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) spec: Option<MayastorPoolSpec>,
}

/// State of the pool as tracked through the CR
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MayastorPoolState {
    /// not created yet, the reason says why
    Pending,
    /// in normal working order
    Online,
    /// functional but with a failure
    Degraded,
    /// completely inaccessible
    Faulted,
    /// on a node which is out of sync
    Offline,
    /// creation failed, the reason carries the error
    Error,
    /// nothing is known
    Unknown,
}

impl Default for MayastorPoolState {
    fn default() -> Self {
        Self::Pending
    }
}

impl From<&mbus_api::v0::PoolState> for MayastorPoolState {
    fn from(state: &mbus_api::v0::PoolState) -> Self {
        match state {
            mbus_api::v0::PoolState::Online => Self::Online,
            mbus_api::v0::PoolState::Degraded => Self::Degraded,
            mbus_api::v0::PoolState::Faulted => Self::Faulted,
            mbus_api::v0::PoolState::Offline => Self::Offline,
            mbus_api::v0::PoolState::Unknown => Self::Unknown,
        }
    }
}

impl MayastorPoolStatus {
    /// Status while something is being waited for
    pub(crate) fn pending(reason: &str, spec: Option<MayastorPoolSpec>) -> Self {
        Self {
            state: MayastorPoolState::Pending,
            reason: Some(reason.to_string()),
            disks: vec![],
            capacity: None,
            used: None,
            spec,
        }
    }

    /// Status after the pool creation failed for good
    pub(crate) fn error(reason: &str, spec: Option<MayastorPoolSpec>) -> Self {
        Self {
            state: MayastorPoolState::Error,
            reason: Some(reason.to_string()),
            disks: vec![],
            capacity: None,
            used: None,
            spec,
        }
    }

    /// Status mirroring a live pool from the registry
    pub(crate) fn from_pool(pool: &mbus_api::v0::Pool, spec: Option<MayastorPoolSpec>) -> Self {
        Self {
            state: MayastorPoolState::from(&pool.state),
            reason: None,
            disks: pool.disks.clone(),
            capacity: Some(pool.capacity),
            used: Some(pool.used),
            spec,
        }
    }
}
