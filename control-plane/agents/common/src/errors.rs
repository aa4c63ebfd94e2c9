use crate::store::StoreError;
use mbus_api::v0::{NodeId, PoolId, ReplicaId, VolumeId};
use snafu::{Error, Snafu};
use strum_macros::Display;
use tonic::{Code, Status};

/// Kinds of resources which an error may refer to
#[derive(Debug, Clone, Display, Eq, PartialEq)]
pub enum ResourceKind {
    /// not specified
    Unknown,
    /// Node resource
    Node,
    /// Pool resource
    Pool,
    /// Replica resource
    Replica,
    /// Nexus resource
    Nexus,
    /// Child resource
    Child,
    /// Volume resource
    Volume,
}

/// Common error type for all the control plane services
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum SvcError {
    #[snafu(display("Node '{}' is not online", node))]
    NodeNotOnline { node: NodeId },
    #[snafu(display(
        "Timed out after '{:?}' attempting to connect to node '{}' via gRPC endpoint '{}'",
        timeout,
        node_id,
        endpoint
    ))]
    GrpcConnectTimeout {
        node_id: String,
        endpoint: String,
        timeout: std::time::Duration,
    },
    #[snafu(display("Failed to connect to node via gRPC"))]
    GrpcConnect { source: tonic::transport::Error },
    #[snafu(display("Node '{}' has invalid gRPC URI '{}'", node_id, uri))]
    GrpcConnectUri {
        node_id: String,
        uri: String,
        source: http::uri::InvalidUri,
    },
    #[snafu(display(
        "gRPC request '{}' for '{}' failed with '{}'",
        request,
        resource,
        source
    ))]
    GrpcRequestError {
        resource: ResourceKind,
        request: String,
        source: tonic::Status,
    },
    #[snafu(display("Node '{}' not found", node_id))]
    NodeNotFound { node_id: NodeId },
    #[snafu(display("Pool '{}' not found", pool_id))]
    PoolNotFound { pool_id: PoolId },
    #[snafu(display("Nexus '{}' not found", nexus_id))]
    NexusNotFound { nexus_id: String },
    #[snafu(display("Replica '{}' not found", replica_id))]
    ReplicaNotFound { replica_id: ReplicaId },
    #[snafu(display("Volume '{}' not found", vol_id))]
    VolumeNotFound { vol_id: VolumeId },
    #[snafu(display(
        "Volume '{}' cannot be published: {}",
        vol_id,
        reason
    ))]
    VolumeNotPublishable { vol_id: VolumeId, reason: String },
    #[snafu(display("Operation failed due to insufficient resources"))]
    NotEnoughResources { source: NotEnough },
    #[snafu(display("Invalid arguments"))]
    InvalidArguments {},
    #[snafu(display("Invalid {}: {}", kind, value))]
    InvalidArgument { kind: String, value: String },
    #[snafu(display("Invalid uuid '{}'", uuid))]
    InvalidUuid { uuid: String },
    #[snafu(display("Service is not ready yet"))]
    NotReady {},
    #[snafu(display("Internal error: {}", details))]
    Internal { details: String },
    #[snafu(display("Persistent store error"))]
    Store { source: StoreError },
}

impl From<StoreError> for SvcError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl From<NotEnough> for SvcError {
    fn from(source: NotEnough) -> Self {
        Self::NotEnoughResources { source }
    }
}

impl SvcError {
    /// Whether a retry of the operation may reasonably succeed.
    /// Transient node failures recover on the next reconcile pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            SvcError::GrpcRequestError { source, .. } => matches!(
                source.code(),
                Code::Unavailable | Code::DeadlineExceeded
            ),
            SvcError::GrpcConnectTimeout { .. } => true,
            SvcError::GrpcConnect { .. } => true,
            SvcError::NodeNotOnline { .. } => true,
            _ => false,
        }
    }
}

/// Map a service error onto the gRPC status taxonomy; this is the only place
/// where errors cross the CSI boundary
impl From<SvcError> for Status {
    fn from(error: SvcError) -> Self {
        let message = error.full_string();
        let code = match &error {
            SvcError::InvalidArguments { .. }
            | SvcError::InvalidArgument { .. }
            | SvcError::InvalidUuid { .. } => Code::InvalidArgument,
            SvcError::NodeNotFound { .. }
            | SvcError::PoolNotFound { .. }
            | SvcError::NexusNotFound { .. }
            | SvcError::ReplicaNotFound { .. }
            | SvcError::VolumeNotFound { .. } => Code::NotFound,
            SvcError::NotEnoughResources { .. } => Code::ResourceExhausted,
            SvcError::NodeNotOnline { .. } | SvcError::VolumeNotPublishable { .. } => {
                Code::FailedPrecondition
            }
            SvcError::NotReady { .. } => Code::Unavailable,
            SvcError::GrpcConnectTimeout { .. } => Code::DeadlineExceeded,
            SvcError::GrpcRequestError { source, .. } => match source.code() {
                Code::Unavailable => Code::Unavailable,
                Code::DeadlineExceeded => Code::DeadlineExceeded,
                _ => Code::Internal,
            },
            _ => Code::Internal,
        };
        Status::new(code, message)
    }
}

/// Not enough resources available
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum NotEnough {
    #[snafu(display("Not enough suitable pools available, {}/{}", have, need))]
    OfPools { have: u64, need: u64 },
    #[snafu(display("Not enough replicas available, {}/{}", have, need))]
    OfReplicas { have: u64, need: u64 },
}

/// Chain all display strings of an error and its sources into one line,
/// suitable for a CR `status.reason`
pub trait ErrorChain {
    /// full error description with its source chain
    fn full_string(&self) -> String;
}

impl<T: Error> ErrorChain for T {
    fn full_string(&self) -> String {
        let mut string = self.to_string();
        let mut source = self.source();
        while let Some(error) = source {
            string = format!("{}: {}", string, error);
            source = error.source();
        }
        string
    }
}
