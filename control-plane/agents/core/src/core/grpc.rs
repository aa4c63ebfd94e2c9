use crate::core::translation::{
    rpc_child_to_bus, rpc_nexus_to_bus, rpc_pool_to_bus, rpc_replica_to_bus, BusToRpc,
};
use common::errors::{
    GrpcConnectSnafu, GrpcConnectUriSnafu, GrpcRequestSnafu, ResourceKind, SvcError,
};
use mbus_api::v0::{
    AddNexusChild, Child, CreateNexus, CreatePool, CreateReplica, DestroyNexus, DestroyPool,
    DestroyReplica, Nexus, NodeId, Pool, RemoveNexusChild, Replica, ShareNexus, ShareReplica,
    UnshareNexus, UnshareReplica,
};
use rpc::mayastor::{mayastor_client::MayastorClient, Null};

use async_trait::async_trait;
use snafu::ResultExt;
use std::{str::FromStr, sync::Arc, time::Duration};
use tonic::transport::Channel;

/// Timeout for establishing the connection itself
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Typed interface to a storage node, one method per io-engine call.
/// The production implementation speaks gRPC; tests plug in a fake.
#[async_trait]
pub(crate) trait AgentClient: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<Pool>, SvcError>;
    async fn list_replicas(&self) -> Result<Vec<Replica>, SvcError>;
    async fn list_nexuses(&self) -> Result<Vec<Nexus>, SvcError>;

    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError>;
    async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError>;

    async fn create_replica(&self, request: &CreateReplica) -> Result<Replica, SvcError>;
    async fn destroy_replica(&self, request: &DestroyReplica) -> Result<(), SvcError>;
    async fn share_replica(&self, request: &ShareReplica) -> Result<String, SvcError>;
    async fn unshare_replica(&self, request: &UnshareReplica) -> Result<(), SvcError>;

    async fn create_nexus(&self, request: &CreateNexus) -> Result<Nexus, SvcError>;
    async fn destroy_nexus(&self, request: &DestroyNexus) -> Result<(), SvcError>;
    async fn publish_nexus(&self, request: &ShareNexus) -> Result<String, SvcError>;
    async fn unpublish_nexus(&self, request: &UnshareNexus) -> Result<(), SvcError>;
    async fn add_child(&self, request: &AddNexusChild) -> Result<Child, SvcError>;
    async fn remove_child(&self, request: &RemoveNexusChild) -> Result<(), SvcError>;
}

/// Creates `AgentClient`s for newly registered nodes
pub(crate) trait AgentClientFactory: Send + Sync {
    /// New client for the node at the given grpc endpoint
    fn client(&self, node: &NodeId, endpoint: &str) -> Result<Arc<dyn AgentClient>, SvcError>;
}

/// Context with the node endpoint and a lock to serialize mutating gRPC calls
#[derive(Clone)]
pub(crate) struct GrpcContext {
    /// gRPC CRUD lock
    lock: Arc<tokio::sync::Mutex<()>>,
    /// node identifier
    node: NodeId,
    /// gRPC URI endpoint
    endpoint: tonic::transport::Endpoint,
    /// per-call deadline
    timeout: Duration,
}

impl GrpcContext {
    pub(crate) fn new(node: &NodeId, endpoint: &str, timeout: Duration) -> Result<Self, SvcError> {
        let uri = format!("http://{}", endpoint);
        let uri = http::uri::Uri::from_str(&uri).context(GrpcConnectUriSnafu {
            node_id: node.to_string(),
            uri: uri.clone(),
        })?;
        let endpoint = tonic::transport::Endpoint::from(uri).timeout(timeout);

        Ok(Self {
            node: node.clone(),
            lock: Default::default(),
            endpoint,
            timeout,
        })
    }
}

/// gRPC implementation of the `AgentClient`, connecting per call so that a
/// node restart does not wedge a cached channel
pub(crate) struct GrpcClient {
    context: GrpcContext,
}

impl GrpcClient {
    pub(crate) fn new(context: GrpcContext) -> Self {
        Self { context }
    }

    async fn connect(&self) -> Result<MayastorClient<Channel>, SvcError> {
        match tokio::time::timeout(
            CONNECT_TIMEOUT,
            MayastorClient::connect(self.context.endpoint.clone()),
        )
        .await
        {
            Err(_) => Err(SvcError::GrpcConnectTimeout {
                node_id: self.context.node.to_string(),
                endpoint: format!("{}", self.context.endpoint.uri()),
                timeout: CONNECT_TIMEOUT,
            }),
            Ok(client) => client.context(GrpcConnectSnafu),
        }
    }

    /// wrap a call with the per-call deadline so a hung node cannot block the
    /// caller past its timeout
    async fn deadline<T, F>(
        &self,
        request: &'static str,
        resource: ResourceKind,
        future: F,
    ) -> Result<T, SvcError>
    where
        F: std::future::Future<Output = Result<T, tonic::Status>> + Send,
    {
        match tokio::time::timeout(self.context.timeout, future).await {
            Err(_) => Err(SvcError::GrpcRequestError {
                resource,
                request: request.to_string(),
                source: tonic::Status::deadline_exceeded(format!(
                    "'{}' timed out after {:?}",
                    request, self.context.timeout
                )),
            }),
            Ok(result) => result.context(GrpcRequestSnafu {
                resource,
                request: request.to_string(),
            }),
        }
    }
}

/// gRPC client factory used for all real nodes
pub(crate) struct GrpcClientFactory {
    timeout: Duration,
}

impl GrpcClientFactory {
    /// New factory with the per-call `timeout` applied to every client
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentClientFactory for GrpcClientFactory {
    fn client(&self, node: &NodeId, endpoint: &str) -> Result<Arc<dyn AgentClient>, SvcError> {
        let context = GrpcContext::new(node, endpoint, self.timeout)?;
        Ok(Arc::new(GrpcClient::new(context)))
    }
}

#[async_trait]
impl AgentClient for GrpcClient {
    async fn list_pools(&self) -> Result<Vec<Pool>, SvcError> {
        let mut client = self.connect().await?;
        let rpc_pools = self
            .deadline("list_pools", ResourceKind::Pool, async move {
                client.list_pools(Null {}).await
            })
            .await?;
        Ok(rpc_pools
            .into_inner()
            .pools
            .iter()
            .map(|pool| rpc_pool_to_bus(pool, &self.context.node))
            .collect())
    }

    async fn list_replicas(&self) -> Result<Vec<Replica>, SvcError> {
        let mut client = self.connect().await?;
        let rpc_replicas = self
            .deadline("list_replicas", ResourceKind::Replica, async move {
                client.list_replicas(Null {}).await
            })
            .await?;
        Ok(rpc_replicas
            .into_inner()
            .replicas
            .iter()
            .map(|replica| rpc_replica_to_bus(replica, &self.context.node))
            .collect())
    }

    async fn list_nexuses(&self) -> Result<Vec<Nexus>, SvcError> {
        let mut client = self.connect().await?;
        let rpc_nexuses = self
            .deadline("list_nexus", ResourceKind::Nexus, async move {
                client.list_nexus(Null {}).await
            })
            .await?;
        Ok(rpc_nexuses
            .into_inner()
            .nexus_list
            .iter()
            .map(|nexus| rpc_nexus_to_bus(nexus, &self.context.node))
            .collect())
    }

    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let rpc_pool = self
            .deadline("create_pool", ResourceKind::Pool, async move {
                client.create_pool(rpc_request).await
            })
            .await?;
        Ok(rpc_pool_to_bus(&rpc_pool.into_inner(), &request.node))
    }

    async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("destroy_pool", ResourceKind::Pool, async move {
                client.destroy_pool(rpc_request).await
            })
            .await?;
        Ok(())
    }

    async fn create_replica(&self, request: &CreateReplica) -> Result<Replica, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let rpc_replica = self
            .deadline("create_replica", ResourceKind::Replica, async move {
                client.create_replica(rpc_request).await
            })
            .await?;
        Ok(rpc_replica_to_bus(&rpc_replica.into_inner(), &request.node))
    }

    async fn destroy_replica(&self, request: &DestroyReplica) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("destroy_replica", ResourceKind::Replica, async move {
                client.destroy_replica(rpc_request).await
            })
            .await?;
        Ok(())
    }

    async fn share_replica(&self, request: &ShareReplica) -> Result<String, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let share = self
            .deadline("share_replica", ResourceKind::Replica, async move {
                client.share_replica(rpc_request).await
            })
            .await?;
        Ok(share.into_inner().uri)
    }

    async fn unshare_replica(&self, request: &UnshareReplica) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("unshare_replica", ResourceKind::Replica, async move {
                client.share_replica(rpc_request).await
            })
            .await?;
        Ok(())
    }

    async fn create_nexus(&self, request: &CreateNexus) -> Result<Nexus, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let rpc_nexus = self
            .deadline("create_nexus", ResourceKind::Nexus, async move {
                client.create_nexus(rpc_request).await
            })
            .await?;
        Ok(rpc_nexus_to_bus(&rpc_nexus.into_inner(), &request.node))
    }

    async fn destroy_nexus(&self, request: &DestroyNexus) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("destroy_nexus", ResourceKind::Nexus, async move {
                client.destroy_nexus(rpc_request).await
            })
            .await?;
        Ok(())
    }

    async fn publish_nexus(&self, request: &ShareNexus) -> Result<String, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let share = self
            .deadline("publish_nexus", ResourceKind::Nexus, async move {
                client.publish_nexus(rpc_request).await
            })
            .await?;
        Ok(share.into_inner().device_uri)
    }

    async fn unpublish_nexus(&self, request: &UnshareNexus) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("unpublish_nexus", ResourceKind::Nexus, async move {
                client.unpublish_nexus(rpc_request).await
            })
            .await?;
        Ok(())
    }

    async fn add_child(&self, request: &AddNexusChild) -> Result<Child, SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let rpc_child = self
            .deadline("add_child_nexus", ResourceKind::Child, async move {
                client.add_child_nexus(rpc_request).await
            })
            .await?;
        Ok(rpc_child_to_bus(&rpc_child.into_inner()))
    }

    async fn remove_child(&self, request: &RemoveNexusChild) -> Result<(), SvcError> {
        let _guard = self.context.lock.lock().await;
        let mut client = self.connect().await?;
        let rpc_request = request.to_rpc();
        let _ = self
            .deadline("remove_child_nexus", ResourceKind::Child, async move {
                client.remove_child_nexus(rpc_request).await
            })
            .await?;
        Ok(())
    }
}
