//! In-memory io-engine used by the component tests: an `AgentClient` whose
//! node state lives in a mutex, with knobs for failure injection and call
//! latency.

use super::grpc::{AgentClient, AgentClientFactory};
use common::errors::{ResourceKind, SvcError};
use mbus_api::v0::{
    AddNexusChild, Child, ChildState, CreateNexus, CreatePool, CreateReplica, DestroyNexus,
    DestroyPool, DestroyReplica, Nexus, NexusState, NodeId, Pool, PoolState, Protocol,
    RemoveNexusChild, Replica, ReplicaState, ShareNexus, ShareReplica, UnshareNexus,
    UnshareReplica,
};

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

#[derive(Default)]
struct FakeState {
    node: NodeId,
    pools: Vec<Pool>,
    replicas: Vec<Replica>,
    nexuses: Vec<Nexus>,
    /// every call fails with this status while set
    failing: Option<tonic::Code>,
    /// applied to every call
    delay: Option<Duration>,
    /// names of all calls served so far
    calls: Vec<String>,
    /// children passed to the most recent create_nexus call
    last_nexus_children: Vec<String>,
}

/// A fake io-engine node
#[derive(Clone, Default)]
pub(crate) struct FakeAgent {
    state: Arc<Mutex<FakeState>>,
}

impl FakeAgent {
    pub(crate) fn new(node: &str) -> Self {
        let agent = Self::default();
        agent.state.lock().unwrap().node = node.into();
        agent
    }

    pub(crate) fn add_pool(&self, pool: Pool) {
        self.state.lock().unwrap().pools.push(pool);
    }
    pub(crate) fn add_replica(&self, replica: Replica) {
        self.state.lock().unwrap().replicas.push(replica);
    }
    pub(crate) fn add_nexus(&self, nexus: Nexus) {
        self.state.lock().unwrap().nexuses.push(nexus);
    }
    /// Fail every call with the given status code
    pub(crate) fn set_failing(&self, code: Option<tonic::Code>) {
        self.state.lock().unwrap().failing = code;
    }
    /// Delay every call
    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }
    /// Calls with the given name served so far
    pub(crate) fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    /// Flip the state of a nexus child, as a rebuild completion or a fault
    /// observed by the data plane would
    pub(crate) fn set_child_state(&self, nexus: &str, uri: &str, child_state: ChildState) {
        let mut state = self.state.lock().unwrap();
        if let Some(nexus) = state
            .nexuses
            .iter_mut()
            .find(|candidate| candidate.uuid.as_str() == nexus)
        {
            if let Some(child) = nexus
                .children
                .iter_mut()
                .find(|child| child.uri.as_str() == uri)
            {
                child.rebuild_progress = match child_state {
                    ChildState::Degraded => Some(0),
                    _ => None,
                };
                child.state = child_state;
            }
            nexus.rebuilds = nexus
                .children
                .iter()
                .filter(|child| child.rebuild_progress.is_some())
                .count() as u32;
        }
    }

    /// The current replicas, for assertions
    pub(crate) fn replicas(&self) -> Vec<Replica> {
        self.state.lock().unwrap().replicas.clone()
    }
    /// The current nexuses, for assertions
    pub(crate) fn nexuses(&self) -> Vec<Nexus> {
        self.state.lock().unwrap().nexuses.clone()
    }
    /// The children the most recent nexus was assembled from
    pub(crate) fn last_nexus_children(&self) -> Vec<String> {
        self.state.lock().unwrap().last_nexus_children.clone()
    }

    async fn enter(&self, call: &str) -> Result<(), SvcError> {
        let (failing, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.to_string());
            (state.failing, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = failing {
            return Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Unknown,
                request: call.to_string(),
                source: tonic::Status::new(code, "fake failure"),
            });
        }
        Ok(())
    }

    /// Share uri of a replica; the `uuid` query parameter carries the uuid of
    /// the underlying data device, stable across share changes
    fn share_uri(node: &NodeId, uuid: &str, real_uuid: &str, share: Protocol) -> String {
        match share {
            Protocol::Off => format!("bdev:///{}?uuid={}", uuid, real_uuid),
            Protocol::Nvmf => format!(
                "nvmf://{}:8420/nqn.2019-05.io.openebs:{}?uuid={}",
                node, uuid, real_uuid
            ),
            Protocol::Iscsi => format!(
                "iscsi://{}:3260/iqn.2019-05.io.openebs:{}?uuid={}",
                node, uuid, real_uuid
            ),
            Protocol::Nbd => format!("nbd:///{}?uuid={}", uuid, real_uuid),
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn list_pools(&self) -> Result<Vec<Pool>, SvcError> {
        self.enter("list_pools").await?;
        Ok(self.state.lock().unwrap().pools.clone())
    }
    async fn list_replicas(&self) -> Result<Vec<Replica>, SvcError> {
        self.enter("list_replicas").await?;
        Ok(self.state.lock().unwrap().replicas.clone())
    }
    async fn list_nexuses(&self) -> Result<Vec<Nexus>, SvcError> {
        self.enter("list_nexus").await?;
        Ok(self.state.lock().unwrap().nexuses.clone())
    }

    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError> {
        self.enter("create_pool").await?;
        let mut state = self.state.lock().unwrap();
        if let Some(pool) = state.pools.iter().find(|pool| pool.id == request.id) {
            return Ok(pool.clone());
        }
        let pool = Pool {
            node: request.node.clone(),
            id: request.id.clone(),
            disks: request.disks.clone(),
            state: PoolState::Online,
            capacity: 100 * 1024 * 1024 * 1024,
            used: 0,
        };
        state.pools.push(pool.clone());
        Ok(pool)
    }

    async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError> {
        self.enter("destroy_pool").await?;
        let mut state = self.state.lock().unwrap();
        let before = state.pools.len();
        state.pools.retain(|pool| pool.id != request.id);
        if state.pools.len() == before {
            return Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Pool,
                request: "destroy_pool".to_string(),
                source: tonic::Status::not_found(request.id.to_string()),
            });
        }
        Ok(())
    }

    async fn create_replica(&self, request: &CreateReplica) -> Result<Replica, SvcError> {
        self.enter("create_replica").await?;
        let mut state = self.state.lock().unwrap();
        if let Some(replica) = state
            .replicas
            .iter()
            .find(|replica| replica.uuid == request.uuid && replica.pool == request.pool)
        {
            return Ok(replica.clone());
        }
        if !state.pools.iter().any(|pool| pool.id == request.pool) {
            return Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Replica,
                request: "create_replica".to_string(),
                source: tonic::Status::not_found(request.pool.to_string()),
            });
        }
        let real_uuid = uuid::Uuid::new_v4().to_string();
        let replica = Replica {
            node: request.node.clone(),
            uuid: request.uuid.clone(),
            pool: request.pool.clone(),
            thin: request.thin,
            size: request.size,
            share: request.share,
            uri: Self::share_uri(&request.node, request.uuid.as_str(), &real_uuid, request.share),
            state: ReplicaState::Online,
        };
        state.replicas.push(replica.clone());
        if let Some(pool) = state.pools.iter_mut().find(|pool| pool.id == request.pool) {
            pool.used += request.size;
        }
        Ok(replica)
    }

    async fn destroy_replica(&self, request: &DestroyReplica) -> Result<(), SvcError> {
        self.enter("destroy_replica").await?;
        let mut state = self.state.lock().unwrap();
        let before = state.replicas.len();
        state
            .replicas
            .retain(|replica| !(replica.uuid == request.uuid && replica.pool == request.pool));
        if state.replicas.len() == before {
            return Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Replica,
                request: "destroy_replica".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            });
        }
        Ok(())
    }

    async fn share_replica(&self, request: &ShareReplica) -> Result<String, SvcError> {
        self.enter("share_replica").await?;
        let mut state = self.state.lock().unwrap();
        let node = state.node.clone();
        match state
            .replicas
            .iter_mut()
            .find(|replica| replica.uuid == request.uuid && replica.pool == request.pool)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Replica,
                request: "share_replica".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            }),
            Some(replica) => {
                let real_uuid = mbus_api::v0::real_uuid_from_uri(&replica.uri)
                    .unwrap_or_else(|| replica.uuid.to_string());
                replica.share = request.protocol;
                replica.uri = Self::share_uri(
                    &node,
                    replica.uuid.as_str(),
                    &real_uuid,
                    request.protocol,
                );
                Ok(replica.uri.clone())
            }
        }
    }

    async fn unshare_replica(&self, request: &UnshareReplica) -> Result<(), SvcError> {
        self.enter("unshare_replica").await?;
        let mut state = self.state.lock().unwrap();
        let node = state.node.clone();
        match state
            .replicas
            .iter_mut()
            .find(|replica| replica.uuid == request.uuid && replica.pool == request.pool)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Replica,
                request: "unshare_replica".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            }),
            Some(replica) => {
                let real_uuid = mbus_api::v0::real_uuid_from_uri(&replica.uri)
                    .unwrap_or_else(|| replica.uuid.to_string());
                replica.share = Protocol::Off;
                replica.uri =
                    Self::share_uri(&node, replica.uuid.as_str(), &real_uuid, Protocol::Off);
                Ok(())
            }
        }
    }

    async fn create_nexus(&self, request: &CreateNexus) -> Result<Nexus, SvcError> {
        self.enter("create_nexus").await?;
        let mut state = self.state.lock().unwrap();
        if let Some(nexus) = state
            .nexuses
            .iter()
            .find(|nexus| nexus.uuid == request.uuid)
        {
            return Ok(nexus.clone());
        }
        state.last_nexus_children = request
            .children
            .iter()
            .map(|uri| uri.to_string())
            .collect();
        let nexus = Nexus {
            node: request.node.clone(),
            uuid: request.uuid.clone(),
            size: request.size,
            state: NexusState::Online,
            children: request
                .children
                .iter()
                .map(|uri| Child {
                    uri: uri.clone(),
                    state: ChildState::Online,
                    rebuild_progress: None,
                })
                .collect(),
            device_uri: "".to_string(),
            rebuilds: 0,
        };
        state.nexuses.push(nexus.clone());
        Ok(nexus)
    }

    async fn destroy_nexus(&self, request: &DestroyNexus) -> Result<(), SvcError> {
        self.enter("destroy_nexus").await?;
        let mut state = self.state.lock().unwrap();
        let before = state.nexuses.len();
        state.nexuses.retain(|nexus| nexus.uuid != request.uuid);
        if state.nexuses.len() == before {
            return Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Nexus,
                request: "destroy_nexus".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            });
        }
        Ok(())
    }

    async fn publish_nexus(&self, request: &ShareNexus) -> Result<String, SvcError> {
        self.enter("publish_nexus").await?;
        let mut state = self.state.lock().unwrap();
        let node = state.node.clone();
        match state
            .nexuses
            .iter_mut()
            .find(|nexus| nexus.uuid == request.uuid)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Nexus,
                request: "publish_nexus".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            }),
            Some(nexus) => {
                nexus.device_uri = format!(
                    "nvmf://{}:8420/nqn.2019-05.io.openebs:nexus-{}",
                    node, nexus.uuid
                );
                Ok(nexus.device_uri.clone())
            }
        }
    }

    async fn unpublish_nexus(&self, request: &UnshareNexus) -> Result<(), SvcError> {
        self.enter("unpublish_nexus").await?;
        let mut state = self.state.lock().unwrap();
        match state
            .nexuses
            .iter_mut()
            .find(|nexus| nexus.uuid == request.uuid)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Nexus,
                request: "unpublish_nexus".to_string(),
                source: tonic::Status::not_found(request.uuid.to_string()),
            }),
            Some(nexus) => {
                nexus.device_uri = "".to_string();
                Ok(())
            }
        }
    }

    async fn add_child(&self, request: &AddNexusChild) -> Result<Child, SvcError> {
        self.enter("add_child_nexus").await?;
        let mut state = self.state.lock().unwrap();
        match state
            .nexuses
            .iter_mut()
            .find(|nexus| nexus.uuid == request.nexus)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Child,
                request: "add_child_nexus".to_string(),
                source: tonic::Status::not_found(request.nexus.to_string()),
            }),
            Some(nexus) => {
                // a new child starts rebuilding
                let child = Child {
                    uri: request.uri.clone(),
                    state: ChildState::Degraded,
                    rebuild_progress: Some(0),
                };
                nexus.children.push(child.clone());
                nexus.rebuilds += 1;
                Ok(child)
            }
        }
    }

    async fn remove_child(&self, request: &RemoveNexusChild) -> Result<(), SvcError> {
        self.enter("remove_child_nexus").await?;
        let mut state = self.state.lock().unwrap();
        match state
            .nexuses
            .iter_mut()
            .find(|nexus| nexus.uuid == request.nexus)
        {
            None => Err(SvcError::GrpcRequestError {
                resource: ResourceKind::Child,
                request: "remove_child_nexus".to_string(),
                source: tonic::Status::not_found(request.nexus.to_string()),
            }),
            Some(nexus) => {
                nexus.children.retain(|child| child.uri != request.uri);
                nexus.rebuilds = nexus
                    .children
                    .iter()
                    .filter(|child| child.rebuild_progress.is_some())
                    .count() as u32;
                Ok(())
            }
        }
    }
}

/// Hands out `FakeAgent`s by node name
#[derive(Default)]
pub(crate) struct FakeFactory {
    agents: Mutex<HashMap<NodeId, FakeAgent>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_agent(&self, node: &str, agent: FakeAgent) {
        self.agents.lock().unwrap().insert(node.into(), agent);
    }

    pub(crate) fn agent(&self, node: &str) -> Option<FakeAgent> {
        self.agents.lock().unwrap().get(&NodeId::from(node)).cloned()
    }
}

impl AgentClientFactory for FakeFactory {
    fn client(
        &self,
        node: &NodeId,
        _endpoint: &str,
    ) -> Result<Arc<dyn AgentClient>, SvcError> {
        match self.agents.lock().unwrap().get(node) {
            Some(agent) => Ok(Arc::new(agent.clone())),
            None => Err(SvcError::NodeNotFound {
                node_id: node.clone(),
            }),
        }
    }
}

/// In-memory `NexusInfoStore` with failure injection
#[derive(Default)]
pub(crate) struct FakeStore {
    records: Mutex<HashMap<String, common::store::nexus::NexusInfo>>,
    failing: Mutex<bool>,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, nexus: &str, record: common::store::nexus::NexusInfo) {
        self.records
            .lock()
            .unwrap()
            .insert(nexus.to_string(), record);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl common::store::nexus::NexusInfoStore for FakeStore {
    async fn filter_replicas(
        &self,
        nexus: &mbus_api::v0::NexusId,
        replicas: Vec<Replica>,
    ) -> Result<Vec<Replica>, common::store::StoreError> {
        if *self.failing.lock().unwrap() {
            return Err(common::store::StoreError::Unavailable {
                failures: 3,
                remaining: Duration::from_secs(30),
            });
        }
        match self.records.lock().unwrap().get(nexus.as_str()) {
            None => Ok(replicas),
            Some(record) => Ok(record.filter_replicas(replicas)),
        }
    }

    async fn destroy_nexus_info(
        &self,
        nexus: &mbus_api::v0::NexusId,
    ) -> Result<(), common::store::StoreError> {
        if *self.failing.lock().unwrap() {
            return Err(common::store::StoreError::Unavailable {
                failures: 3,
                remaining: Duration::from_secs(30),
            });
        }
        self.records.lock().unwrap().remove(nexus.as_str());
        Ok(())
    }
}
