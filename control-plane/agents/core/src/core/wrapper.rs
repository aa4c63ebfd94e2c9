use super::{
    events::{Event, EventAction, EventFanout, EventObject},
    grpc::AgentClient,
};
use common::errors::SvcError;
use mbus_api::v0::{
    AddNexusChild, Child, CreateNexus, CreatePool, CreateReplica, DestroyNexus, DestroyPool,
    DestroyReplica, Nexus, NexusId, NexusState, Node, NodeId, NodeState, Pool, PoolId, PoolState,
    Protocol, RemoveNexusChild, Replica, ReplicaId, ReplicaState, ShareNexus, ShareReplica,
    UnshareNexus, UnshareReplica,
};

use async_trait::async_trait;
use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use tonic::Code;

/// Wrapper over a `Node` with all pools, replicas and nexuses last seen on it,
/// the client used to reach it and the counters driving its sync state
pub(crate) struct NodeWrapper {
    /// inner Node value
    node: Node,
    /// client to the io-engine instance
    client: Arc<dyn AgentClient>,
    /// sink for entity events
    events: EventFanout,
    /// pools part of the node
    pools: HashMap<PoolId, PoolWrapper>,
    /// nexuses part of the node
    nexuses: HashMap<NexusId, Nexus>,
    /// consecutive sync failures
    bad_sync_count: u32,
}

/// Everything one sync pass fetches from a node
pub(crate) struct NodeSnapshot {
    pub(crate) pools: Vec<Pool>,
    pub(crate) replicas: Vec<Replica>,
    pub(crate) nexuses: Vec<Nexus>,
}

impl NodeWrapper {
    /// Create a new wrapper for a `Node` which is yet to complete a sync
    pub(crate) fn new(node: &Node, client: Arc<dyn AgentClient>, events: EventFanout) -> Self {
        tracing::debug!("Creating new node {:?}", node);
        let mut node = node.clone();
        node.state = NodeState::Syncing;
        Self {
            node,
            client,
            events,
            pools: Default::default(),
            nexuses: Default::default(),
            bad_sync_count: 0,
        }
    }

    /// Get the client used to reach this node
    pub(crate) fn client(&self) -> Arc<dyn AgentClient> {
        self.client.clone()
    }
    /// Replace the client, used when the node re-registers on a new endpoint
    pub(crate) fn set_client(&mut self, endpoint: &str, client: Arc<dyn AgentClient>) {
        self.node.grpc_endpoint = endpoint.to_string();
        self.client = client;
        self.node.state = NodeState::Syncing;
        self.emit(EventAction::Mod, EventObject::Node(self.node.clone()));
    }

    /// Get the inner node
    pub(crate) fn node(&self) -> &Node {
        &self.node
    }
    /// The node id
    pub(crate) fn id(&self) -> &NodeId {
        &self.node.id
    }
    /// Whether the node currently has a successful sync
    pub(crate) fn is_synced(&self) -> bool {
        self.node.state == NodeState::Online
    }

    /// Get all pools
    pub(crate) fn pools(&self) -> Vec<PoolWrapper> {
        self.pools.values().cloned().collect()
    }
    /// Get pool from `pool_id` or None
    pub(crate) fn pool(&self, pool_id: &PoolId) -> Option<&PoolWrapper> {
        self.pools.get(pool_id)
    }
    /// Get all replicas
    pub(crate) fn replicas(&self) -> Vec<Replica> {
        self.pools.values().flat_map(|pool| pool.replicas()).collect()
    }
    /// Get replica from `replica_id`
    pub(crate) fn replica(&self, replica_id: &ReplicaId) -> Option<&Replica> {
        self.pools
            .values()
            .find_map(|pool| pool.replica(replica_id))
    }
    /// Get all nexuses
    pub(crate) fn nexuses(&self) -> Vec<Nexus> {
        self.nexuses.values().cloned().collect()
    }
    /// Get nexus
    pub(crate) fn nexus(&self, nexus_id: &NexusId) -> Option<&Nexus> {
        self.nexuses.get(nexus_id)
    }

    fn emit(&self, action: EventAction, object: EventObject) {
        self.events.publish(Event::new(action, object));
    }

    /// Apply a successful sync snapshot: diff it against the last known state
    /// and emit the resulting events. Ordering within a sync: pools before
    /// their replicas, nexuses last, node events at the very end.
    pub(crate) fn apply_sync(&mut self, mut snapshot: NodeSnapshot) {
        self.bad_sync_count = 0;
        for pool in &mut snapshot.pools {
            pool.node = self.node.id.clone();
        }
        for replica in &mut snapshot.replicas {
            replica.node = self.node.id.clone();
        }
        for nexus in &mut snapshot.nexuses {
            nexus.node = self.node.id.clone();
        }

        self.diff_pools(&snapshot);
        self.diff_nexuses(snapshot.nexuses);

        if self.node.state != NodeState::Online {
            self.node.state = NodeState::Online;
            self.emit(EventAction::Mod, EventObject::Node(self.node.clone()));
            self.emit(EventAction::Sync, EventObject::Node(self.node.clone()));
        }
    }

    fn diff_pools(&mut self, snapshot: &NodeSnapshot) {
        let remote_pools: HashMap<PoolId, &Pool> =
            snapshot.pools.iter().map(|pool| (pool.id.clone(), pool)).collect();

        // pools which disappeared take their replicas with them
        let removed: Vec<PoolId> = self
            .pools
            .keys()
            .filter(|id| !remote_pools.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(pool) = self.pools.remove(&id) {
                for replica in pool.replicas() {
                    self.emit(EventAction::Del, EventObject::Replica(replica));
                }
                self.emit(EventAction::Del, EventObject::Pool(pool.into()));
            }
        }

        for remote in &snapshot.pools {
            // a replica whose pool is not reported is ignored
            let replicas: Vec<Replica> = snapshot
                .replicas
                .iter()
                .filter(|replica| replica.pool == remote.id)
                .cloned()
                .collect();
            match self.pools.get_mut(&remote.id) {
                None => {
                    let pool = PoolWrapper::new(remote, &replicas);
                    self.pools.insert(remote.id.clone(), pool);
                    self.emit(EventAction::New, EventObject::Pool(remote.clone()));
                    for replica in replicas {
                        self.emit(EventAction::New, EventObject::Replica(replica));
                    }
                }
                Some(current) => {
                    let (pool_changed, replica_events) = current.merge(remote, &replicas);
                    if pool_changed {
                        self.emit(EventAction::Mod, EventObject::Pool(remote.clone()));
                    }
                    for (action, replica) in replica_events {
                        self.emit(action, EventObject::Replica(replica));
                    }
                }
            }
        }
    }

    fn diff_nexuses(&mut self, nexuses: Vec<Nexus>) {
        let remote: HashMap<NexusId, Nexus> = nexuses
            .into_iter()
            .map(|nexus| (nexus.uuid.clone(), nexus))
            .collect();

        let removed: Vec<NexusId> = self
            .nexuses
            .keys()
            .filter(|uuid| !remote.contains_key(*uuid))
            .cloned()
            .collect();
        for uuid in removed {
            if let Some(nexus) = self.nexuses.remove(&uuid) {
                self.emit(EventAction::Del, EventObject::Nexus(nexus));
            }
        }

        for (uuid, nexus) in remote {
            match self.nexuses.get_mut(&uuid) {
                None => {
                    self.nexuses.insert(uuid, nexus.clone());
                    self.emit(EventAction::New, EventObject::Nexus(nexus));
                }
                Some(current) => {
                    if nexus_changed(current, &nexus) {
                        *current = nexus.clone();
                        self.emit(EventAction::Mod, EventObject::Nexus(nexus));
                    }
                }
            }
        }
    }

    /// Account a failed sync; past `bad_limit` consecutive failures the node
    /// and everything it owns transition to offline
    pub(crate) fn sync_failed(&mut self, error: &SvcError, bad_limit: u32) {
        self.bad_sync_count += 1;
        tracing::warn!(
            "Failed to sync node '{}' ({}/{} failures): {}",
            self.node.id,
            self.bad_sync_count,
            bad_limit + 1,
            error
        );
        if self.bad_sync_count > bad_limit && self.node.state != NodeState::Offline {
            self.set_offline();
        }
    }

    /// Mark the node and all its entities as offline, children first
    pub(crate) fn set_offline(&mut self) {
        tracing::error!("Node '{}' is out of sync, marking it offline", self.node.id);
        for pool in self.pools.values_mut() {
            pool.pool.state = PoolState::Offline;
            for replica in &mut pool.replicas {
                replica.state = ReplicaState::Offline;
            }
        }
        for nexus in self.nexuses.values_mut() {
            nexus.state = NexusState::Offline;
        }
        let events: Vec<Event> = self
            .pools
            .values()
            .flat_map(|pool| {
                std::iter::once(Event::new(
                    EventAction::Mod,
                    EventObject::Pool(pool.pool.clone()),
                ))
                .chain(pool.replicas.iter().map(|replica| {
                    Event::new(EventAction::Mod, EventObject::Replica(replica.clone()))
                }))
            })
            .chain(self.nexuses.values().map(|nexus| {
                Event::new(EventAction::Mod, EventObject::Nexus(nexus.clone()))
            }))
            .collect();
        for event in events {
            self.events.publish(event);
        }
        self.node.state = NodeState::Offline;
        self.emit(EventAction::Mod, EventObject::Node(self.node.clone()));
    }

    /// Remove every entity of the node, emitting `del` events children first.
    /// Used when the node is removed from the cluster.
    pub(crate) fn unbind(&mut self) {
        let pools: Vec<PoolWrapper> = self.pools.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            for replica in pool.replicas() {
                self.emit(EventAction::Del, EventObject::Replica(replica));
            }
            self.emit(EventAction::Del, EventObject::Pool(pool.into()));
        }
        let nexuses: Vec<Nexus> = self.nexuses.drain().map(|(_, nexus)| nexus).collect();
        for nexus in nexuses {
            self.emit(EventAction::Del, EventObject::Nexus(nexus));
        }
        self.emit(EventAction::Del, EventObject::Node(self.node.clone()));
    }

    fn on_create_pool(&mut self, pool: &Pool) {
        self.pools
            .insert(pool.id.clone(), PoolWrapper::new(pool, &[]));
        self.emit(EventAction::New, EventObject::Pool(pool.clone()));
    }
    fn on_destroy_pool(&mut self, pool_id: &PoolId) {
        if let Some(pool) = self.pools.remove(pool_id) {
            for replica in pool.replicas() {
                self.emit(EventAction::Del, EventObject::Replica(replica));
            }
            self.emit(EventAction::Del, EventObject::Pool(pool.into()));
        }
    }
    fn on_create_replica(&mut self, replica: &Replica) {
        match self.pools.get_mut(&replica.pool) {
            None => {
                tracing::error!(
                    "Can't add replica '{}' to pool '{}' because the pool does not exist",
                    replica.uuid,
                    replica.pool
                );
            }
            Some(pool) => {
                pool.add_replica(replica);
                self.emit(EventAction::New, EventObject::Replica(replica.clone()));
            }
        }
    }
    fn on_destroy_replica(&mut self, pool_id: &PoolId, replica_id: &ReplicaId) {
        if let Some(pool) = self.pools.get_mut(pool_id) {
            if let Some(replica) = pool.remove_replica(replica_id) {
                self.emit(EventAction::Del, EventObject::Replica(replica));
            }
        }
    }
    fn on_share_replica(&mut self, pool_id: &PoolId, replica_id: &ReplicaId, share: Protocol, uri: &str) {
        if let Some(pool) = self.pools.get_mut(pool_id) {
            if let Some(replica) = pool.update_replica(replica_id, share, uri) {
                self.emit(EventAction::Mod, EventObject::Replica(replica));
            }
        }
    }
    fn on_create_nexus(&mut self, nexus: &Nexus) {
        self.nexuses.insert(nexus.uuid.clone(), nexus.clone());
        self.emit(EventAction::New, EventObject::Nexus(nexus.clone()));
    }
    fn on_destroy_nexus(&mut self, nexus_id: &NexusId) {
        if let Some(nexus) = self.nexuses.remove(nexus_id) {
            self.emit(EventAction::Del, EventObject::Nexus(nexus));
        }
    }
    fn on_share_nexus(&mut self, nexus_id: &NexusId, uri: &str) {
        if let Some(nexus) = self.nexuses.get_mut(nexus_id) {
            nexus.device_uri = uri.to_string();
            let nexus = nexus.clone();
            self.emit(EventAction::Mod, EventObject::Nexus(nexus));
        }
    }
    fn on_add_child(&mut self, nexus_id: &NexusId, child: &Child) {
        if let Some(nexus) = self.nexuses.get_mut(nexus_id) {
            if !nexus.children.iter().any(|current| current.uri == child.uri) {
                nexus.children.push(child.clone());
            }
            let nexus = nexus.clone();
            self.emit(EventAction::Mod, EventObject::Nexus(nexus));
        }
    }
    fn on_remove_child(&mut self, request: &RemoveNexusChild) {
        if let Some(nexus) = self.nexuses.get_mut(&request.nexus) {
            nexus.children.retain(|child| child.uri != request.uri);
            let nexus = nexus.clone();
            self.emit(EventAction::Mod, EventObject::Nexus(nexus));
        }
    }
}

impl std::fmt::Debug for NodeWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWrapper")
            .field("node", &self.node)
            .field("pools", &self.pools)
            .field("nexuses", &self.nexuses)
            .field("bad_sync_count", &self.bad_sync_count)
            .finish()
    }
}

/// Order-independent on the child uri, order-sensitive on the
/// `(state, rebuild_progress)` of matched children
fn children_changed(current: &[Child], remote: &[Child]) -> bool {
    if current.len() != remote.len() {
        return true;
    }
    for child in remote {
        match current.iter().find(|c| c.uri == child.uri) {
            None => return true,
            Some(matched) => {
                if matched.state != child.state
                    || matched.rebuild_progress != child.rebuild_progress
                {
                    return true;
                }
            }
        }
    }
    false
}

fn nexus_changed(current: &Nexus, remote: &Nexus) -> bool {
    current.size != remote.size
        || current.state != remote.state
        || current.device_uri != remote.device_uri
        || current.rebuilds != remote.rebuilds
        || children_changed(&current.children, &remote.children)
}

fn replica_changed(current: &Replica, remote: &Replica) -> bool {
    current.pool != remote.pool
        || current.size != remote.size
        || current.share != remote.share
        || current.uri != remote.uri
        || current.state != remote.state
}

fn pool_changed(current: &Pool, remote: &Pool) -> bool {
    current.state != remote.state
        || current.capacity != remote.capacity
        || current.used != remote.used
        || current.disks != remote.disks
}

/// Fetch the full state of a node, in the order pools, replicas, nexuses
pub(crate) async fn fetch_node_state(
    client: Arc<dyn AgentClient>,
) -> Result<NodeSnapshot, SvcError> {
    let pools = client.list_pools().await?;
    let replicas = client.list_replicas().await?;
    let nexuses = client.list_nexuses().await?;
    Ok(NodeSnapshot {
        pools,
        replicas,
        nexuses,
    })
}

/// Wrapper over the bus `Pool` which includes all the replicas and Ord traits
/// to aid pool selection for volume replicas
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct PoolWrapper {
    pool: Pool,
    replicas: Vec<Replica>,
}

impl std::ops::Deref for PoolWrapper {
    type Target = Pool;
    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl PoolWrapper {
    /// New Pool wrapper with the pool and replicas
    pub(crate) fn new(pool: &Pool, replicas: &[Replica]) -> Self {
        Self {
            pool: pool.clone(),
            replicas: replicas.into(),
        }
    }

    /// Get the pool's replicas
    pub(crate) fn replicas(&self) -> Vec<Replica> {
        self.replicas.clone()
    }
    /// Get replica from the pool
    pub(crate) fn replica(&self, replica: &ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| &r.uuid == replica)
    }

    /// Get the free space
    pub(crate) fn free_space(&self) -> u64 {
        if self.pool.capacity >= self.pool.used {
            self.pool.capacity - self.pool.used
        } else {
            // odd, let's report no free space available
            tracing::error!(
                "Pool '{}' has a capacity of '{} B' but is using '{} B'",
                self.pool.id,
                self.pool.capacity,
                self.pool.used
            );
            0
        }
    }

    /// Merge a fresh snapshot of the pool and its replicas, returning whether
    /// the pool itself changed and the replica events caused by the diff
    fn merge(
        &mut self,
        remote: &Pool,
        remote_replicas: &[Replica],
    ) -> (bool, Vec<(EventAction, Replica)>) {
        let changed = pool_changed(&self.pool, remote);
        self.pool = remote.clone();

        let mut events = vec![];
        self.replicas.retain(|current| {
            let alive = remote_replicas
                .iter()
                .any(|remote| remote.uuid == current.uuid);
            if !alive {
                events.push((EventAction::Del, current.clone()));
            }
            alive
        });
        for remote in remote_replicas {
            match self
                .replicas
                .iter_mut()
                .find(|current| current.uuid == remote.uuid)
            {
                None => {
                    self.replicas.push(remote.clone());
                    events.push((EventAction::New, remote.clone()));
                }
                Some(current) => {
                    if replica_changed(current, remote) {
                        *current = remote.clone();
                        events.push((EventAction::Mod, remote.clone()));
                    }
                }
            }
        }
        (changed, events)
    }

    /// Add replica to list
    pub(crate) fn add_replica(&mut self, replica: &Replica) {
        self.replicas.push(replica.clone())
    }
    /// Remove replica from list
    pub(crate) fn remove_replica(&mut self, uuid: &ReplicaId) -> Option<Replica> {
        let removed = self.replicas.iter().find(|r| &r.uuid == uuid).cloned();
        self.replicas.retain(|replica| &replica.uuid != uuid);
        removed
    }
    /// Update replica from list
    pub(crate) fn update_replica(
        &mut self,
        uuid: &ReplicaId,
        share: Protocol,
        uri: &str,
    ) -> Option<Replica> {
        if let Some(replica) = self.replicas.iter_mut().find(|replica| &replica.uuid == uuid) {
            replica.share = share;
            replica.uri = uri.to_string();
            Some(replica.clone())
        } else {
            None
        }
    }
}

impl From<PoolWrapper> for Pool {
    fn from(pool: PoolWrapper) -> Self {
        pool.pool
    }
}
impl From<&PoolWrapper> for Pool {
    fn from(pool: &PoolWrapper) -> Self {
        pool.pool.clone()
    }
}

// greater is more suitable for a new replica:
// 1. state ( online > degraded )
// 2. fewer replicas
// 3. more free space
impl PartialOrd for PoolWrapper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolWrapper {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.pool.state.partial_cmp(&other.pool.state) {
            Some(Ordering::Greater) => Ordering::Greater,
            Some(Ordering::Less) => Ordering::Less,
            _ => match other.replicas.len().cmp(&self.replicas.len()) {
                Ordering::Greater => Ordering::Greater,
                Ordering::Less => Ordering::Less,
                Ordering::Equal => self.free_space().cmp(&other.free_space()),
            },
        }
    }
}

/// CRUD operations on a locked `NodeWrapper`, such as pools, replicas,
/// nexuses and their children.
/// When the owning node is out of sync the remote side is unreachable:
/// destroys and unpublishes then succeed synthetically by clearing the local
/// object, every other operation fails.
#[async_trait]
pub(crate) trait ClientOps {
    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError>;
    /// Destroy a pool on the node via gRPC
    async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError>;
    /// Create a replica on the pool via gRPC
    async fn create_replica(&self, request: &CreateReplica) -> Result<Replica, SvcError>;
    /// Share a replica on the pool via gRPC
    async fn share_replica(&self, request: &ShareReplica) -> Result<String, SvcError>;
    /// Unshare a replica on the pool via gRPC
    async fn unshare_replica(&self, request: &UnshareReplica) -> Result<(), SvcError>;
    /// Destroy a replica on the pool via gRPC
    async fn destroy_replica(&self, request: &DestroyReplica) -> Result<(), SvcError>;

    /// Create a nexus on the node via gRPC
    async fn create_nexus(&self, request: &CreateNexus) -> Result<Nexus, SvcError>;
    /// Destroy a nexus on the node via gRPC
    async fn destroy_nexus(&self, request: &DestroyNexus) -> Result<(), SvcError>;
    /// Publish a nexus on the node via gRPC
    async fn share_nexus(&self, request: &ShareNexus) -> Result<String, SvcError>;
    /// Unpublish a nexus on the node via gRPC
    async fn unshare_nexus(&self, request: &UnshareNexus) -> Result<(), SvcError>;
    /// Add a child to a nexus via gRPC
    async fn add_child(&self, request: &AddNexusChild) -> Result<Child, SvcError>;
    /// Remove a child from its parent nexus via gRPC
    async fn remove_child(&self, request: &RemoveNexusChild) -> Result<(), SvcError>;
}

/// Getter operations on a locked `NodeWrapper` to get copies of its resources
#[async_trait]
pub(crate) trait GetterOps {
    async fn pools(&self) -> Vec<PoolWrapper>;
    async fn pool(&self, pool_id: &PoolId) -> Option<PoolWrapper>;

    async fn replicas(&self) -> Vec<Replica>;
    async fn replica(&self, replica: &ReplicaId) -> Option<Replica>;

    async fn nexuses(&self) -> Vec<Nexus>;
    async fn nexus(&self, nexus_id: &NexusId) -> Option<Nexus>;
}

type LockedNode = Arc<tokio::sync::Mutex<NodeWrapper>>;

#[async_trait]
impl GetterOps for LockedNode {
    async fn pools(&self) -> Vec<PoolWrapper> {
        let node = self.lock().await;
        node.pools()
    }
    async fn pool(&self, pool_id: &PoolId) -> Option<PoolWrapper> {
        let node = self.lock().await;
        node.pool(pool_id).cloned()
    }
    async fn replicas(&self) -> Vec<Replica> {
        let node = self.lock().await;
        node.replicas()
    }
    async fn replica(&self, replica: &ReplicaId) -> Option<Replica> {
        let node = self.lock().await;
        node.replica(replica).cloned()
    }
    async fn nexuses(&self) -> Vec<Nexus> {
        let node = self.lock().await;
        node.nexuses()
    }
    async fn nexus(&self, nexus_id: &NexusId) -> Option<Nexus> {
        let node = self.lock().await;
        node.nexus(nexus_id).cloned()
    }
}

/// Client and sync state of the node, read under the lock before issuing the
/// actual call without it
async fn client_if_synced(node: &LockedNode, request: &str) -> Result<Arc<dyn AgentClient>, SvcError> {
    let node = node.lock().await;
    if node.is_synced() {
        Ok(node.client())
    } else {
        Err(SvcError::Internal {
            details: format!(
                "'{}' is not possible: node '{}' is out of sync",
                request, node.node.id
            ),
        })
    }
}

/// A destroy against an entity the node no longer has always succeeds
fn destroyed_ok(result: Result<(), SvcError>) -> Result<(), SvcError> {
    match result {
        Err(SvcError::GrpcRequestError { ref source, .. }) if source.code() == Code::NotFound => {
            Ok(())
        }
        other => other,
    }
}

#[async_trait]
impl ClientOps for LockedNode {
    async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError> {
        let client = client_if_synced(self, "create_pool").await?;
        let pool = client.create_pool(request).await?;
        self.lock().await.on_create_pool(&pool);
        Ok(pool)
    }

    async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError> {
        match client_if_synced(self, "destroy_pool").await {
            Ok(client) => destroyed_ok(client.destroy_pool(request).await)?,
            // the node is gone, so is the pool as far as we are concerned
            Err(_) => (),
        }
        self.lock().await.on_destroy_pool(&request.id);
        Ok(())
    }

    async fn create_replica(&self, request: &CreateReplica) -> Result<Replica, SvcError> {
        let client = client_if_synced(self, "create_replica").await?;
        let replica = client.create_replica(request).await?;
        self.lock().await.on_create_replica(&replica);
        Ok(replica)
    }

    async fn share_replica(&self, request: &ShareReplica) -> Result<String, SvcError> {
        let client = client_if_synced(self, "share_replica").await?;
        let uri = client.share_replica(request).await?;
        self.lock()
            .await
            .on_share_replica(&request.pool, &request.uuid, request.protocol, &uri);
        Ok(uri)
    }

    async fn unshare_replica(&self, request: &UnshareReplica) -> Result<(), SvcError> {
        let client = client_if_synced(self, "unshare_replica").await?;
        client.unshare_replica(request).await?;
        self.lock()
            .await
            .on_share_replica(&request.pool, &request.uuid, Protocol::Off, "");
        Ok(())
    }

    async fn destroy_replica(&self, request: &DestroyReplica) -> Result<(), SvcError> {
        match client_if_synced(self, "destroy_replica").await {
            Ok(client) => destroyed_ok(client.destroy_replica(request).await)?,
            Err(_) => (),
        }
        self.lock()
            .await
            .on_destroy_replica(&request.pool, &request.uuid);
        Ok(())
    }

    async fn create_nexus(&self, request: &CreateNexus) -> Result<Nexus, SvcError> {
        let client = client_if_synced(self, "create_nexus").await?;
        let nexus = client.create_nexus(request).await?;
        self.lock().await.on_create_nexus(&nexus);
        Ok(nexus)
    }

    async fn destroy_nexus(&self, request: &DestroyNexus) -> Result<(), SvcError> {
        match client_if_synced(self, "destroy_nexus").await {
            Ok(client) => destroyed_ok(client.destroy_nexus(request).await)?,
            Err(_) => (),
        }
        self.lock().await.on_destroy_nexus(&request.uuid);
        Ok(())
    }

    async fn share_nexus(&self, request: &ShareNexus) -> Result<String, SvcError> {
        let client = client_if_synced(self, "publish_nexus").await?;
        let uri = client.publish_nexus(request).await?;
        self.lock().await.on_share_nexus(&request.uuid, &uri);
        Ok(uri)
    }

    async fn unshare_nexus(&self, request: &UnshareNexus) -> Result<(), SvcError> {
        match client_if_synced(self, "unpublish_nexus").await {
            Ok(client) => client.unpublish_nexus(request).await?,
            Err(_) => (),
        }
        self.lock().await.on_share_nexus(&request.uuid, "");
        Ok(())
    }

    async fn add_child(&self, request: &AddNexusChild) -> Result<Child, SvcError> {
        let client = client_if_synced(self, "add_child_nexus").await?;
        let child = client.add_child(request).await?;
        self.lock().await.on_add_child(&request.nexus, &child);
        Ok(child)
    }

    async fn remove_child(&self, request: &RemoveNexusChild) -> Result<(), SvcError> {
        let client = client_if_synced(self, "remove_child_nexus").await?;
        client.remove_child(request).await?;
        self.lock().await.on_remove_child(request);
        Ok(())
    }
}
