use super::{
    events::{Event, EventAction, EventFanout, EventObject, EventQueue, VolumeSummary},
    grpc::AgentClientFactory,
    wrapper::{fetch_node_state, GetterOps, NodeWrapper, PoolWrapper},
};
use common::errors::SvcError;
use mbus_api::v0::{Nexus, NexusId, Node, NodeId, NodeState, Pool, PoolId, PoolState, Replica, ReplicaId};

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};

/// Periods and limits driving each node's sync loop
#[derive(Clone, Debug)]
pub(crate) struct RegistryOptions {
    /// steady-state period between syncs
    pub(crate) sync_period: Duration,
    /// period between syncs after a failure
    pub(crate) sync_retry: Duration,
    /// tolerated consecutive sync failures before a node goes offline
    pub(crate) sync_bad_limit: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(20),
            sync_retry: Duration::from_secs(5),
            sync_bad_limit: 2,
        }
    }
}

struct NodeHandle {
    wrapper: Arc<Mutex<NodeWrapper>>,
    /// closing this stops the node's sync task
    stop: mpsc::Sender<()>,
    /// the sync task itself, joined on shutdown
    task: JoinHandle<()>,
}

/// Registry containing all io-engine instances, each synced by its own task.
/// Instances register themselves via the `Register` message or are added when
/// their node custom resource is seen; all entity events funnel through here.
#[derive(Clone)]
pub(crate) struct Registry {
    nodes: Arc<RwLock<HashMap<NodeId, NodeHandle>>>,
    events: EventFanout,
    factory: Arc<dyn AgentClientFactory>,
    opts: Arc<RegistryOptions>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish()
    }
}

impl Registry {
    /// Create a new registry; nodes are added as they register
    pub(crate) fn new(factory: Arc<dyn AgentClientFactory>, opts: RegistryOptions) -> Self {
        Self {
            nodes: Default::default(),
            events: EventFanout::new(),
            factory,
            opts: Arc::new(opts),
        }
    }

    /// New consumer queue receiving all registry events from now on
    pub(crate) fn subscribe(&self) -> Arc<EventQueue> {
        self.events.subscribe()
    }

    /// The fan-out used to publish events, shared with the volume services
    pub(crate) fn events(&self) -> EventFanout {
        self.events.clone()
    }

    /// Add a node to the registry and start syncing it.
    /// Same name with the same endpoint is a no-op; a different endpoint
    /// reconnects the node and emits a `mod` event.
    pub(crate) async fn add_node(&self, id: &NodeId, endpoint: &str) -> Result<(), SvcError> {
        let mut nodes = self.nodes.write().await;
        if let Some(handle) = nodes.get(id) {
            let mut wrapper = handle.wrapper.lock().await;
            if wrapper.node().grpc_endpoint == endpoint {
                return Ok(());
            }
            tracing::info!(
                "Node '{}' moved from endpoint '{}' to '{}', reconnecting",
                id,
                wrapper.node().grpc_endpoint,
                endpoint
            );
            let client = self.factory.client(id, endpoint)?;
            wrapper.set_client(endpoint, client);
            return Ok(());
        }

        let client = self.factory.client(id, endpoint)?;
        let node = Node {
            id: id.clone(),
            grpc_endpoint: endpoint.to_string(),
            state: NodeState::Syncing,
        };
        let wrapper = Arc::new(Mutex::new(NodeWrapper::new(
            &node,
            client,
            self.events.clone(),
        )));
        let (stop, task) = self.spawn_sync(wrapper.clone());
        nodes.insert(
            id.clone(),
            NodeHandle {
                wrapper,
                stop,
                task,
            },
        );
        self.events
            .publish(Event::new(EventAction::New, EventObject::Node(node)));
        Ok(())
    }

    /// Remove a node from the registry, unbinding everything it owns
    pub(crate) async fn remove_node(&self, id: &NodeId) {
        let handle = self.nodes.write().await.remove(id);
        match handle {
            None => {}
            Some(handle) => {
                handle.wrapper.lock().await.unbind();
                // dropping the handle closes the stop channel of the sync task
            }
        }
    }

    /// Stop every node's sync task and wait for them to finish.
    /// The nodes and their entities are left as they are; this only runs at
    /// process shutdown.
    pub(crate) async fn shutdown(&self) {
        let handles: Vec<NodeHandle> = {
            let mut nodes = self.nodes.write().await;
            nodes.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.stop.send(()).await;
            if handle.task.await.is_err() {
                tracing::warn!("A node sync task ended in a panic");
            }
        }
    }

    fn spawn_sync(&self, wrapper: Arc<Mutex<NodeWrapper>>) -> (mpsc::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let opts = self.opts.clone();
        let task = tokio::spawn(async move {
            loop {
                let client = wrapper.lock().await.client();
                let result = fetch_node_state(client).await;
                let delay = {
                    let mut node = wrapper.lock().await;
                    match result {
                        Ok(snapshot) => {
                            node.apply_sync(snapshot);
                            opts.sync_period
                        }
                        Err(error) => {
                            node.sync_failed(&error, opts.sync_bad_limit);
                            opts.sync_retry
                        }
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.recv() => {
                        break;
                    }
                }
            }
        });
        (stop_tx, task)
    }

    /// Get all node wrappers
    pub(crate) async fn get_nodes_wrapper(&self) -> Vec<Arc<Mutex<NodeWrapper>>> {
        let nodes = self.nodes.read().await;
        nodes.values().map(|handle| handle.wrapper.clone()).collect()
    }

    /// Get node `node_id`
    pub(crate) async fn get_node_wrapper(
        &self,
        node_id: &NodeId,
    ) -> Option<Arc<Mutex<NodeWrapper>>> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).map(|handle| handle.wrapper.clone())
    }

    /// Get all nodes
    pub(crate) async fn get_nodes(&self) -> Vec<Node> {
        let mut nodes = vec![];
        for wrapper in self.get_nodes_wrapper().await {
            nodes.push(wrapper.lock().await.node().clone());
        }
        nodes
    }

    /// Get all pool wrappers
    pub(crate) async fn get_pools_wrapper(&self) -> Vec<PoolWrapper> {
        let mut pools = vec![];
        for node in self.get_nodes_wrapper().await {
            pools.extend(node.pools().await);
        }
        pools
    }

    /// Get pool `pool_id` from whichever node holds it
    pub(crate) async fn get_pool_wrapper(&self, pool_id: &PoolId) -> Option<PoolWrapper> {
        for node in self.get_nodes_wrapper().await {
            if let Some(pool) = node.pool(pool_id).await {
                return Some(pool);
            }
        }
        None
    }

    /// Get all pools
    pub(crate) async fn get_pools(&self) -> Vec<Pool> {
        self.get_pools_wrapper()
            .await
            .iter()
            .map(Pool::from)
            .collect()
    }

    /// Get all replicas
    pub(crate) async fn get_replicas(&self) -> Vec<Replica> {
        let mut replicas = vec![];
        for node in self.get_nodes_wrapper().await {
            replicas.extend(node.replicas().await);
        }
        replicas
    }

    /// Get all replicas with the given uuid, one per node at most
    pub(crate) async fn get_replicas_by_id(&self, replica_id: &ReplicaId) -> Vec<Replica> {
        let mut replicas = vec![];
        for node in self.get_nodes_wrapper().await {
            if let Some(replica) = node.replica(replica_id).await {
                replicas.push(replica);
            }
        }
        replicas
    }

    /// Get all nexuses
    pub(crate) async fn get_nexuses(&self) -> Vec<Nexus> {
        let mut nexuses = vec![];
        for node in self.get_nodes_wrapper().await {
            nexuses.extend(node.nexuses().await);
        }
        nexuses
    }

    /// Get every nexus with the given uuid; transiently there can be one per
    /// node, e.g. when a nexus pops up on the wrong node
    pub(crate) async fn get_nexuses_by_id(&self, nexus_id: &NexusId) -> Vec<Nexus> {
        let mut nexuses = vec![];
        for node in self.get_nodes_wrapper().await {
            if let Some(nexus) = node.nexus(nexus_id).await {
                nexuses.push(nexus);
            }
        }
        nexuses
    }

    /// Total free capacity over `online|degraded` pools, optionally limited to
    /// one node
    pub(crate) async fn get_capacity(&self, node_id: Option<&NodeId>) -> u64 {
        self.get_pools_wrapper()
            .await
            .iter()
            .filter(|pool| matches!(pool.state, PoolState::Online | PoolState::Degraded))
            .filter(|pool| node_id.is_none() || Some(&pool.node) == node_id)
            .map(|pool| pool.free_space())
            .sum()
    }

    /// Pools admissible for a new replica of `size` bytes, most suitable
    /// first. The caller picks the top-k with at most one pool per node.
    ///
    /// Admissible: pool state `online|degraded`, enough free space, on one of
    /// `must_nodes` when those are given, and never on an excluded node.
    /// Preference: `should_nodes` first, then healthier state, then fewer
    /// replicas, then more free space.
    pub(crate) async fn select_pools(
        &self,
        size: u64,
        must_nodes: &[NodeId],
        should_nodes: &[NodeId],
        exclude_nodes: &[NodeId],
    ) -> Vec<PoolWrapper> {
        let mut pools: Vec<PoolWrapper> = self
            .get_pools_wrapper()
            .await
            .into_iter()
            .filter(|pool| matches!(pool.state, PoolState::Online | PoolState::Degraded))
            .filter(|pool| pool.free_space() >= size)
            .filter(|pool| must_nodes.is_empty() || must_nodes.contains(&pool.node))
            .filter(|pool| !exclude_nodes.contains(&pool.node))
            .collect();

        pools.sort_by(|a, b| {
            let a_preferred = should_nodes.contains(&a.node);
            let b_preferred = should_nodes.contains(&b.node);
            b_preferred
                .cmp(&a_preferred)
                .then_with(|| b.cmp(a))
        });
        pools
    }
}

/// Back-pressured stream replaying the current state of the world as `new`
/// events before live deltas. Single-shot: a reconnecting consumer creates a
/// fresh one.
pub(crate) struct EventStream {
    queue: Arc<EventQueue>,
}

impl EventStream {
    /// Snapshot the registry (and the given volumes) into a new stream
    pub(crate) async fn new(registry: &Registry, volumes: Vec<VolumeSummary>) -> Self {
        // subscribe first so no concurrent event is lost; the snapshot is
        // then pushed in front of anything already queued
        let queue = registry.subscribe();

        let mut replay = vec![];
        for node in registry.get_nodes_wrapper().await {
            let node = node.lock().await;
            replay.push(Event::new(
                EventAction::New,
                EventObject::Node(node.node().clone()),
            ));
            for pool in node.pools() {
                replay.push(Event::new(
                    EventAction::New,
                    EventObject::Pool(Pool::from(&pool)),
                ));
                for replica in pool.replicas() {
                    replay.push(Event::new(EventAction::New, EventObject::Replica(replica)));
                }
            }
            for nexus in node.nexuses() {
                replay.push(Event::new(EventAction::New, EventObject::Nexus(nexus)));
            }
            replay.push(Event::new(
                EventAction::Sync,
                EventObject::Node(node.node().clone()),
            ));
        }
        for volume in volumes {
            replay.push(Event::new(EventAction::New, EventObject::Volume(volume)));
        }
        for event in replay.into_iter().rev() {
            queue.push_front(event);
        }
        Self { queue }
    }

    /// Next event, initial state first
    pub(crate) async fn next(&self) -> Event {
        self.queue.next().await
    }

    /// Stop the stream; the registry drops the subscription
    pub(crate) fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fake::{FakeAgent, FakeFactory};
    use mbus_api::v0::{ChildState, NexusState, ReplicaState};

    fn test_opts() -> RegistryOptions {
        RegistryOptions {
            sync_period: Duration::from_millis(50),
            sync_retry: Duration::from_millis(20),
            sync_bad_limit: 0,
        }
    }

    fn pool(node: &str, id: &str, state: PoolState, capacity: u64, used: u64) -> Pool {
        Pool {
            node: node.into(),
            id: id.into(),
            disks: vec!["aio:///dev/sdx".into()],
            state,
            capacity,
            used,
        }
    }

    fn replica(node: &str, pool: &str, uuid: &str) -> Replica {
        Replica {
            node: node.into(),
            pool: pool.into(),
            uuid: uuid.into(),
            size: 10,
            uri: format!("bdev:///{}?uuid={}", uuid, uuid),
            state: ReplicaState::Online,
            ..Default::default()
        }
    }

    async fn wait_until_synced(registry: &Registry, node: &str) {
        for _ in 0..100 {
            if let Some(wrapper) = registry.get_node_wrapper(&node.into()).await {
                if wrapper.lock().await.is_synced() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node '{}' never synced", node);
    }

    async fn wait_until_state(registry: &Registry, node: &str, state: NodeState) {
        for _ in 0..100 {
            let nodes = registry.get_nodes().await;
            if nodes.iter().any(|n| n.id.as_str() == node && n.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node '{}' never reached {:?}", node, state);
    }

    async fn next_event(queue: &Arc<EventQueue>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .expect("timed out waiting for an event")
    }

    #[tokio::test]
    async fn same_endpoint_registration_is_a_no_op() {
        let factory = Arc::new(FakeFactory::new());
        factory.add_agent("node-1", FakeAgent::new("node-1"));
        let registry = Registry::new(factory.clone(), test_opts());

        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        wait_until_synced(&registry, "node-1").await;

        let queue = registry.subscribe();
        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        assert!(queue.try_next().is_none());

        // a different endpoint reconnects and re-syncs
        registry
            .add_node(&"node-1".into(), "10.1.0.9:10124")
            .await
            .unwrap();
        let event = next_event(&queue).await;
        match event.object {
            EventObject::Node(node) => {
                assert_eq!(event.action, EventAction::Mod);
                assert_eq!(node.grpc_endpoint, "10.1.0.9:10124");
            }
            other => panic!("expected a node event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn offline_round_trip_emits_children_first() {
        let factory = Arc::new(FakeFactory::new());
        let agent = FakeAgent::new("node-1");
        agent.add_pool(pool("node-1", "pool-1", PoolState::Online, 100, 10));
        agent.add_replica(replica("node-1", "pool-1", "111e4910-c10a-4c70-b591-909d2b412b37"));
        factory.add_agent("node-1", agent.clone());
        let registry = Registry::new(factory.clone(), test_opts());

        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        wait_until_synced(&registry, "node-1").await;

        let queue = registry.subscribe();
        agent.set_failing(Some(tonic::Code::Unavailable));
        wait_until_state(&registry, "node-1", NodeState::Offline).await;

        // pool and replica offline mods arrive before the node offline mod
        let mut order = vec![];
        loop {
            let event = next_event(&queue).await;
            assert_eq!(event.action, EventAction::Mod);
            match event.object {
                EventObject::Pool(pool) => {
                    assert_eq!(pool.state, PoolState::Offline);
                    order.push("pool");
                }
                EventObject::Replica(replica) => {
                    assert_eq!(replica.state, ReplicaState::Offline);
                    order.push("replica");
                }
                EventObject::Node(node) => {
                    assert_eq!(node.state, NodeState::Offline);
                    order.push("node");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(order, vec!["pool", "replica", "node"]);

        // on recovery the entities come back online before the node does
        agent.set_failing(None);
        wait_until_state(&registry, "node-1", NodeState::Online).await;
        let mut order = vec![];
        loop {
            let event = next_event(&queue).await;
            match (&event.action, event.object) {
                (EventAction::Mod, EventObject::Pool(pool)) => {
                    assert_eq!(pool.state, PoolState::Online);
                    order.push("pool");
                }
                (EventAction::Mod, EventObject::Replica(replica)) => {
                    assert_eq!(replica.state, ReplicaState::Online);
                    order.push("replica");
                }
                (EventAction::Mod, EventObject::Node(node)) => {
                    assert_eq!(node.state, NodeState::Online);
                    order.push("node");
                }
                (EventAction::Sync, EventObject::Node(_)) => {
                    order.push("sync");
                    break;
                }
                other => panic!("unexpected event {:?}", other.0),
            }
        }
        assert_eq!(order, vec!["pool", "replica", "node", "sync"]);
    }

    #[tokio::test]
    async fn pool_selection_is_admissible_and_sorted() {
        let factory = Arc::new(FakeFactory::new());

        let agent1 = FakeAgent::new("node-1");
        agent1.add_pool(pool("node-1", "pool-1", PoolState::Online, 100, 0));
        agent1.add_replica(replica("node-1", "pool-1", "26a16b86-3c47-4b0e-8b6c-3862bcdc8cbd"));
        factory.add_agent("node-1", agent1);

        let agent2 = FakeAgent::new("node-2");
        agent2.add_pool(pool("node-2", "pool-2", PoolState::Online, 50, 0));
        factory.add_agent("node-2", agent2);

        let agent3 = FakeAgent::new("node-3");
        agent3.add_pool(pool("node-3", "pool-3", PoolState::Degraded, 200, 0));
        factory.add_agent("node-3", agent3);

        let agent4 = FakeAgent::new("node-4");
        agent4.add_pool(pool("node-4", "pool-4", PoolState::Faulted, 500, 0));
        factory.add_agent("node-4", agent4);

        let registry = Registry::new(factory.clone(), test_opts());
        for (i, node) in ["node-1", "node-2", "node-3", "node-4"].iter().enumerate() {
            registry
                .add_node(&(*node).into(), &format!("10.1.0.{}:10124", i + 1))
                .await
                .unwrap();
            wait_until_synced(&registry, node).await;
        }

        // faulted pools are never admissible
        let pools = registry.select_pools(10, &[], &[], &[]).await;
        let ids: Vec<&str> = pools.iter().map(|pool| pool.id.as_str()).collect();
        assert_eq!(ids, vec!["pool-2", "pool-1", "pool-3"]);

        // preferred nodes win over state
        let pools = registry
            .select_pools(10, &[], &["node-3".into()], &[])
            .await;
        let ids: Vec<&str> = pools.iter().map(|pool| pool.id.as_str()).collect();
        assert_eq!(ids, vec!["pool-3", "pool-2", "pool-1"]);

        // must-nodes restrict the candidates
        let pools = registry
            .select_pools(10, &["node-1".into()], &[], &[])
            .await;
        let ids: Vec<&str> = pools.iter().map(|pool| pool.id.as_str()).collect();
        assert_eq!(ids, vec!["pool-1"]);

        // excluded nodes are filtered even when admissible
        let pools = registry
            .select_pools(10, &[], &[], &["node-2".into()])
            .await;
        assert!(pools.iter().all(|pool| pool.node.as_str() != "node-2"));

        // size is a hard requirement
        let pools = registry.select_pools(150, &[], &[], &[]).await;
        let ids: Vec<&str> = pools.iter().map(|pool| pool.id.as_str()).collect();
        assert_eq!(ids, vec!["pool-3"]);

        // capacity only counts usable pools
        assert_eq!(registry.get_capacity(None).await, 100 + 50 + 200);
        assert_eq!(
            registry.get_capacity(Some(&"node-2".into())).await,
            50
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_sync_tasks() {
        let factory = Arc::new(FakeFactory::new());
        let agent = FakeAgent::new("node-1");
        factory.add_agent("node-1", agent.clone());
        let registry = Registry::new(factory.clone(), test_opts());
        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        wait_until_synced(&registry, "node-1").await;

        registry.shutdown().await;
        let syncs = agent.call_count("list_pools");
        tokio::time::sleep(Duration::from_millis(200)).await;
        // no sync has run since the tasks were joined
        assert_eq!(agent.call_count("list_pools"), syncs);
        assert!(registry.get_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn event_stream_replays_initial_state_then_deltas() {
        let factory = Arc::new(FakeFactory::new());
        let agent = FakeAgent::new("node-1");
        agent.add_pool(pool("node-1", "pool-1", PoolState::Online, 100, 10));
        agent.add_replica(replica("node-1", "pool-1", "111e4910-c10a-4c70-b591-909d2b412b37"));
        agent.add_nexus(Nexus {
            node: "node-1".into(),
            uuid: "83f3bb9b-e378-4e6c-8e25-f75f2d0d16c4".into(),
            size: 10,
            state: NexusState::Online,
            children: vec![mbus_api::v0::Child {
                uri: "bdev:///c".into(),
                state: ChildState::Online,
                rebuild_progress: None,
            }],
            device_uri: "".into(),
            rebuilds: 0,
        });
        factory.add_agent("node-1", agent);
        let registry = Registry::new(factory.clone(), test_opts());
        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        wait_until_synced(&registry, "node-1").await;

        let stream = EventStream::new(&registry, vec![]).await;
        let mut news = 0;
        let mut syncs = 0;
        // node + pool + replica + nexus news, one sync, in hierarchical order
        let mut kinds = vec![];
        for _ in 0..5 {
            let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("replay truncated");
            match (&event.action, &event.object) {
                (EventAction::New, EventObject::Node(_)) => {
                    news += 1;
                    kinds.push("node");
                }
                (EventAction::New, EventObject::Pool(_)) => {
                    news += 1;
                    kinds.push("pool");
                }
                (EventAction::New, EventObject::Replica(_)) => {
                    news += 1;
                    kinds.push("replica");
                }
                (EventAction::New, EventObject::Nexus(_)) => {
                    news += 1;
                    kinds.push("nexus");
                }
                (EventAction::Sync, EventObject::Node(_)) => {
                    syncs += 1;
                    kinds.push("sync");
                }
                other => panic!("unexpected replay event {:?}", other.0),
            }
        }
        assert_eq!(news, 4);
        assert_eq!(syncs, 1);
        assert_eq!(kinds, vec!["node", "pool", "replica", "nexus", "sync"]);
        stream.close();
    }
}
