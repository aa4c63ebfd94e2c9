//! The per-volume reconciliation state machine.
//!
//! A volume declares what should exist (spec, publish target); the registry
//! holds what does exist. Each tick compares the two and issues at most one
//! corrective operation per pass, re-reading the registry after every
//! suspension point, until nothing is left to correct. The volume only keeps
//! key references to its entities; the objects themselves always come fresh
//! from the registry.

use crate::core::{
    registry::Registry,
    wrapper::ClientOps,
};
use common::{
    errors::{ErrorChain, NotEnough, SvcError},
    store::nexus::NexusInfoStore,
};
use mbus_api::v0::{
    AddNexusChild, Child, ChildState, ChildUri, CreateNexus, CreateReplica, DestroyNexus,
    DestroyReplica, Nexus, NexusId, NexusState, NodeId, PoolId, Protocol, RemoveNexusChild,
    Replica, ReplicaId, ReplicaState, ShareNexus, ShareReplica, UnshareReplica, VolumeId,
    VolumeSpec, VolumeState,
};

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Tunables of the reconciliation loop
#[derive(Clone, Debug)]
pub(crate) struct VolumeOptions {
    /// safety-net period between unprompted reconcile ticks
    pub(crate) reconcile_period: Duration,
    /// how long a replica may stay offline before it is replaced
    pub(crate) replica_grace: Duration,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            reconcile_period: Duration::from_secs(5),
            replica_grace: Duration::from_secs(300),
        }
    }
}

/// A replicated volume: declared spec plus the keys of the entities which
/// currently realise it
#[derive(Clone, Debug)]
pub(crate) struct Volume {
    /// uuid of the volume; its nexus and replicas carry the same uuid
    pub(crate) uuid: VolumeId,
    /// declared specification
    pub(crate) spec: VolumeSpec,
    /// derived state, refreshed at the end of every tick
    pub(crate) state: VolumeState,
    /// node the volume must be accessible from, None when unpublished
    pub(crate) published_on: Option<NodeId>,
    /// device uri of the published nexus
    pub(crate) device_uri: String,
    /// nodes which hold (or held, until reconciled) a replica of the volume
    pub(crate) replicas: HashMap<NodeId, ReplicaId>,
    /// node believed to host the volume's nexus
    pub(crate) nexus: Option<NodeId>,
    /// when each currently-offline replica was first seen offline
    offline_since: HashMap<NodeId, Instant>,
}

impl Volume {
    /// New volume from a create request; nothing exists on any node yet
    pub(crate) fn new(uuid: &VolumeId, spec: &VolumeSpec) -> Self {
        Self {
            uuid: uuid.clone(),
            spec: spec.clone(),
            state: VolumeState::Pending,
            published_on: None,
            device_uri: "".to_string(),
            replicas: HashMap::new(),
            nexus: None,
            offline_since: HashMap::new(),
        }
    }

    /// Reconstruct a volume from entities found in the registry.
    /// The spec is inferred from what exists; the state stays `unknown` until
    /// the first tick classifies it.
    pub(crate) fn import(uuid: &VolumeId, replicas: &[Replica], nexus: Option<&Nexus>) -> Self {
        let size = replicas
            .iter()
            .map(|replica| replica.size)
            .max()
            .or_else(|| nexus.map(|nexus| nexus.size))
            .unwrap_or_default();
        let protocol = match nexus {
            Some(nexus) if nexus.device_uri.starts_with("iscsi://") => Protocol::Iscsi,
            _ => Protocol::Nvmf,
        };
        let published = match nexus {
            Some(nexus) if !nexus.device_uri.is_empty() => Some(nexus.node.clone()),
            _ => None,
        };
        Self {
            uuid: uuid.clone(),
            spec: VolumeSpec {
                replica_count: replicas.len().max(1) as u64,
                local: false,
                preferred_nodes: vec![],
                required_nodes: vec![],
                required_bytes: size,
                limit_bytes: 0,
                protocol,
                io_timeout: None,
            },
            state: VolumeState::Unknown,
            published_on: published,
            device_uri: nexus.map(|nexus| nexus.device_uri.clone()).unwrap_or_default(),
            replicas: replicas
                .iter()
                .map(|replica| (replica.node.clone(), replica.uuid.clone()))
                .collect(),
            nexus: nexus.map(|nexus| nexus.node.clone()),
            offline_since: HashMap::new(),
        }
    }

    /// The id shared by the volume's replicas
    pub(crate) fn replica_id(&self) -> ReplicaId {
        ReplicaId::from(self.uuid.as_str())
    }
    /// The id of the volume's nexus
    pub(crate) fn nexus_id(&self) -> NexusId {
        NexusId::from(self.uuid.as_str())
    }

    /// Check that `new` is an acceptable successor of the current spec.
    /// Returns whether anything changed; protocol changes, shrinking and
    /// growing past the limit are refused.
    pub(crate) fn allowed_update(&self, new: &VolumeSpec) -> Result<bool, SvcError> {
        if new.protocol != self.spec.protocol {
            return Err(SvcError::InvalidArgument {
                kind: "protocol".to_string(),
                value: format!(
                    "cannot be changed from {} to {}",
                    self.spec.protocol, new.protocol
                ),
            });
        }
        if new.required_bytes < self.spec.required_bytes {
            return Err(SvcError::InvalidArgument {
                kind: "requiredBytes".to_string(),
                value: format!(
                    "cannot shrink from {} to {}",
                    self.spec.required_bytes, new.required_bytes
                ),
            });
        }
        if self.spec.limit_bytes != 0 && new.required_bytes > self.spec.limit_bytes {
            return Err(SvcError::InvalidArgument {
                kind: "requiredBytes".to_string(),
                value: format!(
                    "cannot grow past the limit of {} bytes",
                    self.spec.limit_bytes
                ),
            });
        }
        if new.io_timeout.is_some() && new.protocol != Protocol::Nvmf {
            return Err(SvcError::InvalidArgument {
                kind: "ioTimeout".to_string(),
                value: "only supported over nvmf".to_string(),
            });
        }
        Ok(new != &self.spec)
    }
}

/// One corrective operation; a tick executes these one at a time, re-planning
/// in between
#[derive(Debug)]
enum Action {
    /// drop a replica whose pool is gone from the bookkeeping, no RPC
    ForgetReplica(NodeId),
    /// start tracking a replica found in the registry, no RPC
    AdoptReplica(Replica),
    /// start tracking a nexus found on the publish target, no RPC
    AdoptNexus(NodeId),
    /// destroy a nexus living on the wrong node
    DestroyForeignNexus(Nexus),
    /// create a replica on the selected pool
    CreateReplica { node: NodeId, pool: PoolId },
    /// fix a replica's share protocol
    ShareReplica(Replica),
    UnshareReplica(Replica),
    /// remove the least preferred replica (its child first)
    RemoveReplica(Replica),
    /// attach an existing replica to the nexus
    AddChild(Replica),
    /// assemble the nexus on the publish target
    CreateNexus { node: NodeId, children: Vec<Replica> },
    /// expose the nexus over the spec protocol
    PublishNexus(NodeId),
    /// tear down an unpublished nexus
    DestroyNexus(NodeId),
    /// the publish target is not in the registry at all
    MarkOffline,
}

/// Everything a planning pass reads, gathered in one place
struct Observed {
    volume: Volume,
    /// live replicas by node
    replicas: HashMap<NodeId, Replica>,
    /// live nexuses carrying the volume uuid, usually zero or one
    nexuses: Vec<Nexus>,
}

impl Observed {
    async fn read(volume: &Arc<Mutex<Volume>>, registry: &Registry) -> Observed {
        let snapshot = volume.lock().await.clone();
        let replicas = registry
            .get_replicas_by_id(&snapshot.replica_id())
            .await
            .into_iter()
            .map(|replica| (replica.node.clone(), replica))
            .collect();
        let nexuses = registry.get_nexuses_by_id(&snapshot.nexus_id()).await;
        Observed {
            volume: snapshot,
            replicas,
            nexuses,
        }
    }

    /// The nexus on the node we track as the volume's nexus host
    fn tracked_nexus(&self) -> Option<&Nexus> {
        let node = self.volume.nexus.as_ref()?;
        self.nexuses.iter().find(|nexus| &nexus.node == node)
    }

    /// The node the nexus should live on, which drives the share protocol of
    /// every replica
    fn target_node(&self) -> Option<&NodeId> {
        self.volume.published_on.as_ref().or(self.volume.nexus.as_ref())
    }

    /// The nexus child backed by the given replica
    fn child_of(&self, replica: &Replica) -> Option<&Child> {
        self.tracked_nexus()?
            .children
            .iter()
            .find(|child| child.uri.as_str() == replica.uri)
    }

    fn rebuilding(&self) -> bool {
        self.nexuses.iter().any(|nexus| nexus.is_rebuilding())
    }
}

/// Number of corrective actions a single tick may take before yielding;
/// anything left over is picked up by the next tick
const MAX_ACTIONS_PER_TICK: usize = 10;

/// One reconciliation tick: plan and execute corrective actions until the
/// observed state matches the spec, then derive the volume state.
/// The caller must hold the volume's operation lock.
pub(crate) async fn reconcile(
    volume: &Arc<Mutex<Volume>>,
    registry: &Registry,
    store: &Arc<dyn NexusInfoStore>,
    opts: &VolumeOptions,
) -> Result<(), SvcError> {
    let mut result = Ok(());
    for _ in 0..MAX_ACTIONS_PER_TICK {
        let observed = Observed::read(volume, registry).await;
        if observed.volume.state == VolumeState::Destroyed {
            return Ok(());
        }
        track_offline_replicas(volume, &observed).await;

        let action = match plan(&observed, registry, opts).await {
            Ok(None) => break,
            Ok(Some(action)) => action,
            Err(error) => {
                result = Err(error);
                break;
            }
        };
        tracing::trace!(volume.uuid = %observed.volume.uuid, "Correcting: {:?}", action);
        if let Err(error) = execute(action, volume, &observed, registry, store).await {
            // transient errors recover on a later tick, the rest bubble up
            if error.is_retryable() {
                tracing::warn!(
                    volume.uuid = %observed.volume.uuid,
                    "Reconciliation postponed: {}",
                    error.full_string()
                );
            } else {
                result = Err(error);
            }
            break;
        }
    }

    derive_state(volume, registry).await;
    result
}

/// Keep `offline_since` in step with what the registry reports
async fn track_offline_replicas(volume: &Arc<Mutex<Volume>>, observed: &Observed) {
    let mut vol = volume.lock().await;
    let offline: Vec<NodeId> = observed
        .replicas
        .values()
        .filter(|replica| replica.state == ReplicaState::Offline)
        .map(|replica| replica.node.clone())
        .collect();
    vol.offline_since.retain(|node, _| offline.contains(node));
    for node in offline {
        vol.offline_since.entry(node).or_insert_with(Instant::now);
    }
}

async fn plan(
    observed: &Observed,
    registry: &Registry,
    opts: &VolumeOptions,
) -> Result<Option<Action>, SvcError> {
    let vol = &observed.volume;

    // replicas whose backing objects are gone are dropped from the
    // bookkeeping; replicas found in the registry but not tracked are adopted
    for node in vol.replicas.keys() {
        if !observed.replicas.contains_key(node) {
            return Ok(Some(Action::ForgetReplica(node.clone())));
        }
    }
    for (node, replica) in &observed.replicas {
        if !vol.replicas.contains_key(node) {
            return Ok(Some(Action::AdoptReplica(replica.clone())));
        }
    }

    // a nexus on any node other than the publish target is never legitimate
    if let Some(target) = &vol.published_on {
        if let Some(foreign) = observed
            .nexuses
            .iter()
            .find(|nexus| &nexus.node != target)
        {
            return Ok(Some(Action::DestroyForeignNexus(foreign.clone())));
        }
        if vol.nexus.as_ref() != Some(target)
            && observed.nexuses.iter().any(|nexus| &nexus.node == target)
        {
            return Ok(Some(Action::AdoptNexus(target.clone())));
        }
    }

    // usable replicas count towards the declared replica count; a replica
    // whose child is faulted, or which has been offline past the grace
    // period, needs replacing
    let usable = |replica: &Replica| -> bool {
        if observed.child_of(replica).map(|child| child.state.clone()) == Some(ChildState::Faulted)
        {
            return false;
        }
        if replica.state == ReplicaState::Offline {
            let expired = vol
                .offline_since
                .get(&replica.node)
                .map(|since| since.elapsed() >= opts.replica_grace)
                .unwrap_or(false);
            return !expired;
        }
        true
    };
    let usable_count = observed.replicas.values().filter(|r| usable(r)).count() as u64;

    if usable_count < vol.spec.replica_count {
        let exclude: Vec<NodeId> = vol.replicas.keys().cloned().collect();
        let pools = registry
            .select_pools(
                vol.spec.required_bytes,
                &vol.spec.required_nodes,
                &vol.spec.preferred_nodes,
                &exclude,
            )
            .await;
        match pools.first() {
            Some(pool) => {
                return Ok(Some(Action::CreateReplica {
                    node: pool.node.clone(),
                    pool: pool.id.clone(),
                }))
            }
            None => {
                return Err(NotEnough::OfPools {
                    have: 0,
                    need: vol.spec.replica_count - usable_count,
                }
                .into())
            }
        }
    }

    // a freshly scaled-up replica is only half done until it serves the
    // nexus: share it for cross-node access and attach it as a (rebuilding)
    // child before anything may be scaled down
    if let (Some(target), Some(nexus)) = (vol.published_on.as_ref(), observed.nexuses.first()) {
        if &nexus.node == target {
            for replica in observed.replicas.values() {
                if !usable(replica)
                    || replica.state == ReplicaState::Offline
                    || nexus
                        .children
                        .iter()
                        .any(|child| child.uri.as_str() == replica.uri)
                {
                    continue;
                }
                let local = &replica.node == target;
                match (local, replica.share) {
                    (true, Protocol::Off) | (false, Protocol::Nvmf) => {
                        return Ok(Some(Action::AddChild(replica.clone())))
                    }
                    (true, _) => return Ok(Some(Action::UnshareReplica(replica.clone()))),
                    (false, _) => return Ok(Some(Action::ShareReplica(replica.clone()))),
                }
            }
        }
    }

    // scale down, but never while a rebuild is running; the least preferred
    // replica goes: broken ones first, then those on the worst-state pool,
    // then those on the fullest pool
    if vol.replicas.len() as u64 > vol.spec.replica_count && !observed.rebuilding() {
        let pools: HashMap<PoolId, (u8, u64)> = registry
            .get_pools_wrapper()
            .await
            .into_iter()
            .map(|pool| {
                let state_rank = match pool.state {
                    mbus_api::v0::PoolState::Online => 0u8,
                    mbus_api::v0::PoolState::Degraded => 1,
                    mbus_api::v0::PoolState::Faulted => 2,
                    mbus_api::v0::PoolState::Unknown => 3,
                    mbus_api::v0::PoolState::Offline => 4,
                };
                (pool.id.clone(), (state_rank, pool.used))
            })
            .collect();
        let mut candidates: Vec<&Replica> = observed.replicas.values().collect();
        candidates.sort_by_key(|replica| {
            let broken = !usable(replica) || replica.state == ReplicaState::Offline;
            let (pool_rank, pool_used) = pools
                .get(&replica.pool)
                .copied()
                .unwrap_or((u8::MAX, u64::MAX));
            std::cmp::Reverse((broken, pool_rank, pool_used))
        });
        if let Some(victim) = candidates.first() {
            return Ok(Some(Action::RemoveReplica((*victim).clone())));
        }
    }

    // each replica is unshared iff it is local to the (intended) nexus node
    let target = observed.target_node();
    for replica in observed.replicas.values() {
        if replica.state == ReplicaState::Offline {
            continue;
        }
        let local = match target {
            None => true,
            Some(node) => &replica.node == node,
        };
        match (local, replica.share) {
            (true, Protocol::Off) | (false, Protocol::Nvmf) => {}
            (true, _) => return Ok(Some(Action::UnshareReplica(replica.clone()))),
            (false, _) => return Ok(Some(Action::ShareReplica(replica.clone()))),
        }
    }

    // nexus exists exactly when the volume is published
    match &vol.published_on {
        Some(target) => {
            if registry.get_node_wrapper(target).await.is_none() {
                if vol.state != VolumeState::Offline {
                    return Ok(Some(Action::MarkOffline));
                }
                return Ok(None);
            }
            let on_target = observed.nexuses.iter().find(|nexus| &nexus.node == target);
            match on_target {
                None => {
                    let children: Vec<Replica> = observed
                        .replicas
                        .values()
                        .filter(|replica| {
                            usable(replica) && replica.state != ReplicaState::Offline
                        })
                        .cloned()
                        .collect();
                    if children.is_empty() {
                        return Err(SvcError::Internal {
                            details: format!(
                                "volume '{}' has no usable replica to assemble a nexus from",
                                vol.uuid
                            ),
                        });
                    }
                    return Ok(Some(Action::CreateNexus {
                        node: target.clone(),
                        children,
                    }));
                }
                Some(nexus) => {
                    if nexus.device_uri.is_empty() {
                        return Ok(Some(Action::PublishNexus(target.clone())));
                    }
                }
            }
        }
        None => {
            if let Some(nexus) = observed.nexuses.first() {
                if !nexus.is_rebuilding() {
                    return Ok(Some(Action::DestroyNexus(nexus.node.clone())));
                }
            }
        }
    }

    Ok(None)
}

async fn execute(
    action: Action,
    volume: &Arc<Mutex<Volume>>,
    observed: &Observed,
    registry: &Registry,
    store: &Arc<dyn NexusInfoStore>,
) -> Result<(), SvcError> {
    let vol = &observed.volume;
    match action {
        Action::ForgetReplica(node) => {
            volume.lock().await.replicas.remove(&node);
        }
        Action::AdoptReplica(replica) => {
            volume
                .lock()
                .await
                .replicas
                .insert(replica.node.clone(), replica.uuid.clone());
        }
        Action::AdoptNexus(node) => {
            let mut vol = volume.lock().await;
            vol.nexus = Some(node);
        }
        Action::DestroyForeignNexus(nexus) => {
            let node = registry
                .get_node_wrapper(&nexus.node)
                .await
                .ok_or(SvcError::NodeNotFound {
                    node_id: nexus.node.clone(),
                })?;
            node.destroy_nexus(&DestroyNexus {
                node: nexus.node.clone(),
                uuid: nexus.uuid.clone(),
            })
            .await?;
            let mut vol = volume.lock().await;
            if vol.nexus == Some(nexus.node.clone()) {
                vol.nexus = None;
                vol.device_uri.clear();
            }
        }
        Action::CreateReplica { node, pool } => {
            let wrapper =
                registry
                    .get_node_wrapper(&node)
                    .await
                    .ok_or(SvcError::NodeNotFound {
                        node_id: node.clone(),
                    })?;
            let replica = wrapper
                .create_replica(&CreateReplica {
                    node: node.clone(),
                    uuid: vol.replica_id(),
                    pool,
                    size: vol.spec.required_bytes,
                    thin: false,
                    share: Protocol::Off,
                })
                .await?;
            volume
                .lock()
                .await
                .replicas
                .insert(node, replica.uuid.clone());
        }
        Action::ShareReplica(replica) => {
            let node = registry
                .get_node_wrapper(&replica.node)
                .await
                .ok_or(SvcError::NodeNotFound {
                    node_id: replica.node.clone(),
                })?;
            node.share_replica(&ShareReplica {
                node: replica.node.clone(),
                pool: replica.pool.clone(),
                uuid: replica.uuid.clone(),
                protocol: Protocol::Nvmf,
            })
            .await?;
        }
        Action::UnshareReplica(replica) => {
            let node = registry
                .get_node_wrapper(&replica.node)
                .await
                .ok_or(SvcError::NodeNotFound {
                    node_id: replica.node.clone(),
                })?;
            node.unshare_replica(&UnshareReplica {
                node: replica.node.clone(),
                pool: replica.pool.clone(),
                uuid: replica.uuid.clone(),
            })
            .await?;
        }
        Action::RemoveReplica(replica) => {
            // the child goes first so the nexus never fans out to a dead leg
            if let Some(nexus) = observed.tracked_nexus() {
                if nexus
                    .children
                    .iter()
                    .any(|child| child.uri.as_str() == replica.uri)
                {
                    let node = registry.get_node_wrapper(&nexus.node).await.ok_or(
                        SvcError::NodeNotFound {
                            node_id: nexus.node.clone(),
                        },
                    )?;
                    node.remove_child(&RemoveNexusChild {
                        node: nexus.node.clone(),
                        nexus: nexus.uuid.clone(),
                        uri: ChildUri::from(replica.uri.clone()),
                    })
                    .await?;
                }
            }
            let node = registry
                .get_node_wrapper(&replica.node)
                .await
                .ok_or(SvcError::NodeNotFound {
                    node_id: replica.node.clone(),
                })?;
            node.destroy_replica(&DestroyReplica {
                node: replica.node.clone(),
                pool: replica.pool.clone(),
                uuid: replica.uuid.clone(),
            })
            .await?;
            volume.lock().await.replicas.remove(&replica.node);
        }
        Action::CreateNexus { node, children } => {
            // only children the health records allow may participate in a
            // fresh nexus; an empty or missing record lets everything through
            let children = store
                .filter_replicas(&vol.nexus_id(), children)
                .await
                .map_err(SvcError::from)?;
            if children.is_empty() {
                return Err(SvcError::Internal {
                    details: format!(
                        "volume '{}': no child is known to hold consistent data",
                        vol.uuid
                    ),
                });
            }
            let wrapper =
                registry
                    .get_node_wrapper(&node)
                    .await
                    .ok_or(SvcError::NodeNotFound {
                        node_id: node.clone(),
                    })?;
            wrapper
                .create_nexus(&CreateNexus {
                    node: node.clone(),
                    uuid: vol.nexus_id(),
                    size: vol.spec.required_bytes,
                    children: children
                        .iter()
                        .map(|replica| ChildUri::from(replica.uri.clone()))
                        .collect(),
                })
                .await?;
            volume.lock().await.nexus = Some(node);
        }
        Action::PublishNexus(node) => {
            let wrapper =
                registry
                    .get_node_wrapper(&node)
                    .await
                    .ok_or(SvcError::NodeNotFound {
                        node_id: node.clone(),
                    })?;
            let uri = wrapper
                .share_nexus(&ShareNexus {
                    node: node.clone(),
                    uuid: vol.nexus_id(),
                    key: None,
                    protocol: vol.spec.protocol,
                })
                .await?;
            volume.lock().await.device_uri = uri;
        }
        Action::DestroyNexus(node) => {
            let wrapper =
                registry
                    .get_node_wrapper(&node)
                    .await
                    .ok_or(SvcError::NodeNotFound {
                        node_id: node.clone(),
                    })?;
            wrapper
                .destroy_nexus(&DestroyNexus {
                    node: node.clone(),
                    uuid: vol.nexus_id(),
                })
                .await?;
            let mut vol = volume.lock().await;
            vol.nexus = None;
            vol.device_uri.clear();
        }
        Action::AddChild(replica) => {
            let nexus_node = observed
                .target_node()
                .cloned()
                .ok_or(SvcError::Internal {
                    details: "no nexus to attach the child to".to_string(),
                })?;
            let wrapper = registry.get_node_wrapper(&nexus_node).await.ok_or(
                SvcError::NodeNotFound {
                    node_id: nexus_node.clone(),
                },
            )?;
            wrapper
                .add_child(&AddNexusChild {
                    node: nexus_node,
                    nexus: vol.nexus_id(),
                    uri: ChildUri::from(replica.uri.clone()),
                    auto_rebuild: true,
                })
                .await?;
        }
        Action::MarkOffline => {
            volume.lock().await.state = VolumeState::Offline;
        }
    }
    Ok(())
}

/// Classify the volume from what the registry currently reports
pub(crate) async fn derive_state(volume: &Arc<Mutex<Volume>>, registry: &Registry) {
    let observed = Observed::read(volume, registry).await;
    let vol = &observed.volume;
    if vol.state == VolumeState::Destroyed {
        return;
    }

    let state = match &vol.published_on {
        Some(target) => {
            if registry.get_node_wrapper(target).await.is_none() {
                VolumeState::Offline
            } else {
                match observed.nexuses.iter().find(|nexus| &nexus.node == target) {
                    None => {
                        // the nexus is yet to be assembled
                        if vol.replicas.is_empty() {
                            VolumeState::Pending
                        } else {
                            VolumeState::Degraded
                        }
                    }
                    Some(nexus) if nexus.state == NexusState::Offline => VolumeState::Offline,
                    Some(nexus) => {
                        let online = nexus
                            .children
                            .iter()
                            .filter(|child| child.state == ChildState::Online)
                            .count();
                        let usable = nexus
                            .children
                            .iter()
                            .filter(|child| child.state != ChildState::Faulted)
                            .count();
                        if online == nexus.children.len()
                            && online as u64 == vol.spec.replica_count
                        {
                            VolumeState::Healthy
                        } else if usable > 0 {
                            VolumeState::Degraded
                        } else {
                            VolumeState::Faulted
                        }
                    }
                }
            }
        }
        None => {
            let online = observed
                .replicas
                .values()
                .filter(|replica| replica.state == ReplicaState::Online)
                .count();
            if observed.replicas.is_empty() {
                if vol.replicas.is_empty() {
                    VolumeState::Pending
                } else {
                    VolumeState::Faulted
                }
            } else if online as u64 >= vol.spec.replica_count {
                VolumeState::Healthy
            } else if online > 0 {
                VolumeState::Degraded
            } else {
                VolumeState::Faulted
            }
        }
    };

    volume.lock().await.state = state;
}
