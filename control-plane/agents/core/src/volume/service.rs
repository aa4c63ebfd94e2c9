use super::volume::{reconcile, Volume, VolumeOptions};
use crate::core::{
    events::{Event, EventAction, EventFanout, EventObject, VolumeSummary},
    registry::{EventStream, Registry},
    wrapper::ClientOps,
};
use common::{
    errors::{ErrorChain, SvcError},
    store::nexus::NexusInfoStore,
};
use mbus_api::v0::{
    DestroyNexus, DestroyReplica, NexusId, NodeId, NodeState, Protocol, ReplicaId, VolumeId,
    VolumeSpec, VolumeState,
};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};

#[derive(Clone)]
struct VolumeEntry {
    volume: Arc<Mutex<Volume>>,
    tick: mpsc::Sender<()>,
}

/// The volumes manager: owns every volume, serializes the operations on each
/// one through a fair per-uuid mutex, imports pre-existing volumes from the
/// registry and fans registry events into per-volume reconcile ticks.
#[derive(Clone)]
pub(crate) struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    store: Arc<dyn NexusInfoStore>,
    opts: VolumeOptions,
    volumes: RwLock<HashMap<VolumeId, VolumeEntry>>,
    op_locks: StdMutex<HashMap<VolumeId, Arc<Mutex<()>>>>,
    events: EventFanout,
    ready: AtomicBool,
    /// flipped to true exactly once, when the process is going down
    shutdown: watch::Sender<bool>,
    /// actor task per volume, joined on shutdown
    actors: StdMutex<HashMap<VolumeId, JoinHandle<()>>>,
    /// the event dispatcher task, joined on shutdown
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub(crate) fn new(
        registry: Registry,
        store: Arc<dyn NexusInfoStore>,
        opts: VolumeOptions,
    ) -> Self {
        let events = registry.events();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                opts,
                volumes: Default::default(),
                op_locks: Default::default(),
                events,
                ready: AtomicBool::new(false),
                shutdown,
                actors: Default::default(),
                dispatcher: Default::default(),
            }),
        }
    }

    /// Whether the import phase has completed and requests may be served
    pub(crate) fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    /// Start the event dispatcher and wait for the nodes known at boot to
    /// finish their first sync (or time out), importing everything they
    /// report; only then is the service ready for traffic.
    /// The dispatcher consumes an `EventStream`, so anything the registry
    /// already knows is replayed as `new` events before the live deltas.
    pub(crate) async fn start(&self, startup_timeout: Duration) {
        let service = self.clone();
        let stream = EventStream::new(&self.inner.registry, vec![]).await;
        let mut shutdown = self.inner.shutdown.subscribe();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = stream.next() => service.dispatch(event).await,
                    _ = shutdown.changed() => break,
                }
            }
            stream.close();
        });
        *self
            .inner
            .dispatcher
            .lock()
            .expect("dispatcher handle poisoned") = Some(dispatcher);

        let deadline = tokio::time::Instant::now() + startup_timeout;
        loop {
            let nodes = self.inner.registry.get_nodes().await;
            let syncing = nodes
                .iter()
                .filter(|node| node.state == NodeState::Syncing)
                .count();
            if syncing == 0 && !nodes.is_empty() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                tracing::warn!(
                    "Startup import window elapsed with {} node(s) still syncing",
                    syncing
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.inner.ready.store(true, Ordering::Relaxed);
        tracing::info!(
            "Volumes manager ready, {} volume(s) imported",
            self.inner.volumes.read().await.len()
        );
    }

    /// Serialization point of all the public operations on one volume.
    /// The mutex is fair, so concurrent duplicates queue up and collapse.
    fn op_lock(&self, uuid: &VolumeId) -> Arc<Mutex<()>> {
        let mut locks = self.inner.op_locks.lock().expect("op lock map poisoned");
        locks.entry(uuid.clone()).or_default().clone()
    }

    async fn entry(&self, uuid: &VolumeId) -> Option<VolumeEntry> {
        self.inner.volumes.read().await.get(uuid).cloned()
    }

    /// Schedule a reconcile tick; a tick already pending absorbs this one
    pub(crate) async fn tick(&self, uuid: &VolumeId) {
        if let Some(entry) = self.entry(uuid).await {
            let _ = entry.tick.try_send(());
        }
    }

    /// Run one reconcile pass now, publishing a volume `mod` event when the
    /// state moved. The caller must hold the volume's operation lock.
    async fn reconcile_now(&self, entry: &VolumeEntry) -> Result<(), SvcError> {
        let before = entry.volume.lock().await.state.clone();
        let result = reconcile(
            &entry.volume,
            &self.inner.registry,
            &self.inner.store,
            &self.inner.opts,
        )
        .await;
        let vol = entry.volume.lock().await;
        if vol.state != before {
            self.inner.events.publish(Event::new(
                EventAction::Mod,
                EventObject::Volume(VolumeSummary {
                    uuid: vol.uuid.clone(),
                    size: vol.spec.required_bytes,
                    state: vol.state.clone(),
                }),
            ));
        }
        result
    }

    fn spawn_actor(&self, uuid: VolumeId, volume: Arc<Mutex<Volume>>) -> mpsc::Sender<()> {
        // capacity of one makes re-entrant triggers coalesce into a single
        // follow-up tick
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
        let service = self.clone();
        let actor_uuid = uuid.clone();
        let task = tokio::spawn(async move {
            let uuid = actor_uuid;
            let mut shutdown = service.inner.shutdown.subscribe();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let triggered = tokio::select! {
                    message = tick_rx.recv() => message.is_some(),
                    _ = tokio::time::sleep(service.inner.opts.reconcile_period) => true,
                    _ = shutdown.changed() => false,
                };
                if !triggered || !service.inner.volumes.read().await.contains_key(&uuid) {
                    break;
                }
                let entry = match service.entry(&uuid).await {
                    Some(entry) => entry,
                    None => break,
                };
                let lock = service.op_lock(&uuid);
                let _guard = lock.lock().await;
                if entry.volume.lock().await.state == VolumeState::Destroyed {
                    break;
                }
                if let Err(error) = service.reconcile_now(&entry).await {
                    tracing::warn!(
                        volume.uuid = %uuid,
                        "Reconciliation failed: {}",
                        error.full_string()
                    );
                }
            }
            let _ = volume;
        });
        self.inner
            .actors
            .lock()
            .expect("actor map poisoned")
            .insert(uuid, task);
        tick_tx
    }

    /// Stop the event dispatcher and every volume actor and wait for them;
    /// in-flight reconcile passes finish first. Only runs at process
    /// shutdown.
    pub(crate) async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .expect("dispatcher handle poisoned")
            .take();
        if let Some(task) = dispatcher {
            if task.await.is_err() {
                tracing::warn!("The volume event dispatcher ended in a panic");
            }
        }
        let actors: Vec<JoinHandle<()>> = {
            let mut actors = self.inner.actors.lock().expect("actor map poisoned");
            actors.drain().map(|(_, task)| task).collect()
        };
        for task in actors {
            if task.await.is_err() {
                tracing::warn!("A volume actor ended in a panic");
            }
        }
    }

    fn validate_spec(spec: &VolumeSpec) -> Result<(), SvcError> {
        if spec.replica_count < 1 {
            return Err(SvcError::InvalidArgument {
                kind: "replicaCount".to_string(),
                value: spec.replica_count.to_string(),
            });
        }
        if spec.required_bytes == 0 {
            return Err(SvcError::InvalidArgument {
                kind: "requiredBytes".to_string(),
                value: "0".to_string(),
            });
        }
        if spec.limit_bytes != 0 && spec.required_bytes > spec.limit_bytes {
            return Err(SvcError::InvalidArgument {
                kind: "requiredBytes".to_string(),
                value: format!(
                    "{} exceeds the limit of {}",
                    spec.required_bytes, spec.limit_bytes
                ),
            });
        }
        if !matches!(spec.protocol, Protocol::Nvmf | Protocol::Iscsi) {
            return Err(SvcError::InvalidArgument {
                kind: "protocol".to_string(),
                value: spec.protocol.to_string(),
            });
        }
        if spec.io_timeout.is_some() && spec.protocol != Protocol::Nvmf {
            return Err(SvcError::InvalidArgument {
                kind: "ioTimeout".to_string(),
                value: "only supported over nvmf".to_string(),
            });
        }
        Ok(())
    }

    /// Create a volume, idempotently: an identical existing volume is
    /// returned as is, an allowed spec change becomes an update, a forbidden
    /// one is refused
    #[tracing::instrument(level = "debug", err, skip(self, spec))]
    pub(crate) async fn create_volume(
        &self,
        uuid: &VolumeId,
        spec: &VolumeSpec,
    ) -> Result<Volume, SvcError> {
        Self::validate_spec(spec)?;
        let lock = self.op_lock(uuid);
        let _guard = lock.lock().await;

        if let Some(entry) = self.entry(uuid).await {
            let changed = {
                let mut vol = entry.volume.lock().await;
                let changed = vol.allowed_update(spec)?;
                if changed {
                    vol.spec = spec.clone();
                }
                changed
            };
            if changed {
                self.reconcile_now(&entry).await?;
            }
            return Ok(entry.volume.lock().await.clone());
        }

        let volume = Arc::new(Mutex::new(Volume::new(uuid, spec)));
        let tick = self.spawn_actor(uuid.clone(), volume.clone());
        let entry = VolumeEntry {
            volume: volume.clone(),
            tick,
        };
        self.inner
            .volumes
            .write()
            .await
            .insert(uuid.clone(), entry.clone());
        self.inner.events.publish(Event::new(
            EventAction::New,
            EventObject::Volume(VolumeSummary {
                uuid: uuid.clone(),
                size: spec.required_bytes,
                state: VolumeState::Pending,
            }),
        ));

        let result = self.reconcile_now(&entry).await;
        let snapshot = volume.lock().await.clone();
        if let Err(error) = result {
            if snapshot.replicas.is_empty() {
                // nothing was realised, undo the bookkeeping
                self.inner.volumes.write().await.remove(uuid);
                self.publish_volume_del(uuid, spec.required_bytes).await;
                return Err(error);
            }
            tracing::warn!(
                volume.uuid = %uuid,
                "Volume created degraded: {}",
                error.full_string()
            );
        }
        Ok(snapshot)
    }

    async fn publish_volume_del(&self, uuid: &VolumeId, size: u64) {
        self.inner.events.publish(Event::new(
            EventAction::Del,
            EventObject::Volume(VolumeSummary {
                uuid: uuid.clone(),
                size,
                state: VolumeState::Destroyed,
            }),
        ));
    }

    /// Destroy a volume and everything belonging to it. Idempotent: a second
    /// destroy issues no operations at all. Entities on unreachable nodes are
    /// cleared synthetically and swept up by the stray-nexus handler once
    /// their node returns.
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn destroy_volume(&self, uuid: &VolumeId) -> Result<(), SvcError> {
        let lock = self.op_lock(uuid);
        let _guard = lock.lock().await;
        let entry = match self.entry(uuid).await {
            None => return Ok(()),
            Some(entry) => entry,
        };
        let size = {
            let mut vol = entry.volume.lock().await;
            vol.state = VolumeState::Destroyed;
            vol.spec.required_bytes
        };

        let nexus_id = NexusId::from(uuid.as_str());
        for nexus in self.inner.registry.get_nexuses_by_id(&nexus_id).await {
            if let Some(node) = self.inner.registry.get_node_wrapper(&nexus.node).await {
                node.destroy_nexus(&DestroyNexus {
                    node: nexus.node.clone(),
                    uuid: nexus_id.clone(),
                })
                .await?;
            }
        }

        let replica_id = ReplicaId::from(uuid.as_str());
        for replica in self.inner.registry.get_replicas_by_id(&replica_id).await {
            if let Some(node) = self.inner.registry.get_node_wrapper(&replica.node).await {
                node.destroy_replica(&DestroyReplica {
                    node: replica.node.clone(),
                    pool: replica.pool.clone(),
                    uuid: replica.uuid.clone(),
                })
                .await?;
            }
        }

        // the child-health record is gone with the volume; a failure here
        // only leaves a harmless orphan record behind
        if let Err(error) = self.inner.store.destroy_nexus_info(&nexus_id).await {
            tracing::warn!(
                volume.uuid = %uuid,
                "Failed to remove the nexus health record: {}",
                error.full_string()
            );
        }

        self.inner.volumes.write().await.remove(uuid);
        // the actor notices the missing entry and winds itself down
        self.inner
            .actors
            .lock()
            .expect("actor map poisoned")
            .remove(uuid);
        self.publish_volume_del(uuid, size).await;
        Ok(())
    }

    /// Publish the volume on the given node, waiting for the nexus to be
    /// assembled and shared, and return the device uri
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn publish_volume(
        &self,
        uuid: &VolumeId,
        node: Option<NodeId>,
    ) -> Result<String, SvcError> {
        let lock = self.op_lock(uuid);
        let _guard = lock.lock().await;
        let entry = self
            .entry(uuid)
            .await
            .ok_or(SvcError::VolumeNotFound { vol_id: uuid.clone() })?;

        let (state, local, replica_nodes, already_on) = {
            let vol = entry.volume.lock().await;
            (
                vol.state.clone(),
                vol.spec.local,
                vol.replicas.keys().cloned().collect::<Vec<_>>(),
                vol.published_on.clone(),
            )
        };
        if state == VolumeState::Faulted {
            return Err(SvcError::VolumeNotPublishable {
                vol_id: uuid.clone(),
                reason: "the volume is faulted".to_string(),
            });
        }

        let target = self
            .elect_publish_target(uuid, node, local, &replica_nodes)
            .await?;
        if let Some(current) = already_on {
            if current != target {
                // republishing elsewhere means the old nexus must go first;
                // the reconciler handles that once the target moves
                tracing::info!(
                    volume.uuid = %uuid,
                    "Moving publish target from '{}' to '{}'",
                    current,
                    target
                );
            }
        }
        entry.volume.lock().await.published_on = Some(target);
        self.reconcile_now(&entry).await?;

        let vol = entry.volume.lock().await;
        if vol.device_uri.is_empty() {
            return Err(SvcError::VolumeNotPublishable {
                vol_id: uuid.clone(),
                reason: "the nexus could not be assembled".to_string(),
            });
        }
        Ok(vol.device_uri.clone())
    }

    /// The node the nexus should go to: the requested one when it is a known
    /// storage node, otherwise the admissible node with the fewest nexuses
    async fn elect_publish_target(
        &self,
        uuid: &VolumeId,
        requested: Option<NodeId>,
        local: bool,
        replica_nodes: &[NodeId],
    ) -> Result<NodeId, SvcError> {
        if let Some(node) = &requested {
            if self.inner.registry.get_node_wrapper(node).await.is_some() {
                if local && !replica_nodes.contains(node) {
                    return Err(SvcError::VolumeNotPublishable {
                        vol_id: uuid.clone(),
                        reason: format!(
                            "local volume has no replica on the requested node '{}'",
                            node
                        ),
                    });
                }
                return Ok(node.clone());
            }
        }
        // the caller is not a storage node: balance nexus count across the
        // admissible online nodes
        let mut nexus_count: HashMap<NodeId, usize> = HashMap::new();
        for nexus in self.inner.registry.get_nexuses().await {
            *nexus_count.entry(nexus.node).or_default() += 1;
        }
        let mut candidates = vec![];
        for node in self.inner.registry.get_nodes().await {
            if node.state != NodeState::Online {
                continue;
            }
            if local && !replica_nodes.contains(&node.id) {
                continue;
            }
            candidates.push((nexus_count.get(&node.id).copied().unwrap_or(0), node.id));
        }
        candidates.sort();
        match candidates.into_iter().next() {
            Some((_, node)) => Ok(node),
            None => Err(match requested {
                Some(node) => SvcError::NodeNotFound { node_id: node },
                None => SvcError::VolumeNotPublishable {
                    vol_id: uuid.clone(),
                    reason: "no online node can host the nexus".to_string(),
                },
            }),
        }
    }

    /// Unpublish the volume; the nexus is torn down by the reconciler, or
    /// cleared synthetically when its node is unreachable
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn unpublish_volume(&self, uuid: &VolumeId) -> Result<(), SvcError> {
        let lock = self.op_lock(uuid);
        let _guard = lock.lock().await;
        let entry = match self.entry(uuid).await {
            // unpublishing something which does not exist is a success
            None => return Ok(()),
            Some(entry) => entry,
        };
        entry.volume.lock().await.published_on = None;
        if let Err(error) = self.reconcile_now(&entry).await {
            tracing::warn!(
                volume.uuid = %uuid,
                "Unpublish left work for the reconciler: {}",
                error.full_string()
            );
        }
        Ok(())
    }

    /// Get a snapshot of the volume
    pub(crate) async fn get_volume(&self, uuid: &VolumeId) -> Option<Volume> {
        match self.entry(uuid).await {
            None => None,
            Some(entry) => Some(entry.volume.lock().await.clone()),
        }
    }

    /// Snapshots of all volumes, ordered by uuid so pagination is stable
    pub(crate) async fn list_volumes(&self) -> Vec<Volume> {
        let entries: Vec<VolumeEntry> = self.inner.volumes.read().await.values().cloned().collect();
        let mut volumes = vec![];
        for entry in entries {
            volumes.push(entry.volume.lock().await.clone());
        }
        volumes.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        volumes
    }

    /// Summaries of all volumes for the event stream replay
    pub(crate) async fn volume_summaries(&self) -> Vec<VolumeSummary> {
        self.list_volumes()
            .await
            .iter()
            .map(|volume| VolumeSummary {
                uuid: volume.uuid.clone(),
                size: volume.spec.required_bytes,
                state: volume.state.clone(),
            })
            .collect()
    }

    /// Bring a volume under management from what the registry reports
    async fn import_volume(&self, uuid: &VolumeId) {
        let lock = self.op_lock(uuid);
        let _guard = lock.lock().await;
        if self.entry(uuid).await.is_some() {
            return;
        }
        let replicas = self
            .inner
            .registry
            .get_replicas_by_id(&ReplicaId::from(uuid.as_str()))
            .await;
        let nexuses = self
            .inner
            .registry
            .get_nexuses_by_id(&NexusId::from(uuid.as_str()))
            .await;
        if replicas.is_empty() && nexuses.is_empty() {
            return;
        }
        tracing::info!(volume.uuid = %uuid, "Importing volume from the registry");
        let volume = Arc::new(Mutex::new(Volume::import(
            uuid,
            &replicas,
            nexuses.first(),
        )));
        let tick = self.spawn_actor(uuid.clone(), volume.clone());
        let entry = VolumeEntry { volume, tick };
        self.inner
            .volumes
            .write()
            .await
            .insert(uuid.clone(), entry.clone());
        let summary = {
            let vol = entry.volume.lock().await;
            VolumeSummary {
                uuid: vol.uuid.clone(),
                size: vol.spec.required_bytes,
                state: vol.state.clone(),
            }
        };
        self.inner
            .events
            .publish(Event::new(EventAction::New, EventObject::Volume(summary)));
        let _ = entry.tick.try_send(());
    }

    /// A nexus which no tracked volume claims is a leftover from a destroyed
    /// volume; it gets torn down
    async fn destroy_stray_nexus(&self, node: &NodeId, uuid: &NexusId) {
        tracing::warn!(
            "Destroying stray nexus '{}' on node '{}': no volume claims it",
            uuid,
            node
        );
        if let Some(wrapper) = self.inner.registry.get_node_wrapper(node).await {
            if let Err(error) = wrapper
                .destroy_nexus(&DestroyNexus {
                    node: node.clone(),
                    uuid: uuid.clone(),
                })
                .await
            {
                tracing::error!(
                    "Failed to destroy stray nexus '{}' on node '{}': {}",
                    uuid,
                    node,
                    error.full_string()
                );
            }
        }
    }

    /// Route a registry event to the volume(s) it concerns
    async fn dispatch(&self, event: Event) {
        match &event.object {
            EventObject::Replica(replica) => {
                let uuid = VolumeId::from(replica.uuid.as_str());
                if self.entry(&uuid).await.is_some() {
                    self.tick(&uuid).await;
                } else if !self.is_ready() {
                    self.import_volume(&uuid).await;
                } else {
                    tracing::trace!(
                        "Ignoring event for unclaimed replica '{}' on '{}'",
                        replica.uuid,
                        replica.node
                    );
                }
            }
            EventObject::Nexus(nexus) => {
                let uuid = VolumeId::from(nexus.uuid.as_str());
                if self.entry(&uuid).await.is_some() {
                    self.tick(&uuid).await;
                } else if !self.is_ready() {
                    self.import_volume(&uuid).await;
                } else if event.action != EventAction::Del {
                    self.destroy_stray_nexus(&nexus.node, &nexus.uuid).await;
                }
            }
            EventObject::Pool(pool) => {
                // volumes with a replica on this pool's node re-evaluate
                let volumes = self.list_volumes().await;
                for volume in volumes {
                    if volume.replicas.contains_key(&pool.node) {
                        self.tick(&volume.uuid).await;
                    }
                }
            }
            EventObject::Node(node) => {
                let volumes = self.list_volumes().await;
                for volume in volumes {
                    if volume.replicas.contains_key(&node.id)
                        || volume.published_on.as_ref() == Some(&node.id)
                        || volume.nexus.as_ref() == Some(&node.id)
                    {
                        self.tick(&volume.uuid).await;
                    }
                }
            }
            EventObject::Volume(_) => {}
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeService").finish()
    }
}
