use super::{
    crd::{MayastorPool, MayastorPoolSpec, MayastorPoolStatus},
    watcher::{CrEvent, CustomResourceCache},
};
use crate::{
    core::{
        events::{EventObject, EventQueue},
        registry::Registry,
    },
    pool::service::Service as PoolService,
};
use common::errors::ErrorChain;
use mbus_api::v0::{CreatePool, DestroyPool, NodeId, PoolId};

use kube::ResourceExt;
use std::sync::Arc;

/// Keeps the CR alive while the pool still holds replicas
const POOL_FINALIZER: &str = "openebs.io/mayastorpool-protection";

/// Reconciles `MayastorPool` custom resources with the registry.
/// The spec is pinned into the status on first sight; later edits of the
/// resource are ignored so a stray `kubectl apply` can never move a pool and
/// take live data with it.
pub(crate) struct PoolOperator {
    cache: Arc<CustomResourceCache<MayastorPool>>,
    pools: PoolService,
    registry: Registry,
}

impl PoolOperator {
    pub(crate) fn new(
        cache: Arc<CustomResourceCache<MayastorPool>>,
        pools: PoolService,
        registry: Registry,
    ) -> Self {
        Self {
            cache,
            pools,
            registry,
        }
    }

    /// Start the cache and the two reconcile loops (CR events and registry
    /// events); returns once the initial CR list is in
    pub(crate) async fn run(self: Arc<Self>) {
        self.cache.start().await;

        let operator = self.clone();
        let mut cr_events = self.cache.subscribe();
        tokio::spawn(async move {
            loop {
                match cr_events.recv().await {
                    Ok(CrEvent::New(pool)) | Ok(CrEvent::Mod(pool)) => {
                        operator.reconcile(&pool.name()).await;
                    }
                    Ok(CrEvent::Del(pool)) => {
                        operator.destroy(&pool).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Pool operator lagged {} CR events", skipped);
                    }
                    Err(_) => break,
                }
            }
        });

        let operator = self.clone();
        let registry_events = self.registry.subscribe();
        tokio::spawn(async move {
            operator.registry_loop(registry_events).await;
        });
    }

    /// Tear the CR watch down, used at process shutdown
    pub(crate) fn stop(&self) {
        self.cache.stop();
    }

    /// Registry pool and replica changes are reflected back into the CR
    /// status and drive the data-protection finalizer
    async fn registry_loop(&self, queue: Arc<EventQueue>) {
        loop {
            let event = queue.next().await;
            let pool_id = match &event.object {
                EventObject::Pool(pool) => pool.id.clone(),
                EventObject::Replica(replica) => replica.pool.clone(),
                _ => continue,
            };
            if self.cache.get(pool_id.as_str()).await.is_some() {
                self.refresh_status(&pool_id).await;
                self.refresh_finalizer(&pool_id).await;
            }
        }
    }

    /// The spec the pool must be reconciled against: the one pinned in the
    /// status, or the resource spec the first time around
    fn pinned_spec(pool: &MayastorPool) -> MayastorPoolSpec {
        pool.status
            .as_ref()
            .and_then(|status| status.spec.clone())
            .unwrap_or_else(|| pool.spec.clone())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn reconcile(&self, name: &str) {
        let pool = match self.cache.get(name).await {
            Some(pool) => pool,
            None => return,
        };
        let pinned = Self::pinned_spec(&pool);
        let node = NodeId::from(pinned.node.as_str());

        match self.pools.node_synced(&node).await {
            None => {
                self.patch_status(
                    name,
                    MayastorPoolStatus::pending(
                        &format!("node '{}' is not known to the control plane", node),
                        Some(pinned),
                    ),
                )
                .await;
            }
            Some(false) => {
                self.patch_status(
                    name,
                    MayastorPoolStatus::pending(
                        &format!("node '{}' has not synced yet", node),
                        Some(pinned),
                    ),
                )
                .await;
            }
            Some(true) => self.create_or_adopt(name, pinned).await,
        }
    }

    async fn create_or_adopt(&self, name: &str, pinned: MayastorPoolSpec) {
        // a pool with this name may already live somewhere
        if let Some(existing) = self.pools.get_pool(&PoolId::from(name)).await {
            if existing.node.as_str() != pinned.node {
                // never move a pool; record what is actually there
                tracing::warn!(
                    "Pool '{}' exists on node '{}' but the resource wants '{}'; leaving both as they are",
                    name,
                    existing.node,
                    pinned.node
                );
            }
            self.patch_status(name, MayastorPoolStatus::from_pool(&existing, Some(pinned)))
                .await;
            return;
        }

        self.patch_status(
            name,
            MayastorPoolStatus::pending("Creating the pool", Some(pinned.clone())),
        )
        .await;
        let request = CreatePool {
            node: NodeId::from(pinned.node.as_str()),
            id: PoolId::from(name),
            disks: normalize_disks(&pinned.disks),
        };
        match self.pools.create_pool(&request).await {
            Ok(created) => {
                self.patch_status(name, MayastorPoolStatus::from_pool(&created, Some(pinned)))
                    .await;
            }
            Err(error) => {
                self.patch_status(
                    name,
                    MayastorPoolStatus::error(&error.full_string(), Some(pinned)),
                )
                .await;
            }
        }
    }

    /// The CR is gone: destroy the pool it pinned; a pool which is already
    /// gone destroys silently
    #[tracing::instrument(level = "debug", skip(self, pool), fields(name = %pool.name()))]
    async fn destroy(&self, pool: &MayastorPool) {
        let pinned = Self::pinned_spec(pool);
        let name = pool.name();
        let node = NodeId::from(pinned.node.as_str());
        if self.registry.get_node_wrapper(&node).await.is_none() {
            tracing::debug!("Pool '{}' has no node to destroy it on", name);
            return;
        }
        if let Err(error) = self
            .pools
            .destroy_pool(&DestroyPool {
                node,
                id: PoolId::from(name.as_str()),
            })
            .await
        {
            tracing::error!("Failed to destroy pool '{}': {}", name, error.full_string());
        }
    }

    async fn refresh_status(&self, pool_id: &PoolId) {
        let pool = match self.cache.get(pool_id.as_str()).await {
            Some(pool) => pool,
            None => return,
        };
        let pinned = Self::pinned_spec(&pool);
        if let Some(live) = self.pools.get_pool(pool_id).await {
            let status = MayastorPoolStatus::from_pool(&live, Some(pinned));
            if pool.status.as_ref() != Some(&status) {
                self.patch_status(pool_id.as_str(), status).await;
            }
        }
    }

    /// The orchestrator must not purge the CR while replicas live on the pool
    async fn refresh_finalizer(&self, pool_id: &PoolId) {
        let replicas = match self.registry.get_pool_wrapper(pool_id).await {
            Some(pool) => pool.replicas().len(),
            None => 0,
        };
        let result = if replicas > 0 {
            self.cache
                .add_finalizer(pool_id.as_str(), POOL_FINALIZER)
                .await
        } else {
            self.cache
                .remove_finalizer(pool_id.as_str(), POOL_FINALIZER)
                .await
        };
        if let Err(error) = result {
            tracing::warn!(
                "Failed to update the finalizer of pool '{}': {}",
                pool_id,
                error.full_string()
            );
        }
    }

    async fn patch_status(&self, name: &str, status: MayastorPoolStatus) {
        if let Err(error) = self.cache.update_status(name, &status).await {
            tracing::warn!(
                "Failed to update the status of pool '{}': {}",
                name,
                error.full_string()
            );
        }
    }
}

/// Disk URIs may arrive bare (`/dev/sdb`) or already carrying a transport
/// scheme (`aio:///dev/sdb`); bare ones default to aio
pub(crate) fn normalize_disks(disks: &[String]) -> Vec<String> {
    disks
        .iter()
        .map(|disk| {
            if disk.contains("://") {
                disk.clone()
            } else {
                format!("aio://{}", disk)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn bare_disks_get_the_aio_scheme() {
        let disks = vec![
            "/dev/sdb".to_string(),
            "aio:///dev/sdc".to_string(),
            "uring:///dev/sdd".to_string(),
        ];
        assert_eq!(
            normalize_disks(&disks),
            vec![
                "aio:///dev/sdb".to_string(),
                "aio:///dev/sdc".to_string(),
                "uring:///dev/sdd".to_string(),
            ]
        );
    }

    #[test]
    fn the_pinned_spec_wins_over_resource_edits() {
        let pinned = MayastorPoolSpec {
            node: "node-a".to_string(),
            disks: vec!["/dev/sdb".to_string()],
        };
        let edited = MayastorPool {
            api_version: "openebs.io/v1alpha1".to_string(),
            kind: "MayastorPool".to_string(),
            metadata: ObjectMeta {
                name: Some("pool-1".to_string()),
                ..Default::default()
            },
            // someone edited the resource to point at another node
            spec: MayastorPoolSpec {
                node: "node-b".to_string(),
                disks: vec!["/dev/sdc".to_string()],
            },
            status: Some(MayastorPoolStatus {
                spec: Some(pinned.clone()),
                ..Default::default()
            }),
        };
        assert_eq!(PoolOperator::pinned_spec(&edited), pinned);

        // without a pinned spec the resource spec is used and then pinned
        let fresh = MayastorPool {
            metadata: ObjectMeta {
                name: Some("pool-1".to_string()),
                ..Default::default()
            },
            spec: pinned.clone(),
            status: None,
        };
        assert_eq!(PoolOperator::pinned_spec(&fresh), pinned);
    }
}
