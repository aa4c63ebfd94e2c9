use crate::core::{registry::Registry, wrapper::ClientOps};
use common::errors::{NodeNotFoundSnafu, SvcError};
use mbus_api::v0::{CreatePool, DestroyPool, NodeId, Pool, PoolId};
use snafu::OptionExt;

/// Pool's Service, driven by the pool operator
#[derive(Debug, Clone)]
pub(crate) struct Service {
    registry: Registry,
}

impl Service {
    pub(crate) fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Get all pools, optionally filtered by pool id
    pub(crate) async fn get_pool(&self, pool_id: &PoolId) -> Option<Pool> {
        self.registry
            .get_pool_wrapper(pool_id)
            .await
            .map(|pool| Pool::from(&pool))
    }

    /// Get all pools on the given node
    pub(crate) async fn get_node_pools(&self, node_id: &NodeId) -> Vec<Pool> {
        match self.registry.get_node_wrapper(node_id).await {
            None => vec![],
            Some(node) => node
                .lock()
                .await
                .pools()
                .iter()
                .map(Pool::from)
                .collect(),
        }
    }

    /// Create pool
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn create_pool(&self, request: &CreatePool) -> Result<Pool, SvcError> {
        let node = self
            .registry
            .get_node_wrapper(&request.node)
            .await
            .context(NodeNotFoundSnafu {
                node_id: request.node.clone(),
            })?;
        node.create_pool(request).await
    }

    /// Destroy pool; a pool which is already gone destroys successfully
    #[tracing::instrument(level = "debug", err, skip(self))]
    pub(crate) async fn destroy_pool(&self, request: &DestroyPool) -> Result<(), SvcError> {
        let node = self
            .registry
            .get_node_wrapper(&request.node)
            .await
            .context(NodeNotFoundSnafu {
                node_id: request.node.clone(),
            })?;
        node.destroy_pool(request).await
    }

    /// Whether the node is known and in sync, used to gate pool creation
    pub(crate) async fn node_synced(&self, node_id: &NodeId) -> Option<bool> {
        match self.registry.get_node_wrapper(node_id).await {
            None => None,
            Some(node) => Some(node.lock().await.is_synced()),
        }
    }
}
