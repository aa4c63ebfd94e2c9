use super::{
    crd::{MayastorNode, MayastorNodeStatus},
    watcher::{CrEvent, CustomResourceCache},
};
use crate::{
    core::{
        events::{EventAction, EventObject, EventQueue},
        registry::Registry,
    },
    node::service::Service as NodeService,
};
use common::errors::ErrorChain;
use mbus_api::v0::{NodeId, NodeState};

use kube::ResourceExt;
use std::sync::Arc;

/// Reconciles `MayastorNode` custom resources with the registry membership.
/// The resource spec is authoritative only at birth: a node joins when its CR
/// appears with an endpoint and leaves when the CR is deleted. Registry state
/// flows the other way, into the CR status and endpoint.
pub(crate) struct NodeOperator {
    cache: Arc<CustomResourceCache<MayastorNode>>,
    nodes: NodeService,
    registry: Registry,
}

impl NodeOperator {
    pub(crate) fn new(
        cache: Arc<CustomResourceCache<MayastorNode>>,
        nodes: NodeService,
        registry: Registry,
    ) -> Self {
        Self {
            cache,
            nodes,
            registry,
        }
    }

    /// Start the cache and both reconcile loops; returns once the initial CR
    /// list has been turned into registry membership
    pub(crate) async fn run(self: Arc<Self>) {
        self.cache.start().await;
        for node in self.cache.list().await {
            self.join(&node).await;
        }

        let operator = self.clone();
        let mut cr_events = self.cache.subscribe();
        tokio::spawn(async move {
            loop {
                match cr_events.recv().await {
                    Ok(CrEvent::New(node)) => operator.join(&node).await,
                    // the spec is authoritative only at birth
                    Ok(CrEvent::Mod(_)) => {}
                    Ok(CrEvent::Del(node)) => {
                        operator.nodes.remove_node(&node.name().as_str().into()).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Node operator lagged {} CR events", skipped);
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

    /// A CR with a non-empty endpoint registers the node; an empty endpoint
    /// means the node deregistered itself and must not be added
    async fn join(&self, node: &MayastorNode) {
        let name = node.name();
        if node.spec.grpc_endpoint.is_empty() {
            tracing::debug!("Node '{}' has no grpc endpoint, not registering it", name);
            return;
        }
        if let Err(error) = self
            .nodes
            .add_node(&name.as_str().into(), &node.spec.grpc_endpoint)
            .await
        {
            tracing::error!("Failed to add node '{}': {}", name, error.full_string());
        }
    }

    /// Registry node changes flow back into the CR: the status mirrors the
    /// sync state and the spec endpoint follows the live endpoint
    async fn registry_loop(&self, queue: Arc<EventQueue>) {
        loop {
            let event = queue.next().await;
            let node = match (&event.action, &event.object) {
                (EventAction::New, EventObject::Node(node))
                | (EventAction::Mod, EventObject::Node(node)) => node.clone(),
                _ => continue,
            };
            let name = NodeId::from(node.id.clone());
            let resource = match self.cache.get(name.as_str()).await {
                Some(resource) => resource,
                None => continue,
            };

            let status = match node.state {
                NodeState::Online => MayastorNodeStatus::Online,
                NodeState::Offline | NodeState::Syncing => MayastorNodeStatus::Offline,
                NodeState::Unknown => MayastorNodeStatus::Unknown,
            };
            if resource.status.as_ref() != Some(&status) {
                if let Err(error) = self.cache.update_status(name.as_str(), &status).await {
                    tracing::warn!(
                        "Failed to update the status of node '{}': {}",
                        name,
                        error.full_string()
                    );
                }
            }

            if resource.spec.grpc_endpoint != node.grpc_endpoint
                && !node.grpc_endpoint.is_empty()
            {
                let endpoint = node.grpc_endpoint.clone();
                if let Err(error) = self
                    .cache
                    .update(name.as_str(), |resource| {
                        resource.spec.grpc_endpoint = endpoint.clone();
                    })
                    .await
                {
                    tracing::warn!(
                        "Failed to mirror the endpoint of node '{}': {}",
                        name,
                        error.full_string()
                    );
                }
            }
        }
    }
}
