use crate::core::registry::Registry;
use common::errors::SvcError;
use mbus_api::{
    v0::{ChannelVs, Deregister, Node, NodeId, Register, RegistrationOps},
    Channel, DynBus,
};

use std::time::Duration;

/// Node's Service: keeps the registry's node membership in step with the
/// registration messages from the io-engine instances and with the node
/// custom resources
#[derive(Debug, Clone)]
pub(crate) struct Service {
    registry: Registry,
}

impl Service {
    /// New Node Service using the `registry` as its node cache
    pub(crate) fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Register a new node through the register information
    pub(crate) async fn register(&self, registration: &Register) {
        if let Err(error) = self
            .registry
            .add_node(&registration.id, &registration.grpc_endpoint)
            .await
        {
            tracing::error!(
                "Failed to register node '{}' on endpoint '{}': {}",
                registration.id,
                registration.grpc_endpoint,
                error
            );
        }
    }

    /// Deregister a node through the deregister information.
    /// The node object is kept (only the CR deletion removes it) but it is no
    /// longer considered in sync.
    pub(crate) async fn deregister(&self, deregister: &Deregister) {
        match self.registry.get_node_wrapper(&deregister.id).await {
            None => {}
            Some(node) => {
                node.lock().await.set_offline();
            }
        }
    }

    /// Add a node, used by the node operator when a CR with an endpoint shows
    /// up
    pub(crate) async fn add_node(&self, id: &NodeId, endpoint: &str) -> Result<(), SvcError> {
        self.registry.add_node(id, endpoint).await
    }

    /// Remove a node, used by the node operator when the CR is deleted
    pub(crate) async fn remove_node(&self, id: &NodeId) {
        self.registry.remove_node(id).await
    }

    /// Get all nodes
    pub(crate) async fn get_nodes(&self) -> Vec<Node> {
        self.registry.get_nodes().await
    }

    /// Consume registration messages from the bus until the process exits.
    /// Malformed payloads are dropped; a broken subscription is re-created
    /// with a delay.
    pub(crate) fn start_registration_listener(&self, bus: DynBus) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let subscription = match bus.subscribe(Channel::v0(ChannelVs::Registry)).await {
                    Ok(subscription) => subscription,
                    Err(error) => {
                        tracing::warn!(
                            "Failed to subscribe to the registration channel: {}",
                            error
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                tracing::info!("Listening for node registrations...");
                while let Some(payload) = subscription.next().await {
                    match RegistrationOps::try_from(payload.as_slice()) {
                        Ok(RegistrationOps::Register(register)) => {
                            service.register(&register).await;
                        }
                        Ok(RegistrationOps::Deregister(deregister)) => {
                            service.deregister(&deregister).await;
                        }
                        Err(error) => {
                            tracing::trace!("Dropping registration payload: {}", error);
                        }
                    }
                }
                tracing::warn!("Registration subscription ended, re-subscribing...");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }
}
