pub(crate) mod service;

#[cfg(test)]
mod tests {
    use super::service::Service;
    use crate::core::{
        fake::{FakeAgent, FakeFactory},
        registry::{Registry, RegistryOptions},
    };
    use mbus_api::v0::{Deregister, NodeState, Register};
    use std::{sync::Arc, time::Duration};

    fn test_opts() -> RegistryOptions {
        RegistryOptions {
            sync_period: Duration::from_millis(50),
            sync_retry: Duration::from_millis(20),
            sync_bad_limit: 0,
        }
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

    #[tokio::test]
    async fn registration_creates_and_deregistration_desyncs() {
        let factory = Arc::new(FakeFactory::new());
        factory.add_agent("node-1", FakeAgent::new("node-1"));
        let registry = Registry::new(factory.clone(), test_opts());
        let service = Service::new(registry.clone());

        service
            .register(&Register {
                id: "node-1".into(),
                grpc_endpoint: "10.1.0.1:10124".to_string(),
            })
            .await;
        wait_until_state(&registry, "node-1", NodeState::Online).await;

        // a keep-alive re-registration with the same endpoint changes nothing
        service
            .register(&Register {
                id: "node-1".into(),
                grpc_endpoint: "10.1.0.1:10124".to_string(),
            })
            .await;
        wait_until_state(&registry, "node-1", NodeState::Online).await;

        service
            .deregister(&Deregister {
                id: "node-1".into(),
            })
            .await;
        wait_until_state(&registry, "node-1", NodeState::Offline).await;
    }

    #[tokio::test]
    async fn registration_for_an_unknown_agent_is_harmless() {
        let factory = Arc::new(FakeFactory::new());
        let registry = Registry::new(factory.clone(), test_opts());
        let service = Service::new(registry.clone());

        // a client cannot be built for this node; the registration is logged
        // and dropped, the next keep-alive gets another chance
        service
            .register(&Register {
                id: "node-9".into(),
                grpc_endpoint: "10.1.0.9:10124".to_string(),
            })
            .await;
        assert!(registry.get_nodes().await.is_empty());
    }
}
