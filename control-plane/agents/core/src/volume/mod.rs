pub(crate) mod service;
pub(crate) mod volume;

#[cfg(test)]
mod tests {
    use super::{service::Service, volume::VolumeOptions};
    use crate::core::{
        fake::{FakeAgent, FakeFactory, FakeStore},
        registry::{Registry, RegistryOptions},
    };
    use common::{
        errors::SvcError,
        store::nexus::{ChildInfo, NexusInfo},
    };
    use mbus_api::v0::{
        ChildState, NodeState, Pool, PoolState, Protocol, VolumeId, VolumeSpec, VolumeState,
    };
    use std::{sync::Arc, time::Duration};

    const UUID: &str = "ec4e66fd-3b33-4439-b504-d49aba53da26";

    fn spec(replicas: u64) -> VolumeSpec {
        VolumeSpec {
            replica_count: replicas,
            local: false,
            preferred_nodes: vec![],
            required_nodes: vec![],
            required_bytes: 10 * 1024 * 1024,
            limit_bytes: 0,
            protocol: Protocol::Nvmf,
            io_timeout: None,
        }
    }

    struct Cluster {
        factory: Arc<FakeFactory>,
        registry: Registry,
        store: Arc<FakeStore>,
        volumes: Service,
    }

    async fn cluster(nodes: usize) -> Cluster {
        let factory = Arc::new(FakeFactory::new());
        for i in 1..=nodes {
            let node = format!("node-{}", i);
            let agent = FakeAgent::new(&node);
            agent.add_pool(Pool {
                node: node.as_str().into(),
                id: format!("pool-{}", i).as_str().into(),
                disks: vec!["aio:///dev/sdx".into()],
                state: PoolState::Online,
                capacity: 100 * 1024 * 1024 * 1024,
                used: 0,
            });
            factory.add_agent(&node, agent);
        }
        let registry = Registry::new(
            factory.clone(),
            RegistryOptions {
                sync_period: Duration::from_millis(50),
                sync_retry: Duration::from_millis(20),
                sync_bad_limit: 0,
            },
        );
        for i in 1..=nodes {
            registry
                .add_node(
                    &format!("node-{}", i).as_str().into(),
                    &format!("10.1.0.{}:10124", i),
                )
                .await
                .unwrap();
        }
        let store = Arc::new(FakeStore::new());
        let volumes = Service::new(
            registry.clone(),
            store.clone(),
            VolumeOptions {
                reconcile_period: Duration::from_millis(50),
                replica_grace: Duration::from_millis(200),
            },
        );
        volumes.start(Duration::from_secs(5)).await;
        Cluster {
            factory,
            registry,
            store,
            volumes,
        }
    }

    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn create_is_idempotent_and_duplicates_collapse() {
        let cluster = cluster(1).await;
        let agent = cluster.factory.agent("node-1").unwrap();
        agent.set_delay(Some(Duration::from_millis(50)));

        let uuid = VolumeId::from(UUID);
        let start = std::time::Instant::now();
        let (first, second) = tokio::join!(
            cluster.volumes.create_volume(&uuid, &spec(1)),
            cluster.volumes.create_volume(&uuid, &spec(1)),
        );
        let elapsed = start.elapsed();
        assert_eq!(first.unwrap().uuid, uuid);
        assert_eq!(second.unwrap().uuid, uuid);
        // the create work ran exactly once, and it waited for the agent
        assert_eq!(agent.call_count("create_replica"), 1);
        assert!(elapsed >= Duration::from_millis(50));

        // a later identical create changes nothing
        agent.set_delay(None);
        cluster.volumes.create_volume(&uuid, &spec(1)).await.unwrap();
        assert_eq!(agent.call_count("create_replica"), 1);
    }

    #[tokio::test]
    async fn forbidden_spec_changes_are_refused() {
        let cluster = cluster(1).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(1)).await.unwrap();

        let mut shrunk = spec(1);
        shrunk.required_bytes /= 2;
        assert!(matches!(
            cluster.volumes.create_volume(&uuid, &shrunk).await,
            Err(SvcError::InvalidArgument { .. })
        ));

        let mut other_protocol = spec(1);
        other_protocol.protocol = Protocol::Iscsi;
        assert!(matches!(
            cluster.volumes.create_volume(&uuid, &other_protocol).await,
            Err(SvcError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn create_without_pools_is_resource_exhausted() {
        let factory = Arc::new(FakeFactory::new());
        factory.add_agent("node-1", FakeAgent::new("node-1"));
        let registry = Registry::new(
            factory.clone(),
            RegistryOptions {
                sync_period: Duration::from_millis(50),
                sync_retry: Duration::from_millis(20),
                sync_bad_limit: 0,
            },
        );
        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();
        let volumes = Service::new(
            registry.clone(),
            Arc::new(FakeStore::new()),
            VolumeOptions::default(),
        );
        volumes.start(Duration::from_secs(5)).await;

        let error = volumes
            .create_volume(&VolumeId::from(UUID), &spec(1))
            .await
            .expect_err("no pool can host the replica");
        assert!(matches!(error, SvcError::NotEnoughResources { .. }));
        assert!(volumes.get_volume(&VolumeId::from(UUID)).await.is_none());
    }

    #[tokio::test]
    async fn publish_assembles_and_shares_the_nexus() {
        let cluster = cluster(2).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(2)).await.unwrap();

        let device_uri = cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();
        assert!(device_uri.starts_with("nvmf://"));

        // replica share follows locality: none on the nexus node, nvmf off it
        let replicas = cluster.registry.get_replicas().await;
        for replica in &replicas {
            if replica.node.as_str() == "node-1" {
                assert_eq!(replica.share, Protocol::Off);
            } else {
                assert_eq!(replica.share, Protocol::Nvmf);
            }
        }

        let nexus = &cluster.factory.agent("node-1").unwrap().nexuses()[0];
        assert_eq!(nexus.children.len(), 2);

        wait_for("the volume to settle healthy", || async {
            cluster.volumes.get_volume(&uuid).await.unwrap().state == VolumeState::Healthy
        })
        .await;

        // publishing again on the same node is a no-op returning the same uri
        let again = cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();
        assert_eq!(again, device_uri);
    }

    #[tokio::test]
    async fn faulted_child_is_replaced_then_retired() {
        let cluster = cluster(3).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(2)).await.unwrap();
        cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();

        let agent1 = cluster.factory.agent("node-1").unwrap();
        let node2_uri = cluster
            .registry
            .get_replicas()
            .await
            .iter()
            .find(|replica| replica.node.as_str() == "node-2")
            .map(|replica| replica.uri.clone())
            .expect("the volume spans node-1 and node-2");

        // the data plane reports the node-2 child as faulted
        agent1.set_child_state(UUID, &node2_uri, ChildState::Faulted);

        // a replacement replica appears on node-3 and starts rebuilding
        wait_for("a third child to join the nexus", || async {
            agent1.nexuses()[0].children.len() == 3
        })
        .await;
        let node3_uri = cluster
            .registry
            .get_replicas()
            .await
            .iter()
            .find(|replica| replica.node.as_str() == "node-3")
            .map(|replica| replica.uri.clone())
            .expect("a replacement was created on node-3");

        // while the rebuild runs nothing is removed
        assert_eq!(agent1.nexuses()[0].children.len(), 3);

        // rebuild done: the faulted leg is retired
        agent1.set_child_state(UUID, &node3_uri, ChildState::Online);
        wait_for("the faulted child to be retired", || async {
            let volume = cluster.volumes.get_volume(&uuid).await.unwrap();
            let nodes: Vec<&str> = volume.replicas.keys().map(|node| node.as_str()).collect();
            volume.replicas.len() == 2 && !nodes.contains(&"node-2")
        })
        .await;
        assert!(cluster.factory.agent("node-2").unwrap().replicas().is_empty());
    }

    #[tokio::test]
    async fn clean_shutdown_record_gates_nexus_assembly() {
        let cluster = cluster(3).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(3)).await.unwrap();

        let replicas = cluster.registry.get_replicas().await;
        assert_eq!(replicas.len(), 3);
        let real = |node: &str| {
            replicas
                .iter()
                .find(|replica| replica.node.as_str() == node)
                .and_then(|replica| replica.real_uuid())
                .unwrap()
        };
        cluster.store.insert(
            UUID,
            NexusInfo {
                clean_shutdown: true,
                children: vec![
                    ChildInfo {
                        uuid: real("node-1"),
                        healthy: true,
                    },
                    ChildInfo {
                        uuid: real("node-2"),
                        healthy: true,
                    },
                    ChildInfo {
                        uuid: real("node-3"),
                        healthy: false,
                    },
                ],
            },
        );

        cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();

        // only the healthy children took part in the assembly; the stale one
        // re-joins afterwards through a full rebuild
        let agent1 = cluster.factory.agent("node-1").unwrap();
        let assembled = agent1.last_nexus_children();
        assert_eq!(assembled.len(), 2);
        assert!(!assembled.iter().any(|uri| uri.contains(&real("node-3"))));
    }

    #[tokio::test]
    async fn unclean_shutdown_keeps_a_single_consistent_child() {
        let cluster = cluster(2).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(2)).await.unwrap();

        let replicas = cluster.registry.get_replicas().await;
        let real = |node: &str| {
            replicas
                .iter()
                .find(|replica| replica.node.as_str() == node)
                .and_then(|replica| replica.real_uuid())
                .unwrap()
        };
        cluster.store.insert(
            UUID,
            NexusInfo {
                clean_shutdown: false,
                children: vec![
                    ChildInfo {
                        uuid: real("node-1"),
                        healthy: true,
                    },
                    ChildInfo {
                        uuid: real("node-2"),
                        healthy: true,
                    },
                ],
            },
        );

        cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();

        let assembled = cluster.factory.agent("node-1").unwrap().last_nexus_children();
        assert_eq!(assembled.len(), 1);
        assert!(assembled[0].contains(&real("node-1")));
    }

    #[tokio::test]
    async fn store_outage_blocks_assembly_but_not_the_volume() {
        let cluster = cluster(1).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(1)).await.unwrap();

        cluster.store.set_failing(true);
        let error = cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .expect_err("assembly must not proceed blind");
        assert!(matches!(error, SvcError::Store { .. }));

        // once the store recovers the reconciler finishes the publish
        cluster.store.set_failing(false);
        wait_for("the nexus to come up after the outage", || async {
            !cluster.factory.agent("node-1").unwrap().nexuses().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn destroy_with_an_offline_node_cleans_up_later() {
        let cluster = cluster(2).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(2)).await.unwrap();
        cluster
            .volumes
            .publish_volume(&uuid, Some("node-1".into()))
            .await
            .unwrap();

        // the nexus owner drops off the network
        let agent1 = cluster.factory.agent("node-1").unwrap();
        agent1.set_failing(Some(tonic::Code::Unavailable));
        wait_for("node-1 to go offline", || async {
            cluster
                .registry
                .get_nodes()
                .await
                .iter()
                .any(|node| node.id.as_str() == "node-1" && node.state == NodeState::Offline)
        })
        .await;

        // the destroy still succeeds and the volume is gone
        cluster.volumes.destroy_volume(&uuid).await.unwrap();
        assert!(cluster.volumes.get_volume(&uuid).await.is_none());
        assert!(cluster.factory.agent("node-2").unwrap().replicas().is_empty());
        // a second destroy does nothing at all
        let agent2 = cluster.factory.agent("node-2").unwrap();
        let destroys = agent2.call_count("destroy_replica") + agent2.call_count("destroy_nexus");
        cluster.volumes.destroy_volume(&uuid).await.unwrap();
        assert_eq!(
            agent2.call_count("destroy_replica") + agent2.call_count("destroy_nexus"),
            destroys
        );

        // when the node returns, the stray nexus it still hosts is discovered
        // and destroyed
        assert!(!agent1.nexuses().is_empty());
        agent1.set_failing(None);
        wait_for("the stray nexus to be swept", || async {
            agent1.nexuses().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn volumes_are_imported_from_a_populated_registry() {
        let factory = Arc::new(FakeFactory::new());
        let agent = FakeAgent::new("node-1");
        agent.add_pool(Pool {
            node: "node-1".into(),
            id: "pool-1".into(),
            disks: vec!["aio:///dev/sdx".into()],
            state: PoolState::Online,
            capacity: 100 * 1024 * 1024 * 1024,
            used: 0,
        });
        agent.add_replica(mbus_api::v0::Replica {
            node: "node-1".into(),
            uuid: UUID.into(),
            pool: "pool-1".into(),
            size: 10 * 1024 * 1024,
            uri: format!("bdev:///{}?uuid=deadbeef", UUID),
            state: mbus_api::v0::ReplicaState::Online,
            ..Default::default()
        });
        factory.add_agent("node-1", agent);
        let registry = Registry::new(
            factory.clone(),
            RegistryOptions {
                sync_period: Duration::from_millis(50),
                sync_retry: Duration::from_millis(20),
                sync_bad_limit: 0,
            },
        );
        registry
            .add_node(&"node-1".into(), "10.1.0.1:10124")
            .await
            .unwrap();

        let volumes = Service::new(
            registry.clone(),
            Arc::new(FakeStore::new()),
            VolumeOptions {
                reconcile_period: Duration::from_millis(50),
                replica_grace: Duration::from_millis(200),
            },
        );
        volumes.start(Duration::from_secs(5)).await;

        wait_for("the volume to be imported", || async {
            volumes.get_volume(&VolumeId::from(UUID)).await.is_some()
        })
        .await;
        let volume = volumes.get_volume(&VolumeId::from(UUID)).await.unwrap();
        assert_eq!(volume.spec.replica_count, 1);
        assert_eq!(volume.spec.required_bytes, 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn shutdown_winds_down_actors_and_sync_tasks() {
        let cluster = cluster(1).await;
        let uuid = VolumeId::from(UUID);
        cluster.volumes.create_volume(&uuid, &spec(1)).await.unwrap();

        // joins the dispatcher and the volume actor, then the node sync task
        cluster.volumes.shutdown().await;
        cluster.registry.shutdown().await;

        let agent = cluster.factory.agent("node-1").unwrap();
        let calls = agent.call_count("list_pools") + agent.call_count("list_replicas");
        tokio::time::sleep(Duration::from_millis(200)).await;
        // nothing is polling the node any more
        assert_eq!(
            agent.call_count("list_pools") + agent.call_count("list_replicas"),
            calls
        );
    }
}
