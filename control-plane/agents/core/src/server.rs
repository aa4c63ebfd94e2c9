pub(crate) mod core;
pub(crate) mod csi;
pub(crate) mod node;
pub(crate) mod operators;
pub(crate) mod pool;
pub(crate) mod volume;

use crate::{
    core::{grpc::GrpcClientFactory, registry::Registry, registry::RegistryOptions},
    csi::{controller::CsiControllerSvc, identity::CsiIdentitySvc, CsiServer},
    operators::{
        crd::{MayastorNode, MayastorPool},
        node::NodeOperator,
        pool::PoolOperator,
        watcher::{CacheParams, CustomResourceCache},
    },
    volume::volume::VolumeOptions,
};
use common::store::etcd::Etcd;

use kube::Api;
use std::{sync::Arc, time::Duration};
use structopt::StructOpt;
use tracing::info;

#[derive(Debug, StructOpt)]
pub(crate) struct CliArgs {
    /// The Nats Server URL to connect to
    /// (supports the nats schema)
    #[structopt(long, short, default_value = "nats://127.0.0.1:4222")]
    nats: String,

    /// The period at which each node's resources are listed and diffed
    #[structopt(long, default_value = "20s")]
    sync_period: humantime::Duration,

    /// The period at which a failed node sync is retried
    #[structopt(long, default_value = "5s")]
    sync_retry: humantime::Duration,

    /// Tolerated consecutive sync failures before a node is declared offline
    #[structopt(long, default_value = "2")]
    sync_bad_limit: u32,

    /// The period of the volume reconciliation safety net
    #[structopt(long, default_value = "5s")]
    reconcile_period: humantime::Duration,

    /// How long a replica may stay offline before it is replaced
    #[structopt(long, default_value = "5min")]
    replica_grace: humantime::Duration,

    /// Deadline applied to every io-engine request
    #[structopt(long, default_value = "30s")]
    request_timeout: humantime::Duration,

    /// The etcd endpoint holding the nexus child health records
    #[structopt(long, short, default_value = "0.0.0.0:2379")]
    store: String,

    /// The unix socket the CSI controller service listens on
    #[structopt(long, default_value = "/var/tmp/csi.sock")]
    csi_socket: String,

    /// The namespace the custom resources live in
    #[structopt(long, default_value = "mayastor")]
    namespace: String,

    /// How long to wait at startup for the known nodes to sync before
    /// serving requests
    #[structopt(long, default_value = "30s")]
    startup_timeout: humantime::Duration,
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli_args = CliArgs::from_args();
    info!("Using options: {:?}", &cli_args);

    server(cli_args).await
}

async fn server(cli_args: CliArgs) -> anyhow::Result<()> {
    mbus_api::message_bus_init(cli_args.nats.clone()).await;

    let registry = Registry::new(
        Arc::new(GrpcClientFactory::new(cli_args.request_timeout.into())),
        RegistryOptions {
            sync_period: cli_args.sync_period.into(),
            sync_retry: cli_args.sync_retry.into(),
            sync_bad_limit: cli_args.sync_bad_limit,
        },
    );

    let nodes = node::service::Service::new(registry.clone());
    nodes.start_registration_listener(mbus_api::bus());

    let store = connect_store(&cli_args.store).await;
    let volumes = volume::service::Service::new(
        registry.clone(),
        store,
        VolumeOptions {
            reconcile_period: cli_args.reconcile_period.into(),
            replica_grace: cli_args.replica_grace.into(),
        },
    );

    let k8s = kube::Client::try_default().await?;
    let node_api: Api<MayastorNode> = Api::namespaced(k8s.clone(), &cli_args.namespace);
    let pool_api: Api<MayastorPool> = Api::namespaced(k8s, &cli_args.namespace);

    let node_operator = Arc::new(NodeOperator::new(
        Arc::new(CustomResourceCache::new(node_api, CacheParams::default())),
        nodes,
        registry.clone(),
    ));
    node_operator.clone().run().await;

    let pool_operator = Arc::new(PoolOperator::new(
        Arc::new(CustomResourceCache::new(pool_api, CacheParams::default())),
        pool::service::Service::new(registry.clone()),
        registry.clone(),
    ));
    pool_operator.clone().run().await;

    volumes.start(cli_args.startup_timeout.into()).await;

    CsiServer::run(
        cli_args.csi_socket,
        CsiIdentitySvc::new(volumes.clone()),
        CsiControllerSvc::new(registry.clone(), volumes.clone()),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    )
    .await?;

    // orderly teardown: stop watching the orchestrator, then wind the volume
    // actors down, then the node sync tasks
    info!("Shutting down...");
    node_operator.stop();
    pool_operator.stop();
    volumes.shutdown().await;
    registry.shutdown().await;
    Ok(())
}

/// The store must be there for volumes to assemble safely; keep trying until
/// it shows up
async fn connect_store(endpoint: &str) -> Arc<Etcd> {
    let mut delay = Duration::from_millis(500);
    loop {
        match Etcd::new(endpoint).await {
            Ok(store) => {
                info!("Connected to the persistent store at {}", endpoint);
                return Arc::new(store);
            }
            Err(error) => {
                tracing::warn!(
                    "Failed to connect to the persistent store at {}: {}. Retrying in {:?}...",
                    endpoint,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }
    }
}
