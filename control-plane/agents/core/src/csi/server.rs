use super::{controller::CsiControllerSvc, identity::CsiIdentitySvc};
use rpc::csi::{controller_server::ControllerServer, identity_server::IdentityServer};

use std::{fs, future::Future, io::ErrorKind};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, info};

/// The CSI gRPC endpoint. The orchestrator's sidecars dial a unix socket, so
/// the listener is a `UnixListenerStream`; tonic knows how to serve plain
/// `tokio::net::UnixStream` connections directly.
pub(crate) struct CsiServer {}

impl CsiServer {
    /// Serve the CSI Identity and Controller services on the given unix
    /// socket until `shutdown` resolves; connections in flight are drained
    /// before this returns
    pub(crate) async fn run<F>(
        csi_socket: String,
        identity: CsiIdentitySvc,
        controller: CsiControllerSvc,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        // a socket file left behind by a previous run would fail the bind
        match fs::remove_file(&csi_socket) {
            Ok(_) => info!("Removed stale CSI socket {}", csi_socket),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Error removing stale CSI socket {}: {}",
                    csi_socket,
                    error
                ));
            }
        }

        let incoming = UnixListenerStream::new(UnixListener::bind(&csi_socket)?);
        debug!("CSI RPC server is listening on {}", csi_socket);

        Server::builder()
            .add_service(IdentityServer::new(identity))
            .add_service(ControllerServer::new(controller))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await?;

        info!("CSI RPC server stopped");
        Ok(())
    }
}
