use crate::volume::service::Service as VolumeService;
use rpc::csi::{
    identity_server::Identity, plugin_capability, GetPluginCapabilitiesRequest,
    GetPluginCapabilitiesResponse, GetPluginInfoRequest, GetPluginInfoResponse, PluginCapability,
    ProbeRequest, ProbeResponse,
};

use std::collections::HashMap;
use tonic::{Request, Response, Status};

/// CSI Identity service: static plugin information plus a probe which turns
/// ready once the volumes manager finished importing
#[derive(Clone)]
pub(crate) struct CsiIdentitySvc {
    volumes: VolumeService,
}

impl CsiIdentitySvc {
    pub(crate) fn new(volumes: VolumeService) -> Self {
        Self { volumes }
    }
}

#[tonic::async_trait]
impl Identity for CsiIdentitySvc {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: "io.openebs.csi-mayastor".to_string(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let capabilities = [
            plugin_capability::service::Type::ControllerService,
            plugin_capability::service::Type::VolumeAccessibilityConstraints,
        ]
        .into_iter()
        .map(|capability| PluginCapability {
            r#type: Some(plugin_capability::Type::Service(
                plugin_capability::Service {
                    r#type: capability as i32,
                },
            )),
        })
        .collect();
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse {
            ready: Some(self.volumes.is_ready()),
        }))
    }
}
