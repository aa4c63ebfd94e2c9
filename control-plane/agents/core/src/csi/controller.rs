use crate::{core::registry::Registry, volume::service::Service as VolumeService};
use mbus_api::v0::{NodeId, Protocol, VolumeId, VolumeSpec};
use rpc::csi::{
    controller_server::Controller, controller_service_capability,
    validate_volume_capabilities_response, volume_capability::access_mode,
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, Topology, VolumeCapability,
};

use std::collections::HashMap;
use tonic::{Request, Response, Status};

/// The topology key under which kubernetes advertises the node name
const HOSTNAME_KEY: &str = "kubernetes.io/hostname";
/// Node id scheme used by the csi-node plugin
const NODE_ID_SCHEME: &str = "mayastor://";

/// CSI Controller service: validates the requests and translates them into
/// volume operations. Serialization per volume uuid happens inside the
/// volumes manager, so storms of duplicate CSI retries collapse there.
#[derive(Clone)]
pub(crate) struct CsiControllerSvc {
    registry: Registry,
    volumes: VolumeService,
}

impl CsiControllerSvc {
    pub(crate) fn new(registry: Registry, volumes: VolumeService) -> Self {
        Self { registry, volumes }
    }

    fn ready(&self) -> Result<(), Status> {
        if self.volumes.is_ready() {
            Ok(())
        } else {
            Err(Status::unavailable("the control plane is still initialising"))
        }
    }

    fn csi_volume(&self, volume: &crate::volume::volume::Volume) -> rpc::csi::Volume {
        let accessible_topology = if volume.spec.local {
            volume
                .replicas
                .keys()
                .map(|node| Topology {
                    segments: [(HOSTNAME_KEY.to_string(), node.to_string())]
                        .into_iter()
                        .collect(),
                })
                .collect()
        } else {
            vec![]
        };
        rpc::csi::Volume {
            capacity_bytes: volume.spec.required_bytes as i64,
            volume_id: volume.uuid.to_string(),
            volume_context: HashMap::new(),
            content_source: None,
            accessible_topology,
        }
    }
}

/// `pvc-<uuid>` is the only accepted volume name shape; the uuid becomes the
/// volume id
fn parse_volume_name(name: &str) -> Result<VolumeId, Status> {
    let uuid = name
        .strip_prefix("pvc-")
        .ok_or_else(|| Status::invalid_argument(format!("invalid volume name '{}'", name)))?;
    parse_uuid(uuid)
}

fn parse_uuid(uuid: &str) -> Result<VolumeId, Status> {
    uuid::Uuid::parse_str(uuid)
        .map_err(|_| Status::invalid_argument(format!("'{}' is not a uuid", uuid)))?;
    Ok(VolumeId::from(uuid))
}

/// CSI node ids look like mayastor://<node-name>
fn parse_node_id(node_id: &str) -> Result<NodeId, Status> {
    match node_id.strip_prefix(NODE_ID_SCHEME) {
        Some(node) if !node.is_empty() => Ok(NodeId::from(node)),
        _ => Err(Status::invalid_argument(format!(
            "invalid node id '{}'",
            node_id
        ))),
    }
}

/// All booleans in storage class parameters arrive as yaml strings
fn parse_yaml_bool(key: &str, value: &str) -> Result<bool, Status> {
    match value.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "on" => Ok(true),
        "n" | "no" | "false" | "off" => Ok(false),
        _ => Err(Status::invalid_argument(format!(
            "'{}' is not a boolean value for parameter '{}'",
            value, key
        ))),
    }
}

fn check_single_node_writer(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    if capabilities.is_empty() {
        return Err(Status::invalid_argument("missing volume capabilities"));
    }
    for capability in capabilities {
        let mode = capability
            .access_mode
            .as_ref()
            .map(|mode| mode.mode)
            .unwrap_or_default();
        if mode != access_mode::Mode::SingleNodeWriter as i32 {
            return Err(Status::invalid_argument(
                "only the SINGLE_NODE_WRITER access mode is supported",
            ));
        }
    }
    Ok(())
}

/// Build the volume spec out of the storage class parameters; unknown keys
/// are left alone and echoed back through the volume context
fn parse_parameters(
    request: &CreateVolumeRequest,
) -> Result<VolumeSpec, Status> {
    let parameters = &request.parameters;
    let replica_count = match parameters.get("repl") {
        None => 1,
        Some(value) => match value.parse::<u64>() {
            Ok(count) if count >= 1 => count,
            _ => {
                return Err(Status::invalid_argument(format!(
                    "'{}' is not a valid replica count",
                    value
                )))
            }
        },
    };
    let local = match parameters.get("local") {
        None => false,
        Some(value) => parse_yaml_bool("local", value)?,
    };
    let protocol = match parameters.get("protocol").map(String::as_str) {
        None | Some("nvmf") => Protocol::Nvmf,
        Some("iscsi") => Protocol::Iscsi,
        Some(other) => {
            return Err(Status::invalid_argument(format!(
                "'{}' is not a supported share protocol",
                other
            )))
        }
    };
    let io_timeout = match parameters.get("ioTimeout") {
        None => None,
        Some(value) => match value.parse::<u64>() {
            Ok(timeout) => Some(timeout),
            Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "'{}' is not a valid ioTimeout",
                    value
                )))
            }
        },
    };
    if io_timeout.is_some() && protocol != Protocol::Nvmf {
        return Err(Status::invalid_argument(
            "the ioTimeout parameter is only supported over nvmf",
        ));
    }

    let range = request.capacity_range.clone().unwrap_or_default();
    if range.required_bytes <= 0 {
        return Err(Status::invalid_argument(
            "the volume size must be specified and positive",
        ));
    }

    let (required_nodes, preferred_nodes) = parse_topology(request)?;

    Ok(VolumeSpec {
        replica_count,
        local,
        preferred_nodes,
        required_nodes,
        required_bytes: range.required_bytes as u64,
        limit_bytes: range.limit_bytes.max(0) as u64,
        protocol,
        io_timeout,
    })
}

/// Requisite entries may only carry the hostname key and become required
/// nodes; hostname keys in preferred become preferred nodes, anything else
/// there is ignored
fn parse_topology(
    request: &CreateVolumeRequest,
) -> Result<(Vec<NodeId>, Vec<NodeId>), Status> {
    let mut required = vec![];
    let mut preferred = vec![];
    if let Some(requirements) = &request.accessibility_requirements {
        for topology in &requirements.requisite {
            for (key, value) in &topology.segments {
                if key != HOSTNAME_KEY {
                    return Err(Status::invalid_argument(format!(
                        "topology key '{}' is not supported in requisite",
                        key
                    )));
                }
                required.push(NodeId::from(value.as_str()));
            }
        }
        for topology in &requirements.preferred {
            if let Some(node) = topology.segments.get(HOSTNAME_KEY) {
                preferred.push(NodeId::from(node.as_str()));
            }
        }
    }
    Ok((required, preferred))
}

#[tonic::async_trait]
impl Controller for CsiControllerSvc {
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = [
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::ListVolumes,
            controller_service_capability::rpc::Type::GetCapacity,
        ]
        .into_iter()
        .map(|capability| ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc {
                    r#type: capability as i32,
                },
            )),
        })
        .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let uuid = parse_volume_name(&request.name)?;
        if request.volume_content_source.is_some() {
            return Err(Status::invalid_argument(
                "snapshot and clone sources are not supported",
            ));
        }
        check_single_node_writer(&request.volume_capabilities)?;
        let spec = parse_parameters(&request)?;

        let volume = self.volumes.create_volume(&uuid, &spec).await?;
        let mut csi_volume = self.csi_volume(&volume);
        csi_volume.volume_context = request.parameters.clone();
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(csi_volume),
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let uuid = parse_uuid(&request.volume_id)?;
        self.volumes.destroy_volume(&uuid).await?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let uuid = parse_uuid(&request.volume_id)?;
        let node = parse_node_id(&request.node_id)?;
        if request.readonly {
            return Err(Status::invalid_argument(
                "readonly volumes are not supported",
            ));
        }
        if let Some(capability) = &request.volume_capability {
            check_single_node_writer(std::slice::from_ref(capability))?;
        }
        let volume = self
            .volumes
            .get_volume(&uuid)
            .await
            .ok_or_else(|| Status::not_found(format!("volume '{}' does not exist", uuid)))?;

        let uri = self.volumes.publish_volume(&uuid, Some(node)).await?;

        let mut publish_context: HashMap<String, String> =
            [("uri".to_string(), uri)].into_iter().collect();
        if let Some(timeout) = volume.spec.io_timeout {
            publish_context.insert("ioTimeout".to_string(), timeout.to_string());
        }
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let uuid = parse_uuid(&request.volume_id)?;
        // a missing volume has nothing published, which is the desired state
        self.volumes.unpublish_volume(&uuid).await?;
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<rpc::csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<rpc::csi::ValidateVolumeCapabilitiesResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let uuid = parse_uuid(&request.volume_id)?;
        let _volume = self
            .volumes
            .get_volume(&uuid)
            .await
            .ok_or_else(|| Status::not_found(format!("volume '{}' does not exist", uuid)))?;

        let response = match check_single_node_writer(&request.volume_capabilities) {
            Ok(()) => rpc::csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: request.volume_context,
                    volume_capabilities: request.volume_capabilities,
                    parameters: request.parameters,
                }),
                message: "".to_string(),
            },
            Err(error) => rpc::csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: error.message().to_string(),
            },
        };
        Ok(Response::new(response))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let volumes = self.volumes.list_volumes().await;

        let start = match request.starting_token.as_str() {
            "" => 0,
            token => token.parse::<usize>().map_err(|_| {
                Status::invalid_argument(format!("unknown starting token '{}'", token))
            })?,
        };
        if start > volumes.len() {
            return Err(Status::invalid_argument(format!(
                "starting token '{}' is past the end of the listing",
                start
            )));
        }
        let max_entries = match request.max_entries {
            negative if negative < 0 => {
                return Err(Status::invalid_argument("max_entries must not be negative"))
            }
            0 => volumes.len(),
            positive => positive as usize,
        };

        let page: Vec<rpc::csi::list_volumes_response::Entry> = volumes
            .iter()
            .skip(start)
            .take(max_entries)
            .map(|volume| rpc::csi::list_volumes_response::Entry {
                volume: Some(self.csi_volume(volume)),
            })
            .collect();
        let next = start + page.len();
        let next_token = if next < volumes.len() {
            next.to_string()
        } else {
            "".to_string()
        };
        Ok(Response::new(ListVolumesResponse {
            entries: page,
            next_token,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        self.ready()?;
        let request = request.into_inner();
        let node = request
            .accessible_topology
            .as_ref()
            .and_then(|topology| topology.segments.get(HOSTNAME_KEY))
            .map(|node| NodeId::from(node.as_str()));
        let capacity = self.registry.get_capacity(node.as_ref()).await;
        Ok(Response::new(GetCapacityResponse {
            available_capacity: capacity as i64,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not implemented"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not implemented"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots are not implemented"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("volume expansion is not implemented"))
    }
}
