//! Converts rpc messages to message bus messages and vice versa.

use mbus_api::v0::{
    self as mbus, ChildState, NexusState, NodeId, PoolState, Protocol, ReplicaState,
};
use rpc::mayastor as rpc;

/// convert rpc pool to a message bus pool
pub(crate) fn rpc_pool_to_bus(rpc_pool: &rpc::Pool, id: &NodeId) -> mbus::Pool {
    mbus::Pool {
        node: id.clone(),
        id: rpc_pool.name.clone().into(),
        disks: rpc_pool.disks.clone(),
        state: PoolState::from(rpc_pool.state),
        capacity: rpc_pool.capacity,
        used: rpc_pool.used,
    }
}

/// convert rpc replica to a message bus replica
pub(crate) fn rpc_replica_to_bus(rpc_replica: &rpc::Replica, id: &NodeId) -> mbus::Replica {
    mbus::Replica {
        node: id.clone(),
        uuid: rpc_replica.uuid.clone().into(),
        pool: rpc_replica.pool.clone().into(),
        thin: rpc_replica.thin,
        size: rpc_replica.size,
        share: Protocol::from(rpc_replica.share),
        uri: rpc_replica.uri.clone(),
        state: ReplicaState::Online,
    }
}

/// convert rpc nexus to a message bus nexus
pub(crate) fn rpc_nexus_to_bus(rpc_nexus: &rpc::Nexus, id: &NodeId) -> mbus::Nexus {
    mbus::Nexus {
        node: id.clone(),
        uuid: rpc_nexus.uuid.clone().into(),
        size: rpc_nexus.size,
        state: NexusState::from(rpc_nexus.state),
        children: rpc_nexus.children.iter().map(rpc_child_to_bus).collect(),
        device_uri: rpc_nexus.device_uri.clone(),
        rebuilds: rpc_nexus.rebuilds,
    }
}

/// convert rpc nexus child to a message bus child
pub(crate) fn rpc_child_to_bus(rpc_child: &rpc::Child) -> mbus::Child {
    mbus::Child {
        uri: rpc_child.uri.clone().into(),
        state: ChildState::from(rpc_child.state),
        rebuild_progress: if rpc_child.rebuild_progress >= 0 {
            Some(rpc_child.rebuild_progress)
        } else {
            None
        },
    }
}

/// Trait for converting message bus messages to rpc messages.
pub(crate) trait BusToRpc {
    /// RPC message type.
    type RpcMessage;
    /// Conversion of message bus message to rpc message.
    fn to_rpc(&self) -> Self::RpcMessage;
}

impl BusToRpc for mbus::CreatePool {
    type RpcMessage = rpc::CreatePoolRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            name: self.id.clone().into(),
            disks: self.disks.clone(),
        }
    }
}

impl BusToRpc for mbus::DestroyPool {
    type RpcMessage = rpc::DestroyPoolRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            name: self.id.clone().into(),
        }
    }
}

impl BusToRpc for mbus::CreateReplica {
    type RpcMessage = rpc::CreateReplicaRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
            pool: self.pool.clone().into(),
            size: self.size,
            thin: self.thin,
            share: self.share as i32,
        }
    }
}

impl BusToRpc for mbus::DestroyReplica {
    type RpcMessage = rpc::DestroyReplicaRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
        }
    }
}

impl BusToRpc for mbus::ShareReplica {
    type RpcMessage = rpc::ShareReplicaRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
            share: self.protocol as i32,
        }
    }
}

impl BusToRpc for mbus::UnshareReplica {
    type RpcMessage = rpc::ShareReplicaRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
            share: Protocol::Off as i32,
        }
    }
}

impl BusToRpc for mbus::CreateNexus {
    type RpcMessage = rpc::CreateNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
            size: self.size,
            children: self.children.iter().map(|child| child.to_string()).collect(),
        }
    }
}

impl BusToRpc for mbus::DestroyNexus {
    type RpcMessage = rpc::DestroyNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
        }
    }
}

impl BusToRpc for mbus::ShareNexus {
    type RpcMessage = rpc::PublishNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
            key: self.key.clone().unwrap_or_default(),
            share: self.protocol as i32,
        }
    }
}

impl BusToRpc for mbus::UnshareNexus {
    type RpcMessage = rpc::UnpublishNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.uuid.clone().into(),
        }
    }
}

impl BusToRpc for mbus::AddNexusChild {
    type RpcMessage = rpc::AddChildNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.nexus.clone().into(),
            uri: self.uri.clone().into(),
            norebuild: !self.auto_rebuild,
        }
    }
}

impl BusToRpc for mbus::RemoveNexusChild {
    type RpcMessage = rpc::RemoveChildNexusRequest;
    fn to_rpc(&self) -> Self::RpcMessage {
        Self::RpcMessage {
            uuid: self.nexus.clone().into(),
            uri: self.uri.clone().into(),
        }
    }
}
