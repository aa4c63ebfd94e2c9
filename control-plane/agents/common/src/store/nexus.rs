use crate::store::{etcd::Etcd, DeserialiseValueSnafu, StoreError};
use async_trait::async_trait;
use mbus_api::v0::{NexusId, Replica};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

/// Health record of a nexus as persisted by the io-engine, keyed by the
/// nexus uuid
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct NexusInfo {
    /// whether the nexus was last torn down cleanly
    pub clean_shutdown: bool,
    /// all children the nexus was last assembled from
    pub children: Vec<ChildInfo>,
}

/// Health of a single nexus child
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ChildInfo {
    /// uuid of the child's underlying data device, matching the `uuid` query
    /// parameter of the replica URI
    pub uuid: String,
    /// whether the child held the latest bits when the record was written
    pub healthy: bool,
}

impl NexusInfo {
    /// Select the replicas which may participate in a new nexus.
    /// After a clean shutdown every healthy child is usable; after an unclean
    /// one only a single healthy child is known to be consistent, picked
    /// deterministically by record order.
    pub fn filter_replicas(&self, replicas: Vec<Replica>) -> Vec<Replica> {
        let healthy = self.children.iter().filter(|child| child.healthy);
        if self.clean_shutdown {
            let healthy: Vec<&str> = healthy.map(|child| child.uuid.as_str()).collect();
            replicas
                .into_iter()
                .filter(|replica| match replica.real_uuid() {
                    Some(uuid) => healthy.contains(&uuid.as_str()),
                    None => false,
                })
                .collect()
        } else {
            for child in healthy {
                if let Some(replica) = replicas.iter().find(|replica| {
                    replica.real_uuid().as_deref() == Some(child.uuid.as_str())
                }) {
                    return vec![replica.clone()];
                }
            }
            vec![]
        }
    }
}

/// Retrieval and removal of per-nexus child health records.
/// The volume reconciler is the only consumer; a fake implementation backs
/// its tests.
#[async_trait]
pub trait NexusInfoStore: Send + Sync {
    /// Filter `replicas` down to those which the last health record allows in
    /// a new nexus; a missing record (first boot) lets all replicas through
    async fn filter_replicas(
        &self,
        nexus: &NexusId,
        replicas: Vec<Replica>,
    ) -> Result<Vec<Replica>, StoreError>;

    /// Remove the health record of the given nexus; missing is a success
    async fn destroy_nexus_info(&self, nexus: &NexusId) -> Result<(), StoreError>;
}

#[async_trait]
impl NexusInfoStore for Etcd {
    async fn filter_replicas(
        &self,
        nexus: &NexusId,
        replicas: Vec<Replica>,
    ) -> Result<Vec<Replica>, StoreError> {
        match self.get_kv(nexus.as_str()).await? {
            None => Ok(replicas),
            Some(value) => {
                let value_str = value.to_string();
                let info: NexusInfo = serde_json::from_value(value)
                    .context(DeserialiseValueSnafu { value: value_str })?;
                Ok(info.filter_replicas(replicas))
            }
        }
    }

    async fn destroy_nexus_info(&self, nexus: &NexusId) -> Result<(), StoreError> {
        self.delete_kv(nexus.as_str()).await
    }
}
