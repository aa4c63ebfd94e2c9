//! Persistent store access.
//!
//! The io-engine records the health of every nexus child in the store under
//! the nexus uuid; the control plane reads those records back when it has to
//! reassemble a nexus after a restart, so that it never builds a nexus from a
//! child holding stale bits.

/// etcd implementation of the key-value store
pub mod etcd;
/// the per-nexus child health records
pub mod nexus;

use snafu::Snafu;

/// Error type for store operations
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum StoreError {
    #[snafu(display("Failed to connect to the store"))]
    Connect { source: etcd_client::Error },
    #[snafu(display("Failed to 'get' entry with key '{}'", key))]
    Get {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("Failed to 'delete' entry with key '{}'", key))]
    Delete {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("Failed to deserialise value '{}'", value))]
    DeserialiseValue {
        value: String,
        source: serde_json::Error,
    },
    #[snafu(display("Value at key '{}' is not valid utf8", key))]
    ValueString {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display(
        "Store is unavailable: {} consecutive failures, retrying after {:?}",
        failures,
        remaining
    ))]
    Unavailable {
        failures: u32,
        remaining: std::time::Duration,
    },
}
