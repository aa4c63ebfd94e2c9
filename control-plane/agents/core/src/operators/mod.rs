/// the custom resource definitions
pub(crate) mod crd;
/// node CR reconciliation
pub(crate) mod node;
/// pool CR reconciliation
pub(crate) mod pool;
/// generic list-and-watch cache over a custom resource
pub(crate) mod watcher;
