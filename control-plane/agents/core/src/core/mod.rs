//! Common modules used by the different core services

/// registry events and their fan-out
pub(crate) mod events;
/// in-memory io-engine for the component tests
#[cfg(test)]
pub(crate) mod fake;
/// gRPC client to the io-engine instances
pub(crate) mod grpc;
/// registry with every node and all its resources
pub(crate) mod registry;
/// conversions between rpc and bus types
pub(crate) mod translation;
/// helper wrappers over the resources
pub(crate) mod wrapper;
