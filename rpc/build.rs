extern crate tonic_build;

fn main() {
    // io-engine message and service definitions; only the client side is used
    // by the control plane
    tonic_build::configure()
        .build_server(false)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["protobuf/mayastor.proto"], &["protobuf"])
        .unwrap_or_else(|e| panic!("mayastor protobuf compilation failed: {}", e));

    // CSI is served by the control plane
    tonic_build::configure()
        .build_server(true)
        .compile_protos(&["protobuf/csi.proto"], &["protobuf"])
        .unwrap_or_else(|e| panic!("CSI protobuf compilation failed: {}", e));
}
