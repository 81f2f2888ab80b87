//! gRPC transport: the TreeLink service (persistent link streams plus
//! the operator Exec entry point) and the dialer side of links.

pub mod client;
pub mod server;

/// Generated protobuf types for the wire protocol.
pub mod pb {
    tonic::include_proto!("canopy");

    // File descriptor for gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/canopy_descriptor.bin"));
}

pub use client::GrpcDialer;
pub use server::{start_grpc_server, GrpcServerHandle, TreeLinkService};
