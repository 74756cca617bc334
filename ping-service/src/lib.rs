//! # Ping Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide the gRPC test service
//! (client and server bindings) used to integration test the `splice` proxy.
//! It is not intended for production use.

pub mod pb {
    tonic::include_proto!("ping.v1");
}

pub use pb::test_service_client::TestServiceClient;
pub use pb::test_service_server::{TestService, TestServiceServer};

/// Fully qualified name of the test service.
pub const SERVICE_NAME: &str = "ping.v1.TestService";
