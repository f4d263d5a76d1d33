//! # Echo Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide a gRPC server implementation
//! and descriptor set for integration testing the `wisp_core` engine.
//! It is not intended for production use.
//!
//! Besides the classic four echo call shapes, the schema carries the messages the engine
//! needs to exercise: every scalar width, maps, oneofs, enums and a self-referential
//! `TreeNode`.

pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/echo.rs"));
}

pub use pb::echo_service_server::{EchoService, EchoServiceServer};
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

/// Directory holding the `.proto` sources, for tests that parse them from disk.
pub const PROTO_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/proto");
