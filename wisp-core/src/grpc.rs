//! # Generic gRPC Transport
//!
//! Low-level building blocks for performing gRPC calls with runtime-built messages.
//!
//! Unlike generated `tonic` clients, nothing here knows the message types at compile time:
//! requests and responses are `prost_reflect::DynamicMessage`s and the method being called
//! is identified by its `MethodDescriptor`.
pub mod client;
pub mod codec;
