//! # Wisp Core
//!
//! `wisp-core` is the dynamic gRPC invocation engine behind the Wisp client. It talks to
//! any gRPC server without compile-time knowledge of its Protobuf schema.
//!
//! ## Key Components
//!
//! * **[`schema`]:** Builds a navigable service/method/field model from server reflection,
//!   raw `.proto` sources or a compiled descriptor set. Self-referential messages are
//!   flattened eagerly up to a configurable loop depth.
//! * **[`marshal`]:** Turns loosely typed [`value::Value`] input into a wire-ready
//!   `DynamicMessage`, field by field, following the schema model.
//! * **[`decode`]:** Renders received messages as pretty-printed canonical JSON.
//! * **[`session`]:** Drives the four gRPC call shapes as background tasks with
//!   cancellation, close-stream signalling and a bounded response channel.
//! * **[`forward`]:** Caches cluster port-forward tunnels so a connection is not torn
//!   down and rebuilt for every call.
//! * **[`engine::Engine`]:** The client instance tying the pieces together.
//!
//! ## Internal clients
//!
//! * **[`grpc::client::GrpcClient`]:** A generic gRPC client working on `DynamicMessage`s
//!   through a custom codec.
//! * **[`reflection::client::ReflectionClient`]:** A gRPC Reflection client offering only
//!   the functionality we need internally.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod config;
pub mod credentials;
pub mod decode;
pub mod engine;
pub mod forward;
pub mod grpc;
pub mod marshal;
pub mod reflection;
pub mod schema;
pub mod session;
pub mod value;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
