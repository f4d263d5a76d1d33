//! # Schema
//!
//! This module turns Protobuf descriptors into the navigable model the rest of the engine
//! (and any UI on top of it) works with: [`Service`]s holding [`Method`]s holding a
//! recursive tree of input [`Field`]s.
//!
//! Descriptors can come from three places, all handled by [`SchemaLoader`]:
//!
//! 1. **Server reflection** (`grpc.reflection.v1`), queried over an existing connection.
//! 2. **`.proto` sources**, parsed at runtime with configured import roots.
//! 3. **A compiled `FileDescriptorSet`** (protobuf binary format).
mod expand;
mod loader;
mod model;

pub use expand::FieldExpander;
pub use loader::*;
pub use model::*;
