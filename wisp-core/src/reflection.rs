//! # Server Reflection
//!
//! Talks the `grpc.reflection.v1` protocol so a server's schema can be discovered at runtime,
//! without `.proto` sources on the client side.
pub mod client;
