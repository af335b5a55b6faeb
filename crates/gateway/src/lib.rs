//! Serve REST APIs described by `OpenAPI` documents as agent tools.
//!
//! Each mounted namespace gets its own frozen tool registry; clients open sessions over SSE
//! and invoke tools by name. See [`transport`] for the wire surface.

pub mod config;
pub mod mounts;
pub mod protocol;
pub mod session;
pub mod sessions;
pub mod transport;
