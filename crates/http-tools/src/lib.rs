//! Outbound HTTP plumbing shared by the apigate spec loader and invocation dispatcher.
//!
//! Nothing in here knows about `OpenAPI` documents or sessions; it only deals with URLs,
//! request encoding, response bodies and the outbound safety policy.

pub mod body;
pub mod encoding;
pub mod safety;
pub mod semantics;
