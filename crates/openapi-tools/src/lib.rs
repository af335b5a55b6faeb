//! `OpenAPI` -> tool translation and dispatch core.
//!
//! Pipeline: [`loader`] reads and validates a document into the [`document`] model,
//! [`translator`] turns each operation into a [`registry::ToolDescriptor`], and
//! [`dispatcher`] executes tool invocations against the upstream API.
//!
//! Nothing in here knows about sessions or transports.

pub mod config;
pub mod dispatcher;
pub mod document;
pub mod error;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod translator;

pub use dispatcher::{Dispatcher, InvocationResult, SuccessPayload};
pub use document::OpenApiDocument;
pub use error::{ErrorKind, LoadError, StructuredError, TranslationError};
pub use loader::SpecLoader;
pub use registry::{ToolDescriptor, ToolRegistry};
