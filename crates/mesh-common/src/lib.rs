//! Common types for the mesh operator: CRDs, errors, the object store seam
//! and shared utilities

#![deny(missing_docs)]

pub mod config;
pub mod conflict;
pub mod crd;
pub mod document;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod labels;
pub mod lifecycle;
pub mod resource_key;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod yaml;

pub use config::OperatorConfig;
pub use document::DynamicDocument;
pub use error::Error;
pub use resource_key::ResourceKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
