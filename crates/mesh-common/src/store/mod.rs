//! Object store seam
//!
//! Every reconciler reads and writes cluster state through [`ObjectStore`].
//! Production wiring uses [`KubeStore`]; tests use the strongly consistent
//! in-memory `MemoryStore` (behind the `testing` feature).
//!
//! Error contract shared by all implementations:
//! - `get` maps a missing object to `Ok(None)`
//! - `update` / `update_status` are conditional on `metadata.resourceVersion`
//!   when the document carries one, failing with [`Error::Conflict`]
//! - kinds the cluster does not serve fail with [`Error::KindNotRegistered`]
//! - `delete` of a missing object fails with [`Error::NotFound`]; callers
//!   decide whether absence is acceptable

mod cluster;
#[cfg(any(test, feature = "testing"))]
mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::api::GroupVersionKind;
use serde::de::DeserializeOwned;

use crate::document::DynamicDocument;
use crate::resource_key::ResourceKey;
use crate::Error;

pub use cluster::KubeStore;
#[cfg(any(test, feature = "testing"))]
pub use memory::{Fault, MemoryStore, Operation, Verb};

/// Access to cluster objects of any kind
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether objects of this kind live in a namespace
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, Error>;

    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicDocument>, Error>;

    /// List objects of a kind, optionally within one namespace
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicDocument>, Error>;

    /// Create an object; the document must not carry a resourceVersion
    async fn create(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error>;

    /// Replace an object's spec and metadata, leaving status untouched
    async fn update(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error>;

    /// Replace an object's status subresource
    async fn update_status(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error>;

    /// Delete an object with background propagation
    async fn delete(&self, key: &ResourceKey) -> Result<(), Error>;
}

/// List objects and deserialize them into typed views
pub async fn list_typed<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    selector: &LabelSelector,
) -> Result<Vec<T>, Error> {
    store
        .list(gvk, namespace, selector)
        .await?
        .iter()
        .map(DynamicDocument::to_typed)
        .collect()
}

/// Delete an object, treating absence as success
pub async fn delete_if_exists(store: &dyn ObjectStore, key: &ResourceKey) -> Result<(), Error> {
    match store.delete(key).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// =============================================================================
// Label selectors
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    Exists(String),
}

/// Label selector with equality and existence requirements
///
/// The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key=value`
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    /// Require that `key` is present with any value
    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    /// Whether the selector has no requirements
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::Exists(k) => k.clone(),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
