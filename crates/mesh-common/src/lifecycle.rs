//! Finalizer-driven deletion lifecycle
//!
//! An object managed by the operator is in exactly one of three states:
//!
//! ```text
//!  Active ──(deletionTimestamp set)──> Finalizing ──(finalizer released)──> Gone
//! ```
//!
//! Reconcilers match on [`Lifecycle`] instead of inspecting the deletion
//! timestamp and finalizer list at each call site.

use serde_json::json;
use tracing::debug;

use crate::document::DynamicDocument;
use crate::labels::FINALIZER;
use crate::store::ObjectStore;
use crate::Error;

/// Deletion state of a managed object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Not being deleted; the finalizer should be present
    Active,
    /// Deletion requested and our finalizer still holds the object
    Finalizing,
    /// Deletion requested and our finalizer is already gone; nothing to do
    Gone,
}

impl Lifecycle {
    /// Classify an object
    pub fn of(doc: &DynamicDocument) -> Self {
        if !doc.is_terminating() {
            Lifecycle::Active
        } else if doc.finalizers().iter().any(|f| f == FINALIZER) {
            Lifecycle::Finalizing
        } else {
            Lifecycle::Gone
        }
    }
}

/// Active: make sure the finalizer is present.
///
/// Returns the object as stored, updated only if the finalizer was missing.
pub async fn ensure_finalizer(
    store: &dyn ObjectStore,
    doc: &DynamicDocument,
) -> Result<DynamicDocument, Error> {
    let mut finalizers = doc.finalizers();
    if finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(doc.clone());
    }
    finalizers.push(FINALIZER.to_string());

    let mut next = doc.clone();
    next.set(&["metadata", "finalizers"], json!(finalizers))?;
    debug!(kind = %doc.kind(), name = %doc.name(), "adding finalizer");
    store.update(&next).await
}

/// Finalizing -> Gone: drop the finalizer once cleanup has completed.
///
/// An object that vanished in the meantime counts as released.
pub async fn release_finalizer(store: &dyn ObjectStore, doc: &DynamicDocument) -> Result<(), Error> {
    let finalizers: Vec<String> = doc
        .finalizers()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();

    let mut next = doc.clone();
    next.set(&["metadata", "finalizers"], json!(finalizers))?;
    debug!(kind = %doc.kind(), name = %doc.name(), "releasing finalizer");
    match store.update(&next).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map(|_| ()),
    }
}
