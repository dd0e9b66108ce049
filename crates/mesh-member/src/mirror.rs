//! Helpers for objects mirrored from the mesh namespace into members
//!
//! A mirrored object keeps its source's name and carries the member-of label
//! naming the mesh namespace. That label is the only ownership marker: objects
//! without it are never touched.

use std::collections::BTreeSet;

use tracing::info;

use mesh_common::kube_utils::gvk;
use mesh_common::labels::MEMBER_OF_LABEL;
use mesh_common::store::{delete_if_exists, LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error};

/// Whether `doc` was mirrored by the mesh in `mesh_namespace`
pub(crate) fn is_ours(doc: &DynamicDocument, mesh_namespace: &str) -> bool {
    doc.label(MEMBER_OF_LABEL) == Some(mesh_namespace)
}

/// Mirrored objects of a kind in `namespace`
pub(crate) async fn list_mirrored(
    store: &dyn ObjectStore,
    api_version: &str,
    kind: &str,
    namespace: &str,
    mesh_namespace: &str,
) -> Result<Vec<DynamicDocument>, Error> {
    let selector = LabelSelector::everything().equals(MEMBER_OF_LABEL, mesh_namespace);
    store
        .list(&gvk(api_version, kind), Some(namespace), &selector)
        .await
}

/// Delete mirrored objects whose name is not in `keep`
pub(crate) async fn delete_mirrored_except(
    store: &dyn ObjectStore,
    api_version: &str,
    kind: &str,
    namespace: &str,
    mesh_namespace: &str,
    keep: &BTreeSet<String>,
) -> Result<(), Error> {
    let mut errors = Vec::new();
    for doc in list_mirrored(store, api_version, kind, namespace, mesh_namespace).await? {
        if keep.contains(doc.name()) {
            continue;
        }
        let key = doc.key()?;
        info!(resource = %key, "deleting mirrored object");
        if let Err(e) = delete_if_exists(store, &key).await {
            errors.push(e.context(format!("deleting {key}")));
        }
    }
    Error::aggregate(errors)
}
