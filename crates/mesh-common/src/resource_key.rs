//! Object identity keys
//!
//! A [`ResourceKey`] identifies one object independent of its content. It
//! renders as `namespace/name=apiVersion,Kind=kind` (empty namespace for
//! cluster-scoped objects) and is used as the map key when indexing owned
//! objects.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::GroupVersionKind;

use crate::document::DynamicDocument;
use crate::kube_utils;
use crate::Error;

/// Identity of a single cluster object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Full apiVersion (`apps/v1`, `v1`)
    pub api_version: String,
    /// Kind
    pub kind: String,
}

impl ResourceKey {
    /// Build a key from its parts
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Key of a document; fails when identity fields are missing
    pub fn from_document(doc: &DynamicDocument) -> Result<Self, Error> {
        for (field, value) in [
            ("apiVersion", doc.api_version()),
            ("kind", doc.kind()),
            ("metadata.name", doc.name()),
        ] {
            if value.is_empty() {
                return Err(Error::validation_for_field(
                    field,
                    format!("object is missing {field}"),
                ));
            }
        }
        Ok(Self::new(
            doc.namespace().unwrap_or_default(),
            doc.name(),
            doc.api_version(),
            doc.kind(),
        ))
    }

    /// Group/version/kind of the keyed object
    pub fn gvk(&self) -> GroupVersionKind {
        kube_utils::gvk(&self.api_version, &self.kind)
    }

    /// Namespace, or `None` when cluster-scoped
    pub fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }

    /// Minimal object reference for events and owner lookups
    pub fn to_object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version.clone()),
            kind: Some(self.kind.clone()),
            name: Some(self.name.clone()),
            namespace: self.namespace().map(str::to_string),
            ..Default::default()
        }
    }
}

impl From<&ObjectReference> for ResourceKey {
    fn from(r: &ObjectReference) -> Self {
        Self::new(
            r.namespace.clone().unwrap_or_default(),
            r.name.clone().unwrap_or_default(),
            r.api_version.clone().unwrap_or_default(),
            r.kind.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}={},Kind={}",
            self.namespace, self.name, self.api_version, self.kind
        )
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::validation(format!("malformed resource key {s:?}"));

        let (location, type_info) = s.split_once('=').ok_or_else(malformed)?;
        let (namespace, name) = location.split_once('/').ok_or_else(malformed)?;
        let (api_version, kind) = type_info.rsplit_once(",Kind=").ok_or_else(malformed)?;
        if name.is_empty() || api_version.is_empty() || kind.is_empty() {
            return Err(malformed());
        }
        Ok(Self::new(namespace, name, api_version, kind))
    }
}
