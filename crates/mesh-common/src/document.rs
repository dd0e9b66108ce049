//! Dynamic object documents
//!
//! Rendered manifests and live objects of arbitrary kinds are handled as a
//! [`DynamicDocument`]: a JSON object tree with typed accessors. Paths are
//! slices of segments rather than dotted strings because label and annotation
//! keys contain dots (`maistra.io/owner`).
//!
//! Frequently-used metadata has named accessors; anything else goes through
//! [`DynamicDocument::get`] / [`DynamicDocument::set`]. Typed views are one
//! serde conversion away via [`DynamicDocument::to_typed`].

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::resource_key::ResourceKey;
use crate::Error;

/// A Kubernetes object of any kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicDocument(Value);

impl DynamicDocument {
    /// Create a skeleton object with identity fields set.
    ///
    /// An empty `namespace` produces a cluster-scoped object.
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), Value::String(name.to_string()));
        if !namespace.is_empty() {
            metadata.insert(
                "namespace".to_string(),
                Value::String(namespace.to_string()),
            );
        }
        let mut root = Map::new();
        root.insert(
            "apiVersion".to_string(),
            Value::String(api_version.to_string()),
        );
        root.insert("kind".to_string(), Value::String(kind.to_string()));
        root.insert("metadata".to_string(), Value::Object(metadata));
        Self(Value::Object(root))
    }

    /// Wrap a JSON value; the root must be an object
    pub fn from_value(value: Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::serialization(format!(
                "expected an object document, got {}",
                type_name(&value)
            )));
        }
        Ok(Self(value))
    }

    /// Serialize a typed object (k8s-openapi or CRD) into a document
    pub fn from_typed<T: Serialize>(obj: &T) -> Result<Self, Error> {
        Self::from_value(serde_json::to_value(obj)?)
    }

    /// Deserialize into a typed view
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.0.clone())
            .map_err(|e| Error::serialization_for_kind(self.kind(), e.to_string()))
    }

    /// Borrow the underlying JSON
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Take the underlying JSON
    pub fn into_value(self) -> Value {
        self.0
    }

    // =========================================================================
    // Path access
    // =========================================================================

    /// Value at `path`, if every segment exists
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.0, |value, segment| value.get(*segment))
    }

    /// String at `path`
    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Integer at `path`
    pub fn get_i64(&self, path: &[&str]) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// Object at `path`
    pub fn get_map(&self, path: &[&str]) -> Option<&Map<String, Value>> {
        self.get(path).and_then(Value::as_object)
    }

    /// Array at `path`
    pub fn get_array(&self, path: &[&str]) -> Option<&Vec<Value>> {
        self.get(path).and_then(Value::as_array)
    }

    /// Set the value at `path`, creating intermediate objects.
    ///
    /// Fails if an intermediate segment exists but is not an object.
    pub fn set(&mut self, path: &[&str], value: impl Into<Value>) -> Result<(), Error> {
        let Some((last, parents)) = path.split_last() else {
            return Err(Error::internal_with_context("document", "empty path"));
        };

        let mut current = &mut self.0;
        for segment in parents {
            let obj = current
                .as_object_mut()
                .ok_or_else(|| not_an_object(path, segment))?;
            current = obj
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
        }

        current
            .as_object_mut()
            .ok_or_else(|| not_an_object(path, last))?
            .insert(last.to_string(), value.into());
        Ok(())
    }

    /// Remove and return the value at `path`
    pub fn remove(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut current = &mut self.0;
        for segment in parents {
            current = current.get_mut(*segment)?;
        }
        current.as_object_mut()?.remove(*last)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    /// `apiVersion`, empty if absent
    pub fn api_version(&self) -> &str {
        self.get_str(&["apiVersion"]).unwrap_or_default()
    }

    /// `kind`, empty if absent
    pub fn kind(&self) -> &str {
        self.get_str(&["kind"]).unwrap_or_default()
    }

    /// `metadata.name`, empty if absent
    pub fn name(&self) -> &str {
        self.get_str(&["metadata", "name"]).unwrap_or_default()
    }

    /// `metadata.namespace`, `None` for cluster-scoped objects
    pub fn namespace(&self) -> Option<&str> {
        self.get_str(&["metadata", "namespace"])
            .filter(|ns| !ns.is_empty())
    }

    /// Set `metadata.namespace`
    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), Error> {
        self.set(&["metadata", "namespace"], namespace)
    }

    /// Identity key of this object
    pub fn key(&self) -> Result<ResourceKey, Error> {
        ResourceKey::from_document(self)
    }

    // =========================================================================
    // Labels and annotations
    // =========================================================================

    /// All string labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map(&["metadata", "labels"])
    }

    /// A single label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.get_str(&["metadata", "labels", key])
    }

    /// Set a label
    pub fn set_label(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.set(&["metadata", "labels", key], value)
    }

    /// Remove a label, returning whether it was present
    pub fn remove_label(&mut self, key: &str) -> bool {
        self.remove(&["metadata", "labels", key]).is_some()
    }

    /// All string annotations
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map(&["metadata", "annotations"])
    }

    /// A single annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get_str(&["metadata", "annotations", key])
    }

    /// Set an annotation
    pub fn set_annotation(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.set(&["metadata", "annotations", key], value)
    }

    /// Remove an annotation, returning whether it was present
    pub fn remove_annotation(&mut self, key: &str) -> bool {
        self.remove(&["metadata", "annotations", key]).is_some()
    }

    fn string_map(&self, path: &[&str]) -> BTreeMap<String, String> {
        self.get_map(path)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    // =========================================================================
    // Server-managed metadata
    // =========================================================================

    /// `metadata.resourceVersion`
    pub fn resource_version(&self) -> Option<&str> {
        self.get_str(&["metadata", "resourceVersion"])
    }

    /// Set or clear `metadata.resourceVersion`
    pub fn set_resource_version(&mut self, version: Option<&str>) -> Result<(), Error> {
        match version {
            Some(v) => self.set(&["metadata", "resourceVersion"], v),
            None => {
                self.remove(&["metadata", "resourceVersion"]);
                Ok(())
            }
        }
    }

    /// `metadata.generation`
    pub fn generation(&self) -> Option<i64> {
        self.get_i64(&["metadata", "generation"])
    }

    /// `metadata.uid`
    pub fn uid(&self) -> Option<&str> {
        self.get_str(&["metadata", "uid"])
    }

    /// `metadata.deletionTimestamp`
    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.get_str(&["metadata", "deletionTimestamp"])
    }

    /// Whether deletion of this object has been requested
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp().is_some()
    }

    /// `metadata.finalizers`
    pub fn finalizers(&self) -> Vec<String> {
        self.get_array(&["metadata", "finalizers"])
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `metadata.ownerReferences`
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.get(&["metadata", "ownerReferences"])
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Replace `metadata.ownerReferences`
    pub fn set_owner_references(&mut self, refs: &[OwnerReference]) -> Result<(), Error> {
        self.set(&["metadata", "ownerReferences"], serde_json::to_value(refs)?)
    }
}

fn not_an_object(path: &[&str], segment: &str) -> Error {
    Error::internal_with_context(
        "document",
        format!("segment {segment:?} of {path:?} is not an object"),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
