//! [`ObjectStore`] backed by the Kubernetes API server

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
    TypeMeta,
};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use super::{LabelSelector, ObjectStore};
use crate::document::DynamicDocument;
use crate::resource_key::ResourceKey;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{kube_utils, Error};

/// Dynamic-object client with cached API discovery
///
/// Resolved kinds are cached for the life of the process. Kinds that are not
/// served are never cached so a CRD installed later is picked up.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    resources: Arc<DashMap<String, (ApiResource, ApiCapabilities)>>,
    discovery_retry: RetryConfig,
}

impl KubeStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Arc::new(DashMap::new()),
            discovery_retry: RetryConfig::with_max_attempts(3),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities), Error> {
        let cache_key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(entry) = self.resources.get(&cache_key) {
            return Ok(entry.value().clone());
        }

        let client = &self.client;
        let resolved = retry_with_backoff(&self.discovery_retry, "api_discovery", || async move {
            match kube::discovery::pinned_kind(client, gvk).await {
                Ok(found) => Ok(Some(found)),
                Err(kube::Error::Discovery(_)) => Ok(None),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;

        match resolved {
            Some(found) => {
                debug!(
                    group = %gvk.group,
                    version = %gvk.version,
                    kind = %gvk.kind,
                    plural = %found.0.plural,
                    "resolved API resource"
                );
                self.resources.insert(cache_key, found.clone());
                Ok(found)
            }
            None => Err(Error::kind_not_registered(
                kube_utils::api_version_of(gvk),
                &gvk.kind,
            )),
        }
    }

    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource), Error> {
        let (ar, caps) = self.resolve(gvk).await?;
        let api = match (&caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    async fn api_for_document(
        &self,
        doc: &DynamicDocument,
    ) -> Result<(Api<DynamicObject>, ApiResource), Error> {
        let gvk = kube_utils::gvk(doc.api_version(), doc.kind());
        self.api_for(&gvk, doc.namespace()).await
    }
}

fn to_object(doc: &DynamicDocument) -> Result<DynamicObject, Error> {
    serde_json::from_value(doc.as_value().clone())
        .map_err(|e| Error::serialization_for_kind(doc.kind(), e.to_string()))
}

/// List responses omit apiVersion/kind on items; restore them from discovery.
fn to_document(mut obj: DynamicObject, ar: &ApiResource) -> Result<DynamicDocument, Error> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
    DynamicDocument::from_typed(&obj)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, Error> {
        let (_, caps) = self.resolve(gvk).await?;
        Ok(matches!(caps.scope, Scope::Namespaced))
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicDocument>, Error> {
        let (api, ar) = self.api_for(&key.gvk(), key.namespace()).await?;
        trace!(key = %key, "get");
        api.get_opt(&key.name)
            .await?
            .map(|obj| to_document(obj, &ar))
            .transpose()
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicDocument>, Error> {
        let (api, ar) = self.api_for(gvk, namespace).await?;
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        trace!(kind = %gvk.kind, namespace = ?namespace, selector = %selector, "list");
        api.list(&params)
            .await?
            .items
            .into_iter()
            .map(|obj| to_document(obj, &ar))
            .collect()
    }

    async fn create(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let (api, ar) = self.api_for_document(doc).await?;
        let created = api.create(&PostParams::default(), &to_object(doc)?).await?;
        to_document(created, &ar)
    }

    async fn update(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let (api, ar) = self.api_for_document(doc).await?;
        let replaced = api
            .replace(doc.name(), &PostParams::default(), &to_object(doc)?)
            .await?;
        to_document(replaced, &ar)
    }

    async fn update_status(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let (api, ar) = self.api_for_document(doc).await?;

        // A merge patch carrying resourceVersion is rejected with 409 when stale
        let mut metadata = Map::new();
        if let Some(rv) = doc.resource_version() {
            metadata.insert("resourceVersion".to_string(), Value::String(rv.to_string()));
        }
        let patch = json!({
            "metadata": metadata,
            "status": doc.get(&["status"]).cloned().unwrap_or(Value::Null),
        });

        let patched = api
            .patch_status(doc.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        to_document(patched, &ar)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        let (api, _) = self.api_for(&key.gvk(), key.namespace()).await?;
        api.delete(&key.name, &DeleteParams::background()).await?;
        Ok(())
    }
}
