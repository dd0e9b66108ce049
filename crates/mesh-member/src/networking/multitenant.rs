//! Multitenant (VNID) isolation
//!
//! Each namespace has a `NetNamespace` with a virtual network id. Joining a
//! mesh means requesting the mesh's id through the change-network annotation;
//! the SDN controller applies it asynchronously and clears the annotation.
//! The request blocks, polling with bounded backoff, until that happens.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use mesh_common::config::BackoffConfig;
use mesh_common::labels::{CHANGE_NETWORK_ANNOTATION, ISOLATE_NETWORK, JOIN_NETWORK_PREFIX};
use mesh_common::retry::poll_with_backoff;
use mesh_common::store::ObjectStore;
use mesh_common::{DynamicDocument, Error, ResourceKey};

use super::{NetworkingStrategy, NETWORK_API_VERSION};

/// Joins and isolates NetNamespaces
pub struct MultitenantStrategy {
    store: Arc<dyn ObjectStore>,
    backoff: BackoffConfig,
}

impl MultitenantStrategy {
    /// Strategy polling with `backoff`
    pub fn new(store: Arc<dyn ObjectStore>, backoff: BackoffConfig) -> Self {
        Self { store, backoff }
    }

    async fn net_namespace(&self, namespace: &str) -> Result<DynamicDocument, Error> {
        let key = net_namespace_key(namespace);
        self.store
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(format!("NetNamespace {namespace}")))
    }

    /// Request `action` on the namespace's network and wait until the SDN
    /// controller has applied it
    async fn update_network_namespace(&self, namespace: &str, action: &str) -> Result<(), Error> {
        let mut net = self.net_namespace(namespace).await?;
        net.set_annotation(CHANGE_NETWORK_ANNOTATION, action)?;
        self.store.update(&net).await?;
        info!(namespace, action, "requested network change, waiting for the SDN controller");

        let key = net_namespace_key(namespace);
        let store = self.store.clone();
        poll_with_backoff(&self.backoff, "netnamespace update", || {
            let store = store.clone();
            let key = key.clone();
            async move {
                let net = store
                    .get(&key)
                    .await?
                    .ok_or_else(|| Error::not_found(key.to_string()))?;
                Ok(net.annotation(CHANGE_NETWORK_ANNOTATION).is_none())
            }
        })
        .await
        .map_err(|e| e.context(format!("waiting for NetNamespace {namespace} to apply {action}")))
    }
}

#[async_trait]
impl NetworkingStrategy for MultitenantStrategy {
    async fn reconcile_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        let mesh_net = self.net_namespace(mesh_namespace).await?;
        let member_net = self.net_namespace(namespace).await?;
        if member_net.get_i64(&["netid"]).is_some()
            && member_net.get_i64(&["netid"]) == mesh_net.get_i64(&["netid"])
            && member_net.annotation(CHANGE_NETWORK_ANNOTATION).is_none()
        {
            debug!(namespace, "already joined to the mesh network");
            return Ok(());
        }
        self.update_network_namespace(namespace, &format!("{JOIN_NETWORK_PREFIX}{mesh_namespace}"))
            .await
    }

    async fn remove_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        let member_net = match self.net_namespace(namespace).await {
            Ok(net) => net,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mesh_net = self.net_namespace(mesh_namespace).await?;
        if member_net.get_i64(&["netid"]) != mesh_net.get_i64(&["netid"]) {
            debug!(namespace, "not on the mesh network");
            return Ok(());
        }
        self.update_network_namespace(namespace, ISOLATE_NETWORK).await
    }
}

fn net_namespace_key(namespace: &str) -> ResourceKey {
    ResourceKey::new("", namespace, NETWORK_API_VERSION, "NetNamespace")
}
