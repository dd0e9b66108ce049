//! CNI attachment
//!
//! With the mesh CNI plugin enabled, pods in a member namespace only get
//! their traffic redirected when the namespace carries the
//! NetworkAttachmentDefinition for the mesh's version.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use mesh_common::config::CniConfig;
use mesh_common::labels::MEMBER_OF_LABEL;
use mesh_common::store::ObjectStore;
use mesh_common::{DynamicDocument, Error, ResourceKey};

use crate::mirror::{delete_mirrored_except, is_ours};

/// apiVersion of NetworkAttachmentDefinition
pub const NAD_API_VERSION: &str = "k8s.cni.cncf.io/v1";
/// NetworkAttachmentDefinition kind
pub const NAD_KIND: &str = "NetworkAttachmentDefinition";

/// Maintains the mesh attachment in member namespaces
pub struct CniAttachment {
    store: Arc<dyn ObjectStore>,
    config: CniConfig,
}

impl CniAttachment {
    /// Attachment manager for the cluster CNI settings
    pub fn new(store: Arc<dyn ObjectStore>, config: CniConfig) -> Self {
        Self { store, config }
    }

    /// Ensure exactly the attachment for `mesh_version` exists in `namespace`,
    /// or none when CNI is disabled
    pub async fn reconcile(&self, mesh_namespace: &str, mesh_version: &str, namespace: &str) -> Result<(), Error> {
        if !self.config.enabled {
            return self.remove(mesh_namespace, namespace).await;
        }

        let name = self.config.network_name(mesh_version);
        let key = ResourceKey::new(namespace, &name, NAD_API_VERSION, NAD_KIND);
        match self.store.get(&key).await? {
            None => {
                let mut desired = DynamicDocument::new(NAD_API_VERSION, NAD_KIND, namespace, &name);
                desired.set_label(MEMBER_OF_LABEL, mesh_namespace)?;
                info!(resource = %key, "creating network attachment");
                self.store.create(&desired).await?;
            }
            Some(existing) if !is_ours(&existing, mesh_namespace) => {
                debug!(resource = %key, "network attachment already present, not managed by this mesh");
            }
            Some(_) => {}
        }

        let keep = BTreeSet::from([name]);
        delete_mirrored_except(self.store.as_ref(), NAD_API_VERSION, NAD_KIND, namespace, mesh_namespace, &keep).await
    }

    /// Delete every attachment this mesh created in `namespace`
    pub async fn remove(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        let result = delete_mirrored_except(
            self.store.as_ref(),
            NAD_API_VERSION,
            NAD_KIND,
            namespace,
            mesh_namespace,
            &BTreeSet::new(),
        )
        .await;
        match result {
            Err(e) if e.is_kind_not_registered() => {
                debug!("NetworkAttachmentDefinition kind not served, nothing to remove");
                Ok(())
            }
            other => other,
        }
    }
}
