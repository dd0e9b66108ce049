//! NetworkPolicy isolation
//!
//! The mesh namespace's own NetworkPolicies are mirrored by name into every
//! member so mesh traffic is admitted there. Only `spec` is copied. Policies
//! annotated as internal stay in the mesh namespace.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use mesh_common::kube_utils::gvk;
use mesh_common::labels::{INTERNAL_ANNOTATION, MEMBER_OF_LABEL, OWNER_LABEL};
use mesh_common::store::{LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error, ResourceKey};

use super::NetworkingStrategy;
use crate::mirror::{delete_mirrored_except, is_ours};

const API_VERSION: &str = "networking.k8s.io/v1";
const KIND: &str = "NetworkPolicy";

/// Mirrors mesh NetworkPolicies into member namespaces
pub struct NetworkPolicyStrategy {
    store: Arc<dyn ObjectStore>,
}

impl NetworkPolicyStrategy {
    /// Strategy writing through `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Mesh policies that members must carry
    async fn required_policies(&self, mesh_namespace: &str) -> Result<Vec<DynamicDocument>, Error> {
        let selector = LabelSelector::everything().equals(OWNER_LABEL, mesh_namespace);
        let policies = self
            .store
            .list(&gvk(API_VERSION, KIND), Some(mesh_namespace), &selector)
            .await?;
        Ok(policies
            .into_iter()
            .filter(|p| p.annotation(INTERNAL_ANNOTATION) != Some("true"))
            .collect())
    }

    async fn mirror(&self, source: &DynamicDocument, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        let mut desired = DynamicDocument::new(API_VERSION, KIND, namespace, source.name());
        desired.set_label(MEMBER_OF_LABEL, mesh_namespace)?;
        if let Some(spec) = source.get(&["spec"]) {
            desired.set(&["spec"], spec.clone())?;
        }

        let key = ResourceKey::new(namespace, source.name(), API_VERSION, KIND);
        match self.store.get(&key).await? {
            None => {
                info!(resource = %key, "mirroring network policy");
                self.store.create(&desired).await?;
            }
            Some(existing) if !is_ours(&existing, mesh_namespace) => {
                return Err(Error::AlreadyExists {
                    resource: format!("{key} (not managed by mesh {mesh_namespace})"),
                });
            }
            Some(existing) if existing.get(&["spec"]) != desired.get(&["spec"]) => {
                debug!(resource = %key, "updating mirrored network policy");
                let mut next = existing.clone();
                match desired.get(&["spec"]) {
                    Some(spec) => next.set(&["spec"], spec.clone())?,
                    None => {
                        next.remove(&["spec"]);
                    }
                }
                self.store.update(&next).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkingStrategy for NetworkPolicyStrategy {
    async fn reconcile_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        let required = self.required_policies(mesh_namespace).await?;

        let mut errors = Vec::new();
        for policy in &required {
            if let Err(e) = self.mirror(policy, mesh_namespace, namespace).await {
                errors.push(e.context(format!("mirroring network policy {}", policy.name())));
            }
        }

        let keep: BTreeSet<String> = required.iter().map(|p| p.name().to_string()).collect();
        if let Err(e) =
            delete_mirrored_except(self.store.as_ref(), API_VERSION, KIND, namespace, mesh_namespace, &keep).await
        {
            errors.push(e);
        }
        Error::aggregate(errors)
    }

    async fn remove_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error> {
        delete_mirrored_except(
            self.store.as_ref(),
            API_VERSION,
            KIND,
            namespace,
            mesh_namespace,
            &BTreeSet::new(),
        )
        .await
    }
}
