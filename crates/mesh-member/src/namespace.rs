//! Joining namespaces to a mesh and removing them again
//!
//! A namespace is a member once it carries the member-of label. Everything
//! else the mesh needs there (network access, role bindings, the CNI
//! attachment) is put in place first, so the label only appears on a fully
//! configured namespace and disappears before teardown starts.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use mesh_common::config::CniConfig;
use mesh_common::kube_utils::gvk;
use mesh_common::labels::{MEMBER_OF_LABEL, OWNER_LABEL};
use mesh_common::store::{LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error, ResourceKey};

use crate::cni::CniAttachment;
use crate::mirror::{delete_mirrored_except, is_ours};
use crate::networking::NetworkingStrategy;

const RBAC_API_VERSION: &str = "rbac.authorization.k8s.io/v1";
const ROLE_BINDING: &str = "RoleBinding";

/// Key of a Namespace object
pub fn namespace_key(name: &str) -> ResourceKey {
    ResourceKey::new("", name, "v1", "Namespace")
}

/// Configures member namespaces for one mesh
pub struct NamespaceReconciler {
    store: Arc<dyn ObjectStore>,
    mesh_namespace: String,
    mesh_version: String,
    networking: Arc<dyn NetworkingStrategy>,
    cni: CniAttachment,
}

impl NamespaceReconciler {
    /// Reconciler for the mesh in `mesh_namespace` running `mesh_version`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        mesh_namespace: &str,
        mesh_version: &str,
        networking: Arc<dyn NetworkingStrategy>,
        cni: &CniConfig,
    ) -> Self {
        Self {
            cni: CniAttachment::new(store.clone(), cni.clone()),
            store,
            mesh_namespace: mesh_namespace.to_string(),
            mesh_version: mesh_version.to_string(),
            networking,
        }
    }

    /// Make `namespace` a configured member of the mesh.
    ///
    /// Fails with [`Error::MembershipConflict`] when the namespace belongs to
    /// another mesh; nothing is touched in that case.
    #[instrument(skip(self), fields(mesh = %self.mesh_namespace))]
    pub async fn reconcile_namespace_in_mesh(&self, namespace: &str) -> Result<(), Error> {
        let ns = self
            .store
            .get(&namespace_key(namespace))
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace {namespace}")))?;
        if let Some(member_of) = ns.label(MEMBER_OF_LABEL) {
            if member_of != self.mesh_namespace {
                return Err(Error::MembershipConflict {
                    namespace: namespace.to_string(),
                    member_of: member_of.to_string(),
                    requested: self.mesh_namespace.clone(),
                });
            }
        }

        self.reconcile_role_bindings(namespace).await?;
        self.networking
            .reconcile_namespace(&self.mesh_namespace, namespace)
            .await
            .map_err(|e| e.context("configuring network access"))?;
        self.cni
            .reconcile(&self.mesh_namespace, &self.mesh_version, namespace)
            .await
            .map_err(|e| e.context("configuring CNI attachment"))?;

        if ns.label(MEMBER_OF_LABEL).is_none() {
            let mut next = ns.clone();
            next.set_label(MEMBER_OF_LABEL, &self.mesh_namespace)?;
            self.store.update(&next).await?;
            info!(namespace, "namespace joined the mesh");
        }
        Ok(())
    }

    /// Undo [`NamespaceReconciler::reconcile_namespace_in_mesh`].
    ///
    /// A namespace that no longer exists is already removed. Teardown steps
    /// all run even when one fails; their errors are aggregated.
    #[instrument(skip(self), fields(mesh = %self.mesh_namespace))]
    pub async fn remove_namespace_from_mesh(&self, namespace: &str) -> Result<(), Error> {
        let Some(ns) = self.store.get(&namespace_key(namespace)).await? else {
            debug!(namespace, "namespace is gone, nothing to remove");
            return Ok(());
        };
        match ns.label(MEMBER_OF_LABEL) {
            Some(member_of) if member_of != self.mesh_namespace => {
                warn!(namespace, member_of, "namespace belongs to another mesh, leaving it alone");
                return Ok(());
            }
            Some(_) => {
                let mut next = ns.clone();
                next.remove_label(MEMBER_OF_LABEL);
                self.store.update(&next).await?;
            }
            None => {}
        }

        let mut errors = Vec::new();
        if let Err(e) = self
            .networking
            .remove_namespace(&self.mesh_namespace, namespace)
            .await
        {
            errors.push(e.context("removing network access"));
        }
        if let Err(e) = self.delete_role_bindings_except(namespace, &BTreeSet::new()).await {
            errors.push(e.context("removing role bindings"));
        }
        if let Err(e) = self.cni.remove(&self.mesh_namespace, namespace).await {
            errors.push(e.context("removing CNI attachment"));
        }
        Error::aggregate(errors)?;
        info!(namespace, "namespace left the mesh");
        Ok(())
    }

    /// Mirror the mesh's role bindings by name and drop the ones it no
    /// longer has
    async fn reconcile_role_bindings(&self, namespace: &str) -> Result<(), Error> {
        let selector = LabelSelector::everything().equals(OWNER_LABEL, self.mesh_namespace.as_str());
        let required = self
            .store
            .list(&gvk(RBAC_API_VERSION, ROLE_BINDING), Some(&self.mesh_namespace), &selector)
            .await?;

        let mut errors = Vec::new();
        for binding in &required {
            if let Err(e) = self.mirror_role_binding(binding, namespace).await {
                errors.push(e.context(format!("mirroring role binding {}", binding.name())));
            }
        }

        let keep: BTreeSet<String> = required.iter().map(|b| b.name().to_string()).collect();
        if let Err(e) = self.delete_role_bindings_except(namespace, &keep).await {
            errors.push(e);
        }
        Error::aggregate(errors)
    }

    async fn mirror_role_binding(&self, source: &DynamicDocument, namespace: &str) -> Result<(), Error> {
        let key = ResourceKey::new(namespace, source.name(), RBAC_API_VERSION, ROLE_BINDING);
        if let Some(existing) = self.store.get(&key).await? {
            if is_ours(&existing, &self.mesh_namespace) {
                return Ok(());
            }
            return Err(Error::AlreadyExists {
                resource: format!("{key} (not managed by mesh {})", self.mesh_namespace),
            });
        }

        let mut binding = DynamicDocument::new(RBAC_API_VERSION, ROLE_BINDING, namespace, source.name());
        binding.set_label(MEMBER_OF_LABEL, &self.mesh_namespace)?;
        for field in ["roleRef", "subjects"] {
            if let Some(value) = source.get(&[field]) {
                binding.set(&[field], value.clone())?;
            }
        }
        debug!(resource = %key, "mirroring role binding");
        self.store.create(&binding).await?;
        Ok(())
    }

    async fn delete_role_bindings_except(&self, namespace: &str, keep: &BTreeSet<String>) -> Result<(), Error> {
        delete_mirrored_except(
            self.store.as_ref(),
            RBAC_API_VERSION,
            ROLE_BINDING,
            namespace,
            &self.mesh_namespace,
            keep,
        )
        .await
    }
}
