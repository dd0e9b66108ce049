//! Pruning of owned objects the current pass did not write
//!
//! Every object the manifest processor writes carries the owner label and the
//! mesh generation annotation. After a successful pass, anything still
//! labelled as ours with a different generation was not rendered anymore and
//! is deleted. Decisions are made from those two markers only, never from
//! object content.

use tracing::{debug, info, warn};

use mesh_common::kube_utils::gvk;
use mesh_common::labels::{MESH_GENERATION_ANNOTATION, OWNER_LABEL};
use mesh_common::store::{LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error};

/// Kinds the pruner looks at, in deletion order.
///
/// Workloads and the namespaced objects they reference go first. Cluster-wide
/// admission webhooks and RBAC go last so nothing is admitted against a
/// webhook whose backend is already gone mid-teardown.
pub const PRUNE_ORDER: &[(&str, &str)] = &[
    ("autoscaling/v2", "HorizontalPodAutoscaler"),
    ("policy/v1", "PodDisruptionBudget"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "Job"),
    ("v1", "Service"),
    ("v1", "ConfigMap"),
    ("v1", "Secret"),
    ("networking.k8s.io/v1", "NetworkPolicy"),
    ("k8s.cni.cncf.io/v1", "NetworkAttachmentDefinition"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("v1", "ServiceAccount"),
    ("admissionregistration.k8s.io/v1", "MutatingWebhookConfiguration"),
    ("admissionregistration.k8s.io/v1", "ValidatingWebhookConfiguration"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
];

/// Which owned objects survive a prune
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneTarget {
    /// Keep objects stamped with this mesh generation
    Generation(String),
    /// Delete every owned object (control-plane deletion)
    DeleteAll,
}

impl PruneTarget {
    fn is_stale(&self, doc: &DynamicDocument) -> bool {
        match self {
            PruneTarget::DeleteAll => true,
            PruneTarget::Generation(current) => {
                doc.annotation(MESH_GENERATION_ANNOTATION) != Some(current.as_str())
            }
        }
    }
}

/// Deletes stale objects owned by one mesh namespace
pub struct Pruner<'a> {
    store: &'a dyn ObjectStore,
    owner: String,
}

impl<'a> Pruner<'a> {
    /// Pruner for objects labelled as owned by `owner`
    pub fn new(store: &'a dyn ObjectStore, owner: &str) -> Self {
        Self {
            store,
            owner: owner.to_string(),
        }
    }

    /// Prune every kind in [`PRUNE_ORDER`].
    ///
    /// Best effort: a failing kind does not stop the remaining ones; all
    /// failures come back as one aggregate.
    pub async fn prune(&self, target: &PruneTarget) -> Result<(), Error> {
        let mut errors = Vec::new();
        for (api_version, kind) in PRUNE_ORDER {
            if let Err(e) = self.prune_kind(api_version, kind, target).await {
                errors.push(e);
            }
        }
        Error::aggregate(errors)
    }

    /// Prune a single kind with the same matching rules as [`Pruner::prune`]
    pub async fn prune_kind(&self, api_version: &str, kind: &str, target: &PruneTarget) -> Result<(), Error> {
        let selector = LabelSelector::everything().equals(OWNER_LABEL, &self.owner);
        let objects = match self.store.list(&gvk(api_version, kind), None, &selector).await {
            Ok(objects) => objects,
            Err(e) if e.is_kind_not_registered() => {
                info!(api_version, kind, "kind not served by the cluster, nothing to prune");
                return Ok(());
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.context(format!("listing {kind}"))),
        };

        let mut errors = Vec::new();
        for doc in objects {
            if doc.is_terminating() || !target.is_stale(&doc) {
                continue;
            }
            let key = match doc.key() {
                Ok(key) => key,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            debug!(
                resource = %key,
                generation = doc.annotation(MESH_GENERATION_ANNOTATION).unwrap_or_default(),
                "pruning"
            );
            match self.store.delete(&key).await {
                Ok(()) => info!(resource = %key, "pruned"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(resource = %key, error = %e, "failed to prune");
                    errors.push(e.context(format!("deleting {key}")));
                }
            }
        }
        Error::aggregate(errors)
    }
}
