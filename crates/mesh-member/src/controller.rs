//! ServiceMeshMemberRoll controller
//!
//! Each pass takes exactly one of these paths, checked in order:
//!
//! | # | trigger | work |
//! |---|---|---|
//! | 1 | roll generation != `observedGeneration` | add listed namespaces, remove unlisted ones |
//! | 2 | a listed namespace appeared | configure only the new namespaces |
//! | 3 | control plane `reconciledVersion` changed | re-configure every member |
//! | 4 | a configured namespace was deleted | drop it from `configuredMembers` |
//! | 5 | none of the above | nothing |
//!
//! Before that the roll needs exactly one reconciled control plane in its
//! namespace; otherwise it reports why and waits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use mesh_common::config::OperatorConfig;
use mesh_common::conflict::handle_conflicts;
use mesh_common::crd::{
    condition_reasons, condition_types, Condition, ConditionStatus, MemberRollStatus, ServiceMeshControlPlane,
    ServiceMeshMemberRoll,
};
use mesh_common::events::{actions, reasons, EventPublisher};
use mesh_common::kube_utils::gvk;
use mesh_common::labels::MEMBER_OF_LABEL;
use mesh_common::lifecycle::{ensure_finalizer, release_finalizer, Lifecycle};
use mesh_common::store::{list_typed, LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error};

use crate::namespace::NamespaceReconciler;
use crate::networking::{probe_network_plugin, strategy_for};

/// Shared context for the member-roll controller
pub struct MemberRollContext {
    /// Cluster access
    pub store: Arc<dyn ObjectStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

/// Reconcile a ServiceMeshMemberRoll; conflicts requeue quietly
#[instrument(skip(roll, ctx), fields(namespace = %roll.namespace().unwrap_or_default(), name = %roll.name_any()))]
pub async fn reconcile(roll: Arc<ServiceMeshMemberRoll>, ctx: Arc<MemberRollContext>) -> Result<Action, Error> {
    handle_conflicts(reconcile_inner(&roll, &ctx), ctx.config.requeue.on_conflict).await
}

/// Requeue failed passes after the configured delay
pub fn error_policy(roll: Arc<ServiceMeshMemberRoll>, error: &Error, ctx: Arc<MemberRollContext>) -> Action {
    warn!(
        namespace = %roll.namespace().unwrap_or_default(),
        name = %roll.name_any(),
        error = %error,
        "member roll reconcile failed"
    );
    Action::requeue(ctx.config.requeue.on_error)
}

/// The control plane a roll's members are configured for
struct Mesh {
    generation: Option<i64>,
    reconciled_version: Option<String>,
    version: String,
}

/// Why a roll cannot make progress yet
enum Wait {
    Missing,
    Multiple(usize),
    NotReconciled(String),
}

impl Wait {
    fn condition(&self) -> Condition {
        let (reason, message) = match self {
            Wait::Missing => (
                condition_reasons::SMCP_MISSING,
                "No ServiceMeshControlPlane exists in the namespace".to_string(),
            ),
            Wait::Multiple(count) => (
                condition_reasons::MULTIPLE_SMCPS,
                format!("Found {count} ServiceMeshControlPlanes in the namespace, expected exactly one"),
            ),
            Wait::NotReconciled(name) => (
                condition_reasons::SMCP_NOT_RECONCILED,
                format!("ServiceMeshControlPlane {name} has not been reconciled yet"),
            ),
        };
        Condition::new(condition_types::READY, ConditionStatus::False, reason, message)
    }
}

async fn reconcile_inner(roll: &ServiceMeshMemberRoll, ctx: &MemberRollContext) -> Result<Action, Error> {
    let doc = DynamicDocument::from_typed(roll)?;
    match Lifecycle::of(&doc) {
        Lifecycle::Gone => return Ok(Action::await_change()),
        Lifecycle::Finalizing => return finalize(roll, &doc, ctx).await,
        Lifecycle::Active => {}
    }
    let mut doc = ensure_finalizer(ctx.store.as_ref(), &doc).await?;

    let mesh_namespace = roll
        .namespace()
        .ok_or_else(|| Error::validation_for_field("metadata.namespace", "member roll has no namespace"))?;
    let original = roll.status.clone().unwrap_or_default();
    let mut status = original.clone();

    let control_planes: Vec<ServiceMeshControlPlane> = list_typed(
        ctx.store.as_ref(),
        &gvk("maistra.io/v2", "ServiceMeshControlPlane"),
        Some(&mesh_namespace),
        &LabelSelector::everything(),
    )
    .await?;
    let smcp = match control_planes.as_slice() {
        [] => return wait(ctx, &doc, &original, status, Wait::Missing).await,
        [smcp] => smcp,
        many => return wait(ctx, &doc, &original, status, Wait::Multiple(many.len())).await,
    };
    doc = ensure_owner(ctx.store.as_ref(), doc, smcp).await?;

    let smcp_status = smcp.status.clone().unwrap_or_default();
    let Some(reconciled_version) = smcp_status.reconciled_version.clone() else {
        return wait(ctx, &doc, &original, status, Wait::NotReconciled(smcp.name_any())).await;
    };
    let mesh = Mesh {
        generation: smcp.metadata.generation,
        reconciled_version: Some(reconciled_version),
        version: smcp_status
            .chart_version
            .or_else(|| smcp.spec.version.clone())
            .unwrap_or_else(|| ctx.config.default_mesh_version.clone()),
    };

    let namespaces = ctx
        .store
        .list(&gvk("v1", "Namespace"), None, &LabelSelector::everything())
        .await
        .map_err(|e| e.context("listing namespaces"))?;
    let existing: BTreeSet<String> = namespaces.iter().map(|ns| ns.name().to_string()).collect();
    let terminating: BTreeSet<String> = namespaces
        .iter()
        .filter(|ns| ns.is_terminating())
        .map(|ns| ns.name().to_string())
        .collect();
    let labelled: BTreeSet<String> = namespaces
        .iter()
        .filter(|ns| ns.label(MEMBER_OF_LABEL) == Some(mesh_namespace.as_str()) && ns.name() != mesh_namespace)
        .map(|ns| ns.name().to_string())
        .collect();

    let required = roll.required_members();
    let previously_configured = roll.configured_members();
    let configured: BTreeSet<String> = previously_configured.intersection(&existing).cloned().collect();
    let available: BTreeSet<String> = required
        .iter()
        .filter(|ns| existing.contains(*ns) && !terminating.contains(*ns))
        .cloned()
        .collect();

    let mut pass = MemberPass::new(ctx, roll.object_ref(&()), &mesh_namespace, &mesh.version, configured).await?;
    let generation = roll.metadata.generation;

    if generation != status.observed_generation {
        info!(?generation, "member list changed, recomputing membership");
        let stale: BTreeSet<String> = labelled
            .union(&pass.configured)
            .filter(|ns| !required.contains(*ns))
            .cloned()
            .collect();
        for namespace in &stale {
            pass.remove(namespace).await;
        }
        for namespace in &available {
            pass.add(namespace).await;
        }
        if pass.failures.is_empty() {
            status.observed_generation = generation;
            status.service_mesh_generation = mesh.generation;
            status.service_mesh_reconciled_version = mesh.reconciled_version.clone();
        }
    } else if available.iter().any(|ns| !pass.configured.contains(ns)) {
        let appeared: Vec<String> = available
            .iter()
            .filter(|ns| !pass.configured.contains(*ns))
            .cloned()
            .collect();
        info!(namespaces = ?appeared, "configuring newly available members");
        for namespace in &appeared {
            pass.add(namespace).await;
        }
    } else if status.service_mesh_reconciled_version != mesh.reconciled_version {
        info!(
            from = ?status.service_mesh_reconciled_version,
            to = ?mesh.reconciled_version,
            "control plane changed, reconfiguring every member"
        );
        for namespace in &available {
            pass.add(namespace).await;
        }
        if pass.failures.is_empty() {
            status.service_mesh_generation = mesh.generation;
            status.service_mesh_reconciled_version = mesh.reconciled_version.clone();
        }
    } else if pass.configured != previously_configured {
        let gone: Vec<&String> = previously_configured.difference(&pass.configured).collect();
        info!(namespaces = ?gone, "configured namespaces were deleted");
    } else {
        debug!("members up to date");
    }

    if !pass.failures.is_empty() && pass.failures.values().all(Error::is_pure_conflict) {
        debug!(namespaces = ?pass.failures.keys().collect::<Vec<_>>(), "member writes conflicted, leaving status for the retry");
        return Error::aggregate(pass.failures.into_values().collect()).map(|_| Action::await_change());
    }

    let failed = !pass.failures.is_empty();
    pass.record(&required, &terminating, &mut status);
    if status != original {
        write_status(ctx.store.as_ref(), &doc, &status).await?;
    }

    if failed {
        Ok(Action::requeue(ctx.config.requeue.on_error))
    } else {
        Ok(Action::requeue(ctx.config.requeue.reconciled))
    }
}

/// Membership changes made during one pass
struct MemberPass<'a> {
    ctx: &'a MemberRollContext,
    target: ObjectReference,
    namespaces: NamespaceReconciler,
    configured: BTreeSet<String>,
    failures: BTreeMap<String, Error>,
}

impl<'a> MemberPass<'a> {
    async fn new(
        ctx: &'a MemberRollContext,
        target: ObjectReference,
        mesh_namespace: &str,
        mesh_version: &str,
        configured: BTreeSet<String>,
    ) -> Result<MemberPass<'a>, Error> {
        let plugin = probe_network_plugin(ctx.store.as_ref()).await?;
        let networking = strategy_for(plugin, ctx.store.clone(), &ctx.config.multitenant_backoff);
        let namespaces = NamespaceReconciler::new(
            ctx.store.clone(),
            mesh_namespace,
            mesh_version,
            networking,
            &ctx.config.cni,
        );
        Ok(Self {
            ctx,
            target,
            namespaces,
            configured,
            failures: BTreeMap::new(),
        })
    }

    async fn add(&mut self, namespace: &str) {
        match self.namespaces.reconcile_namespace_in_mesh(namespace).await {
            Ok(()) => {
                if self.configured.insert(namespace.to_string()) {
                    self.publish(
                        EventType::Normal,
                        reasons::MEMBER_CONFIGURED,
                        format!("Added namespace {namespace} to the mesh"),
                    )
                    .await;
                }
            }
            Err(e) => {
                warn!(namespace, error = %e, "failed to configure member");
                self.configured.remove(namespace);
                self.fail(namespace, e).await;
            }
        }
    }

    async fn remove(&mut self, namespace: &str) {
        self.configured.remove(namespace);
        match self.namespaces.remove_namespace_from_mesh(namespace).await {
            Ok(()) => {
                self.publish(
                    EventType::Normal,
                    reasons::MEMBER_REMOVED,
                    format!("Removed namespace {namespace} from the mesh"),
                )
                .await;
            }
            Err(e) => {
                warn!(namespace, error = %e, "failed to remove member");
                self.fail(namespace, e).await;
            }
        }
    }

    /// Conflicts are retried silently; anything else is reported on the roll
    async fn fail(&mut self, namespace: &str, error: Error) {
        if !error.is_pure_conflict() {
            self.publish(
                EventType::Warning,
                reasons::MEMBER_RECONCILE_ERROR,
                format!("Failed to reconcile namespace {namespace}: {error}"),
            )
            .await;
        }
        self.failures
            .insert(namespace.to_string(), error.context(format!("namespace {namespace}")));
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        self.ctx
            .events
            .publish(&self.target, type_, reason, actions::RECONCILE, Some(note))
            .await;
    }

    /// Member lists and the Ready condition
    fn record(self, required: &BTreeSet<String>, terminating: &BTreeSet<String>, status: &mut MemberRollStatus) {
        let pending: Vec<String> = required
            .iter()
            .filter(|ns| !self.configured.contains(*ns))
            .cloned()
            .collect();
        status.terminating_members = required.intersection(terminating).cloned().collect();

        let condition = if !self.failures.is_empty() {
            let message = self
                .failures
                .values()
                .map(Error::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            Condition::new(
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::RECONCILE_MEMBERS_FAILED,
                message,
            )
        } else if !pending.is_empty() {
            Condition::new(
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::NAMESPACE_MISSING,
                format!("Namespaces not available yet: {}", pending.join(", ")),
            )
        } else {
            Condition::new(
                condition_types::READY,
                ConditionStatus::True,
                condition_reasons::CONFIGURED,
                "All namespaces have been configured",
            )
        };
        status.status.set_condition(condition);
        status.pending_members = pending;
        status.configured_members = self.configured.into_iter().collect();
    }
}

/// Report why the roll cannot proceed and check again later
async fn wait(
    ctx: &MemberRollContext,
    doc: &DynamicDocument,
    original: &MemberRollStatus,
    mut status: MemberRollStatus,
    reason: Wait,
) -> Result<Action, Error> {
    let condition = reason.condition();
    info!(reason = %condition.reason, "waiting for control plane");
    status.status.set_condition(condition);
    if status != *original {
        write_status(ctx.store.as_ref(), doc, &status).await?;
    }
    Ok(Action::requeue(ctx.config.requeue.reconciled))
}

/// Make the control plane the roll's controller so the roll goes with it
async fn ensure_owner(
    store: &dyn ObjectStore,
    doc: DynamicDocument,
    smcp: &ServiceMeshControlPlane,
) -> Result<DynamicDocument, Error> {
    let owner = smcp
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation_for_field("metadata.uid", "control plane has no uid"))?;
    let mut refs = doc.owner_references();
    if refs.iter().any(|r| r.uid == owner.uid) {
        return Ok(doc);
    }
    refs.retain(|r| !(r.kind == owner.kind && r.api_version == owner.api_version));
    refs.push(owner);

    let mut next = doc;
    next.set_owner_references(&refs)?;
    debug!("setting control plane owner reference");
    store.update(&next).await
}

/// Finalizing: remove every member, then release the finalizer
async fn finalize(roll: &ServiceMeshMemberRoll, doc: &DynamicDocument, ctx: &MemberRollContext) -> Result<Action, Error> {
    let mesh_namespace = roll.namespace().unwrap_or_default();
    info!("member roll deleted, removing members");

    let selector = LabelSelector::everything().equals(MEMBER_OF_LABEL, mesh_namespace.as_str());
    let labelled = ctx.store.list(&gvk("v1", "Namespace"), None, &selector).await?;
    let mut members = roll.configured_members();
    members.extend(
        labelled
            .iter()
            .map(|ns| ns.name().to_string())
            .filter(|ns| *ns != mesh_namespace),
    );

    // Leaving does not depend on the mesh version
    let version = ctx.config.default_mesh_version.clone();
    let mut pass = MemberPass::new(ctx, roll.object_ref(&()), &mesh_namespace, &version, BTreeSet::new()).await?;
    for namespace in &members {
        pass.remove(namespace).await;
    }
    Error::aggregate(pass.failures.into_values().collect()).map_err(|e| e.context("removing members"))?;

    release_finalizer(ctx.store.as_ref(), doc).await?;
    Ok(Action::await_change())
}

async fn write_status(store: &dyn ObjectStore, doc: &DynamicDocument, status: &MemberRollStatus) -> Result<(), Error> {
    let mut next = doc.clone();
    next.set(&["status"], serde_json::to_value(status)?)?;
    store
        .update_status(&next)
        .await
        .map(|_| ())
        .map_err(|e| e.context("updating member roll status"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use mesh_common::events::{MockEventPublisher, NoopEventPublisher};
    use mesh_common::labels::{FINALIZER, OWNER_LABEL};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use mesh_common::store::{Fault, MemoryStore, Operation, Verb};
    use mesh_common::ResourceKey;
    use serde_json::json;

    use crate::namespace::namespace_key;

    const MESH_NS: &str = "istio-system";

    fn roll_key() -> ResourceKey {
        ResourceKey::new(MESH_NS, "default", "maistra.io/v1", "ServiceMeshMemberRoll")
    }

    fn smcp_key(name: &str) -> ResourceKey {
        ResourceKey::new(MESH_NS, name, "maistra.io/v2", "ServiceMeshControlPlane")
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ctx: Arc<MemberRollContext>,
    }

    impl Harness {
        async fn new(members: &[&str]) -> Self {
            Self::with_events(members, Arc::new(NoopEventPublisher)).await
        }

        async fn with_events(members: &[&str], events: Arc<dyn EventPublisher>) -> Self {
            let store = Arc::new(MemoryStore::with_default_kinds());
            store
                .create(&DynamicDocument::new("v1", "Namespace", "", MESH_NS))
                .await
                .unwrap();

            let mut binding =
                DynamicDocument::new("rbac.authorization.k8s.io/v1", "RoleBinding", MESH_NS, "istiod-internal");
            binding.set_label(OWNER_LABEL, MESH_NS).unwrap();
            binding
                .set(&["roleRef"], json!({"kind": "ClusterRole", "name": "istiod-internal"}))
                .unwrap();
            store.create(&binding).await.unwrap();

            let mut roll = DynamicDocument::new("maistra.io/v1", "ServiceMeshMemberRoll", MESH_NS, "default");
            roll.set(&["spec", "members"], json!(members)).unwrap();
            store.create(&roll).await.unwrap();

            let ctx = Arc::new(MemberRollContext {
                store: store.clone(),
                events,
                config: Arc::new(OperatorConfig {
                    operator_version: "2.4.0".to_string(),
                    ..Default::default()
                }),
            });
            Self { store, ctx }
        }

        async fn namespace(&self, name: &str) {
            self.store
                .create(&DynamicDocument::new("v1", "Namespace", "", name))
                .await
                .unwrap();
        }

        /// A control plane that has completed `reconciled_generation`
        async fn control_plane(&self, name: &str, reconciled_generation: Option<i64>) {
            let mut smcp = DynamicDocument::new("maistra.io/v2", "ServiceMeshControlPlane", MESH_NS, name);
            smcp.set(&["spec"], json!({"version": "v2.4"})).unwrap();
            self.store.create(&smcp).await.unwrap();
            if let Some(generation) = reconciled_generation {
                self.mark_reconciled(name, generation);
            }
        }

        fn mark_reconciled(&self, name: &str, generation: i64) {
            self.store
                .set_status(
                    &smcp_key(name),
                    json!({"reconciledVersion": format!("2.4.0-{generation}"), "chartVersion": "v2.4"}),
                )
                .unwrap();
        }

        fn roll(&self) -> Arc<ServiceMeshMemberRoll> {
            Arc::new(self.store.object(&roll_key()).unwrap().to_typed().unwrap())
        }

        fn status(&self) -> MemberRollStatus {
            self.roll().status.clone().unwrap_or_default()
        }

        async fn reconcile(&self) -> Result<Action, Error> {
            reconcile(self.roll(), self.ctx.clone()).await
        }

        async fn set_members(&self, members: &[&str]) {
            let mut roll = self.store.object(&roll_key()).unwrap();
            roll.set(&["spec", "members"], json!(members)).unwrap();
            self.store.update(&roll).await.unwrap();
        }

        fn member_of(&self, namespace: &str) -> Option<String> {
            self.store
                .object(&namespace_key(namespace))
                .and_then(|ns| ns.label(MEMBER_OF_LABEL).map(str::to_string))
        }

        fn mirrored_binding(&self, namespace: &str, name: &str) -> Option<DynamicDocument> {
            self.store.object(&ResourceKey::new(
                namespace,
                name,
                "rbac.authorization.k8s.io/v1",
                "RoleBinding",
            ))
        }

        async fn recorded_events(members: &[&str]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let events = Arc::new(Mutex::new(Vec::<String>::new()));
            let mut publisher = MockEventPublisher::new();
            let seen = events.clone();
            publisher
                .expect_publish()
                .returning(move |_, _, reason, _, _| seen.lock().unwrap().push(reason.to_string()));
            (Self::with_events(members, Arc::new(publisher)).await, events)
        }

        fn ready(&self) -> Condition {
            self.status()
                .status
                .get_condition(condition_types::READY)
                .cloned()
                .unwrap()
        }
    }

    /// Story: a listed namespace is configured, unlisting it undoes
    /// everything
    #[tokio::test]
    async fn story_member_add_and_remove() {
        let h = Harness::new(&["ns1"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.reconciled));
        let status = h.status();
        assert_eq!(status.configured_members, vec!["ns1"]);
        assert!(status.pending_members.is_empty());
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.service_mesh_reconciled_version.as_deref(), Some("2.4.0-1"));
        assert_eq!(h.ready().status, ConditionStatus::True);
        assert_eq!(h.member_of("ns1").as_deref(), Some(MESH_NS));
        assert!(h.mirrored_binding("ns1", "istiod-internal").is_some());

        let roll = h.store.object(&roll_key()).unwrap();
        assert_eq!(roll.finalizers(), vec![FINALIZER.to_string()]);
        assert_eq!(roll.owner_references()[0].name, "basic");

        h.set_members(&[]).await;
        h.reconcile().await.unwrap();
        let status = h.status();
        assert!(status.configured_members.is_empty());
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(h.member_of("ns1"), None);
        assert!(h.mirrored_binding("ns1", "istiod-internal").is_none());
    }

    #[tokio::test]
    async fn converged_roll_is_left_alone() {
        let h = Harness::new(&["ns1"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;
        h.reconcile().await.unwrap();
        h.store.clear_operations();

        h.reconcile().await.unwrap();
        assert!(h.store.operations().is_empty(), "{:?}", h.store.operations());
    }

    #[tokio::test]
    async fn waits_for_exactly_one_reconciled_control_plane() {
        let h = Harness::new(&["ns1"]).await;
        h.namespace("ns1").await;

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.reconciled));
        assert_eq!(h.ready().reason, condition_reasons::SMCP_MISSING);

        h.control_plane("basic", None).await;
        h.reconcile().await.unwrap();
        assert_eq!(h.ready().reason, condition_reasons::SMCP_NOT_RECONCILED);

        h.control_plane("second", Some(1)).await;
        h.reconcile().await.unwrap();
        assert_eq!(h.ready().reason, condition_reasons::MULTIPLE_SMCPS);

        assert_eq!(h.member_of("ns1"), None);
        assert!(h.status().configured_members.is_empty());
    }

    /// Story: a listed namespace created later is picked up without
    /// touching the mesh bookkeeping
    #[tokio::test]
    async fn story_missing_namespace_appears() {
        let h = Harness::new(&["ns1", "later"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;

        h.reconcile().await.unwrap();
        let status = h.status();
        assert_eq!(status.configured_members, vec!["ns1"]);
        assert_eq!(status.pending_members, vec!["later"]);
        let ready = h.ready();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, condition_reasons::NAMESPACE_MISSING);

        h.namespace("later").await;
        h.store.clear_operations();
        h.reconcile().await.unwrap();
        let status = h.status();
        assert_eq!(status.configured_members, vec!["later", "ns1"]);
        assert!(status.pending_members.is_empty());
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(h.member_of("later").as_deref(), Some(MESH_NS));
        assert_eq!(h.ready().status, ConditionStatus::True);

        // Only the new namespace was touched
        assert!(h
            .store
            .operations()
            .iter()
            .all(|op| op.key().namespace != "ns1" && op.key().name != "ns1"));
    }

    #[tokio::test]
    async fn control_plane_update_reconfigures_members() {
        let h = Harness::new(&["ns1"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;
        h.reconcile().await.unwrap();

        let mut binding =
            DynamicDocument::new("rbac.authorization.k8s.io/v1", "RoleBinding", MESH_NS, "istiod-new");
        binding.set_label(OWNER_LABEL, MESH_NS).unwrap();
        h.store.create(&binding).await.unwrap();
        h.mark_reconciled("basic", 2);

        h.reconcile().await.unwrap();
        assert!(h.mirrored_binding("ns1", "istiod-new").is_some());
        assert_eq!(
            h.status().service_mesh_reconciled_version.as_deref(),
            Some("2.4.0-2")
        );
    }

    #[tokio::test]
    async fn deleted_namespace_is_dropped_without_churn() {
        let h = Harness::new(&["ns1", "ns2"]).await;
        h.namespace("ns1").await;
        h.namespace("ns2").await;
        h.control_plane("basic", Some(1)).await;
        h.reconcile().await.unwrap();
        assert_eq!(h.status().configured_members, vec!["ns1", "ns2"]);

        h.store.delete(&namespace_key("ns2")).await.unwrap();
        h.store.clear_operations();
        h.reconcile().await.unwrap();

        assert_eq!(h.store.operations(), vec![Operation::UpdateStatus(roll_key())]);
        let status = h.status();
        assert_eq!(status.configured_members, vec!["ns1"]);
        assert_eq!(status.pending_members, vec!["ns2"]);
    }

    #[tokio::test]
    async fn namespace_of_another_mesh_stays_pending() {
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut publisher = MockEventPublisher::new();
        let seen = events.clone();
        publisher
            .expect_publish()
            .returning(move |_, _, reason, _, _| seen.lock().unwrap().push(reason.to_string()));

        let h = Harness::with_events(&["shared"], Arc::new(publisher)).await;
        let mut shared = DynamicDocument::new("v1", "Namespace", "", "shared");
        shared.set_label(MEMBER_OF_LABEL, "other-mesh").unwrap();
        h.store.create(&shared).await.unwrap();
        h.control_plane("basic", Some(1)).await;

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_error));
        let status = h.status();
        assert!(status.configured_members.is_empty());
        assert_eq!(status.pending_members, vec!["shared"]);
        assert_eq!(status.observed_generation, None);
        let ready = h.ready();
        assert_eq!(ready.reason, condition_reasons::RECONCILE_MEMBERS_FAILED);
        assert!(ready.message.contains("other-mesh"), "{}", ready.message);
        assert_eq!(h.member_of("shared").as_deref(), Some("other-mesh"));
        assert!(h.mirrored_binding("shared", "istiod-internal").is_none());
        assert_eq!(
            events.lock().unwrap().clone(),
            vec![reasons::MEMBER_RECONCILE_ERROR.to_string()]
        );
    }

    /// Story: one member fails to join; the others are configured, the
    /// failure is reported and the next pass finishes the job
    #[tokio::test]
    async fn story_failed_add_stays_pending_until_retried() {
        let (h, events) = Harness::recorded_events(&["ns1", "ns2"]).await;
        h.namespace("ns1").await;
        h.namespace("ns2").await;
        h.control_plane("basic", Some(1)).await;
        h.store
            .inject_fault(Verb::Update, "Namespace", Some("ns1"), Fault::Internal);

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_error));
        let status = h.status();
        assert_eq!(status.configured_members, vec!["ns2"]);
        assert_eq!(status.pending_members, vec!["ns1"]);
        assert_eq!(status.observed_generation, None);
        assert_eq!(status.service_mesh_reconciled_version, None);
        let ready = h.ready();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, condition_reasons::RECONCILE_MEMBERS_FAILED);
        assert!(ready.message.contains("namespace ns1"), "{}", ready.message);
        assert_eq!(h.member_of("ns1"), None);
        assert_eq!(h.member_of("ns2").as_deref(), Some(MESH_NS));
        assert!(events
            .lock()
            .unwrap()
            .contains(&reasons::MEMBER_RECONCILE_ERROR.to_string()));

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.reconciled));
        let status = h.status();
        assert_eq!(status.configured_members, vec!["ns1", "ns2"]);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.service_mesh_reconciled_version.as_deref(), Some("2.4.0-1"));
        assert_eq!(h.ready().status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn failed_reconfiguration_keeps_previous_mesh_version() {
        let h = Harness::new(&["ns1"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;
        h.reconcile().await.unwrap();

        let mut binding =
            DynamicDocument::new("rbac.authorization.k8s.io/v1", "RoleBinding", MESH_NS, "istiod-new");
        binding.set_label(OWNER_LABEL, MESH_NS).unwrap();
        h.store.create(&binding).await.unwrap();
        h.mark_reconciled("basic", 2);
        h.store
            .inject_fault(Verb::Create, "RoleBinding", Some("istiod-new"), Fault::Internal);

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_error));
        let status = h.status();
        assert_eq!(status.service_mesh_reconciled_version.as_deref(), Some("2.4.0-1"));
        assert_eq!(status.pending_members, vec!["ns1"]);
        assert_eq!(h.ready().reason, condition_reasons::RECONCILE_MEMBERS_FAILED);

        // Rejoin the member, then catch up on the control-plane change
        h.reconcile().await.unwrap();
        h.reconcile().await.unwrap();
        assert!(h.mirrored_binding("ns1", "istiod-new").is_some());
        assert_eq!(
            h.status().service_mesh_reconciled_version.as_deref(),
            Some("2.4.0-2")
        );
    }

    /// Story: a member write that lost an optimistic-concurrency race is
    /// retried quietly without touching status or raising events
    #[tokio::test]
    async fn story_member_conflict_requeues_without_reporting() {
        let (h, events) = Harness::recorded_events(&["ns1"]).await;
        h.namespace("ns1").await;
        h.control_plane("basic", Some(1)).await;
        h.store
            .inject_fault(Verb::Update, "Namespace", Some("ns1"), Fault::Conflict);

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_conflict));
        assert!(!h.store.operations().contains(&Operation::UpdateStatus(roll_key())));
        assert!(h.status().status.get_condition(condition_types::READY).is_none());
        assert!(events.lock().unwrap().is_empty(), "{:?}", events.lock().unwrap());

        h.reconcile().await.unwrap();
        assert_eq!(h.status().configured_members, vec!["ns1"]);
        assert_eq!(h.ready().status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn stale_control_plane_owner_is_replaced() {
        let h = Harness::new(&[]).await;
        h.control_plane("basic", Some(1)).await;
        let stale = OwnerReference {
            api_version: "maistra.io/v2".to_string(),
            kind: "ServiceMeshControlPlane".to_string(),
            name: "deleted".to_string(),
            uid: "deleted-uid".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let unrelated = OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "keep-me".to_string(),
            uid: "keep-uid".to_string(),
            ..Default::default()
        };
        let mut roll = h.store.object(&roll_key()).unwrap();
        roll.set_owner_references(&[stale, unrelated]).unwrap();
        h.store.update(&roll).await.unwrap();

        h.reconcile().await.unwrap();

        let smcp_uid = h.store.object(&smcp_key("basic")).unwrap().uid().map(str::to_string);
        let refs = h.store.object(&roll_key()).unwrap().owner_references();
        assert_eq!(refs.len(), 2, "{refs:?}");
        assert!(refs.iter().any(|r| r.name == "keep-me"));
        let owner = refs
            .iter()
            .find(|r| r.kind == "ServiceMeshControlPlane")
            .unwrap();
        assert_eq!(owner.name, "basic");
        assert_eq!(Some(owner.uid.clone()), smcp_uid);
    }

    /// Story: deleting the roll removes every member before the finalizer
    /// is released
    #[tokio::test]
    async fn story_deletion_removes_members() {
        let h = Harness::new(&["ns1", "ns2"]).await;
        h.namespace("ns1").await;
        h.namespace("ns2").await;
        h.control_plane("basic", Some(1)).await;
        h.reconcile().await.unwrap();

        h.store.delete(&roll_key()).await.unwrap();
        let action = h.reconcile().await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(h.store.object(&roll_key()).is_none());
        for ns in ["ns1", "ns2"] {
            assert_eq!(h.member_of(ns), None);
            assert!(h.mirrored_binding(ns, "istiod-internal").is_none());
        }
    }
}
