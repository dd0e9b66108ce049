//! ServiceMeshControlPlane controller
//!
//! One pass per control-plane generation:
//!
//! 1. render the spec into per-component manifests
//! 2. apply components in catalog order, skipping any whose prerequisite
//!    failed in the same pass
//! 3. prune objects stamped with an older mesh generation (only when every
//!    component succeeded)
//! 4. write status: Installed / Reconciled, per-component results, readiness
//!
//! Once a generation is reconciled, later passes only refresh readiness and
//! write status when the `Ready` condition flips.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use mesh_common::config::OperatorConfig;
use mesh_common::conflict::handle_conflicts;
use mesh_common::crd::{
    condition_reasons, condition_types, mesh_generation, ComponentStatus, Condition, ConditionStatus,
    ControlPlaneStatus, ServiceMeshControlPlane,
};
use mesh_common::events::{actions, reasons, EventPublisher};
use mesh_common::lifecycle::{ensure_finalizer, release_finalizer, Lifecycle};
use mesh_common::store::ObjectStore;
use mesh_common::{DynamicDocument, Error};

use crate::manifest::{ManifestLabels, ManifestProcessor, OwnershipHooks, RawManifest};
use crate::prune::{PruneTarget, Pruner};
use crate::readiness::ReadinessAggregator;

/// Component name -> rendered manifests
pub type RenderedManifests = BTreeMap<String, Vec<RawManifest>>;

/// Turns a control-plane spec into manifests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    /// Render every component for the given mesh version
    async fn render(
        &self,
        smcp: &ServiceMeshControlPlane,
        version: &str,
    ) -> Result<RenderedManifests, Error>;
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared context for the control-plane controller
pub struct ControlPlaneContext {
    /// Cluster access
    pub store: Arc<dyn ObjectStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Manifest source
    pub renderer: Arc<dyn ManifestRenderer>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a ServiceMeshControlPlane; conflicts requeue quietly
#[instrument(skip(smcp, ctx), fields(namespace = %smcp.namespace().unwrap_or_default(), name = %smcp.name_any()))]
pub async fn reconcile(
    smcp: Arc<ServiceMeshControlPlane>,
    ctx: Arc<ControlPlaneContext>,
) -> Result<Action, Error> {
    handle_conflicts(reconcile_inner(&smcp, &ctx), ctx.config.requeue.on_conflict).await
}

/// Requeue failed passes after the configured delay
pub fn error_policy(
    smcp: Arc<ServiceMeshControlPlane>,
    error: &Error,
    ctx: Arc<ControlPlaneContext>,
) -> Action {
    warn!(
        namespace = %smcp.namespace().unwrap_or_default(),
        name = %smcp.name_any(),
        error = %error,
        "control plane reconcile failed"
    );
    Action::requeue(ctx.config.requeue.on_error)
}

async fn reconcile_inner(smcp: &ServiceMeshControlPlane, ctx: &ControlPlaneContext) -> Result<Action, Error> {
    let doc = DynamicDocument::from_typed(smcp)?;
    match Lifecycle::of(&doc) {
        Lifecycle::Gone => return Ok(Action::await_change()),
        Lifecycle::Finalizing => return finalize(smcp, &doc, ctx).await,
        Lifecycle::Active => {}
    }
    let doc = ensure_finalizer(ctx.store.as_ref(), &doc).await?;

    let namespace = smcp
        .namespace()
        .ok_or_else(|| Error::validation_for_field("metadata.namespace", "control plane has no namespace"))?;
    let target = smcp.object_ref(&());
    let mut status = smcp.status.clone().unwrap_or_default();
    let readiness = ReadinessAggregator::new(
        ctx.store.as_ref(),
        ctx.events.as_ref(),
        ctx.config.as_ref(),
        &namespace,
    );

    if smcp.is_reconciled(&ctx.config.operator_version) {
        debug!("generation already reconciled, refreshing readiness");
        if readiness.update_readiness(&target, &mut status).await {
            write_status(ctx.store.as_ref(), &doc, &status).await?;
        }
        return Ok(Action::requeue(ctx.config.requeue.reconciled));
    }

    let generation = smcp.metadata.generation.unwrap_or_default();
    let mesh_gen = mesh_generation(&ctx.config.operator_version, generation);
    let version = smcp
        .spec
        .version
        .clone()
        .unwrap_or_else(|| ctx.config.default_mesh_version.clone());
    info!(generation = %mesh_gen, version = %version, "reconciling control plane");

    let rendered = match ctx.renderer.render(smcp, &version).await {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!(error = %e, "failed to render manifests");
            let message = format!("failed to render manifests: {e}");
            status.status.mark_reconcile_result(Err(message.as_str()));
            publish(ctx, &target, EventType::Warning, reasons::RECONCILE_ERROR, message).await;
            write_status(ctx.store.as_ref(), &doc, &status).await?;
            return Err(e.context("rendering manifests"));
        }
    };

    let owner = smcp
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation_for_field("metadata.uid", "control plane has no uid"))?;
    let hooks = OwnershipHooks::new(owner, &namespace, &mesh_gen);
    let labels = ManifestLabels {
        owner: namespace.clone(),
        instance: smcp.name_any(),
        version: version.clone(),
    };
    let processor = ManifestProcessor::new(
        ctx.store.as_ref(),
        ctx.events.as_ref(),
        &hooks,
        labels,
        target.clone(),
    );

    let (components, mut errors) = apply_components(&processor, &ctx.config, &rendered).await;
    if errors.is_empty() {
        let pruner = Pruner::new(ctx.store.as_ref(), &namespace);
        if let Err(e) = pruner.prune(&PruneTarget::Generation(mesh_gen.clone())).await {
            errors.push(e.context("pruning"));
        }
    } else {
        info!(failures = errors.len(), "skipping prune after component failures");
    }
    let result = Error::aggregate(errors);
    if result.as_ref().is_err_and(Error::is_pure_conflict) {
        debug!("object writes conflicted, leaving status for the retry");
        return result.map(|_| Action::await_change());
    }

    status.components = components;
    status.chart_version = Some(version);
    status.observed_generation = Some(generation);
    let was_installed = status.status.is_true(condition_types::INSTALLED);
    let action = match &result {
        Ok(()) => {
            status.status.mark_reconcile_result(Ok(()));
            status.reconciled_version = Some(mesh_gen);
            if !was_installed {
                publish(
                    ctx,
                    &target,
                    EventType::Normal,
                    reasons::INSTALLED,
                    "Successfully installed all mesh components".to_string(),
                )
                .await;
            }
            info!("control plane reconciled");
            Action::requeue(ctx.config.requeue.reconciled)
        }
        Err(e) => {
            let message = e.to_string();
            warn!(error = %message, "control plane reconcile failed");
            status.status.mark_reconcile_result(Err(message.as_str()));
            publish(ctx, &target, EventType::Warning, reasons::RECONCILE_ERROR, message).await;
            Action::requeue(ctx.config.requeue.on_error)
        }
    };

    readiness.update_readiness(&target, &mut status).await;
    write_status(ctx.store.as_ref(), &doc, &status).await?;
    Ok(action)
}

/// Apply rendered components in catalog order.
///
/// Returns one status per component and every failure; a component whose
/// prerequisite failed is not attempted. A skip caused by a prerequisite
/// that only conflicted is itself reported as a conflict.
async fn apply_components(
    processor: &ManifestProcessor<'_>,
    config: &OperatorConfig,
    rendered: &RenderedManifests,
) -> (Vec<ComponentStatus>, Vec<Error>) {
    let mut statuses = Vec::new();
    let mut errors = Vec::new();
    // component -> failed only on write conflicts
    let mut failed: BTreeMap<String, bool> = BTreeMap::new();

    for component in config.components.order(rendered.keys().map(String::as_str)) {
        let blocked_by = config
            .components
            .dependencies(&component)
            .iter()
            .find_map(|dep| failed.get(dep.as_str()).map(|conflict| (dep.clone(), *conflict)));
        if let Some((dep, conflict)) = blocked_by {
            let message = format!("component {component} skipped: prerequisite {dep} failed");
            warn!(component = %component, prerequisite = %dep, "skipping component");
            let mut status = ComponentStatus::new(&component);
            status.status.set_condition(Condition::new(
                condition_types::RECONCILED,
                ConditionStatus::False,
                condition_reasons::RECONCILE_ERROR,
                message.as_str(),
            ));
            statuses.push(status);
            errors.push(if conflict {
                Error::conflict(message)
            } else {
                Error::internal_with_context(component.as_str(), message)
            });
            failed.insert(component, conflict);
            continue;
        }

        let manifests = rendered.get(&component).map(Vec::as_slice).unwrap_or_default();
        let outcome = processor.process_manifests(manifests, &component).await;
        statuses.push(outcome.status());
        if let Err(e) = outcome.into_result() {
            failed.insert(component.clone(), e.is_pure_conflict());
            errors.push(e.context(format!("component {component}")));
        }
    }
    (statuses, errors)
}

/// Finalizing: delete everything owned, then release the finalizer
async fn finalize(
    smcp: &ServiceMeshControlPlane,
    doc: &DynamicDocument,
    ctx: &ControlPlaneContext,
) -> Result<Action, Error> {
    let namespace = smcp.namespace().unwrap_or_default();
    info!("control plane deleted, removing owned objects");

    Pruner::new(ctx.store.as_ref(), &namespace)
        .prune(&PruneTarget::DeleteAll)
        .await
        .map_err(|e| e.context("removing owned objects"))?;
    release_finalizer(ctx.store.as_ref(), doc).await?;

    publish(
        ctx,
        &smcp.object_ref(&()),
        EventType::Normal,
        reasons::DELETED,
        "Removed all mesh components".to_string(),
    )
    .await;
    Ok(Action::await_change())
}

async fn write_status(
    store: &dyn ObjectStore,
    doc: &DynamicDocument,
    status: &ControlPlaneStatus,
) -> Result<(), Error> {
    let mut next = doc.clone();
    next.set(&["status"], serde_json::to_value(status)?)?;
    store
        .update_status(&next)
        .await
        .map(|_| ())
        .map_err(|e| e.context("updating control plane status"))
}

async fn publish(
    ctx: &ControlPlaneContext,
    target: &ObjectReference,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let action = if reason == reasons::DELETED {
        actions::DELETE
    } else {
        actions::RECONCILE
    };
    ctx.events.publish(target, type_, reason, action, Some(note)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use mesh_common::config::{ComponentCatalog, ComponentDef};
    use mesh_common::events::NoopEventPublisher;
    use mesh_common::labels::{FINALIZER, MESH_GENERATION_ANNOTATION};
    use mesh_common::store::{Fault, MemoryStore, Operation, Verb};
    use mesh_common::ResourceKey;
    use serde_json::json;

    const MESH_NS: &str = "istio-system";

    /// Renderer returning whatever the test put in it
    #[derive(Default)]
    struct Rendered(Mutex<RenderedManifests>);

    #[async_trait]
    impl ManifestRenderer for Rendered {
        async fn render(
            &self,
            _smcp: &ServiceMeshControlPlane,
            _version: &str,
        ) -> Result<RenderedManifests, Error> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    impl Rendered {
        fn set(&self, component: &str, manifests: Vec<RawManifest>) {
            self.0
                .lock()
                .unwrap()
                .insert(component.to_string(), manifests);
        }
    }

    fn config() -> OperatorConfig {
        OperatorConfig {
            operator_version: "2.4.0".to_string(),
            components: ComponentCatalog::new(vec![
                ComponentDef::new("base", &[]),
                ComponentDef::new("discovery", &["base"]),
            ])
            .unwrap(),
            ..Default::default()
        }
    }

    fn yaml(kind: &str, api_version: &str, name: &str) -> RawManifest {
        RawManifest::new(
            format!("{name}.yaml"),
            format!("apiVersion: {api_version}\nkind: {kind}\nmetadata:\n  name: {name}\n  namespace: {MESH_NS}\n"),
        )
    }

    struct Harness {
        store: Arc<MemoryStore>,
        renderer: Arc<Rendered>,
        ctx: Arc<ControlPlaneContext>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_events(Arc::new(NoopEventPublisher)).await
        }

        async fn with_events(events: Arc<dyn EventPublisher>) -> Self {
            let store = Arc::new(MemoryStore::with_default_kinds());
            store
                .create(&DynamicDocument::new("v1", "Namespace", "", MESH_NS))
                .await
                .unwrap();
            let mut smcp =
                DynamicDocument::new("maistra.io/v2", "ServiceMeshControlPlane", MESH_NS, "basic");
            smcp.set(&["spec"], json!({})).unwrap();
            store.create(&smcp).await.unwrap();

            let renderer = Arc::new(Rendered::default());
            let ctx = Arc::new(ControlPlaneContext {
                store: store.clone(),
                events,
                renderer: renderer.clone(),
                config: Arc::new(config()),
            });
            Self { store, renderer, ctx }
        }

        fn smcp_key() -> ResourceKey {
            ResourceKey::new(MESH_NS, "basic", "maistra.io/v2", "ServiceMeshControlPlane")
        }

        fn smcp(&self) -> Arc<ServiceMeshControlPlane> {
            Arc::new(self.store.object(&Self::smcp_key()).unwrap().to_typed().unwrap())
        }

        fn status(&self) -> ControlPlaneStatus {
            self.smcp().status.clone().unwrap_or_default()
        }

        async fn reconcile(&self) -> Result<Action, Error> {
            reconcile(self.smcp(), self.ctx.clone()).await
        }

        /// Bump the spec generation the way a user edit would
        async fn edit_spec(&self, version: &str) {
            let mut doc = self.store.object(&Self::smcp_key()).unwrap();
            doc.set(&["spec", "version"], version).unwrap();
            self.store.update(&doc).await.unwrap();
        }

        fn object(&self, kind: &str, api_version: &str, name: &str) -> Option<DynamicDocument> {
            self.store
                .object(&ResourceKey::new(MESH_NS, name, api_version, kind))
        }
    }

    /// Story: dependent components are installed after their prerequisites
    /// and the first successful pass reports Installed and Reconciled
    #[tokio::test]
    async fn story_fresh_install_respects_component_order() {
        let h = Harness::new().await;
        h.renderer.set(
            "discovery",
            vec![yaml("Deployment", "apps/v1", "istiod"), yaml("Service", "v1", "istiod")],
        );
        h.renderer.set(
            "base",
            vec![yaml("ServiceAccount", "v1", "istio-reader"), yaml("ConfigMap", "v1", "istio")],
        );

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.reconciled));

        let creates: Vec<ResourceKey> = h
            .store
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Create(key) => Some(key),
                _ => None,
            })
            .collect();
        let position = |name: &str, kind: &str| {
            creates
                .iter()
                .position(|k| k.name == name && k.kind == kind)
                .unwrap()
        };
        let last_base = position("istio-reader", "ServiceAccount").max(position("istio", "ConfigMap"));
        let first_discovery = position("istiod", "Service").min(position("istiod", "Deployment"));
        assert!(last_base < first_discovery, "{creates:?}");

        let status = h.status();
        assert!(status.status.is_true(condition_types::INSTALLED));
        assert!(status.status.is_true(condition_types::RECONCILED));
        assert_eq!(status.reconciled_version.as_deref(), Some("2.4.0-1"));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.components.len(), 2);
        assert_eq!(status.components[0].resource, "base");

        // The Deployment has no Available condition yet
        assert_eq!(
            status.status.condition_status(condition_types::READY),
            ConditionStatus::False
        );

        let smcp = h.store.object(&Harness::smcp_key()).unwrap();
        assert_eq!(smcp.finalizers(), vec![FINALIZER.to_string()]);
    }

    /// Story: objects no longer rendered in the next generation are pruned
    #[tokio::test]
    async fn story_stale_objects_are_pruned() {
        let h = Harness::new().await;
        h.renderer.set(
            "base",
            vec![yaml("Deployment", "apps/v1", "old"), yaml("Deployment", "apps/v1", "istiod")],
        );
        h.reconcile().await.unwrap();
        assert_eq!(
            h.object("Deployment", "apps/v1", "old")
                .unwrap()
                .annotation(MESH_GENERATION_ANNOTATION),
            Some("2.4.0-1")
        );

        h.edit_spec("v2.5").await;
        h.renderer.set("base", vec![yaml("Deployment", "apps/v1", "istiod")]);
        h.reconcile().await.unwrap();

        assert!(h.object("Deployment", "apps/v1", "old").is_none());
        let istiod = h.object("Deployment", "apps/v1", "istiod").unwrap();
        assert_eq!(istiod.annotation(MESH_GENERATION_ANNOTATION), Some("2.4.0-2"));
        assert_eq!(h.status().reconciled_version.as_deref(), Some("2.4.0-2"));
    }

    #[tokio::test]
    async fn reconciled_generation_only_refreshes_readiness() {
        let h = Harness::new().await;
        h.renderer.set("base", vec![yaml("Deployment", "apps/v1", "istiod")]);
        h.reconcile().await.unwrap();
        h.store.clear_operations();

        // Still not ready: nothing to write
        h.reconcile().await.unwrap();
        assert!(h.store.operations().is_empty(), "{:?}", h.store.operations());

        // Becomes ready: exactly one status write
        let key = ResourceKey::new(MESH_NS, "istiod", "apps/v1", "Deployment");
        h.store
            .set_status(&key, json!({"conditions": [{"type": "Available", "status": "True"}]}))
            .unwrap();
        h.reconcile().await.unwrap();
        assert_eq!(
            h.store.operations(),
            vec![Operation::UpdateStatus(Harness::smcp_key())]
        );
        let status = h.status();
        assert!(status.status.is_true(condition_types::READY));
        assert_eq!(status.readiness.components.ready, vec!["base"]);
    }

    #[tokio::test]
    async fn failed_prerequisite_skips_dependents_and_pruning() {
        let h = Harness::new().await;
        h.renderer.set("base", vec![yaml("ConfigMap", "v1", "istio")]);
        h.renderer.set("discovery", vec![yaml("Deployment", "apps/v1", "istiod")]);
        h.store
            .inject_fault(Verb::Create, "ConfigMap", Some("istio"), Fault::Internal);

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_error));
        assert!(h.object("Deployment", "apps/v1", "istiod").is_none());

        let status = h.status();
        assert_eq!(
            status.status.condition_status(condition_types::RECONCILED),
            ConditionStatus::False
        );
        assert_eq!(
            status.status.condition_status(condition_types::INSTALLED),
            ConditionStatus::False
        );
        assert!(status.reconciled_version.is_none());
        let discovery = status
            .components
            .iter()
            .find(|c| c.resource == "discovery")
            .unwrap();
        assert!(discovery
            .status
            .get_condition(condition_types::RECONCILED)
            .unwrap()
            .message
            .contains("prerequisite base failed"));
    }

    #[tokio::test]
    async fn partial_failure_does_not_prune_unstamped_objects() {
        let h = Harness::new().await;
        h.renderer.set(
            "base",
            vec![yaml("ConfigMap", "v1", "istio"), yaml("Deployment", "apps/v1", "istiod")],
        );
        h.reconcile().await.unwrap();

        h.edit_spec("v2.5").await;
        h.store
            .inject_fault(Verb::Update, "Deployment", Some("istiod"), Fault::Internal);
        h.reconcile().await.unwrap();

        // The Deployment kept the old generation but survives
        let istiod = h.object("Deployment", "apps/v1", "istiod").unwrap();
        assert_eq!(istiod.annotation(MESH_GENERATION_ANNOTATION), Some("2.4.0-1"));
        let status = h.status();
        assert!(status.status.is_true(condition_types::INSTALLED));
        assert!(!status.status.is_true(condition_types::RECONCILED));
    }

    #[tokio::test]
    async fn render_failure_is_reported_and_returned() {
        let h = Harness::new().await;
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .returning(|_, _| Err(Error::validation("unknown profile")));
        let ctx = Arc::new(ControlPlaneContext {
            store: h.store.clone(),
            events: Arc::new(NoopEventPublisher),
            renderer: Arc::new(renderer),
            config: h.ctx.config.clone(),
        });

        let err = reconcile(h.smcp(), ctx).await.unwrap_err();
        assert!(err.to_string().contains("unknown profile"));
        let reconciled = h
            .status()
            .status
            .get_condition(condition_types::RECONCILED)
            .cloned()
            .unwrap();
        assert_eq!(reconciled.status, ConditionStatus::False);
        assert!(reconciled.message.contains("unknown profile"));
    }

    #[tokio::test]
    async fn status_conflict_requeues_quietly() {
        let h = Harness::new().await;
        h.renderer.set("base", vec![yaml("ConfigMap", "v1", "istio")]);
        h.store.inject_fault(
            Verb::UpdateStatus,
            "ServiceMeshControlPlane",
            Some("basic"),
            Fault::Conflict,
        );

        let action = h.reconcile().await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// Story: a component write that only lost an optimistic-concurrency race
    /// is retried quietly without touching status or raising events
    #[tokio::test]
    async fn story_object_conflict_requeues_without_reporting() {
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut publisher = mesh_common::events::MockEventPublisher::new();
        let seen = events.clone();
        publisher
            .expect_publish()
            .returning(move |_, _, reason, _, _| seen.lock().unwrap().push(reason.to_string()));
        let h = Harness::with_events(Arc::new(publisher)).await;
        h.renderer.set("base", vec![yaml("Deployment", "apps/v1", "istiod")]);
        h.renderer.set("discovery", vec![yaml("Service", "v1", "istiod")]);
        h.reconcile().await.unwrap();
        let before = h.status();

        h.edit_spec("v2.5").await;
        h.store
            .inject_fault(Verb::Update, "Deployment", Some("istiod"), Fault::Conflict);
        h.store.clear_operations();
        events.lock().unwrap().clear();
        let action = h.reconcile().await.unwrap();

        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_conflict));
        assert!(events.lock().unwrap().is_empty(), "{:?}", events.lock().unwrap());
        assert!(!h
            .store
            .operations()
            .contains(&Operation::UpdateStatus(Harness::smcp_key())));
        let after = h.status();
        assert_eq!(after.reconciled_version, before.reconciled_version);
        assert_eq!(after.observed_generation, Some(1));
        assert!(after.status.is_true(condition_types::RECONCILED));
    }

    #[tokio::test]
    async fn conflict_mixed_with_failure_is_reported() {
        let h = Harness::new().await;
        h.renderer.set(
            "base",
            vec![yaml("ConfigMap", "v1", "istio"), yaml("Deployment", "apps/v1", "istiod")],
        );
        h.reconcile().await.unwrap();

        h.edit_spec("v2.5").await;
        h.store
            .inject_fault(Verb::Update, "Deployment", Some("istiod"), Fault::Conflict);
        h.store
            .inject_fault(Verb::Update, "ConfigMap", Some("istio"), Fault::Internal);
        let action = h.reconcile().await.unwrap();

        assert_eq!(action, Action::requeue(h.ctx.config.requeue.on_error));
        let reconciled = h
            .status()
            .status
            .get_condition(condition_types::RECONCILED)
            .cloned()
            .unwrap();
        assert_eq!(reconciled.status, ConditionStatus::False);
        assert!(reconciled.message.contains("conflict"), "{}", reconciled.message);
    }

    /// Story: deleting the control plane removes everything it owns and
    /// then lets the object go
    #[tokio::test]
    async fn story_deletion_removes_owned_objects() {
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut publisher = mesh_common::events::MockEventPublisher::new();
        let seen = events.clone();
        publisher
            .expect_publish()
            .returning(move |_, _, reason, _, _| seen.lock().unwrap().push(reason.to_string()));

        let h = Harness::with_events(Arc::new(publisher)).await;
        h.renderer.set(
            "base",
            vec![yaml("ConfigMap", "v1", "istio"), yaml("Deployment", "apps/v1", "istiod")],
        );
        h.reconcile().await.unwrap();

        // Unowned objects in the namespace stay
        h.store
            .create(&DynamicDocument::new("v1", "ConfigMap", MESH_NS, "user-data"))
            .await
            .unwrap();

        h.store.delete(&Harness::smcp_key()).await.unwrap();
        let action = h.reconcile().await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(h.store.object(&Harness::smcp_key()).is_none());
        assert!(h.object("ConfigMap", "v1", "istio").is_none());
        assert!(h.object("Deployment", "apps/v1", "istiod").is_none());
        assert!(h.object("ConfigMap", "v1", "user-data").is_some());

        let events = events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some(reasons::INSTALLED));
        assert_eq!(events.last().map(String::as_str), Some(reasons::DELETED));
    }
}
