//! Manifest processing
//!
//! Turns the rendered manifests of one component into create/patch calls.
//! Per object, in this order:
//!
//! 1. stamp the standard app labels and the owner label
//! 2. run the caller's pre-process hook (owner references, generation)
//! 3. record the last-applied annotation from exactly what will be written
//! 4. create the object (then run the post-create hook) or patch it
//!
//! Failures are collected per object so siblings keep converging; the
//! component outcome carries them as an aggregate.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::EventType;
use serde_json::Value;
use tracing::{debug, info, warn};

use mesh_common::crd::{condition_reasons, condition_types, ComponentStatus, Condition, ConditionStatus};
use mesh_common::events::{actions, reasons, EventPublisher};
use mesh_common::kube_utils::{gvk, kind_priority};
use mesh_common::labels::*;
use mesh_common::store::{delete_if_exists, ObjectStore};
use mesh_common::yaml::parse_yaml_multi;
use mesh_common::{DynamicDocument, Error, ResourceKey};

use crate::patch::create_patch;

/// One rendered file of a component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawManifest {
    /// File name as rendered (`templates/deployment.yaml`)
    pub name: String,
    /// Multi-document YAML
    pub content: String,
}

impl RawManifest {
    /// Manifest from name and content
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Only `.yaml` / `.yml` files carry objects; NOTES.txt and friends are skipped
    pub fn is_yaml(&self) -> bool {
        self.name.ends_with(".yaml") || self.name.ends_with(".yml")
    }
}

/// Caller hooks around each object write
#[async_trait]
pub trait ManifestHooks: Send + Sync {
    /// Mutate an object before its last-applied configuration is recorded
    fn pre_process(&self, doc: &mut DynamicDocument) -> Result<(), Error>;

    /// Runs once after an object was created for the first time
    async fn post_create(&self, _doc: &DynamicDocument) -> Result<(), Error> {
        Ok(())
    }
}

/// Hooks stamping control-plane ownership onto every object
pub struct OwnershipHooks {
    owner: OwnerReference,
    owner_namespace: String,
    mesh_generation: String,
}

impl OwnershipHooks {
    /// Hooks for objects owned by `owner` (living in `owner_namespace`)
    pub fn new(owner: OwnerReference, owner_namespace: &str, mesh_generation: &str) -> Self {
        Self {
            owner,
            owner_namespace: owner_namespace.to_string(),
            mesh_generation: mesh_generation.to_string(),
        }
    }
}

#[async_trait]
impl ManifestHooks for OwnershipHooks {
    fn pre_process(&self, doc: &mut DynamicDocument) -> Result<(), Error> {
        doc.set_annotation(MESH_GENERATION_ANNOTATION, &self.mesh_generation)?;

        // Owner references cannot cross namespaces; everything else is
        // tracked by the owner label alone.
        if doc.namespace() == Some(self.owner_namespace.as_str()) {
            let mut refs = doc.owner_references();
            if !refs.iter().any(|r| r.uid == self.owner.uid) {
                refs.push(self.owner.clone());
                doc.set_owner_references(&refs)?;
            }
        }
        Ok(())
    }

    async fn post_create(&self, doc: &DynamicDocument) -> Result<(), Error> {
        debug!(kind = %doc.kind(), name = %doc.name(), "created");
        Ok(())
    }
}

/// Label values shared by every object of one control plane
#[derive(Clone, Debug)]
pub struct ManifestLabels {
    /// Mesh (control-plane) namespace; the owner label value
    pub owner: String,
    /// Control-plane name
    pub instance: String,
    /// Mesh version being rendered
    pub version: String,
}

/// What happened to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Did not exist and was created
    Created,
    /// Existed and was patched
    Patched,
    /// Existed and already matched
    Unchanged,
    /// The patch was rejected; the object was deleted and created again
    Recreated,
}

/// Result for one object
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectOutcome {
    /// ResourceKey string of the object
    pub resource: String,
    /// What happened, or the error message
    pub applied: Result<Applied, String>,
}

/// Result of processing one component
#[derive(Debug)]
pub struct ComponentOutcome {
    /// Component name
    pub component: String,
    /// Per-object results in processing order
    pub objects: Vec<ObjectOutcome>,
    /// Every failure, including manifests that could not be decoded
    pub errors: Vec<Error>,
}

impl ComponentOutcome {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            objects: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether every manifest and object was applied
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Status entry for this component with one child per object
    pub fn status(&self) -> ComponentStatus {
        use condition_reasons::{RECONCILE_ERROR, RECONCILE_SUCCESSFUL};
        use condition_types::RECONCILED;

        let mut status = ComponentStatus::new(&self.component);
        for object in &self.objects {
            let condition = match &object.applied {
                Ok(_) => Condition::new(RECONCILED, ConditionStatus::True, RECONCILE_SUCCESSFUL, ""),
                Err(message) => {
                    Condition::new(RECONCILED, ConditionStatus::False, RECONCILE_ERROR, message.as_str())
                }
            };
            status
                .child_mut(&object.resource)
                .status
                .set_condition(condition);
        }

        let condition = if self.errors.is_empty() {
            Condition::new(RECONCILED, ConditionStatus::True, RECONCILE_SUCCESSFUL, "")
        } else {
            let message = self
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            Condition::new(RECONCILED, ConditionStatus::False, RECONCILE_ERROR, message)
        };
        status.status.set_condition(condition);
        status
    }

    /// Collapse the failures into one aggregate error
    pub fn into_result(self) -> Result<(), Error> {
        Error::aggregate(self.errors)
    }
}

/// Applies rendered manifests for one control plane
pub struct ManifestProcessor<'a> {
    store: &'a dyn ObjectStore,
    events: &'a dyn EventPublisher,
    hooks: &'a dyn ManifestHooks,
    labels: ManifestLabels,
    event_target: ObjectReference,
}

impl<'a> ManifestProcessor<'a> {
    /// Processor writing through `store`; recreate events land on `event_target`
    pub fn new(
        store: &'a dyn ObjectStore,
        events: &'a dyn EventPublisher,
        hooks: &'a dyn ManifestHooks,
        labels: ManifestLabels,
        event_target: ObjectReference,
    ) -> Self {
        Self {
            store,
            events,
            hooks,
            labels,
            event_target,
        }
    }

    /// Create or patch every object rendered for `component`.
    ///
    /// Never fails as a whole: per-manifest and per-object failures are
    /// collected in the returned outcome.
    pub async fn process_manifests(&self, manifests: &[RawManifest], component: &str) -> ComponentOutcome {
        let mut outcome = ComponentOutcome::new(component);

        let mut docs = Vec::new();
        for manifest in manifests {
            if !manifest.is_yaml() {
                debug!(component, manifest = %manifest.name, "skipping non-YAML manifest");
                continue;
            }
            match decode_manifest(manifest) {
                Ok(mut decoded) => docs.append(&mut decoded),
                Err(e) => {
                    warn!(component, manifest = %manifest.name, error = %e, "failed to decode manifest");
                    outcome
                        .errors
                        .push(e.context(format!("manifest {}", manifest.name)));
                }
            }
        }
        docs.sort_by_key(|doc| kind_priority(doc.kind()));

        for doc in docs {
            let label = format!("{}/{}", doc.kind(), doc.name());
            match self.apply_object(doc, component).await {
                Ok((key, applied)) => {
                    debug!(component, resource = %key, ?applied, "object processed");
                    outcome.objects.push(ObjectOutcome {
                        resource: key.to_string(),
                        applied: Ok(applied),
                    });
                }
                Err((resource, e)) => {
                    warn!(component, object = %label, error = %e, "failed to process object");
                    outcome.objects.push(ObjectOutcome {
                        resource: resource.unwrap_or(label.clone()),
                        applied: Err(e.to_string()),
                    });
                    outcome.errors.push(e.context(label));
                }
            }
        }
        outcome
    }

    async fn apply_object(
        &self,
        mut doc: DynamicDocument,
        component: &str,
    ) -> Result<(ResourceKey, Applied), (Option<String>, Error)> {
        if let Err(e) = self.default_namespace(&mut doc).await {
            return Err((None, e));
        }
        let prepared = self.prepare(&mut doc, component);
        let key = match prepared.and_then(|_| doc.key()) {
            Ok(key) => key,
            Err(e) => return Err((None, e)),
        };
        match self.write(&key, &doc).await {
            Ok(applied) => Ok((key, applied)),
            Err(e) => Err((Some(key.to_string()), e)),
        }
    }

    /// Namespaced objects rendered without a namespace land in the mesh namespace
    async fn default_namespace(&self, doc: &mut DynamicDocument) -> Result<(), Error> {
        if doc.namespace().is_some() {
            return Ok(());
        }
        let gvk = gvk(doc.api_version(), doc.kind());
        if self.store.is_namespaced(&gvk).await? {
            doc.set_namespace(&self.labels.owner)?;
        }
        Ok(())
    }

    fn prepare(&self, doc: &mut DynamicDocument, component: &str) -> Result<(), Error> {
        let labels = [
            (APP_NAME_LABEL, component),
            (APP_INSTANCE_LABEL, self.labels.instance.as_str()),
            (APP_VERSION_LABEL, self.labels.version.as_str()),
            (APP_COMPONENT_LABEL, component),
            (APP_PART_OF_LABEL, PART_OF_VALUE),
            (APP_MANAGED_BY_LABEL, MANAGED_BY_VALUE),
            (OWNER_LABEL, self.labels.owner.as_str()),
        ];
        for (key, value) in labels {
            doc.set_label(key, value)?;
        }
        self.hooks.pre_process(doc)?;
        record_last_applied(doc)
    }

    async fn write(&self, key: &ResourceKey, desired: &DynamicDocument) -> Result<Applied, Error> {
        let Some(current) = self.store.get(key).await? else {
            let created = self.store.create(desired).await?;
            self.hooks.post_create(&created).await?;
            return Ok(Applied::Created);
        };

        let Some(patch) = create_patch(&current, desired)? else {
            return Ok(Applied::Unchanged);
        };
        match patch.apply(self.store).await {
            Ok(_) => Ok(Applied::Patched),
            Err(e) if e.is_invalid() => self.recreate(key, desired, &e).await,
            Err(e) => Err(e),
        }
    }

    /// Delete-then-create after the server rejected a patch
    async fn recreate(
        &self,
        key: &ResourceKey,
        desired: &DynamicDocument,
        cause: &Error,
    ) -> Result<Applied, Error> {
        warn!(resource = %key, error = %cause, "patch rejected, deleting and recreating object");
        delete_if_exists(self.store, key).await?;

        let mut fresh = desired.clone();
        fresh.set_resource_version(None)?;
        self.store.create(&fresh).await?;

        info!(resource = %key, "object recreated");
        self.events
            .publish(
                &self.event_target,
                EventType::Warning,
                reasons::OBJECT_RECREATED,
                actions::RECREATE,
                Some(format!("{} {} recreated: {cause}", key.kind, key.name)),
            )
            .await;
        Ok(Applied::Recreated)
    }
}

/// Record what is about to be written as the last-applied configuration
fn record_last_applied(doc: &mut DynamicDocument) -> Result<(), Error> {
    let mut applied = doc.clone();
    applied.remove(&["status"]);
    applied.remove(&["metadata", "resourceVersion"]);
    applied.remove_annotation(LAST_APPLIED_ANNOTATION);
    let text = serde_json::to_string(applied.as_value())
        .map_err(|e| Error::serialization_for_kind(doc.kind(), e.to_string()))?;
    doc.set_annotation(LAST_APPLIED_ANNOTATION, &text)
}

/// Split a manifest into objects, expanding `List` kinds recursively
fn decode_manifest(manifest: &RawManifest) -> Result<Vec<DynamicDocument>, Error> {
    let mut docs = Vec::new();
    for value in parse_yaml_multi(&manifest.content)? {
        expand_lists(value, &mut docs)?;
    }
    Ok(docs)
}

fn expand_lists(value: Value, out: &mut Vec<DynamicDocument>) -> Result<(), Error> {
    let doc = DynamicDocument::from_value(value)?;
    if !doc.kind().ends_with("List") || doc.get(&["items"]).is_none() {
        out.push(doc);
        return Ok(());
    }

    let kind = doc.kind().to_string();
    let mut value = doc.into_value();
    match value.get_mut("items").map(Value::take) {
        Some(Value::Array(items)) => items
            .into_iter()
            .try_for_each(|item| expand_lists(item, out)),
        Some(Value::Null) | None => Ok(()),
        Some(_) => Err(Error::serialization_for_kind(kind, "items must be a list")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mesh_common::events::{MockEventPublisher, NoopEventPublisher};
    use mesh_common::store::{Fault, MemoryStore, Operation, Verb};
    use serde_json::json;

    const MESH_NS: &str = "istio-system";

    async fn store() -> MemoryStore {
        let store = MemoryStore::with_default_kinds();
        store
            .create(&DynamicDocument::new("v1", "Namespace", "", MESH_NS))
            .await
            .unwrap();
        store.clear_operations();
        store
    }

    fn labels() -> ManifestLabels {
        ManifestLabels {
            owner: MESH_NS.to_string(),
            instance: "basic".to_string(),
            version: "v2.4".to_string(),
        }
    }

    fn hooks(generation: &str) -> OwnershipHooks {
        let owner = OwnerReference {
            api_version: "maistra.io/v2".to_string(),
            kind: "ServiceMeshControlPlane".to_string(),
            name: "basic".to_string(),
            uid: "smcp-uid".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        OwnershipHooks::new(owner, MESH_NS, generation)
    }

    fn target() -> ObjectReference {
        ObjectReference {
            name: Some("basic".to_string()),
            namespace: Some(MESH_NS.to_string()),
            ..Default::default()
        }
    }

    fn config_map(name: &str, value: &str) -> String {
        format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {MESH_NS}\ndata:\n  key: \"{value}\"\n"
        )
    }

    const DISCOVERY: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: istiod
  namespace: istio-system
spec:
  template:
    spec:
      containers:
        - name: discovery
          image: pilot:2.4
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: istiod
  namespace: istio-system
---
apiVersion: admissionregistration.k8s.io/v1
kind: MutatingWebhookConfiguration
metadata:
  name: istio-sidecar-injector
"#;

    #[test]
    fn only_yaml_files_are_manifests() {
        assert!(RawManifest::new("templates/a.yaml", "").is_yaml());
        assert!(RawManifest::new("templates/a.yml", "").is_yaml());
        assert!(!RawManifest::new("templates/NOTES.txt", "").is_yaml());
    }

    #[test]
    fn nested_lists_are_expanded() {
        let manifest = RawManifest::new(
            "list.yaml",
            r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMapList
    items:
      - apiVersion: v1
        kind: ConfigMap
        metadata: {name: a}
      - apiVersion: v1
        kind: ConfigMap
        metadata: {name: b}
  - apiVersion: v1
    kind: Secret
    metadata: {name: c}
"#,
        );
        let names: Vec<String> = decode_manifest(&manifest)
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn malformed_list_fails_only_that_manifest() {
        let manifest = RawManifest::new("list.yaml", "apiVersion: v1\nkind: List\nitems: 3\n");
        assert!(decode_manifest(&manifest).is_err());
    }

    #[tokio::test]
    async fn objects_are_labelled_annotated_and_created_in_kind_order() {
        let store = store().await;
        let hooks = hooks("1.0.0-1");
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());

        let outcome = processor
            .process_manifests(
                &[
                    RawManifest::new("discovery.yaml", DISCOVERY),
                    RawManifest::new("NOTES.txt", "not: [yaml"),
                ],
                "istio-discovery",
            )
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.errors);

        let kinds: Vec<String> = store
            .operations()
            .iter()
            .map(|op| op.key().kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec!["ServiceAccount", "Deployment", "MutatingWebhookConfiguration"]
        );

        let deployment = store
            .object(&ResourceKey::new(MESH_NS, "istiod", "apps/v1", "Deployment"))
            .unwrap();
        assert_eq!(deployment.label(OWNER_LABEL), Some(MESH_NS));
        assert_eq!(deployment.label(APP_COMPONENT_LABEL), Some("istio-discovery"));
        assert_eq!(deployment.label(APP_MANAGED_BY_LABEL), Some(MANAGED_BY_VALUE));
        assert_eq!(deployment.annotation(MESH_GENERATION_ANNOTATION), Some("1.0.0-1"));
        assert_eq!(deployment.owner_references()[0].uid, "smcp-uid");

        let applied: Value =
            serde_json::from_str(deployment.annotation(LAST_APPLIED_ANNOTATION).unwrap()).unwrap();
        assert_eq!(applied["metadata"]["labels"][OWNER_LABEL], MESH_NS);
        assert!(applied["metadata"]["annotations"]
            .get(LAST_APPLIED_ANNOTATION)
            .is_none());

        // Cluster-scoped objects carry the owner label but no owner reference
        let webhook = store
            .object(&ResourceKey::new(
                "",
                "istio-sidecar-injector",
                "admissionregistration.k8s.io/v1",
                "MutatingWebhookConfiguration",
            ))
            .unwrap();
        assert_eq!(webhook.label(OWNER_LABEL), Some(MESH_NS));
        assert!(webhook.owner_references().is_empty());
    }

    /// Story: a converged cluster sees zero writes on the second pass
    #[tokio::test]
    async fn story_second_pass_is_idempotent() {
        let store = store().await;
        let hooks = hooks("1.0.0-1");
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());
        let manifests = [
            RawManifest::new("discovery.yaml", DISCOVERY),
            RawManifest::new("config.yaml", config_map("mesh", "a")),
        ];

        let first = processor.process_manifests(&manifests, "istio-discovery").await;
        assert!(first.is_success());
        store.clear_operations();

        let second = processor.process_manifests(&manifests, "istio-discovery").await;
        assert!(second.is_success());
        assert!(store.operations().is_empty(), "{:?}", store.operations());
        assert!(second
            .objects
            .iter()
            .all(|o| o.applied == Ok(Applied::Unchanged)));
    }

    #[tokio::test]
    async fn changed_manifests_are_patched() {
        let store = store().await;
        let hooks = hooks("1.0.0-1");
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());

        processor
            .process_manifests(&[RawManifest::new("c.yaml", config_map("mesh", "a"))], "istio")
            .await;
        let outcome = processor
            .process_manifests(&[RawManifest::new("c.yaml", config_map("mesh", "b"))], "istio")
            .await;

        assert_eq!(outcome.objects[0].applied, Ok(Applied::Patched));
        let key = ResourceKey::new(MESH_NS, "mesh", "v1", "ConfigMap");
        assert_eq!(store.object(&key).unwrap().get_str(&["data", "key"]), Some("b"));
    }

    /// Story: the server rejects the patch, the object is recreated and an
    /// event records the disruption
    #[tokio::test]
    async fn story_rejected_patch_recreates_object() {
        let store = store().await;
        let hooks = hooks("1.0.0-1");
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, type_, reason, action, _| {
                *type_ == EventType::Warning
                    && reason == reasons::OBJECT_RECREATED
                    && action == actions::RECREATE
            })
            .times(1)
            .return_const(());
        let processor = ManifestProcessor::new(&store, &events, &hooks, labels(), target());

        processor
            .process_manifests(&[RawManifest::new("c.yaml", config_map("mesh", "a"))], "istio")
            .await;
        let key = ResourceKey::new(MESH_NS, "mesh", "v1", "ConfigMap");
        let uid_before = store.object(&key).unwrap().uid().map(str::to_string);

        store.inject_fault(Verb::Update, "ConfigMap", Some("mesh"), Fault::Invalid);
        store.clear_operations();
        let outcome = processor
            .process_manifests(&[RawManifest::new("c.yaml", config_map("mesh", "b"))], "istio")
            .await;

        assert_eq!(outcome.objects[0].applied, Ok(Applied::Recreated));
        assert_eq!(
            store.operations(),
            vec![Operation::Delete(key.clone()), Operation::Create(key.clone())]
        );
        let recreated = store.object(&key).unwrap();
        assert_eq!(recreated.get_str(&["data", "key"]), Some("b"));
        assert_ne!(recreated.uid().map(str::to_string), uid_before);
    }

    #[tokio::test]
    async fn object_failures_are_collected_and_siblings_proceed() {
        let store = store().await;
        store.inject_fault(Verb::Create, "ConfigMap", Some("broken"), Fault::Internal);
        let hooks = hooks("1.0.0-1");
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());

        let outcome = processor
            .process_manifests(
                &[
                    RawManifest::new("a.yaml", config_map("broken", "x")),
                    RawManifest::new("b.yaml", config_map("fine", "y")),
                    RawManifest::new("c.yaml", "kind: [unclosed"),
                ],
                "istio",
            )
            .await;

        assert_eq!(outcome.errors.len(), 2);
        assert!(store
            .object(&ResourceKey::new(MESH_NS, "fine", "v1", "ConfigMap"))
            .is_some());

        let status = outcome.status();
        assert!(!status.status.is_true(condition_types::RECONCILED));
        let broken = status
            .children
            .iter()
            .find(|c| c.resource.contains("broken"))
            .unwrap();
        assert!(!broken.status.is_true(condition_types::RECONCILED));
        let fine = status
            .children
            .iter()
            .find(|c| c.resource.contains("fine"))
            .unwrap();
        assert!(fine.status.is_true(condition_types::RECONCILED));

        assert!(outcome.into_result().is_err());
    }

    struct CountingHooks {
        created: AtomicUsize,
    }

    #[async_trait]
    impl ManifestHooks for CountingHooks {
        fn pre_process(&self, doc: &mut DynamicDocument) -> Result<(), Error> {
            doc.set_annotation(MESH_GENERATION_ANNOTATION, "1.0.0-1")
        }

        async fn post_create(&self, _doc: &DynamicDocument) -> Result<(), Error> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn namespaced_objects_default_to_the_mesh_namespace() {
        let store = store().await;
        let hooks = hooks("1.0.0-1");
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());

        let outcome = processor
            .process_manifests(
                &[RawManifest::new(
                    "bare.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: bare\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: istiod-reader\n",
                )],
                "istio",
            )
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.errors);

        let config = store
            .object(&ResourceKey::new(MESH_NS, "bare", "v1", "ConfigMap"))
            .unwrap();
        assert_eq!(config.namespace(), Some(MESH_NS));
        assert_eq!(config.owner_references()[0].uid, "smcp-uid");

        let role = store
            .object(&ResourceKey::new(
                "",
                "istiod-reader",
                "rbac.authorization.k8s.io/v1",
                "ClusterRole",
            ))
            .unwrap();
        assert_eq!(role.namespace(), None);
    }

    #[tokio::test]
    async fn post_create_runs_only_on_first_creation() {
        let store = store().await;
        let hooks = CountingHooks {
            created: AtomicUsize::new(0),
        };
        let processor = ManifestProcessor::new(&store, &NoopEventPublisher, &hooks, labels(), target());
        let manifests = [RawManifest::new("c.yaml", config_map("mesh", "a"))];

        processor.process_manifests(&manifests, "istio").await;
        processor.process_manifests(&manifests, "istio").await;
        assert_eq!(hooks.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_applied_excludes_status_and_resource_version() {
        let mut doc = DynamicDocument::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "resourceVersion": "3", "annotations": {LAST_APPLIED_ANNOTATION: "{}"}},
            "status": {"x": 1}
        }))
        .unwrap();
        record_last_applied(&mut doc).unwrap();
        let applied: Value = serde_json::from_str(doc.annotation(LAST_APPLIED_ANNOTATION).unwrap()).unwrap();
        assert!(applied.get("status").is_none());
        assert!(applied["metadata"].get("resourceVersion").is_none());
        assert_eq!(applied["metadata"]["annotations"], json!({}));
    }
}
