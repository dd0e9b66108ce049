//! Three-way patch engine
//!
//! Moves a live object toward a newly rendered one using three inputs:
//!
//! - **original**: the `last-applied-configuration` annotation on the live
//!   object, i.e. what the operator wrote last time
//! - **current**: the live object
//! - **desired**: the freshly rendered object
//!
//! Fields present in `desired` and different in `current` are set. Fields
//! the operator wrote before (`original`) but no longer renders are removed.
//! Fields nobody rendered (server defaults, status, fields other controllers
//! add) are left alone.
//!
//! Built-in kinds get a strategic patch: lists with a merge key (containers
//! by name, volume mounts by path, ...) are merged item by item, so a sidecar
//! injected by another controller survives. Everything else falls back to an
//! RFC 7386 JSON merge patch where lists are replaced whole.
//!
//! The patch is applied locally to `current`; the result is written with a
//! conditional update carrying `current`'s resourceVersion.

use serde_json::{json, Map, Value};
use tracing::trace;

use mesh_common::labels::LAST_APPLIED_ANNOTATION;
use mesh_common::store::ObjectStore;
use mesh_common::{DynamicDocument, Error};

/// Prefix of the strategic-merge list ordering directive
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";
/// Strategic-merge per-item directive key
const PATCH_DIRECTIVE: &str = "$patch";

/// API groups/versions whose types are known to the operator and therefore
/// patched strategically
const STRATEGIC_API_VERSIONS: &[&str] = &[
    "v1",
    "apps/v1",
    "batch/v1",
    "autoscaling/v1",
    "autoscaling/v2",
    "policy/v1",
    "networking.k8s.io/v1",
    "rbac.authorization.k8s.io/v1",
    "admissionregistration.k8s.io/v1",
    "apiextensions.k8s.io/v1",
    "scheduling.k8s.io/v1",
    "storage.k8s.io/v1",
];

/// How a patch is merged into the live object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Kind-aware merge honouring list merge keys
    Strategic,
    /// RFC 7386 JSON merge patch
    Merge,
}

impl PatchStrategy {
    /// Strategy for an apiVersion
    pub fn for_api_version(api_version: &str) -> Self {
        if STRATEGIC_API_VERSIONS.contains(&api_version) {
            PatchStrategy::Strategic
        } else {
            PatchStrategy::Merge
        }
    }
}

/// A non-empty change to one live object
#[derive(Clone, Debug)]
pub struct ObjectPatch {
    strategy: PatchStrategy,
    patch: Value,
    target: DynamicDocument,
}

impl ObjectPatch {
    /// Merge strategy used
    pub fn strategy(&self) -> PatchStrategy {
        self.strategy
    }

    /// The patch document
    pub fn patch(&self) -> &Value {
        &self.patch
    }

    /// The live object with the patch applied, carrying the live
    /// resourceVersion
    pub fn target(&self) -> &DynamicDocument {
        &self.target
    }

    /// Write the patched object with a conditional update.
    ///
    /// A structural rejection surfaces as [`Error::Invalid`]; recovering from
    /// it (delete and recreate) is the caller's decision.
    pub async fn apply(&self, store: &dyn ObjectStore) -> Result<DynamicDocument, Error> {
        store.update(&self.target).await
    }
}

/// Compute the patch moving `current` toward `desired`.
///
/// Returns `Ok(None)` when there is nothing to do. Fails with
/// [`Error::PreconditionFailed`] if `desired` names a different object.
pub fn create_patch(
    current: &DynamicDocument,
    desired: &DynamicDocument,
) -> Result<Option<ObjectPatch>, Error> {
    check_preconditions(current, desired)?;

    let mut desired = desired.clone();
    desired.set_resource_version(current.resource_version())?;

    let original = current
        .annotation(LAST_APPLIED_ANNOTATION)
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .filter(Value::is_object);

    let strategy = PatchStrategy::for_api_version(desired.api_version());
    let ctx = Context {
        kind: desired.kind().to_string(),
        strategy,
    };

    let (Some(current_map), Some(desired_map)) =
        (current.as_value().as_object(), desired.as_value().as_object())
    else {
        return Err(Error::internal_with_context("patch", "documents must be objects"));
    };

    let mut path = Vec::new();
    let patch = ctx.diff_object(
        &mut path,
        original.as_ref().and_then(Value::as_object),
        Some(current_map),
        desired_map,
    );
    if patch.is_empty() {
        return Ok(None);
    }
    let patch = Value::Object(patch);

    let mut target = current.as_value().clone();
    match strategy {
        PatchStrategy::Merge => json_patch::merge(&mut target, &patch),
        PatchStrategy::Strategic => {
            if let (Some(target_map), Some(patch_map)) = (target.as_object_mut(), patch.as_object())
            {
                ctx.apply_object(&mut Vec::new(), target_map, patch_map);
            }
        }
    }
    let target = DynamicDocument::from_value(target)?;
    if &target == current {
        return Ok(None);
    }

    trace!(kind = %ctx.kind, name = %current.name(), patch = %patch, "computed patch");
    Ok(Some(ObjectPatch {
        strategy,
        patch,
        target,
    }))
}

fn check_preconditions(current: &DynamicDocument, desired: &DynamicDocument) -> Result<(), Error> {
    let checks = [
        ("apiVersion", current.api_version(), desired.api_version()),
        ("kind", current.kind(), desired.kind()),
        ("metadata.name", current.name(), desired.name()),
        (
            "metadata.namespace",
            current.namespace().unwrap_or_default(),
            desired.namespace().unwrap_or_default(),
        ),
    ];
    for (field, have, want) in checks {
        if have != want {
            return Err(Error::PreconditionFailed {
                field: field.to_string(),
                message: format!("patch would change {field} from {have:?} to {want:?}"),
            });
        }
    }
    Ok(())
}

struct Context {
    kind: String,
    strategy: PatchStrategy,
}

impl Context {
    /// Merge key of the list at `path`/`field`, if it is merged per item
    fn merge_key(&self, path: &[String], field: &str) -> Option<&'static str> {
        if self.strategy != PatchStrategy::Strategic {
            return None;
        }
        match field {
            "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes"
            | "imagePullSecrets" => Some("name"),
            "volumeMounts" => Some("mountPath"),
            "volumeDevices" => Some("devicePath"),
            "hostAliases" => Some("ip"),
            "ownerReferences" => Some("uid"),
            "ports" if self.kind == "Service" && path == ["spec"] => Some("port"),
            "ports"
                if matches!(
                    path.last().map(String::as_str),
                    Some("containers" | "initContainers" | "ephemeralContainers")
                ) =>
            {
                Some("containerPort")
            }
            _ => None,
        }
    }

    // =========================================================================
    // Diff
    // =========================================================================

    fn diff_object(
        &self,
        path: &mut Vec<String>,
        original: Option<&Map<String, Value>>,
        current: Option<&Map<String, Value>>,
        desired: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut patch = Map::new();

        // Fields we wrote before and no longer render
        if let Some(original) = original {
            for key in original.keys() {
                let still_desired = desired.get(key).is_some_and(|v| !v.is_null());
                let live = current.is_some_and(|c| c.contains_key(key));
                if !still_desired && live {
                    patch.insert(key.clone(), Value::Null);
                }
            }
        }

        for (key, want) in desired {
            if want.is_null() {
                continue;
            }
            let have = current.and_then(|c| c.get(key));
            let before = original.and_then(|o| o.get(key));
            match (have, want) {
                (Some(have), want) if have == want => {}
                (Some(Value::Object(have)), Value::Object(want)) => {
                    path.push(key.clone());
                    let sub = self.diff_object(path, before.and_then(Value::as_object), Some(have), want);
                    path.pop();
                    if !sub.is_empty() {
                        patch.insert(key.clone(), Value::Object(sub));
                    }
                }
                (Some(Value::Array(have)), Value::Array(want)) => {
                    match self.merge_key(path, key) {
                        Some(merge_key) => {
                            path.push(key.clone());
                            let list = diff_list(
                                self,
                                path,
                                merge_key,
                                before.and_then(Value::as_array),
                                have,
                                want,
                            );
                            path.pop();
                            match list {
                                Some(ListPatch { items, order }) => {
                                    if !items.is_empty() || order_changed(merge_key, have, want) {
                                        patch.insert(key.clone(), Value::Array(items));
                                        patch.insert(
                                            format!("{SET_ELEMENT_ORDER}{key}"),
                                            Value::Array(order),
                                        );
                                    }
                                }
                                None => {
                                    patch.insert(key.clone(), Value::Array(want.clone()));
                                }
                            }
                        }
                        None => {
                            patch.insert(key.clone(), Value::Array(want.clone()));
                        }
                    }
                }
                _ => {
                    patch.insert(key.clone(), strip_nulls(want));
                }
            }
        }
        patch
    }

    // =========================================================================
    // Apply
    // =========================================================================

    fn apply_object(&self, path: &mut Vec<String>, target: &mut Map<String, Value>, patch: &Map<String, Value>) {
        for (key, value) in patch {
            if key.starts_with(SET_ELEMENT_ORDER) || key == PATCH_DIRECTIVE {
                continue;
            }
            match value {
                Value::Null => {
                    target.remove(key);
                }
                Value::Object(sub) => {
                    path.push(key.clone());
                    match target.get_mut(key) {
                        Some(Value::Object(existing)) => self.apply_object(path, existing, sub),
                        _ => {
                            let mut fresh = Map::new();
                            self.apply_object(path, &mut fresh, sub);
                            target.insert(key.clone(), Value::Object(fresh));
                        }
                    }
                    path.pop();
                }
                Value::Array(items) => {
                    let merge_key = self.merge_key(path, key);
                    let order = patch
                        .get(&format!("{SET_ELEMENT_ORDER}{key}"))
                        .and_then(Value::as_array);
                    match (merge_key, target.get_mut(key)) {
                        (Some(merge_key), Some(Value::Array(existing))) => {
                            path.push(key.clone());
                            self.apply_list(path, merge_key, existing, items, order);
                            path.pop();
                        }
                        _ => {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                }
                other => {
                    target.insert(key.clone(), other.clone());
                }
            }
        }
    }

    fn apply_list(
        &self,
        path: &mut Vec<String>,
        merge_key: &str,
        target: &mut Vec<Value>,
        items: &[Value],
        order: Option<&Vec<Value>>,
    ) {
        for item in items {
            let Some(item_map) = item.as_object() else {
                continue;
            };
            let Some(id) = item_map.get(merge_key) else {
                continue;
            };
            let position = target.iter().position(|t| t.get(merge_key) == Some(id));
            let delete = item_map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete");
            match (position, delete) {
                (Some(pos), true) => {
                    target.remove(pos);
                }
                (None, true) => {}
                (Some(pos), false) => {
                    if let Some(existing) = target[pos].as_object_mut() {
                        self.apply_object(path, existing, item_map);
                    }
                }
                (None, false) => {
                    let mut fresh = Map::new();
                    self.apply_object(path, &mut fresh, item_map);
                    target.push(Value::Object(fresh));
                }
            }
        }

        if let Some(order) = order {
            let ids: Vec<&Value> = order.iter().filter_map(|o| o.get(merge_key)).collect();
            let mut ordered = Vec::with_capacity(target.len());
            for id in &ids {
                if let Some(pos) = target.iter().position(|t| t.get(merge_key) == Some(*id)) {
                    ordered.push(target.remove(pos));
                }
            }
            ordered.append(target);
            *target = ordered;
        }
    }
}

struct ListPatch {
    items: Vec<Value>,
    order: Vec<Value>,
}

/// Per-item diff of a keyed list; `None` when some item lacks the merge key,
/// in which case the list is replaced whole.
fn diff_list(
    ctx: &Context,
    path: &mut Vec<String>,
    merge_key: &str,
    original: Option<&Vec<Value>>,
    current: &[Value],
    desired: &[Value],
) -> Option<ListPatch> {
    let keyed = |items: &[Value]| items.iter().all(|i| i.get(merge_key).is_some());
    if !keyed(current) || !keyed(desired) {
        return None;
    }
    let find = |items: &[Value], id: &Value| -> Option<Value> {
        items.iter().find(|i| i.get(merge_key) == Some(id)).cloned()
    };

    let mut items = Vec::new();
    let mut order = Vec::with_capacity(desired.len());
    for want in desired {
        let id = want.get(merge_key)?;
        order.push(json!({ merge_key: id }));

        match find(current, id) {
            None => items.push(strip_nulls(want)),
            Some(have) if &have == want => {}
            Some(have) => {
                let before = original.and_then(|o| find(o, id));
                let sub = ctx.diff_object(
                    path,
                    before.as_ref().and_then(Value::as_object),
                    have.as_object(),
                    want.as_object()?,
                );
                if !sub.is_empty() {
                    let mut sub = sub;
                    sub.insert(merge_key.to_string(), id.clone());
                    items.push(Value::Object(sub));
                }
            }
        }
    }

    if let Some(original) = original {
        for before in original {
            let Some(id) = before.get(merge_key) else {
                continue;
            };
            let still_desired = desired.iter().any(|d| d.get(merge_key) == Some(id));
            let live = current.iter().any(|c| c.get(merge_key) == Some(id));
            if !still_desired && live {
                items.push(json!({ merge_key: id, PATCH_DIRECTIVE: "delete" }));
            }
        }
    }

    Some(ListPatch { items, order })
}

/// Whether desired items appear in `current` in a different relative order
fn order_changed(merge_key: &str, current: &[Value], desired: &[Value]) -> bool {
    let desired_ids: Vec<&Value> = desired.iter().filter_map(|d| d.get(merge_key)).collect();
    let current_ids: Vec<&Value> = current
        .iter()
        .filter_map(|c| c.get(merge_key))
        .filter(|id| desired_ids.contains(id))
        .collect();
    let desired_present: Vec<&Value> = desired_ids
        .iter()
        .copied()
        .filter(|id| current_ids.contains(id))
        .collect();
    current_ids != desired_present
}

/// Drop null-valued object fields (rendered `creationTimestamp: null` and
/// friends mean "unset")
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> DynamicDocument {
        DynamicDocument::from_value(value).unwrap()
    }

    /// Live object as the server would hold it after `applied` was written
    fn live(applied: &Value, mutate: impl FnOnce(&mut Value)) -> DynamicDocument {
        let mut value = applied.clone();
        let annotation = serde_json::to_string(applied).unwrap();
        value["metadata"]["annotations"] = json!({ LAST_APPLIED_ANNOTATION: annotation });
        value["metadata"]["resourceVersion"] = json!("7");
        value["metadata"]["uid"] = json!("abc");
        mutate(&mut value);
        doc(value)
    }

    /// Desired object carrying its own last-applied annotation
    fn rendered(value: Value) -> DynamicDocument {
        let annotation = serde_json::to_string(&value).unwrap();
        let mut value = value;
        value["metadata"]["annotations"] = json!({ LAST_APPLIED_ANNOTATION: annotation });
        doc(value)
    }

    fn config_map(data: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "mesh", "namespace": "istio-system" },
            "data": data
        })
    }

    fn deployment(containers: Value) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "istiod", "namespace": "istio-system" },
            "spec": { "template": { "spec": { "containers": containers } } }
        })
    }

    #[test]
    fn unchanged_object_needs_no_patch() {
        let applied = config_map(json!({"a": "1"}));
        let current = live(&applied, |v| v["status"] = json!({"observed": true}));
        assert!(create_patch(&current, &rendered(applied)).unwrap().is_none());
    }

    /// Story: a field we stopped rendering is removed even though it is live
    #[test]
    fn story_three_way_removes_dropped_fields() {
        let applied = config_map(json!({"a": "1", "b": "2"}));
        let current = live(&applied, |_| {});
        let desired = rendered(config_map(json!({"a": "1"})));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        assert_eq!(patch.patch()["data"]["b"], Value::Null);
        assert_eq!(patch.target().get_str(&["data", "a"]), Some("1"));
        assert!(patch.target().get(&["data", "b"]).is_none());
    }

    #[test]
    fn fields_added_by_others_are_kept() {
        let applied = config_map(json!({"a": "1"}));
        let current = live(&applied, |v| v["data"]["injected"] = json!("yes"));
        let desired = rendered(config_map(json!({"a": "2"})));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        assert_eq!(patch.target().get_str(&["data", "a"]), Some("2"));
        assert_eq!(patch.target().get_str(&["data", "injected"]), Some("yes"));
    }

    #[test]
    fn target_keeps_live_resource_version_and_server_fields() {
        let applied = config_map(json!({"a": "1"}));
        let current = live(&applied, |_| {});
        let desired = rendered(config_map(json!({"a": "2"})));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        assert_eq!(patch.target().resource_version(), Some("7"));
        assert_eq!(patch.target().uid(), Some("abc"));
        assert!(patch.patch()["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn rendered_nulls_mean_unset() {
        let mut applied = config_map(json!({"a": "1"}));
        applied["metadata"]["creationTimestamp"] = Value::Null;
        let current = live(&applied, |v| {
            v["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        });
        assert!(create_patch(&current, &rendered(applied)).unwrap().is_none());
    }

    /// Story: containers merge by name; an injected sidecar survives and a
    /// container we stopped rendering is deleted
    #[test]
    fn story_strategic_merge_by_container_name() {
        let applied = deployment(json!([
            {"name": "discovery", "image": "pilot:1"},
            {"name": "debug", "image": "busybox"}
        ]));
        let current = live(&applied, |v| {
            v["spec"]["template"]["spec"]["containers"]
                .as_array_mut()
                .unwrap()
                .push(json!({"name": "sidecar", "image": "proxy"}));
        });
        let desired = rendered(deployment(json!([
            {"name": "discovery", "image": "pilot:2"}
        ])));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        assert_eq!(patch.strategy(), PatchStrategy::Strategic);

        let list = &patch.patch()["spec"]["template"]["spec"]["containers"];
        assert!(list
            .as_array()
            .unwrap()
            .contains(&json!({"name": "debug", "$patch": "delete"})));
        assert_eq!(
            patch.patch()["spec"]["template"]["spec"]["$setElementOrder/containers"],
            json!([{"name": "discovery"}])
        );

        let containers = patch
            .target()
            .get_array(&["spec", "template", "spec", "containers"])
            .unwrap()
            .clone();
        assert_eq!(
            containers,
            vec![
                json!({"name": "discovery", "image": "pilot:2"}),
                json!({"name": "sidecar", "image": "proxy"}),
            ]
        );
    }

    #[test]
    fn service_ports_merge_by_port() {
        let service = |ports: Value| {
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": "istiod", "namespace": "istio-system" },
                "spec": { "ports": ports }
            })
        };
        let applied = service(json!([{"port": 15010, "name": "grpc"}]));
        let current = live(&applied, |v| {
            v["spec"]["ports"][0]["targetPort"] = json!(15010);
        });
        let desired = rendered(service(json!([
            {"port": 15010, "name": "grpc-xds"},
            {"port": 443, "name": "https"}
        ])));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        let ports = patch.target().get_array(&["spec", "ports"]).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0], json!({"port": 15010, "name": "grpc-xds", "targetPort": 15010}));
        assert_eq!(ports[1]["port"], 443);
    }

    #[test]
    fn custom_resources_use_merge_patch_and_replace_lists() {
        let gateway = |hosts: Value| {
            json!({
                "apiVersion": "networking.istio.io/v1beta1",
                "kind": "Gateway",
                "metadata": { "name": "ingress", "namespace": "istio-system" },
                "spec": { "servers": [{ "hosts": hosts }] }
            })
        };
        let applied = gateway(json!(["a.example.com"]));
        let current = live(&applied, |_| {});
        let desired = rendered(gateway(json!(["b.example.com"])));

        let patch = create_patch(&current, &desired).unwrap().unwrap();
        assert_eq!(patch.strategy(), PatchStrategy::Merge);
        assert_eq!(
            patch.target().get(&["spec", "servers"]).unwrap(),
            &json!([{ "hosts": ["b.example.com"] }])
        );
    }

    #[test]
    fn identity_changes_fail_preconditions() {
        let applied = config_map(json!({"a": "1"}));
        let current = live(&applied, |_| {});
        let mut renamed = config_map(json!({"a": "1"}));
        renamed["metadata"]["name"] = json!("other");

        let err = create_patch(&current, &rendered(renamed)).unwrap_err();
        match err {
            Error::PreconditionFailed { field, .. } => assert_eq!(field, "metadata.name"),
            other => panic!("expected precondition failure, got {other:?}"),
        }

        let mut moved = config_map(json!({"a": "1"}));
        moved["metadata"]["namespace"] = json!("elsewhere");
        assert!(create_patch(&current, &rendered(moved)).is_err());
    }

    #[test]
    fn missing_last_applied_behaves_like_two_way() {
        let current = doc(config_map(json!({"a": "1", "b": "2"})));
        let desired = doc(config_map(json!({"a": "1"})));
        assert!(create_patch(&current, &desired).unwrap().is_none());
    }
}
