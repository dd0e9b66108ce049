//! In-memory [`ObjectStore`] for tests
//!
//! Behaves like a single strongly consistent API server: resource versions
//! advance on every write, `metadata.generation` bumps only when content
//! outside metadata/status changes, updates never touch status, deletion
//! honours finalizers and deleting a Namespace removes its contents.
//!
//! Test controls:
//! - [`MemoryStore::inject_fault`] fails the next matching call once
//! - [`MemoryStore::on_write`] runs a hook after each write of a kind, the
//!   way an external controller would react to it
//! - [`MemoryStore::operations`] records every mutation for idempotence checks

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::api::GroupVersionKind;
use parking_lot::Mutex;
use serde_json::Value;

use super::{LabelSelector, ObjectStore};
use crate::document::DynamicDocument;
use crate::kube_utils;
use crate::resource_key::ResourceKey;
use crate::Error;

/// Store operation kinds, used to target injected faults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// `get`
    Get,
    /// `list`
    List,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `update_status`
    UpdateStatus,
    /// `delete`
    Delete,
}

/// A recorded mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Object created
    Create(ResourceKey),
    /// Object spec/metadata replaced
    Update(ResourceKey),
    /// Object status replaced
    UpdateStatus(ResourceKey),
    /// Object deleted (or marked for deletion)
    Delete(ResourceKey),
}

impl Operation {
    /// Key of the mutated object
    pub fn key(&self) -> &ResourceKey {
        match self {
            Operation::Create(k)
            | Operation::Update(k)
            | Operation::UpdateStatus(k)
            | Operation::Delete(k) => k,
        }
    }
}

/// Failure to inject
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Optimistic-concurrency conflict
    Conflict,
    /// Structural rejection, like an immutable field change
    Invalid,
    /// Unclassified server failure
    Internal,
}

impl Fault {
    fn to_error(self, key: &str) -> Error {
        match self {
            Fault::Conflict => Error::conflict(format!("injected conflict on {key}")),
            Fault::Invalid => Error::invalid(format!("{key}: field is immutable")),
            Fault::Internal => {
                Error::internal_with_context("memory-store", format!("injected failure on {key}"))
            }
        }
    }
}

struct PendingFault {
    verb: Verb,
    kind: String,
    name: Option<String>,
    fault: Fault,
}

type WriteHook = Arc<dyn Fn(&mut DynamicDocument) + Send + Sync>;

#[derive(Default)]
struct State {
    /// (apiVersion, kind) -> namespaced
    kinds: HashMap<(String, String), bool>,
    objects: BTreeMap<ResourceKey, DynamicDocument>,
    revision: u64,
    faults: Vec<PendingFault>,
    hooks: Vec<(String, WriteHook)>,
    operations: Vec<Operation>,
}

/// Strongly consistent in-memory object store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

const DEFAULT_KINDS: &[(&str, &str, bool)] = &[
    ("v1", "Namespace", false),
    ("v1", "ConfigMap", true),
    ("v1", "Secret", true),
    ("v1", "Service", true),
    ("v1", "ServiceAccount", true),
    ("apps/v1", "Deployment", true),
    ("apps/v1", "StatefulSet", true),
    ("apps/v1", "DaemonSet", true),
    ("policy/v1", "PodDisruptionBudget", true),
    ("autoscaling/v2", "HorizontalPodAutoscaler", true),
    ("networking.k8s.io/v1", "NetworkPolicy", true),
    ("rbac.authorization.k8s.io/v1", "Role", true),
    ("rbac.authorization.k8s.io/v1", "RoleBinding", true),
    ("rbac.authorization.k8s.io/v1", "ClusterRole", false),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", false),
    ("admissionregistration.k8s.io/v1", "MutatingWebhookConfiguration", false),
    ("admissionregistration.k8s.io/v1", "ValidatingWebhookConfiguration", false),
    ("maistra.io/v2", "ServiceMeshControlPlane", true),
    ("maistra.io/v1", "ServiceMeshMemberRoll", true),
];

impl MemoryStore {
    /// Store that serves no kinds
    pub fn new() -> Self {
        Self::default()
    }

    /// Store serving core workload, RBAC, policy and mesh CRD kinds.
    ///
    /// Plugin kinds (NetNamespace, ClusterNetwork,
    /// NetworkAttachmentDefinition) must be registered explicitly.
    pub fn with_default_kinds() -> Self {
        let store = Self::new();
        for (api_version, kind, namespaced) in DEFAULT_KINDS {
            store.register_kind(api_version, kind, *namespaced);
        }
        store
    }

    /// Serve an additional kind
    pub fn register_kind(&self, api_version: &str, kind: &str, namespaced: bool) {
        self.state
            .lock()
            .kinds
            .insert((api_version.to_string(), kind.to_string()), namespaced);
    }

    /// Insert an object directly, bypassing faults and the operation log.
    ///
    /// Keeps any `metadata.generation` and `deletionTimestamp` on the input
    /// so tests can start from an arbitrary state.
    pub fn seed(&self, doc: DynamicDocument) -> Result<DynamicDocument, Error> {
        let mut state = self.state.lock();
        let key = state.normalize(&doc.key()?)?;
        let mut next = doc;
        if key.namespace.is_empty() {
            next.remove(&["metadata", "namespace"]);
        }
        next.set_resource_version(None)?;
        if next.uid().is_none() {
            let uid = format!("uid-{}", state.revision + 1);
            next.set(&["metadata", "uid"], uid)?;
        }
        if next.generation().is_none() {
            next.set(&["metadata", "generation"], 1)?;
        }
        let rv = state.next_revision();
        next.set_resource_version(Some(&rv))?;
        state.objects.insert(key, next.clone());
        Ok(next)
    }

    /// Current stored copy of an object
    pub fn object(&self, key: &ResourceKey) -> Option<DynamicDocument> {
        let state = self.state.lock();
        let key = state.normalize(key).ok()?;
        state.objects.get(&key).cloned()
    }

    /// Stored objects of one kind, across namespaces
    pub fn objects_of(&self, api_version: &str, kind: &str) -> Vec<DynamicDocument> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == kind)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Replace an object's status out of band, as a workload controller would
    pub fn set_status(&self, key: &ResourceKey, status: Value) -> Result<(), Error> {
        let mut state = self.state.lock();
        let key = state.normalize(key)?;
        let rv = state.next_revision();
        let doc = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        doc.set(&["status"], status)?;
        doc.set_resource_version(Some(&rv))
    }

    /// Fail the next `verb` on `kind` (optionally only for `name`) once
    pub fn inject_fault(&self, verb: Verb, kind: &str, name: Option<&str>, fault: Fault) {
        self.state.lock().faults.push(PendingFault {
            verb,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            fault,
        });
    }

    /// Run `hook` on the stored copy after every write of `kind`
    pub fn on_write(&self, kind: &str, hook: impl Fn(&mut DynamicDocument) + Send + Sync + 'static) {
        self.state
            .lock()
            .hooks
            .push((kind.to_string(), Arc::new(hook)));
    }

    /// Every mutation since creation or the last [`clear_operations`](Self::clear_operations)
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    /// Forget recorded operations
    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }
}

impl State {
    fn namespaced(&self, api_version: &str, kind: &str) -> Result<bool, Error> {
        self.kinds
            .get(&(api_version.to_string(), kind.to_string()))
            .copied()
            .ok_or_else(|| Error::kind_not_registered(api_version, kind))
    }

    /// Validate the kind and drop the namespace of cluster-scoped keys
    fn normalize(&self, key: &ResourceKey) -> Result<ResourceKey, Error> {
        let namespaced = self.namespaced(&key.api_version, &key.kind)?;
        if namespaced && key.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "metadata.namespace",
                format!("{} {} requires a namespace", key.kind, key.name),
            ));
        }
        let mut key = key.clone();
        if !namespaced {
            key.namespace.clear();
        }
        Ok(key)
    }

    fn take_fault(&mut self, verb: Verb, kind: &str, name: &str) -> Option<Error> {
        let pos = self.faults.iter().position(|f| {
            f.verb == verb && f.kind == kind && f.name.as_deref().map_or(true, |n| n == name)
        })?;
        let fault = self.faults.remove(pos);
        Some(fault.fault.to_error(&format!("{kind}/{name}")))
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        self.objects
            .contains_key(&ResourceKey::new("", namespace, "v1", "Namespace"))
    }

    fn check_version(&self, doc: &DynamicDocument, key: &ResourceKey) -> Result<DynamicDocument, Error> {
        let existing = self
            .objects
            .get(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        if let Some(rv) = doc.resource_version() {
            if existing.resource_version() != Some(rv) {
                return Err(Error::conflict(format!(
                    "the object has been modified; please apply your changes to the latest version: {key}"
                )));
            }
        }
        Ok(existing.clone())
    }

    fn run_hooks(&mut self, key: &ResourceKey) -> Result<(), Error> {
        let hooks: Vec<WriteHook> = self
            .hooks
            .iter()
            .filter(|(kind, _)| *kind == key.kind)
            .map(|(_, hook)| hook.clone())
            .collect();
        if hooks.is_empty() {
            return Ok(());
        }
        let Some(mut doc) = self.objects.get(key).cloned() else {
            return Ok(());
        };
        let before = doc.clone();
        for hook in hooks {
            hook(&mut doc);
        }
        if doc != before {
            let rv = self.next_revision();
            doc.set_resource_version(Some(&rv))?;
            self.objects.insert(key.clone(), doc);
        }
        Ok(())
    }

    fn remove_object(&mut self, key: &ResourceKey) {
        self.objects.remove(key);
        if key.kind == "Namespace" && key.api_version == "v1" {
            let namespace = key.name.clone();
            self.objects.retain(|k, _| k.namespace != namespace);
        }
    }
}

/// Content that drives `metadata.generation`: everything but metadata and status
fn generation_content(doc: &DynamicDocument) -> Value {
    let mut content = doc.clone();
    content.remove(&["metadata"]);
    content.remove(&["status"]);
    content.into_value()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, Error> {
        let api_version = kube_utils::api_version_of(gvk);
        self.state.lock().namespaced(&api_version, &gvk.kind)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<DynamicDocument>, Error> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(Verb::Get, &key.kind, &key.name) {
            return Err(err);
        }
        let key = state.normalize(key)?;
        Ok(state.objects.get(&key).cloned())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<DynamicDocument>, Error> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_fault(Verb::List, &gvk.kind, "") {
            return Err(err);
        }
        let api_version = kube_utils::api_version_of(gvk);
        state.namespaced(&api_version, &gvk.kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == gvk.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .filter(|(_, doc)| selector.matches(&doc.labels()))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn create(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let mut state = self.state.lock();
        let key = state.normalize(&doc.key()?)?;
        if let Some(err) = state.take_fault(Verb::Create, &key.kind, &key.name) {
            return Err(err);
        }
        if doc.resource_version().is_some() {
            return Err(Error::invalid(format!(
                "{key}: resourceVersion should not be set on objects to be created"
            )));
        }
        if !key.namespace.is_empty() && !state.namespace_exists(&key.namespace) {
            return Err(Error::not_found(format!(
                "namespaces \"{}\" not found",
                key.namespace
            )));
        }
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                resource: key.to_string(),
            });
        }

        let mut next = doc.clone();
        if key.namespace.is_empty() {
            next.remove(&["metadata", "namespace"]);
        }
        next.remove(&["metadata", "deletionTimestamp"]);
        let uid = format!("uid-{}", state.revision + 1);
        next.set(&["metadata", "uid"], uid)?;
        next.set(&["metadata", "generation"], 1)?;
        let rv = state.next_revision();
        next.set_resource_version(Some(&rv))?;

        state.objects.insert(key.clone(), next.clone());
        state.operations.push(Operation::Create(key.clone()));
        state.run_hooks(&key)?;
        Ok(next)
    }

    async fn update(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let mut state = self.state.lock();
        let key = state.normalize(&doc.key()?)?;
        if let Some(err) = state.take_fault(Verb::Update, &key.kind, &key.name) {
            return Err(err);
        }
        let existing = state.check_version(doc, &key)?;

        let mut next = doc.clone();
        if key.namespace.is_empty() {
            next.remove(&["metadata", "namespace"]);
        }
        for field in ["uid", "deletionTimestamp"] {
            match existing.get(&["metadata", field]) {
                Some(v) => next.set(&["metadata", field], v.clone())?,
                None => {
                    next.remove(&["metadata", field]);
                }
            }
        }
        match existing.get(&["status"]) {
            Some(status) => next.set(&["status"], status.clone())?,
            None => {
                next.remove(&["status"]);
            }
        }
        let mut generation = existing.generation().unwrap_or(1);
        if generation_content(&next) != generation_content(&existing) {
            generation += 1;
        }
        next.set(&["metadata", "generation"], generation)?;
        let rv = state.next_revision();
        next.set_resource_version(Some(&rv))?;

        state.operations.push(Operation::Update(key.clone()));
        if next.is_terminating() && next.finalizers().is_empty() {
            state.remove_object(&key);
            return Ok(next);
        }
        state.objects.insert(key.clone(), next.clone());
        state.run_hooks(&key)?;
        Ok(next)
    }

    async fn update_status(&self, doc: &DynamicDocument) -> Result<DynamicDocument, Error> {
        let mut state = self.state.lock();
        let key = state.normalize(&doc.key()?)?;
        if let Some(err) = state.take_fault(Verb::UpdateStatus, &key.kind, &key.name) {
            return Err(err);
        }
        let mut next = state.check_version(doc, &key)?;
        match doc.get(&["status"]) {
            Some(status) => next.set(&["status"], status.clone())?,
            None => {
                next.remove(&["status"]);
            }
        }
        let rv = state.next_revision();
        next.set_resource_version(Some(&rv))?;

        state.objects.insert(key.clone(), next.clone());
        state.operations.push(Operation::UpdateStatus(key.clone()));
        state.run_hooks(&key)?;
        Ok(next)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), Error> {
        let mut state = self.state.lock();
        let key = state.normalize(key)?;
        if let Some(err) = state.take_fault(Verb::Delete, &key.kind, &key.name) {
            return Err(err);
        }
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(key.to_string()))?;

        state.operations.push(Operation::Delete(key.clone()));
        if existing.finalizers().is_empty() {
            state.remove_object(&key);
            return Ok(());
        }
        if !existing.is_terminating() {
            let mut next = existing;
            next.set(&["metadata", "deletionTimestamp"], now())?;
            let rv = state.next_revision();
            next.set_resource_version(Some(&rv))?;
            state.objects.insert(key, next);
        }
        Ok(())
    }
}
