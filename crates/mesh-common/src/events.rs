//! Events attached to mesh resources
//!
//! Controllers report what they did through [`EventPublisher`]; the
//! production publisher records `core/v1` Events so they show up under
//! `kubectl describe smcp` and `kubectl describe smmr`. Publishing is best
//! effort: a rejected Event is logged and otherwise ignored.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for events about a single object
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason`/`action` (see [`reasons`] and [`actions`]) against
    /// `regarding`, with an optional free-form note.
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Records events through the API server
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `component` becomes the event's reporting controller; the pod name,
    /// when the downward API provides it, becomes the reporting instance.
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, regarding).await {
            warn!(
                object = ?regarding.name,
                namespace = ?regarding.namespace,
                reason,
                %error,
                "dropping event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _: &ObjectReference, _: EventType, _: &str, _: &str, _: Option<String>) {}
}

/// Values for the REASON column
pub mod reasons {
    // Control plane
    /// First successful reconcile of a control plane
    pub const INSTALLED: &str = "Installed";
    /// A reconcile pass failed
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    /// Every component became ready
    pub const COMPONENTS_READY: &str = "ComponentsReady";
    /// A component became unready
    pub const COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
    /// Readiness could not be determined
    pub const PROBE_ERROR: &str = "ProbeError";
    /// All owned objects were removed
    pub const DELETED: &str = "Deleted";
    /// An object was deleted and recreated after the server rejected a patch
    pub const OBJECT_RECREATED: &str = "ObjectRecreated";

    // Member roll
    /// A namespace joined the mesh
    pub const MEMBER_CONFIGURED: &str = "MemberConfigured";
    /// A namespace left the mesh
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
    /// Configuring or removing a namespace failed
    pub const MEMBER_RECONCILE_ERROR: &str = "MemberReconcileError";
}

/// Values for the ACTION column
pub mod actions {
    /// Regular reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Readiness evaluation
    pub const PROBE: &str = "Probe";
    /// Deletion-path cleanup
    pub const DELETE: &str = "Delete";
    /// Delete-and-recreate fallback
    pub const RECREATE: &str = "Recreate";
}
