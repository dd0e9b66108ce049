//! Controller wiring
//!
//! Each `build_*` function returns the controller future; `main` runs them
//! side by side.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use mesh_common::crd::{ServiceMeshControlPlane, ServiceMeshMemberRoll};
use mesh_common::events::KubeEventPublisher;
use mesh_common::store::KubeStore;
use mesh_common::OperatorConfig;
use mesh_controlplane::{ControlPlaneContext, ManifestRenderer};
use mesh_member::MemberRollContext;

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the server first
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// ServiceMeshControlPlane controller
///
/// Owned workloads retrigger the control plane so readiness is re-evaluated
/// as soon as they change.
pub fn build_control_plane_controller(
    client: Client,
    store: Arc<KubeStore>,
    renderer: Arc<dyn ManifestRenderer>,
    config: Arc<OperatorConfig>,
) -> ControllerFuture {
    let ctx = Arc::new(ControlPlaneContext {
        store,
        events: Arc::new(KubeEventPublisher::new(client.clone(), "servicemeshcontrolplane-controller")),
        renderer,
        config,
    });

    tracing::info!("- ServiceMeshControlPlane controller");
    Box::pin(
        Controller::new(Api::<ServiceMeshControlPlane>::all(client.clone()), watcher_config())
            .owns(Api::<Deployment>::all(client.clone()), watcher_config())
            .owns(Api::<StatefulSet>::all(client.clone()), watcher_config())
            .owns(Api::<DaemonSet>::all(client), watcher_config())
            .shutdown_on_signal()
            .run(mesh_controlplane::reconcile, mesh_controlplane::error_policy, ctx)
            .for_each(log_reconcile_result("ServiceMeshControlPlane")),
    )
}

/// ServiceMeshMemberRoll controller
///
/// Namespace events are mapped to the rolls that list or configured the
/// namespace; control-plane events to the rolls in the same namespace.
pub fn build_member_roll_controller(
    client: Client,
    store: Arc<KubeStore>,
    config: Arc<OperatorConfig>,
) -> ControllerFuture {
    let ctx = Arc::new(MemberRollContext {
        store,
        events: Arc::new(KubeEventPublisher::new(client.clone(), "servicemeshmemberroll-controller")),
        config,
    });

    let controller = Controller::new(Api::<ServiceMeshMemberRoll>::all(client.clone()), watcher_config());
    let rolls_for_namespaces = controller.store();
    let rolls_for_control_planes = controller.store();

    tracing::info!("- ServiceMeshMemberRoll controller");
    Box::pin(
        controller
            .watches(Api::<Namespace>::all(client.clone()), watcher_config(), move |namespace| {
                let name = namespace.name_any();
                rolls_for_namespaces
                    .state()
                    .into_iter()
                    .filter(|roll| roll.spec.members.contains(&name) || roll.configured_members().contains(&name))
                    .map(|roll| ObjectRef::from_obj(roll.as_ref()))
                    .collect::<Vec<_>>()
            })
            .watches(
                Api::<ServiceMeshControlPlane>::all(client),
                watcher_config(),
                move |smcp| {
                    let namespace = smcp.namespace();
                    rolls_for_control_planes
                        .state()
                        .into_iter()
                        .filter(|roll| roll.namespace() == namespace)
                        .map(|roll| ObjectRef::from_obj(roll.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .shutdown_on_signal()
            .run(mesh_member::reconcile, mesh_member::error_policy, ctx)
            .for_each(log_reconcile_result("ServiceMeshMemberRoll")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
