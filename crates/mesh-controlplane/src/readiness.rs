//! Workload readiness aggregation
//!
//! Lists the owned Deployments, StatefulSets and DaemonSets (plus the CNI
//! DaemonSets in the operator namespace when the plugin is enabled), groups
//! them by component label and folds the result into the `Ready` condition.
//! The condition, the status write and the event only change when the
//! condition status flips.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use mesh_common::config::OperatorConfig;
use mesh_common::crd::{condition_reasons, condition_types, Condition, ConditionStatus, ControlPlaneStatus, ReadinessMap};
use mesh_common::events::{actions, reasons, EventPublisher};
use mesh_common::kube_utils::{gvk, has_condition, CONDITION_AVAILABLE};
use mesh_common::labels::{APP_COMPONENT_LABEL, APP_MANAGED_BY_LABEL, CNI_COMPONENT, MANAGED_BY_VALUE, OWNER_LABEL};
use mesh_common::store::{LabelSelector, ObjectStore};
use mesh_common::{DynamicDocument, Error};

const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet"];

/// Component name -> whether every workload of it is ready
pub type ComponentReadiness = BTreeMap<String, bool>;

/// Computes readiness for one control plane
pub struct ReadinessAggregator<'a> {
    store: &'a dyn ObjectStore,
    events: &'a dyn EventPublisher,
    config: &'a OperatorConfig,
    owner: String,
}

impl<'a> ReadinessAggregator<'a> {
    /// Aggregator for objects owned by the mesh namespace `owner`
    pub fn new(
        store: &'a dyn ObjectStore,
        events: &'a dyn EventPublisher,
        config: &'a OperatorConfig,
        owner: &str,
    ) -> Self {
        Self {
            store,
            events,
            config,
            owner: owner.to_string(),
        }
    }

    /// Readiness of every component with at least one workload
    pub async fn component_readiness(&self) -> Result<ComponentReadiness, Error> {
        let owned = LabelSelector::everything().equals(OWNER_LABEL, &self.owner);
        let mut workloads = Vec::new();
        for kind in WORKLOAD_KINDS {
            workloads.extend(self.store.list(&gvk("apps/v1", kind), None, &owned).await?);
        }

        if self.config.cni.enabled {
            let cni = LabelSelector::everything()
                .equals(APP_COMPONENT_LABEL, CNI_COMPONENT)
                .equals(APP_MANAGED_BY_LABEL, MANAGED_BY_VALUE);
            workloads.extend(
                self.store
                    .list(
                        &gvk("apps/v1", "DaemonSet"),
                        Some(&self.config.operator_namespace),
                        &cni,
                    )
                    .await?,
            );
        }

        let mut readiness = ComponentReadiness::new();
        for workload in &workloads {
            let Some(component) = workload.label(APP_COMPONENT_LABEL) else {
                warn!(
                    kind = %workload.kind(),
                    name = %workload.name(),
                    "workload has no component label, ignoring for readiness"
                );
                continue;
            };
            let ready = is_ready(workload).unwrap_or_else(|e| {
                warn!(
                    kind = %workload.kind(),
                    name = %workload.name(),
                    error = %e,
                    "unreadable workload status, counting it as not ready"
                );
                false
            });
            debug!(component, kind = %workload.kind(), name = %workload.name(), ready, "workload readiness");
            let entry = readiness.entry(component.to_string()).or_insert(true);
            *entry &= ready;
        }
        Ok(readiness)
    }

    /// Refresh readiness on `status`, returning whether the `Ready`
    /// condition transitioned.
    ///
    /// The caller writes status only on a transition. An event is published
    /// for every transition.
    pub async fn update_readiness(&self, target: &ObjectReference, status: &mut ControlPlaneStatus) -> bool {
        use condition_reasons::{COMPONENTS_NOT_READY, COMPONENTS_READY, PROBE_ERROR};

        let (condition, event_type, reason) = match self.component_readiness().await {
            Ok(readiness) => {
                let map = partition(&readiness);
                let condition = if map.unready.is_empty() {
                    Condition::new(
                        condition_types::READY,
                        ConditionStatus::True,
                        COMPONENTS_READY,
                        "All component deployments are Available",
                    )
                } else {
                    Condition::new(
                        condition_types::READY,
                        ConditionStatus::False,
                        COMPONENTS_NOT_READY,
                        format!("Some components are not fully available: {}", map.unready.join(", ")),
                    )
                };
                status.readiness.components = map;
                let (event_type, reason) = if condition.status == ConditionStatus::True {
                    (EventType::Normal, reasons::COMPONENTS_READY)
                } else {
                    (EventType::Warning, reasons::COMPONENTS_NOT_READY)
                };
                (condition, event_type, reason)
            }
            Err(e) => {
                warn!(error = %e, "failed to determine component readiness");
                let condition = Condition::new(
                    condition_types::READY,
                    ConditionStatus::Unknown,
                    PROBE_ERROR,
                    format!("Error determining component readiness: {e}"),
                );
                (condition, EventType::Warning, reasons::PROBE_ERROR)
            }
        };

        let message = condition.message.clone();
        if !status.status.set_condition(condition) {
            return false;
        }
        info!(reason, message = %message, "readiness changed");
        self.events
            .publish(target, event_type, reason, actions::PROBE, Some(message))
            .await;
        true
    }
}

/// Split readiness into sorted ready / unready component lists
pub fn partition(readiness: &ComponentReadiness) -> ReadinessMap {
    let mut map = ReadinessMap::default();
    for (component, ready) in readiness {
        if *ready {
            map.ready.push(component.clone());
        } else {
            map.unready.push(component.clone());
        }
    }
    map
}

/// Kind-specific readiness predicate
fn is_ready(workload: &DynamicDocument) -> Result<bool, Error> {
    match workload.kind() {
        "Deployment" => {
            let deployment: Deployment = workload.to_typed()?;
            let conditions = deployment.status.and_then(|s| s.conditions);
            Ok(has_condition(conditions.as_deref(), CONDITION_AVAILABLE))
        }
        "StatefulSet" => {
            let status = workload.to_typed::<StatefulSet>()?.status.unwrap_or_default();
            Ok(status.ready_replicas.unwrap_or(0) >= status.replicas)
        }
        "DaemonSet" => {
            let status = workload.to_typed::<DaemonSet>()?.status.unwrap_or_default();
            Ok(status.number_unavailable.unwrap_or(0) == 0)
        }
        _ => Ok(true),
    }
}
