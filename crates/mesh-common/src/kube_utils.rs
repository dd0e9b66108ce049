//! Shared Kubernetes helpers
//!
//! Small pure functions over apiVersion strings, workload conditions and
//! manifest kinds. Anything that talks to the API server lives in
//! [`crate::store`].

use kube::api::GroupVersionKind;

// Kubernetes condition type constants
/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Parse an API version string into (group, version)
///
/// # Example
///
/// ```
/// use mesh_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build a GroupVersionKind from an apiVersion string and kind
pub fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = parse_api_version(api_version);
    GroupVersionKind::gvk(&group, &version, kind)
}

/// Render a GroupVersionKind back into its apiVersion string
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Check if a Kubernetes condition of the given type has status "True"
///
/// # Arguments
/// * `conditions` - Optional slice of conditions (e.g., from status.conditions)
/// * `condition_type` - The condition type to check (e.g., "Available")
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Get the priority for a resource kind within one component's manifests
///
/// Lower numbers are created first. Objects that others reference by name
/// (namespaces, CRDs, service accounts, roles) go before their referrers.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "NetworkPolicy" | "PodDisruptionBudget" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        "HorizontalPodAutoscaler" => 9,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 10,
        _ => 11,
    }
}
