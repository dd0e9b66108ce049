//! ServiceMeshControlPlane CRD
//!
//! Declares one mesh installation per namespace. The operator renders the
//! spec into per-component manifests, applies them, prunes what is no longer
//! rendered and reports the outcome on status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ComponentStatus, StatusType};

// =============================================================================
// CRD
// =============================================================================

/// Spec for a ServiceMeshControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "maistra.io",
    version = "v2",
    kind = "ServiceMeshControlPlane",
    plural = "servicemeshcontrolplanes",
    shortname = "smcp",
    namespaced,
    status = "ControlPlaneStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Reconciled","type":"string","jsonPath":".status.reconciledVersion"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Mesh version to install (e.g. "v2.4"); the operator default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Rendering profiles applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
}

/// Observed state of a ServiceMeshControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Installed / Reconciled / Ready conditions
    #[serde(flatten)]
    pub status: StatusType,

    /// Spec generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Mesh generation stamped on every owned object by the last
    /// successful pass (`<operatorVersion>-<generation>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_version: Option<String>,

    /// Mesh version that was rendered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    /// Per-component results of the last pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatus>,

    /// Workload readiness by component
    #[serde(default)]
    pub readiness: ReadinessStatus,
}

/// Readiness summary
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ReadinessStatus {
    /// Component readiness
    #[serde(default)]
    pub components: ReadinessMap,
}

/// Component names partitioned by readiness, each sorted
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ReadinessMap {
    /// Components whose workloads are all ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ready: Vec<String>,
    /// Components with at least one unready workload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unready: Vec<String>,
}

/// Mesh generation string for a control-plane generation
///
/// Changing either the operator version or the spec generation re-stamps
/// every owned object on the next pass.
pub fn mesh_generation(operator_version: &str, generation: i64) -> String {
    format!("{operator_version}-{generation}")
}

impl ServiceMeshControlPlane {
    /// Whether a pass has completed for the current spec and operator version
    pub fn is_reconciled(&self, operator_version: &str) -> bool {
        let Some(generation) = self.metadata.generation else {
            return false;
        };
        self.status
            .as_ref()
            .and_then(|s| s.reconciled_version.as_deref())
            == Some(mesh_generation(operator_version, generation).as_str())
    }
}
