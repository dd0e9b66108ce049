//! ServiceMeshMemberRoll CRD
//!
//! Lists the namespaces that participate in the mesh whose control plane
//! lives in the roll's namespace.

use std::collections::BTreeSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::StatusType;

/// Spec for a ServiceMeshMemberRoll
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "maistra.io",
    version = "v1",
    kind = "ServiceMeshMemberRoll",
    plural = "servicemeshmemberrolls",
    shortname = "smmr",
    namespaced,
    status = "MemberRollStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Members","type":"string","jsonPath":".status.configuredMembers"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MemberRollSpec {
    /// Namespaces that should be members of the mesh
    #[serde(default)]
    pub members: Vec<String>,
}

/// Observed state of a ServiceMeshMemberRoll
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberRollStatus {
    /// Ready condition
    #[serde(flatten)]
    pub status: StatusType,

    /// Spec generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Control-plane generation the members were last configured for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mesh_generation: Option<i64>,

    /// Control-plane reconciled version the members were last configured for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mesh_reconciled_version: Option<String>,

    /// Namespaces fully configured as members
    #[serde(default)]
    pub configured_members: Vec<String>,

    /// Required namespaces not configured yet
    #[serde(default)]
    pub pending_members: Vec<String>,

    /// Required namespaces that are being deleted
    #[serde(default)]
    pub terminating_members: Vec<String>,
}

impl ServiceMeshMemberRoll {
    /// Members requested by the spec, without the roll's own namespace
    pub fn required_members(&self) -> BTreeSet<String> {
        let own = self.namespace().unwrap_or_default();
        self.spec
            .members
            .iter()
            .filter(|m| !m.is_empty() && **m != own)
            .cloned()
            .collect()
    }

    /// Members configured by earlier passes
    pub fn configured_members(&self) -> BTreeSet<String> {
        self.status
            .as_ref()
            .map(|s| s.configured_members.iter().cloned().collect())
            .unwrap_or_default()
    }
}
