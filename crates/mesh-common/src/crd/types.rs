//! Status building blocks shared by the mesh CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Installed, Reconciled, Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Condition types
pub mod condition_types {
    /// At least one reconcile pass has succeeded
    pub const INSTALLED: &str = "Installed";
    /// The last reconcile pass succeeded
    pub const RECONCILED: &str = "Reconciled";
    /// Workloads are ready / members are configured
    pub const READY: &str = "Ready";
}

/// Condition reasons
pub mod condition_reasons {
    /// First successful pass
    pub const INSTALL_SUCCESSFUL: &str = "InstallSuccessful";
    /// Pass failed before the first install succeeded
    pub const INSTALL_ERROR: &str = "InstallError";
    /// Pass succeeded
    pub const RECONCILE_SUCCESSFUL: &str = "ReconcileSuccessful";
    /// Pass failed
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    /// Every component is ready
    pub const COMPONENTS_READY: &str = "ComponentsReady";
    /// At least one component is not ready
    pub const COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
    /// Readiness could not be determined
    pub const PROBE_ERROR: &str = "ProbeError";
    /// No control plane in the member roll's namespace
    pub const SMCP_MISSING: &str = "SMCPMissing";
    /// More than one control plane in the member roll's namespace
    pub const MULTIPLE_SMCPS: &str = "MultipleSMCPs";
    /// The control plane has not completed a reconcile yet
    pub const SMCP_NOT_RECONCILED: &str = "SMCPNotReconciled";
    /// Every required member is configured
    pub const CONFIGURED: &str = "Configured";
    /// Some required members are not configured
    pub const RECONCILE_MEMBERS_FAILED: &str = "ReconcileMembersFailed";
    /// Some required namespaces do not exist yet
    pub const NAMESPACE_MISSING: &str = "NamespaceMissing";
}

/// List of conditions with transition-preserving updates
///
/// Embedded (flattened) in every status struct.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StatusType {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StatusType {
    /// The condition of the given type, if present
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Status of the given condition type, `Unknown` if absent
    pub fn condition_status(&self, type_: &str) -> ConditionStatus {
        self.get_condition(type_)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    /// Whether the given condition type is `True`
    pub fn is_true(&self, type_: &str) -> bool {
        self.condition_status(type_) == ConditionStatus::True
    }

    /// Set a condition, returning whether its status transitioned.
    ///
    /// When the status is unchanged the reason and message are refreshed but
    /// `lastTransitionTime` is kept. A condition absent before counts as a
    /// transition from `Unknown` only if the new status is not `Unknown`.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) if existing.status == condition.status => {
                existing.reason = condition.reason;
                existing.message = condition.message;
                false
            }
            Some(existing) => {
                *existing = condition;
                true
            }
            None => {
                let transitioned = condition.status != ConditionStatus::Unknown;
                self.conditions.push(condition);
                transitioned
            }
        }
    }

    /// Record the outcome of a reconcile pass on `Installed` / `Reconciled`.
    ///
    /// `Installed` only changes until it first becomes `True`.
    pub fn mark_reconcile_result(&mut self, outcome: Result<(), &str>) {
        use condition_reasons::*;
        use condition_types::*;

        let installed = self.is_true(INSTALLED);
        match outcome {
            Ok(()) => {
                if !installed {
                    self.set_condition(Condition::new(
                        INSTALLED,
                        ConditionStatus::True,
                        INSTALL_SUCCESSFUL,
                        "Successfully installed all mesh components",
                    ));
                }
                self.set_condition(Condition::new(
                    RECONCILED,
                    ConditionStatus::True,
                    RECONCILE_SUCCESSFUL,
                    "Successfully reconciled",
                ));
            }
            Err(message) => {
                if !installed {
                    self.set_condition(Condition::new(
                        INSTALLED,
                        ConditionStatus::False,
                        INSTALL_ERROR,
                        message,
                    ));
                }
                self.set_condition(Condition::new(
                    RECONCILED,
                    ConditionStatus::False,
                    RECONCILE_ERROR,
                    message,
                ));
            }
        }
    }
}

/// Status of one rendered component (chart)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component name
    pub resource: String,

    /// Component-level conditions
    #[serde(flatten)]
    pub status: StatusType,

    /// One entry per object the component rendered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildStatus>,
}

impl ComponentStatus {
    /// Empty status for a component
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// The child entry for an object key, created if missing
    pub fn child_mut(&mut self, resource: &str) -> &mut ChildStatus {
        match self.children.iter().position(|c| c.resource == resource) {
            Some(pos) => &mut self.children[pos],
            None => {
                self.children.push(ChildStatus {
                    resource: resource.to_string(),
                    status: StatusType::default(),
                });
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        }
    }
}

/// Status of one object rendered by a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ChildStatus {
    /// ResourceKey string of the object
    pub resource: String,

    /// Object-level conditions
    #[serde(flatten)]
    pub status: StatusType,
}
