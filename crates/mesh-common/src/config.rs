//! Operator configuration
//!
//! Built once at startup and shared read-only (`Arc<OperatorConfig>`) by
//! every reconciler. Tests construct it directly.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::Error;

/// Immutable operator settings
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator (and the CNI DaemonSets) run in
    pub operator_namespace: String,
    /// Operator version, prefix of every mesh generation string
    pub operator_version: String,
    /// Mesh version used when a control plane does not set one
    pub default_mesh_version: String,
    /// Cluster-wide CNI plugin settings
    pub cni: CniConfig,
    /// Ordered components and their dependencies
    pub components: ComponentCatalog,
    /// Poll budget for the multitenant network plugin
    pub multitenant_backoff: BackoffConfig,
    /// Requeue intervals
    pub requeue: RequeueConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "openshift-operators".to_string(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            default_mesh_version: "v2.4".to_string(),
            cni: CniConfig::default(),
            components: ComponentCatalog::default(),
            multitenant_backoff: BackoffConfig::default(),
            requeue: RequeueConfig::default(),
        }
    }
}

// =============================================================================
// CNI
// =============================================================================

/// Settings of the mesh CNI plugin
#[derive(Clone, Debug, Default)]
pub struct CniConfig {
    /// Whether the CNI plugin is deployed cluster-wide
    pub enabled: bool,
    /// NetworkAttachmentDefinition name per mesh version
    pub network_names: BTreeMap<String, String>,
}

impl CniConfig {
    /// NetworkAttachmentDefinition name for a mesh version.
    ///
    /// Falls back to a name derived from the version (`v2.4` -> `v2-4-istio-cni`).
    pub fn network_name(&self, version: &str) -> String {
        if let Some(name) = self.network_names.get(version) {
            return name.clone();
        }
        let normalized = version.trim_start_matches('v').replace('.', "-");
        format!("v{normalized}-istio-cni")
    }
}

// =============================================================================
// Components
// =============================================================================

/// One component (chart) and the components it requires
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentDef {
    /// Component name, matching the rendered manifest group
    pub name: String,
    /// Components that must be applied first in the same pass
    pub depends_on: Vec<String>,
}

impl ComponentDef {
    /// Component with dependencies
    pub fn new(name: &str, depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Ordered component list
///
/// Every dependency must appear earlier in the list, so catalog order is a
/// valid installation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentCatalog {
    components: Vec<ComponentDef>,
}

impl ComponentCatalog {
    /// Validate and build a catalog
    pub fn new(components: Vec<ComponentDef>) -> Result<Self, Error> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for component in &components {
            for dep in &component.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::validation_for_field(
                        "components",
                        format!(
                            "component {} depends on {dep}, which is not listed before it",
                            component.name
                        ),
                    ));
                }
            }
            if !seen.insert(component.name.as_str()) {
                return Err(Error::validation_for_field(
                    "components",
                    format!("component {} is listed twice", component.name),
                ));
            }
        }
        Ok(Self { components })
    }

    /// Components in installation order
    pub fn iter(&self) -> impl Iterator<Item = &ComponentDef> {
        self.components.iter()
    }

    /// Prerequisites of a component; empty for unknown components
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.depends_on.as_slice())
            .unwrap_or_default()
    }

    /// Order rendered component names: catalog order first, then unknown
    /// names sorted
    pub fn order<'a>(&self, rendered: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let rendered: BTreeSet<&str> = rendered.into_iter().collect();
        let mut ordered: Vec<String> = self
            .components
            .iter()
            .filter(|c| rendered.contains(c.name.as_str()))
            .map(|c| c.name.clone())
            .collect();
        ordered.extend(
            rendered
                .into_iter()
                .filter(|name| !self.components.iter().any(|c| c.name == *name))
                .map(str::to_string),
        );
        ordered
    }
}

impl Default for ComponentCatalog {
    fn default() -> Self {
        let components = vec![
            ComponentDef::new("istio", &[]),
            ComponentDef::new("istio-discovery", &["istio"]),
            ComponentDef::new("mesh-config", &["istio-discovery"]),
            ComponentDef::new("istio-ingress", &["istio-discovery"]),
            ComponentDef::new("istio-egress", &["istio-discovery"]),
            ComponentDef::new("gateways", &["istio-discovery"]),
            ComponentDef::new("prometheus", &["istio-discovery"]),
            ComponentDef::new("tracing", &["istio-discovery"]),
            ComponentDef::new("threeScale", &["istio-discovery"]),
            ComponentDef::new("grafana", &["prometheus"]),
            ComponentDef::new("kiali", &["prometheus"]),
        ];
        Self { components }
    }
}

// =============================================================================
// Timing
// =============================================================================

/// Bounded exponential backoff
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Delay multiplier per attempt
    pub factor: f64,
    /// Maximum number of attempts
    pub steps: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            steps: 8,
        }
    }
}

/// Requeue intervals for reconcile outcomes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeueConfig {
    /// After a successful pass
    pub reconciled: Duration,
    /// After a failed pass
    pub on_error: Duration,
    /// After an optimistic-concurrency conflict
    pub on_conflict: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            reconciled: Duration::from_secs(300),
            on_error: Duration::from_secs(30),
            on_conflict: Duration::from_secs(5),
        }
    }
}
