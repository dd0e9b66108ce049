//! Label, annotation and finalizer keys
//!
//! Stable contract other collaborators key off of (sidecar injection,
//! dashboards, network controllers). Changing any value here orphans objects
//! written by earlier operator versions.

// =============================================================================
// Ownership
// =============================================================================

/// Label recording which mesh namespace owns an object
pub const OWNER_LABEL: &str = "maistra.io/owner";

/// Label on member namespaces (and mirrored objects) naming the mesh namespace
pub const MEMBER_OF_LABEL: &str = "maistra.io/member-of";

/// Annotation recording the mesh generation that last wrote an object
pub const MESH_GENERATION_ANNOTATION: &str = "maistra.io/mesh-generation";

/// Annotation holding the configuration last written by the operator.
///
/// The "original" input of the three-way patch.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Annotation marking mesh objects that must not be mirrored into members
pub const INTERNAL_ANNOTATION: &str = "maistra.io/internal";

/// Finalizer held on control planes and member rolls until cleanup completes
pub const FINALIZER: &str = "maistra.io/istio-operator";

// =============================================================================
// Standard app labels
// =============================================================================

/// `app.kubernetes.io/name`
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
/// `app.kubernetes.io/instance`
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// `app.kubernetes.io/version`
pub const APP_VERSION_LABEL: &str = "app.kubernetes.io/version";
/// `app.kubernetes.io/component`
pub const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// `app.kubernetes.io/part-of`
pub const APP_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
/// `app.kubernetes.io/managed-by`
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value for [`APP_PART_OF_LABEL`]
pub const PART_OF_VALUE: &str = "istio";

/// Value for [`APP_MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "maistra-istio-operator";

/// Component label value carried by the CNI DaemonSets
pub const CNI_COMPONENT: &str = "cni";

// =============================================================================
// Network plugin integration
// =============================================================================

/// NetNamespace annotation the multitenant SDN controller consumes and clears
pub const CHANGE_NETWORK_ANNOTATION: &str = "pod.network.openshift.io/multitenant.change-network";

/// Prefix of the join action value (`join:<mesh-namespace>`)
pub const JOIN_NETWORK_PREFIX: &str = "join:";

/// Isolate action value
pub const ISOLATE_NETWORK: &str = "isolate";
