//! Custom Resource Definitions for the mesh operator

mod control_plane;
mod member_roll;
mod types;

pub use control_plane::{
    mesh_generation, ControlPlaneSpec, ControlPlaneStatus, ReadinessMap, ReadinessStatus,
    ServiceMeshControlPlane,
};
pub use member_roll::{MemberRollSpec, MemberRollStatus, ServiceMeshMemberRoll};
pub use types::{
    condition_reasons, condition_types, ChildStatus, ComponentStatus, Condition, ConditionStatus,
    StatusType,
};
