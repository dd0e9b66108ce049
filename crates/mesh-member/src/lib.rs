//! Mesh membership
//!
//! Reconciles `ServiceMeshMemberRoll`s: every listed namespace gets the
//! mesh's role bindings, network access and CNI attachment, then the
//! member-of label that sidecar injection keys off of.

#![deny(missing_docs)]

pub mod cni;
pub mod controller;
mod mirror;
pub mod namespace;
pub mod networking;

pub use controller::{error_policy, reconcile, MemberRollContext};
pub use namespace::NamespaceReconciler;
pub use networking::{NetworkPlugin, NetworkingStrategy};
