//! Control-plane reconciliation
//!
//! Renders a `ServiceMeshControlPlane` into per-component manifests, applies
//! them with three-way patches, prunes what is no longer rendered and reports
//! readiness on status.

#![deny(missing_docs)]

pub mod controller;
pub mod manifest;
pub mod patch;
pub mod prune;
pub mod readiness;

pub use controller::{error_policy, reconcile, ControlPlaneContext, ManifestRenderer, RenderedManifests};
pub use manifest::{ManifestProcessor, RawManifest};
pub use patch::{create_patch, ObjectPatch, PatchStrategy};
pub use prune::{PruneTarget, Pruner};
pub use readiness::ReadinessAggregator;
