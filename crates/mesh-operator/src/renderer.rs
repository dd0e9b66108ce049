//! Pre-rendered manifest source
//!
//! Reads `<root>/<version>/<component>/*` so the operator can run against
//! manifests produced ahead of time by an external chart renderer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use mesh_common::crd::ServiceMeshControlPlane;
use mesh_common::Error;
use mesh_controlplane::{ManifestRenderer, RawManifest, RenderedManifests};

/// Manifests laid out on disk by mesh version and component
pub struct DirectoryRenderer {
    root: PathBuf,
}

impl DirectoryRenderer {
    /// Renderer reading below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ManifestRenderer for DirectoryRenderer {
    async fn render(&self, _smcp: &ServiceMeshControlPlane, version: &str) -> Result<RenderedManifests, Error> {
        let version_dir = self.root.join(version);
        if !tokio::fs::try_exists(&version_dir).await.unwrap_or(false) {
            return Err(Error::validation_for_field(
                "spec.version",
                format!("no manifests for mesh version {version} in {}", self.root.display()),
            ));
        }

        let mut rendered = RenderedManifests::new();
        for component_dir in sorted_entries(&version_dir).await? {
            if !component_dir.is_dir() {
                continue;
            }
            let Some(component) = file_name(&component_dir) else {
                continue;
            };
            let mut manifests = Vec::new();
            for file in sorted_entries(&component_dir).await? {
                if !file.is_file() {
                    continue;
                }
                let Some(name) = file_name(&file) else {
                    continue;
                };
                let content = tokio::fs::read_to_string(&file).await.map_err(|e| {
                    Error::internal_with_context("manifests", format!("reading {}: {e}", file.display()))
                })?;
                manifests.push(RawManifest::new(name, content));
            }
            debug!(component = %component, files = manifests.len(), "loaded component manifests");
            rendered.insert(component, manifests);
        }
        Ok(rendered)
    }
}

async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let read_error = |e: std::io::Error| Error::internal_with_context("manifests", format!("listing {}: {e}", dir.display()));
    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}
