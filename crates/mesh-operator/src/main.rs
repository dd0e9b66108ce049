//! Mesh operator - installs service mesh control planes and manages their members

mod controllers;
mod renderer;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use mesh_common::config::{BackoffConfig, CniConfig, ComponentCatalog, ComponentDef, RequeueConfig};
use mesh_common::crd::{ServiceMeshControlPlane, ServiceMeshMemberRoll};
use mesh_common::store::KubeStore;
use mesh_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use mesh_common::OperatorConfig;

use crate::controllers::{build_control_plane_controller, build_member_roll_controller};
use crate::renderer::DirectoryRenderer;

/// Service mesh operator
#[derive(Parser, Debug)]
#[command(name = "mesh-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control-plane and member-roll controllers (default mode)
    Controller,
}

/// Operator settings; every flag falls back to an environment variable
#[derive(Args, Debug)]
struct Settings {
    /// Namespace the operator and the CNI DaemonSets run in
    #[arg(long, env = "POD_NAMESPACE", default_value = "openshift-operators")]
    operator_namespace: String,

    /// Mesh version for control planes that do not set one
    #[arg(long, env = "MESH_DEFAULT_VERSION", default_value = "v2.4")]
    default_mesh_version: String,

    /// Whether the mesh CNI plugin is deployed cluster-wide
    #[arg(long, env = "CNI_ENABLED")]
    cni_enabled: bool,

    /// NetworkAttachmentDefinition name per mesh version (`v2.4=v2-4-istio-cni`)
    #[arg(long = "cni-network", env = "CNI_NETWORKS", value_delimiter = ',', value_parser = parse_key_value)]
    cni_networks: Vec<(String, String)>,

    /// Component install order with prerequisites (`name` or `name=dep1+dep2`)
    #[arg(long = "component", env = "MESH_COMPONENTS", value_delimiter = ',', value_parser = parse_component)]
    components: Vec<ComponentDef>,

    /// Directory holding pre-rendered manifests (`<dir>/<version>/<component>/*.yaml`)
    #[arg(long, env = "MANIFESTS_DIR", default_value = "/usr/local/share/mesh-operator/manifests")]
    manifests_dir: PathBuf,

    /// Initial delay of the multitenant network poll, in milliseconds
    #[arg(long, env = "MULTITENANT_POLL_INITIAL_MS", default_value_t = 200)]
    multitenant_poll_initial_ms: u64,

    /// Maximum number of multitenant network polls
    #[arg(long, env = "MULTITENANT_POLL_STEPS", default_value_t = 8)]
    multitenant_poll_steps: u32,

    /// Requeue interval after a successful pass, in seconds
    #[arg(long, env = "REQUEUE_SECONDS", default_value_t = 300)]
    requeue_seconds: u64,

    /// Requeue interval after a failed pass, in seconds
    #[arg(long, env = "ERROR_REQUEUE_SECONDS", default_value_t = 30)]
    error_requeue_seconds: u64,

    /// Log human-readable lines instead of JSON
    #[arg(long, env = "LOG_PLAIN")]
    log_plain: bool,
}

impl Settings {
    fn operator_config(&self) -> anyhow::Result<OperatorConfig> {
        let components = if self.components.is_empty() {
            ComponentCatalog::default()
        } else {
            ComponentCatalog::new(self.components.clone())?
        };
        Ok(OperatorConfig {
            operator_namespace: self.operator_namespace.clone(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            default_mesh_version: self.default_mesh_version.clone(),
            cni: CniConfig {
                enabled: self.cni_enabled,
                network_names: self.cni_networks.iter().cloned().collect::<BTreeMap<_, _>>(),
            },
            components,
            multitenant_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(self.multitenant_poll_initial_ms),
                steps: self.multitenant_poll_steps,
                ..Default::default()
            },
            requeue: RequeueConfig {
                reconciled: Duration::from_secs(self.requeue_seconds),
                on_error: Duration::from_secs(self.error_requeue_seconds),
                ..Default::default()
            },
        })
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn parse_component(raw: &str) -> Result<ComponentDef, String> {
    let (name, deps) = raw.split_once('=').unwrap_or((raw, ""));
    if name.is_empty() {
        return Err(format!("missing component name in {raw:?}"));
    }
    let deps: Vec<&str> = deps.split('+').filter(|d| !d.is_empty()).collect();
    Ok(ComponentDef::new(name, &deps))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let smcp = serde_yaml::to_string(&ServiceMeshControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let smmr = serde_yaml::to_string(&ServiceMeshMemberRoll::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{smcp}---\n{smmr}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: if cli.settings.log_plain {
            LogFormat::Plain
        } else {
            LogFormat::Json
        },
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.settings).await,
    }
}

async fn run_controller(settings: &Settings) -> anyhow::Result<()> {
    let config = Arc::new(settings.operator_config()?);
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let renderer = Arc::new(DirectoryRenderer::new(settings.manifests_dir.clone()));

    tracing::info!(
        version = %config.operator_version,
        namespace = %config.operator_namespace,
        cni = config.cni.enabled,
        "Starting mesh operator controllers:"
    );
    let controllers = vec![
        build_control_plane_controller(client.clone(), store.clone(), renderer, config.clone()),
        build_member_roll_controller(client, store, config),
    ];
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped");
    Ok(())
}
