//! Network isolation strategies
//!
//! How a namespace joins a mesh at the network level depends on the
//! cluster's network plugin. The plugin is probed once per pass and mapped
//! to one [`NetworkingStrategy`]:
//!
//! | plugin | strategy |
//! |---|---|
//! | no cluster network configuration | no-op |
//! | `*-subnet` (flat network) | no-op |
//! | `*-multitenant` | [`MultitenantStrategy`] (VNID join / isolate) |
//! | `*-networkpolicy`, anything else | [`NetworkPolicyStrategy`] |

mod multitenant;
mod network_policy;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use mesh_common::config::BackoffConfig;
use mesh_common::store::ObjectStore;
use mesh_common::{Error, ResourceKey};

pub use multitenant::MultitenantStrategy;
pub use network_policy::NetworkPolicyStrategy;

/// apiVersion of the OpenShift SDN configuration kinds
pub const NETWORK_API_VERSION: &str = "network.openshift.io/v1";

/// Network-level membership of a namespace
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkingStrategy: Send + Sync {
    /// Let `namespace` talk to the mesh in `mesh_namespace`
    async fn reconcile_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error>;

    /// Undo [`NetworkingStrategy::reconcile_namespace`]
    async fn remove_namespace(&self, mesh_namespace: &str, namespace: &str) -> Result<(), Error>;
}

/// Flat networking: there is no isolation boundary to manage
pub struct NoOpStrategy;

#[async_trait]
impl NetworkingStrategy for NoOpStrategy {
    async fn reconcile_namespace(&self, _mesh_namespace: &str, _namespace: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn remove_namespace(&self, _mesh_namespace: &str, _namespace: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Cluster network plugin families
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkPlugin {
    /// No cluster network configuration
    Absent,
    /// Flat network
    Subnet,
    /// Per-namespace VNIDs
    Multitenant,
    /// NetworkPolicy enforcement
    NetworkPolicy,
}

impl NetworkPlugin {
    /// Classify a `pluginName` value
    pub fn from_plugin_name(name: &str) -> Self {
        if name.is_empty() {
            NetworkPlugin::Absent
        } else if name.ends_with("-subnet") {
            NetworkPlugin::Subnet
        } else if name.ends_with("-multitenant") {
            NetworkPlugin::Multitenant
        } else {
            NetworkPlugin::NetworkPolicy
        }
    }
}

/// Read the plugin from the `default` ClusterNetwork
pub async fn probe_network_plugin(store: &dyn ObjectStore) -> Result<NetworkPlugin, Error> {
    let key = ResourceKey::new("", "default", NETWORK_API_VERSION, "ClusterNetwork");
    let plugin = match store.get(&key).await {
        Ok(Some(doc)) => NetworkPlugin::from_plugin_name(doc.get_str(&["pluginName"]).unwrap_or_default()),
        Ok(None) => NetworkPlugin::Absent,
        Err(e) if e.is_kind_not_registered() => {
            debug!("ClusterNetwork kind not served, assuming no network plugin");
            NetworkPlugin::Absent
        }
        Err(e) => return Err(e.context("probing cluster network plugin")),
    };
    Ok(plugin)
}

/// Strategy for a probed plugin
pub fn strategy_for(
    plugin: NetworkPlugin,
    store: Arc<dyn ObjectStore>,
    backoff: &BackoffConfig,
) -> Arc<dyn NetworkingStrategy> {
    info!(?plugin, "selected networking strategy");
    match plugin {
        NetworkPlugin::Absent | NetworkPlugin::Subnet => Arc::new(NoOpStrategy),
        NetworkPlugin::Multitenant => Arc::new(MultitenantStrategy::new(store, backoff.clone())),
        NetworkPlugin::NetworkPolicy => Arc::new(NetworkPolicyStrategy::new(store)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_common::store::MemoryStore;
    use mesh_common::DynamicDocument;

    #[test]
    fn plugin_names_map_to_families() {
        use NetworkPlugin::*;
        assert_eq!(NetworkPlugin::from_plugin_name("redhat/openshift-ovs-subnet"), Subnet);
        assert_eq!(
            NetworkPlugin::from_plugin_name("redhat/openshift-ovs-multitenant"),
            Multitenant
        );
        assert_eq!(
            NetworkPlugin::from_plugin_name("redhat/openshift-ovs-networkpolicy"),
            NetworkPolicy
        );
        assert_eq!(NetworkPlugin::from_plugin_name("cilium"), NetworkPolicy);
        assert_eq!(NetworkPlugin::from_plugin_name(""), Absent);
    }

    #[tokio::test]
    async fn missing_kind_or_object_means_absent() {
        let store = MemoryStore::with_default_kinds();
        assert_eq!(probe_network_plugin(&store).await.unwrap(), NetworkPlugin::Absent);

        store.register_kind(NETWORK_API_VERSION, "ClusterNetwork", false);
        assert_eq!(probe_network_plugin(&store).await.unwrap(), NetworkPlugin::Absent);
    }

    #[tokio::test]
    async fn probe_reads_plugin_name() {
        let store = MemoryStore::with_default_kinds();
        store.register_kind(NETWORK_API_VERSION, "ClusterNetwork", false);
        let mut network = DynamicDocument::new(NETWORK_API_VERSION, "ClusterNetwork", "", "default");
        network
            .set(&["pluginName"], "redhat/openshift-ovs-multitenant")
            .unwrap();
        store.create(&network).await.unwrap();

        assert_eq!(
            probe_network_plugin(&store).await.unwrap(),
            NetworkPlugin::Multitenant
        );
    }
}
