//! Kubernetes pod inventory.

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use super::{DiscoveryError, Workload, WorkloadInventory};

/// Lists pods through the Kubernetes API.
#[derive(Clone)]
pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    /// Connect using the in-cluster or kubeconfig credentials.
    pub async fn try_default() -> Result<Self, DiscoveryError> {
        let client = Client::try_default()
            .await
            .map_err(|e| DiscoveryError::Client(format!("{} (not running in cluster?)", e)))?;
        Ok(Self { client })
    }
}

impl WorkloadInventory for KubeInventory {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Workload>, DiscoveryError> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiscoveryError::List(e.to_string()))?;

        Ok(pods.items.into_iter().map(pod_to_workload).collect())
    }
}

fn pod_to_workload(pod: Pod) -> Workload {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running");

    Workload {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        ready,
        annotations: pod.metadata.annotations.unwrap_or_default(),
    }
}
