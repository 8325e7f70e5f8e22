use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::{Api, ListParams},
    Client, CustomResource, ResourceExt as _,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster describes a nested kind/k3s sandbox running inside a single privileged pod.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "honk.honk.ci",
    version = "v1",
    namespaced,
    status = "ClusterStatus",
    shortname = "kaas",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".status.loadBalancerIP"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Bootstrapper used to create the sandbox.
    #[serde(default)]
    pub cluster_type: ClusterType,

    /// Bootstrapper configuration text. The API server bind address is always
    /// pinned to `0.0.0.0:6443`.
    #[serde(default, rename = "kindSpec")]
    pub bootstrap_config: String,

    /// Manifests applied inside the sandbox once it is up, in list order.
    #[serde(default, rename = "clusterYAML")]
    pub extra_manifests: Vec<String>,

    /// Node image override. Empty selects the default for the cluster type.
    #[serde(default)]
    pub image: String,

    pub cpu: Quantity,

    pub memory: Quantity,

    #[serde(default, rename = "clusterSource", skip_serializing_if = "Option::is_none")]
    pub source: Option<ClusterSource>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    Kind,
    K3s,
}

impl ClusterType {
    pub fn default_image(&self) -> &'static str {
        match self {
            ClusterType::Kind => "kindest/node:v1.18.0",
            ClusterType::K3s => "rancher/k3s:v1.18.2-rc1-k3s1",
        }
    }
}

/// External manifest source to sync from instead of inline manifests.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_source: Option<SourceUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_source: Option<SourceUrl>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct SourceUrl {
    pub url: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Set once the sandbox answered its readiness probe and credentials were harvested.
    #[serde(default)]
    pub ready: bool,

    /// Externally reachable API server endpoint, `address[:port]`.
    #[serde(default, rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_config: Option<CredentialRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user_config: Option<CredentialRef>,
}

/// Points at one kubeconfig document stored in the cluster credential secret.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct CredentialRef {
    pub name: String,
    pub key: String,
}

impl Cluster {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.ready)
    }

    /// Namespace every child object of this cluster lives in.
    pub fn child_namespace(&self) -> String {
        self.namespace().unwrap_or_else(|| String::from("default"))
    }
}

/// Read-only listing of sandbox clusters, across all namespaces when none is given.
pub async fn list_clusters(client: Client, namespace: Option<&str>) -> kube::Result<Vec<Cluster>> {
    let api: Api<Cluster> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    Ok(api.list(&ListParams::default()).await?.items)
}
