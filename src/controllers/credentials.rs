//! Kubeconfig harvesting from a running sandbox.
//!
//! The sandbox writes kubeconfigs pointing at `0.0.0.0:6443`, an address that
//! only makes sense inside the pod. Files are read over a remote exec channel
//! and the endpoint is rewritten to the address the exposing service is
//! reachable at from outside.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::ResourceExt;
use rand::{rngs::SmallRng, Rng as _, SeedableRng as _};
use tracing::{debug, info, warn};

use crate::api::sandbox_config::{API_SERVER_PORT, LOAD_BALANCER, NODE_PORT};
use crate::Result;

use super::{
    client::SandboxClient,
    generator::{BIND_ADDRESS, CONTAINER_NAME},
    RemoteExecError, RemoteExecResult,
};

pub const ROOT_CONFIG: &str = "root-config";
pub const DEFAULT_CONFIG: &str = "default-config";

/// Kubeconfig files harvested from every sandbox, keyed by logical name.
pub const CREDENTIAL_FILES: [(&str, &str); 2] = [
    (ROOT_CONFIG, "/root/.kube/config"),
    (DEFAULT_CONFIG, "/tmp/kube/k8s-kind-user-default-conf"),
];

/// Default seed for node selection.
pub const DEFAULT_NODE_SEED: u64 = 112358;

/// Externally reachable address of a sandbox API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    /// Port replacing the in-pod `6443`. `None` rewrites the address only.
    pub port: Option<i32>,
}

impl Endpoint {
    pub fn loopback() -> Self {
        Self {
            address: BIND_ADDRESS.to_string(),
            port: None,
        }
    }

    /// Replace the in-pod endpoint in `text`. Plain substring replacement,
    /// independent of the kubeconfig schema.
    pub fn rewrite(&self, text: &str) -> String {
        match self.port {
            Some(port) => text.replace(
                &format!("{BIND_ADDRESS}:{API_SERVER_PORT}"),
                &format!("{}:{port}", self.address),
            ),
            None => text.replace(BIND_ADDRESS, &self.address),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// Picks the node whose address is used to reach a node-port service.
/// Nodes are interchangeable for this purpose.
pub trait NodeSelector: Send + Sync {
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node>;
}

/// Always the first listed node.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstNodeSelector;

impl NodeSelector for FirstNodeSelector {
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        nodes.first()
    }
}

/// Uniformly random node. Each selection restarts from the seed, so the same
/// node list always yields the same node.
#[derive(Clone, Copy, Debug)]
pub struct RandomNodeSelector {
    seed: u64,
}

impl RandomNodeSelector {
    pub fn seeded(seed: u64) -> Self {
        Self { seed }
    }
}

impl NodeSelector for RandomNodeSelector {
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        if nodes.is_empty() {
            return None;
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        nodes.get(rng.gen_range(0..nodes.len()))
    }
}

/// Ingress address of a load-balancer service with its declared port.
pub fn load_balancer_endpoint(service: &Service) -> Option<Endpoint> {
    let spec = service.spec.as_ref()?;
    if spec.type_.as_deref() != Some(LOAD_BALANCER) {
        return None;
    }
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;

    Some(Endpoint {
        address: ingress.ip.clone().or_else(|| ingress.hostname.clone())?,
        port: Some(spec.ports.as_ref()?.first()?.port),
    })
}

fn is_node_port(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .is_some_and(|spec| spec.type_.as_deref() == Some(NODE_PORT))
}

fn assigned_node_port(service: &Service) -> Option<i32> {
    service.spec.as_ref()?.ports.as_ref()?.first()?.node_port
}

/// External address of a node, falling back to its internal address.
pub fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    let find = |kind: &str| {
        addresses
            .iter()
            .find(|a| a.type_ == kind && !a.address.is_empty())
            .map(|a| a.address.clone())
    };

    find("ExternalIP").or_else(|| find("InternalIP"))
}

/// Endpoint through a node-port service on a node chosen by `selector`.
/// Only nodes reporting an address are offered to the selector.
pub fn node_port_endpoint(
    service: &Service,
    nodes: &[Node],
    selector: &dyn NodeSelector,
) -> Option<Endpoint> {
    let port = assigned_node_port(service)?;
    let addressable: Vec<Node> = nodes
        .iter()
        .filter(|node| node_address(node).is_some())
        .cloned()
        .collect();
    let node = selector.select(&addressable)?;

    Some(Endpoint {
        address: node_address(node)?,
        port: Some(port),
    })
}

/// Work out where the sandbox API server is reachable from outside the pod.
pub async fn resolve_endpoint(
    client: &dyn SandboxClient,
    service: &Service,
    selector: &dyn NodeSelector,
) -> Result<Endpoint> {
    if let Some(endpoint) = load_balancer_endpoint(service) {
        info!(%endpoint, "Using load balancer ingress");
        return Ok(endpoint);
    }

    if is_node_port(service) {
        let nodes = client.list_nodes().await?;
        if let Some(endpoint) = node_port_endpoint(service, &nodes, selector) {
            info!(%endpoint, "Using node port");
            return Ok(endpoint);
        }
        warn!(nodes = nodes.len(), "No addressable node for node port service");
    }

    Ok(Endpoint::loopback())
}

/// Result of one extraction pass. Each file succeeds or fails on its own.
#[derive(Debug)]
pub struct Extraction {
    pub endpoint: Endpoint,
    pub files: BTreeMap<String, RemoteExecResult<String>>,
}

impl Extraction {
    /// All rewritten files, or the first failure.
    pub fn into_complete(self) -> RemoteExecResult<BTreeMap<String, String>> {
        self.files
            .into_iter()
            .map(|(name, text)| text.map(|text| (name, text)))
            .collect()
    }
}

/// Read `path` from the sandbox container.
pub async fn cat_file(client: &dyn SandboxClient, pod: &Pod, path: &str) -> RemoteExecResult<String> {
    let namespace = pod.namespace().unwrap_or_default();
    let output = client
        .exec(
            &namespace,
            &pod.name_any(),
            CONTAINER_NAME,
            vec!["cat".to_string(), path.to_string()],
        )
        .await?;

    if !output.stderr.is_empty() {
        debug!(path, stderr = %String::from_utf8_lossy(&output.stderr), "Exec wrote to stderr");
    }

    String::from_utf8(output.stdout).map_err(|_| RemoteExecError::Encoding {
        path: path.to_string(),
    })
}

/// Harvest `files` (logical name, path) from the sandbox pod, rewriting the
/// in-pod endpoint to the one reachable through `service`.
pub async fn extract(
    client: &dyn SandboxClient,
    pod: &Pod,
    service: &Service,
    selector: &dyn NodeSelector,
    files: &[(&str, &str)],
) -> Result<Extraction> {
    let endpoint = resolve_endpoint(client, service, selector).await?;

    let mut extracted = BTreeMap::new();
    for (name, path) in files {
        debug!(name, path, "Reading credential file");
        let text = cat_file(client, pod, path)
            .await
            .map(|text| endpoint.rewrite(&text));
        if let Err(e) = &text {
            warn!(name, path, error = %e, "Credential extraction failed");
        }
        extracted.insert(name.to_string(), text);
    }

    Ok(Extraction {
        endpoint,
        files: extracted,
    })
}
