use k8s_openapi::{
    api::core::v1::ServicePort, apimachinery::pkg::util::intstr::IntOrString,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the single cluster-wide settings object.
pub static SANDBOX_CONFIG_NAME: &str = "kaas-config";

pub static NODE_PORT: &str = "NodePort";
pub static LOAD_BALANCER: &str = "LoadBalancer";

/// Port the sandbox API server listens on inside the pod.
pub const API_SERVER_PORT: i32 = 6443;

/// This provides cluster-wide defaults for sandbox provisioning
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(kind = "SandboxConfig", group = "honk.honk.ci", version = "v1")]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfigSpec {
    /// Service type used to expose sandbox API servers. Defaults to `NodePort`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service_type: Option<String>,

    /// Service port exposing the sandbox API server. Ignored unless `port` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_port: Option<ServicePort>,
}

impl SandboxConfigSpec {
    pub fn service_type(&self) -> String {
        self.default_service_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| NODE_PORT.to_string())
    }

    pub fn service_port(&self) -> ServicePort {
        match &self.default_port {
            Some(port) if port.port != 0 => port.clone(),
            _ => ServicePort {
                name: Some("kube-apiserver".to_string()),
                port: API_SERVER_PORT,
                target_port: Some(IntOrString::Int(API_SERVER_PORT)),
                ..Default::default()
            },
        }
    }
}
