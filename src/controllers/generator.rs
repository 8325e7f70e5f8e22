use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, ExecAction,
        HostPathVolumeSource, Pod, PodSpec, Probe, ResourceRequirements, Secret, SecurityContext,
        Service, ServiceSpec, Volume, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
    ByteString,
};
use kube::{api::ObjectMeta, Resource, ResourceExt};
use serde_yaml::{Mapping, Value};

use crate::api::{
    cluster::{Cluster, ClusterSpec, ClusterType},
    sandbox_config::{SandboxConfigSpec, API_SERVER_PORT},
};

use super::{ConfigGenerationError, ConfigGenerationResult};

/// Label tying every child object to its parent cluster.
pub static CLUSTER_LABEL: &str = "cluster";

pub static CONTAINER_NAME: &str = "kind";
pub static RUNNER_IMAGE: &str = "gcr.io/k8s-testimages/krte@sha256:6cae666d578e2ad87f25934efa7b0a907827cf2cd515067c49e6144954b9cb70";

pub static BUNDLE_MOUNT_PATH: &str = "/honk";
pub static KIND_CONFIG_KEY: &str = "kind-config.yaml";
pub static SECRET_SUFFIX: &str = "kubeconfig";

/// Namespace created inside the sandbox as the very last bootstrap step.
/// The readiness probe waits for it.
pub static READY_NAMESPACE: &str = "honk";

pub static BIND_ADDRESS: &str = "0.0.0.0";

static SERVICE_ACCOUNT_SCRIPT_URL: &str = "https://gist.githubusercontent.com/jeefy/81fb5bc9b95898c1492d796a8a27ab10/raw/374f0cf09a6a6eceb5ae982bbd5df39dab7804e5/kubernetes_add_service_account_kubeconfig.sh";
static KIND_BINARY_URL: &str =
    "https://storage.googleapis.com/bentheelder-kind-ci-builds/latest/kind-linux-amd64";
static K3D_INSTALL_URL: &str = "https://raw.githubusercontent.com/rancher/k3d/master/install.sh";

/// User and namespace of the restricted kubeconfig created next to the admin one.
pub static DEFAULT_USER: &str = "kind-user";
pub static DEFAULT_USER_NAMESPACE: &str = "default";

/// Child objects a cluster must own, regenerated on every reconcile.
#[derive(Clone, Debug)]
pub struct DesiredState {
    pub config_map: ConfigMap,
    pub pod: Pod,
    pub service: Service,
}

/// Derive every child object for the cluster. No I/O, deterministic.
pub fn generate(cluster: &Cluster, config: &SandboxConfigSpec) -> ConfigGenerationResult<DesiredState> {
    Ok(DesiredState {
        config_map: cluster.config_map()?,
        pod: cluster.pod(),
        service: cluster.service(config),
    })
}

pub fn manifest_key(index: usize) -> String {
    format!("{index}.yaml")
}

/// Pin the kind API server to `0.0.0.0:6443` so it is reachable from outside
/// the pod network namespace. Unknown fields are carried through untouched.
pub fn kind_config(raw: &str) -> ConfigGenerationResult<String> {
    let mut config: Value = serde_yaml::from_str(raw).map_err(ConfigGenerationError::Parse)?;
    if config.is_null() {
        config = Value::Mapping(Mapping::new());
    }

    let root = match &mut config {
        Value::Mapping(root) => root,
        other => return Err(ConfigGenerationError::NotAMapping(yaml_type(other))),
    };
    root.entry("kind".into())
        .or_insert_with(|| Value::from("Cluster"));
    root.entry("apiVersion".into())
        .or_insert_with(|| Value::from("kind.x-k8s.io/v1alpha4"));

    let networking = root
        .entry("networking".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if networking.is_null() {
        *networking = Value::Mapping(Mapping::new());
    }
    let networking = match networking {
        Value::Mapping(networking) => networking,
        other => return Err(ConfigGenerationError::NotAMapping(yaml_type(other))),
    };
    networking.insert("apiServerAddress".into(), Value::from(BIND_ADDRESS));
    networking.insert("apiServerPort".into(), Value::from(API_SERVER_PORT));

    serde_yaml::to_string(&config).map_err(ConfigGenerationError::Serialize)
}

fn yaml_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Shell script run by the sandbox container: bootstrap the nested cluster,
/// apply every extra manifest in list order, then stay alive for exec.
pub fn bootstrap_command(spec: &ClusterSpec) -> String {
    let image = match spec.image.as_str() {
        "" => spec.cluster_type.default_image(),
        image => image,
    };

    let mut command = format!(
        "sleep 5 && curl -sSLo /root/add_sa.sh {SERVICE_ACCOUNT_SCRIPT_URL} && chmod +x /root/add_sa.sh && apt update && apt install -y jq && mkdir -p /root/.kube/ && "
    );

    command += &match spec.cluster_type {
        ClusterType::Kind => format!(
            "curl -sSLo \"${{PATH%%:*}}/kind\" {KIND_BINARY_URL} && chmod +x \"${{PATH%%:*}}/kind\" && kind create cluster --image {image} --config={BUNDLE_MOUNT_PATH}/{KIND_CONFIG_KEY} && "
        ),
        ClusterType::K3s => format!(
            "curl -s {K3D_INSTALL_URL} | bash && k3d create --image {image} --api-port {API_SERVER_PORT} && sleep 30 && cp -ruf $(k3d get-kubeconfig) /root/.kube/config && "
        ),
    };

    command += &format!(
        "sleep 5 && /root/add_sa.sh {DEFAULT_USER} {DEFAULT_USER_NAMESPACE} && sleep 5 && "
    );

    for index in 0..spec.extra_manifests.len() {
        command += &format!(
            "kubectl apply -f {BUNDLE_MOUNT_PATH}/{} && sleep 5 && ",
            manifest_key(index)
        );
    }

    command + &format!("kubectl create ns {READY_NAMESPACE} && sleep infinity")
}

impl Cluster {
    /// Metadata shared by every child: same namespace, parent label, controller owner reference.
    fn child_meta(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.child_namespace()),
            labels: Some([(CLUSTER_LABEL.to_string(), self.name_any())].into()),
            owner_references: Some(self.controller_owner_ref(&()).into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn secret_name(&self) -> String {
        format!("{}-{SECRET_SUFFIX}", self.name_any())
    }

    pub fn config_map(&self) -> ConfigGenerationResult<ConfigMap> {
        let mut data = BTreeMap::new();

        if self.spec.cluster_type == ClusterType::Kind {
            data.insert(
                KIND_CONFIG_KEY.to_string(),
                kind_config(&self.spec.bootstrap_config)?,
            );
        }

        for (index, manifest) in self.spec.extra_manifests.iter().enumerate() {
            data.insert(manifest_key(index), manifest.clone());
        }

        Ok(ConfigMap {
            metadata: self.child_meta(self.name_any()),
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn pod(&self) -> Pod {
        let name = self.name_any();

        let mut metadata = self.child_meta(name.clone());
        let mut labels = self.labels().clone();
        labels.insert(CLUSTER_LABEL.to_string(), name.clone());
        metadata.labels = Some(labels);

        let resources: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), self.spec.cpu.clone()),
            ("memory".to_string(), self.spec.memory.clone()),
        ]
        .into();

        let volume_mounts = vec![
            VolumeMount {
                name: "docker-root".to_string(),
                mount_path: "/var/lib/docker".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "modules".to_string(),
                mount_path: "/lib/modules".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "cgroup".to_string(),
                mount_path: "/sys/fs/cgroup".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "honk".to_string(),
                mount_path: BUNDLE_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        let host_path = |path: &str| HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        };

        let volumes = vec![
            Volume {
                name: "docker-root".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: "modules".to_string(),
                host_path: Some(host_path("/lib/modules")),
                ..Default::default()
            },
            Volume {
                name: "cgroup".to_string(),
                host_path: Some(host_path("/sys/fs/cgroup")),
                ..Default::default()
            },
            Volume {
                name: "honk".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: name.clone(),
                    default_mode: Some(0o777),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        Pod {
            metadata,
            spec: Some(PodSpec {
                automount_service_account_token: Some(false),
                enable_service_links: Some(false),
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(RUNNER_IMAGE.to_string()),
                    command: Some(vec![
                        "wrapper.sh".to_string(),
                        "bash".to_string(),
                        "-c".to_string(),
                        bootstrap_command(&self.spec),
                    ]),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    readiness_probe: Some(Probe {
                        exec: Some(ExecAction {
                            command: Some(
                                ["kubectl", "get", "ns", READY_NAMESPACE]
                                    .map(String::from)
                                    .to_vec(),
                            ),
                        }),
                        initial_delay_seconds: Some(120),
                        timeout_seconds: Some(5),
                        ..Default::default()
                    }),
                    env: Some(vec![EnvVar {
                        name: "DOCKER_IN_DOCKER_ENABLED".to_string(),
                        value: Some("true".to_string()),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(volume_mounts),
                    resources: Some(ResourceRequirements {
                        limits: Some(resources.clone()),
                        requests: Some(resources),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service(&self, config: &SandboxConfigSpec) -> Service {
        Service {
            metadata: self.child_meta(self.name_any()),
            spec: Some(ServiceSpec {
                ports: Some(vec![config.service_port()]),
                selector: Some([(CLUSTER_LABEL.to_string(), self.name_any())].into()),
                type_: Some(config.service_type()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Credential secret holding one kubeconfig document per logical name.
    pub fn secret(&self, credentials: &BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: self.child_meta(self.secret_name()),
            type_: Some("Opaque".to_string()),
            data: Some(
                credentials
                    .iter()
                    .map(|(key, text)| (key.clone(), ByteString(text.clone().into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}
