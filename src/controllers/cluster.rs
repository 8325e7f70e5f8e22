use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, info, instrument};

use crate::api::cluster::{Cluster, ClusterStatus, CredentialRef};
use crate::{telemetry, Error, Result};

use super::{
    client::SandboxClient,
    controller::Context,
    credentials::{extract, NodeSelector, CREDENTIAL_FILES, DEFAULT_CONFIG, ROOT_CONFIG},
    equivalence::pod_matches,
    generator::generate,
};

/// Progress of a sandbox, as observed at the end of one reconcile pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxPhase {
    /// The cluster object is gone. Children are collected through owner references.
    Missing,
    /// Config bundle and service exist, the pod does not (or is being replaced).
    ConfigBundleReady,
    PodPending,
    PodRunningNotReady,
    PodReady,
    /// Kubeconfigs are stored and the cluster is marked ready.
    CredentialsExtracted,
}

impl Cluster {
    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = self.name_any(), namespace = self.namespace()), err)]
    pub async fn reconcile(self: Arc<Self>, ctx: Arc<Context>) -> Result<Action> {
        let _timer = ctx.metrics.count_and_measure();
        ctx.diagnostics.write().await.last_event = Utc::now();
        debug!("Reconciling");

        let phase = reconcile_sandbox(
            ctx.sandbox.as_ref(),
            ctx.node_selector.as_ref(),
            &self.child_namespace(),
            &self.name_any(),
        )
        .await?;
        info!(?phase, "Reconciled");

        Ok(Action::await_change())
    }
}

/// One pass of the sandbox state machine. Every step reads the live object
/// first and mutates only what differs, so a repeated pass with nothing
/// changed in between performs no writes.
pub async fn reconcile_sandbox(
    client: &dyn SandboxClient,
    selector: &dyn NodeSelector,
    namespace: &str,
    name: &str,
) -> Result<SandboxPhase> {
    let Some(mut cluster) = client.get_cluster(namespace, name).await? else {
        debug!("Cluster not found");
        return Ok(SandboxPhase::Missing);
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("Cluster is being deleted");
        return Ok(SandboxPhase::Missing);
    }

    let config = client
        .fetch_config()
        .await?
        .map(|config| config.spec)
        .unwrap_or_default();
    let desired = generate(&cluster, &config)?;

    let bundle = client.get_config_map(namespace, name).await?;
    let bundle_stale = bundle
        .as_ref()
        .is_some_and(|existing| !same_data(&existing.data, &desired.config_map.data));

    // The pod goes before the bundle is overwritten, so a failed delete is
    // retried while the bundle still reads as stale.
    let pod = client.get_pod(namespace, name).await?;
    let replacing = match &pod {
        Some(pod)
            if pod.metadata.deletion_timestamp.is_none()
                && (bundle_stale || !pod_matches(&desired.pod, pod)) =>
        {
            info!(bundle_stale, "Pod is out of date, deleting it for recreation");
            client.delete_pod(namespace, name).await?;
            true
        }
        _ => false,
    };

    sync_config_map(client, bundle, &desired.config_map).await?;
    let service = sync_service(client, &desired.service).await?;

    let Some(pod) = pod else {
        match client.create_pod(&desired.pod).await {
            Ok(_) | Err(Error::AlreadyExists { .. }) => return Ok(SandboxPhase::PodPending),
            Err(e) => return Err(e),
        }
    };

    if replacing || pod.metadata.deletion_timestamp.is_some() {
        debug!(replacing, "Waiting for the pod to go away");
        return Ok(SandboxPhase::ConfigBundleReady);
    }

    if !is_running(&pod) {
        return Ok(SandboxPhase::PodPending);
    }
    if !primary_container_ready(&pod) {
        return Ok(SandboxPhase::PodRunningNotReady);
    }
    if cluster.is_ready() {
        return Ok(SandboxPhase::CredentialsExtracted);
    }

    debug!(phase = ?SandboxPhase::PodReady, "Extracting credentials");
    let extraction = extract(client, &pod, &service, selector, &CREDENTIAL_FILES).await?;
    let endpoint = extraction.endpoint.clone();
    let credentials = extraction.into_complete()?;
    if credentials.is_empty() {
        return Ok(SandboxPhase::PodReady);
    }
    sync_secret(client, &cluster.secret(&credentials)).await?;

    let secret_name = cluster.secret_name();
    let credential = |key: &str| CredentialRef {
        name: secret_name.clone(),
        key: key.to_string(),
    };
    cluster.status = Some(ClusterStatus {
        ready: true,
        load_balancer_ip: Some(endpoint.to_string()),
        admin_config: Some(credential(ROOT_CONFIG)),
        default_user_config: Some(credential(DEFAULT_CONFIG)),
    });
    client.replace_cluster_status(&cluster).await?;
    info!(%endpoint, "Sandbox is ready");

    Ok(SandboxPhase::CredentialsExtracted)
}

/// Create the config bundle, or overwrite the observed one when its content differs.
async fn sync_config_map(
    client: &dyn SandboxClient,
    observed: Option<ConfigMap>,
    desired: &ConfigMap,
) -> Result<()> {
    match observed {
        None => {
            client.create_config_map(desired).await?;
        }
        Some(existing) if same_data(&existing.data, &desired.data) => {}
        Some(mut existing) => {
            existing.data = desired.data.clone();
            client.replace_config_map(&existing).await?;
        }
    }

    Ok(())
}

/// Services are only ever created. A changed exposure needs a manual delete.
async fn sync_service(client: &dyn SandboxClient, desired: &Service) -> Result<Service> {
    let (namespace, name) = (desired.namespace().unwrap_or_default(), desired.name_any());

    match client.get_service(&namespace, &name).await? {
        Some(existing) => Ok(existing),
        None => client.create_service(desired).await,
    }
}

/// Secrets are replaced by delete then create, never updated in place.
async fn sync_secret(client: &dyn SandboxClient, desired: &Secret) -> Result<()> {
    let (namespace, name) = (desired.namespace().unwrap_or_default(), desired.name_any());

    if let Some(existing) = client.get_secret(&namespace, &name).await? {
        if same_data(&existing.data, &desired.data) {
            return Ok(());
        }
        client.delete_secret(&namespace, &name).await?;
    }
    client.create_secret(desired).await?;

    Ok(())
}

fn same_data<V: PartialEq>(a: &Option<BTreeMap<String, V>>, b: &Option<BTreeMap<String, V>>) -> bool {
    let empty = BTreeMap::new();
    a.as_ref().unwrap_or(&empty) == b.as_ref().unwrap_or(&empty)
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

fn primary_container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .is_some_and(|status| status.ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::sandbox_config::{SandboxConfig, SandboxConfigSpec, SANDBOX_CONFIG_NAME};
    use crate::controllers::{
        client::{ExecOutput, MockSandboxClient},
        credentials::FirstNodeSelector,
        generator::tests::sample_cluster,
        RemoteExecError,
    };
    use k8s_openapi::{
        api::core::v1::{
            ContainerStatus, LoadBalancerIngress, LoadBalancerStatus, Node, NodeAddress,
            NodeStatus, PodStatus, ServicePort, ServiceStatus,
        },
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
    };
    use std::sync::Mutex;

    /// In-memory object store backing the mock client.
    #[derive(Default)]
    struct Store {
        cluster: Option<Cluster>,
        config_map: Option<ConfigMap>,
        service: Option<Service>,
        pod: Option<Pod>,
        secret: Option<Secret>,
        config: Option<SandboxConfig>,
        failing_exec: bool,
        failing_delete: bool,
        mutations: Vec<&'static str>,
    }

    type Shared = Arc<Mutex<Store>>;

    fn store(cluster: Cluster) -> Shared {
        Arc::new(Mutex::new(Store {
            cluster: Some(cluster),
            ..Default::default()
        }))
    }

    fn mutations(store: &Shared) -> Vec<&'static str> {
        std::mem::take(&mut store.lock().unwrap().mutations)
    }

    fn kubeconfig(path: &str) -> String {
        format!("# {path}\nclusters:\n- cluster:\n    server: https://0.0.0.0:6443\n")
    }

    fn worker() -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: "192.168.0.10".to_string(),
                    },
                    NodeAddress {
                        type_: "ExternalIP".to_string(),
                        address: "10.0.0.5".to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mark_ready(store: &Shared) {
        let mut store = store.lock().unwrap();
        let pod = store.pod.as_mut().unwrap();
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "kind".to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    /// Mock client whose every operation reads and writes `store`.
    fn backed_by(store: &Shared) -> MockSandboxClient {
        let mut client = MockSandboxClient::new();

        let s = store.clone();
        client
            .expect_get_cluster()
            .returning(move |_, _| Ok(s.lock().unwrap().cluster.clone()));
        let s = store.clone();
        client.expect_replace_cluster_status().returning(move |cluster| {
            let mut s = s.lock().unwrap();
            s.mutations.push("replace cluster status");
            s.cluster = Some(cluster.clone());
            Ok(cluster.clone())
        });
        let s = store.clone();
        client
            .expect_fetch_config()
            .returning(move || Ok(s.lock().unwrap().config.clone()));

        let s = store.clone();
        client
            .expect_get_config_map()
            .returning(move |_, _| Ok(s.lock().unwrap().config_map.clone()));
        let s = store.clone();
        client.expect_create_config_map().returning(move |cm| {
            let mut s = s.lock().unwrap();
            s.mutations.push("create config map");
            s.config_map = Some(cm.clone());
            Ok(cm.clone())
        });
        let s = store.clone();
        client.expect_replace_config_map().returning(move |cm| {
            let mut s = s.lock().unwrap();
            s.mutations.push("replace config map");
            s.config_map = Some(cm.clone());
            Ok(cm.clone())
        });

        let s = store.clone();
        client
            .expect_get_service()
            .returning(move |_, _| Ok(s.lock().unwrap().service.clone()));
        let s = store.clone();
        client.expect_create_service().returning(move |svc| {
            let mut s = s.lock().unwrap();
            s.mutations.push("create service");
            let mut created = svc.clone();
            let spec = created.spec.as_mut().unwrap();
            if spec.type_.as_deref() == Some("LoadBalancer") {
                created.status = Some(ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            ip: Some("34.1.2.3".to_string()),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                });
            } else {
                spec.ports.as_mut().unwrap()[0].node_port = Some(31443);
            }
            s.service = Some(created.clone());
            Ok(created)
        });

        let s = store.clone();
        client
            .expect_get_pod()
            .returning(move |_, _| Ok(s.lock().unwrap().pod.clone()));
        let s = store.clone();
        client.expect_create_pod().returning(move |pod| {
            let mut s = s.lock().unwrap();
            s.mutations.push("create pod");
            s.pod = Some(pod.clone());
            Ok(pod.clone())
        });
        let s = store.clone();
        client.expect_delete_pod().returning(move |_, name| {
            let mut s = s.lock().unwrap();
            if s.failing_delete {
                return Err(Error::Conflict {
                    kind: "Pod".to_string(),
                    name: name.to_string(),
                });
            }
            s.mutations.push("delete pod");
            s.pod = None;
            Ok(())
        });

        let s = store.clone();
        client
            .expect_get_secret()
            .returning(move |_, _| Ok(s.lock().unwrap().secret.clone()));
        let s = store.clone();
        client.expect_create_secret().returning(move |secret| {
            let mut s = s.lock().unwrap();
            s.mutations.push("create secret");
            s.secret = Some(secret.clone());
            Ok(secret.clone())
        });
        let s = store.clone();
        client.expect_delete_secret().returning(move |_, _| {
            let mut s = s.lock().unwrap();
            s.mutations.push("delete secret");
            s.secret = None;
            Ok(())
        });

        client.expect_list_nodes().returning(|| Ok(vec![worker()]));
        let s = store.clone();
        client.expect_exec().returning(move |_, _, _, command| {
            if s.lock().unwrap().failing_exec {
                return Err(RemoteExecError::Failed {
                    command: command.join(" "),
                    message: "command terminated with non-zero exit code".to_string(),
                    stderr: format!("cat: {}: No such file or directory", command[1]),
                });
            }
            Ok(ExecOutput {
                stdout: kubeconfig(&command[1]).into_bytes(),
                stderr: vec![],
            })
        });

        client
    }

    async fn run(client: &MockSandboxClient) -> Result<SandboxPhase> {
        reconcile_sandbox(client, &FirstNodeSelector, "sandboxes", "demo").await
    }

    #[tokio::test]
    async fn missing_cluster_is_a_no_op() {
        let mut client = MockSandboxClient::new();
        client.expect_get_cluster().returning(|_, _| Ok(None));

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::Missing);
    }

    #[tokio::test]
    async fn deleting_cluster_is_left_to_garbage_collection() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mutations(&store);

        {
            let mut store = store.lock().unwrap();
            store.cluster.as_mut().unwrap().metadata.deletion_timestamp = Some(Time(Utc::now()));
            store.pod = None;
            store.config_map = None;
        }

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::Missing);
        assert!(mutations(&store).is_empty());
    }

    #[tokio::test]
    async fn first_sight_creates_children() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::PodPending);
        assert_eq!(
            mutations(&store),
            ["create config map", "create service", "create pod"]
        );

        // Pod not scheduled yet: nothing to do.
        assert_eq!(run(&client).await.unwrap(), SandboxPhase::PodPending);
        assert!(mutations(&store).is_empty());
    }

    #[tokio::test]
    async fn ready_pod_yields_credentials() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mutations(&store);

        mark_ready(&store);
        assert_eq!(run(&client).await.unwrap(), SandboxPhase::CredentialsExtracted);
        assert_eq!(mutations(&store), ["create secret", "replace cluster status"]);

        let store = store.lock().unwrap();
        let status = store.cluster.as_ref().unwrap().status.clone().unwrap();
        assert!(status.ready);
        assert_eq!(status.load_balancer_ip.as_deref(), Some("10.0.0.5:31443"));
        assert_eq!(
            status.admin_config,
            Some(CredentialRef {
                name: "demo-kubeconfig".to_string(),
                key: "root-config".to_string()
            })
        );
        assert_eq!(status.default_user_config.unwrap().key, "default-config");

        let data = store.secret.as_ref().unwrap().data.clone().unwrap();
        let root = String::from_utf8(data["root-config"].0.clone()).unwrap();
        assert!(root.contains("server: https://10.0.0.5:31443"));
        assert!(!root.contains("0.0.0.0"));
        assert!(data.contains_key("default-config"));
    }

    #[tokio::test]
    async fn steady_state_is_idempotent() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mark_ready(&store);
        run(&client).await.unwrap();
        mutations(&store);

        for _ in 0..2 {
            assert_eq!(run(&client).await.unwrap(), SandboxPhase::CredentialsExtracted);
            assert!(mutations(&store).is_empty());
        }
    }

    #[tokio::test]
    async fn cpu_drift_deletes_then_recreates_pod() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mark_ready(&store);
        run(&client).await.unwrap();
        mutations(&store);

        store.lock().unwrap().cluster.as_mut().unwrap().spec.cpu = Quantity("1".to_string());

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::ConfigBundleReady);
        assert_eq!(mutations(&store), ["delete pod"]);
        assert!(store.lock().unwrap().cluster.as_ref().unwrap().is_ready());

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::PodPending);
        assert_eq!(mutations(&store), ["create pod"]);

        let store = store.lock().unwrap();
        let limits = store.pod.as_ref().unwrap().spec.as_ref().unwrap().containers[0]
            .resources
            .clone()
            .unwrap()
            .limits
            .unwrap();
        assert_eq!(limits["cpu"], Quantity("1".to_string()));
    }

    #[tokio::test]
    async fn bundle_change_replaces_config_and_pod() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mutations(&store);

        store
            .lock()
            .unwrap()
            .cluster
            .as_mut()
            .unwrap()
            .spec
            .bootstrap_config
            .push_str("- role: worker\n");

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::ConfigBundleReady);
        assert_eq!(mutations(&store), ["delete pod", "replace config map"]);

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::PodPending);
        assert_eq!(mutations(&store), ["create pod"]);
    }

    #[tokio::test]
    async fn failed_pod_delete_keeps_the_old_bundle() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mutations(&store);

        {
            let mut store = store.lock().unwrap();
            let cluster = store.cluster.as_mut().unwrap();
            cluster.spec.bootstrap_config.push_str("- role: worker\n");
            store.failing_delete = true;
        }

        assert!(matches!(
            run(&client).await,
            Err(Error::Conflict { kind, .. }) if kind == "Pod"
        ));
        assert!(mutations(&store).is_empty());

        // The bundle still differs, so the next pass retries the replacement.
        store.lock().unwrap().failing_delete = false;
        assert_eq!(run(&client).await.unwrap(), SandboxPhase::ConfigBundleReady);
        assert_eq!(mutations(&store), ["delete pod", "replace config map"]);
    }

    #[tokio::test]
    async fn load_balancer_config_reaches_status() {
        let store = store(sample_cluster("demo"));
        store.lock().unwrap().config = Some(SandboxConfig::new(
            SANDBOX_CONFIG_NAME,
            SandboxConfigSpec {
                default_service_type: Some("LoadBalancer".to_string()),
                default_port: Some(ServicePort {
                    port: 443,
                    ..Default::default()
                }),
            },
        ));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mark_ready(&store);

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::CredentialsExtracted);

        let store = store.lock().unwrap();
        let service = store.service.as_ref().unwrap().spec.clone().unwrap();
        assert_eq!(service.type_.as_deref(), Some("LoadBalancer"));

        let status = store.cluster.as_ref().unwrap().status.clone().unwrap();
        assert_eq!(status.load_balancer_ip.as_deref(), Some("34.1.2.3:443"));

        let data = store.secret.as_ref().unwrap().data.clone().unwrap();
        let root = String::from_utf8(data["root-config"].0.clone()).unwrap();
        assert!(root.contains("server: https://34.1.2.3:443"));
    }

    #[tokio::test]
    async fn terminating_pod_is_left_alone() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mutations(&store);

        {
            let mut store = store.lock().unwrap();
            store.cluster.as_mut().unwrap().spec.cpu = Quantity("2".to_string());
            store.pod.as_mut().unwrap().metadata.deletion_timestamp = Some(Time(Utc::now()));
        }

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::ConfigBundleReady);
        assert!(mutations(&store).is_empty());
    }

    #[tokio::test]
    async fn changed_credentials_replace_the_secret() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mark_ready(&store);

        let stale = sample_cluster("demo").secret(&[("root-config".to_string(), "old".to_string())].into());
        store.lock().unwrap().secret = Some(stale);

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::CredentialsExtracted);
        assert_eq!(
            mutations(&store),
            [
                "create config map",
                "create service",
                "create pod",
                "delete secret",
                "create secret",
                "replace cluster status"
            ]
        );
    }

    #[tokio::test]
    async fn existing_pod_on_create_is_success() {
        let cluster = sample_cluster("demo");
        let config_map = cluster.config_map().unwrap();
        let service = cluster.service(&Default::default());

        let mut client = MockSandboxClient::new();
        client
            .expect_get_cluster()
            .returning(move |_, _| Ok(Some(cluster.clone())));
        client.expect_fetch_config().returning(|| Ok(None));
        client
            .expect_get_config_map()
            .returning(move |_, _| Ok(Some(config_map.clone())));
        client
            .expect_get_service()
            .returning(move |_, _| Ok(Some(service.clone())));
        client.expect_get_pod().returning(|_, _| Ok(None));
        client.expect_create_pod().times(1).returning(|_| {
            Err(Error::AlreadyExists {
                kind: "Pod".to_string(),
                name: "demo".to_string(),
            })
        });

        assert_eq!(run(&client).await.unwrap(), SandboxPhase::PodPending);
    }

    #[tokio::test]
    async fn conflict_is_surfaced() {
        let mut cluster = sample_cluster("demo");
        cluster.spec.extra_manifests.clear();
        let stale = sample_cluster("demo").config_map().unwrap();

        let mut client = MockSandboxClient::new();
        client
            .expect_get_cluster()
            .returning(move |_, _| Ok(Some(cluster.clone())));
        client.expect_fetch_config().returning(|| Ok(None));
        client
            .expect_get_config_map()
            .returning(move |_, _| Ok(Some(stale.clone())));
        client.expect_get_pod().returning(|_, _| Ok(None));
        client.expect_replace_config_map().times(1).returning(|cm| {
            Err(Error::Conflict {
                kind: "ConfigMap".to_string(),
                name: cm.name_any(),
            })
        });

        assert!(matches!(
            run(&client).await,
            Err(Error::Conflict { kind, .. }) if kind == "ConfigMap"
        ));
    }

    #[tokio::test]
    async fn generation_error_blocks_reconcile() {
        let mut cluster = sample_cluster("demo");
        cluster.spec.bootstrap_config = "- not a mapping".to_string();

        let mut client = MockSandboxClient::new();
        client
            .expect_get_cluster()
            .returning(move |_, _| Ok(Some(cluster.clone())));
        client.expect_fetch_config().returning(|| Ok(None));

        assert!(matches!(run(&client).await, Err(Error::ConfigGeneration(_))));
    }

    #[tokio::test]
    async fn failed_extraction_persists_nothing() {
        let store = store(sample_cluster("demo"));
        let client = backed_by(&store);
        run(&client).await.unwrap();
        mark_ready(&store);
        mutations(&store);

        store.lock().unwrap().failing_exec = true;

        assert!(matches!(run(&client).await, Err(Error::RemoteExec(_))));
        assert!(mutations(&store).is_empty());

        let store = store.lock().unwrap();
        assert!(store.secret.is_none());
        assert!(!store.cluster.as_ref().unwrap().is_ready());
    }
}
