use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Node, ObjectReference, Pod, Secret, Service},
    NamespaceResourceScope,
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, PostParams},
    runtime::events::{Event, EventType, Recorder},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncReadExt as _;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::api::{
    cluster::Cluster,
    sandbox_config::{SandboxConfig, SANDBOX_CONFIG_NAME},
};
use crate::{Error, Result};

use super::{RemoteExecError, RemoteExecResult};

/// Captured output of a finished remote command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Object store and exec operations the sandbox reconciler depends on.
///
/// Missing objects are reported as `None`, never as errors. Stale updates fail
/// with [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Persist `cluster.status`, guarded by the carried resourceVersion.
    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster>;

    /// Fetch the cluster-wide settings object, if one exists.
    async fn fetch_config(&self) -> Result<Option<SandboxConfig>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Run `command` in `container` and capture its whole output.
    ///
    /// A non-zero exit is reported as [`RemoteExecError::Failed`] with the captured stderr.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> RemoteExecResult<ExecOutput>;
}

/// [`SandboxClient`] backed by the Kubernetes API.
///
/// Every mutation is recorded as a Kubernetes event on the touched object.
#[derive(Clone)]
pub struct KubeSandboxClient {
    client: Client,
    recorder: Recorder,
}

impl KubeSandboxClient {
    pub fn new(client: Client, recorder: Recorder) -> Self {
        Self { client, recorder }
    }

    fn api<R>(&self, namespace: &str) -> Api<R>
    where
        R: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<R>(&self, namespace: &str, name: &str) -> Result<Option<R>>
    where
        R: Clone + DeserializeOwned + Debug,
        R: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        self.api::<R>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::request(R::kind(&()), name, e))
    }

    async fn create<R>(&self, res: &R) -> Result<R>
    where
        R: Clone + Serialize + DeserializeOwned + Debug,
        R: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let (name, namespace) = (res.name_any(), res.namespace().unwrap_or_default());
        let created = self
            .api::<R>(&namespace)
            .create(&PostParams::default(), res)
            .await
            .map_err(|e| Error::request(R::kind(&()), &name, e))?;

        info!(kind = %R::kind(&()), %name, %namespace, "Created object");
        self.publish(res, "Created", "Creating").await?;

        Ok(created)
    }

    async fn replace<R>(&self, res: &R) -> Result<R>
    where
        R: Clone + Serialize + DeserializeOwned + Debug,
        R: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let (name, namespace) = (res.name_any(), res.namespace().unwrap_or_default());
        let replaced = self
            .api::<R>(&namespace)
            .replace(&name, &PostParams::default(), res)
            .await
            .map_err(|e| Error::request(R::kind(&()), &name, e))?;

        info!(kind = %R::kind(&()), %name, %namespace, "Updated object");
        self.publish(res, "Updated", "Updating").await?;

        Ok(replaced)
    }

    async fn delete<R>(&self, namespace: &str, name: &str) -> Result<()>
    where
        R: Clone + DeserializeOwned + Debug,
        R: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self.api::<R>(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(kind = %R::kind(&()), name, namespace, "Object already gone");
                return Ok(());
            }
            Err(e) => return Err(Error::request(R::kind(&()), name, e)),
        }

        info!(kind = %R::kind(&()), name, namespace, "Deleted object");
        let reference = ObjectReference {
            api_version: Some(R::api_version(&()).to_string()),
            kind: Some(R::kind(&()).to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "Deleted".into(),
                    note: Some(format!("Deleted {} `{name}` in `{namespace}`", R::kind(&()))),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &reference,
            )
            .await?;

        Ok(())
    }

    async fn publish<R>(&self, res: &R, reason: &str, action: &str) -> Result<()>
    where
        R: Resource<DynamicType = ()>,
    {
        self.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(format!(
                        "{reason} {} `{}` in `{}`",
                        R::kind(&()),
                        res.name_any(),
                        res.namespace().unwrap_or_default()
                    )),
                    action: action.into(),
                    secondary: None,
                },
                &res.object_ref(&()),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SandboxClient for KubeSandboxClient {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        self.get(namespace, name).await
    }

    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let name = cluster.name_any();
        self.api::<Cluster>(&cluster.child_namespace())
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(cluster)?)
            .await
            .map_err(|e| Error::request("Cluster", name, e))
    }

    async fn fetch_config(&self) -> Result<Option<SandboxConfig>> {
        Api::<SandboxConfig>::all(self.client.clone())
            .get_opt(SANDBOX_CONFIG_NAME)
            .await
            .map_err(|e| Error::request("SandboxConfig", SANDBOX_CONFIG_NAME, e))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get(namespace, name).await
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.create(config_map).await
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.replace(config_map).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.create(service).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get(namespace, name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        self.create(pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Pod>(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get(namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete::<Secret>(namespace, name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::request("Node", "*", e))?
            .items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> RemoteExecResult<ExecOutput> {
        let pods: Api<Pod> = self.api(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        debug!(namespace, pod, container, "Exec command");
        let mut attached = pods.exec(pod, command.clone(), &params).await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or(RemoteExecError::MissingStream("stdout"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or(RemoteExecError::MissingStream("stderr"))?;
        let status = attached.take_status();

        let mut output = ExecOutput::default();
        let (stdout, stderr) = tokio::join!(
            stdout_reader.read_to_end(&mut output.stdout),
            stderr_reader.read_to_end(&mut output.stderr)
        );
        stdout?;
        stderr?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        match status {
            Some(status) if status.status.as_deref() == Some("Success") => Ok(output),
            status => Err(RemoteExecError::Failed {
                command: command.join(" "),
                message: status
                    .and_then(|s| s.message)
                    .unwrap_or_else(|| "exec finished without a status".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}
