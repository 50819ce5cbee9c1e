//! kcp workspace access. Workspaces are handled as dynamic objects of
//! `tenancy.kcp.io/v1alpha1`, addressed through the `/clusters/<path>`
//! endpoint of the configured parent workspace.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_WORKSPACE_TYPE: &str = "kdp-organization";
pub const DEFAULT_WORKSPACE_PATH: &str = "root";
pub const WORKSPACE_READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const WORKSPACE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const KCP_URL_KEY: &str = "kcp-url";
const WORKSPACE_PATH_KEY: &str = "kcp-workspace-path";
const KUBECONFIG_KEY: &str = "kubeconfig";
const READY_PHASE: &str = "Ready";
const MANAGED_BY: &str = "kdp-workspace-operator";

#[derive(Debug, Error)]
pub enum KcpError {
    #[error("failed to get {kind} {namespace}/{name}: {source}")]
    ConfigSource {
        kind: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("kubeconfig not found in secret {namespace}/{name}")]
    MissingKubeconfig { namespace: String, name: String },
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(String),
    #[error("invalid kcp url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to create kcp client: {0}")]
    Client(#[source] kube::Error),
    #[error("workspace name cannot be empty")]
    EmptyName,
    #[error("failed to {operation} workspace {name}: {source}")]
    Request {
        operation: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to encode workspace: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("workspace {0} not found")]
    NotFound(String),
    #[error("workspace {name} not ready after {timeout:?}, current phase: {phase}")]
    NotReady {
        name: String,
        phase: String,
        timeout: Duration,
    },
}

/// Connection settings read from the operator's ConfigMap and Secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KcpConfig {
    pub kcp_url: String,
    pub workspace_path: String,
    pub kubeconfig: Vec<u8>,
}

impl std::fmt::Debug for KcpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpConfig")
            .field("kcp_url", &self.kcp_url)
            .field("workspace_path", &self.workspace_path)
            .field("kubeconfig", &format_args!("<{} bytes>", self.kubeconfig.len()))
            .finish()
    }
}

/// Reads `kcp-url` and `kcp-workspace-path` from the ConfigMap and
/// `kubeconfig` from the Secret, both in `namespace`.
pub async fn load_config_from_cluster(
    client: &Client,
    configmap_name: &str,
    secret_name: &str,
    namespace: &str,
) -> Result<KcpConfig, KcpError> {
    let configmap = Api::<ConfigMap>::namespaced(client.clone(), namespace)
        .get(configmap_name)
        .await
        .map_err(|source| KcpError::ConfigSource {
            kind: "ConfigMap",
            namespace: namespace.to_string(),
            name: configmap_name.to_string(),
            source,
        })?;
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get(secret_name)
        .await
        .map_err(|source| KcpError::ConfigSource {
            kind: "Secret",
            namespace: namespace.to_string(),
            name: secret_name.to_string(),
            source,
        })?;

    config_from_parts(
        configmap.data.unwrap_or_default(),
        secret
            .data
            .unwrap_or_default()
            .remove(KUBECONFIG_KEY)
            .map(|b| b.0),
        namespace,
        secret_name,
    )
}

fn config_from_parts(
    mut data: BTreeMap<String, String>,
    kubeconfig: Option<Vec<u8>>,
    namespace: &str,
    secret_name: &str,
) -> Result<KcpConfig, KcpError> {
    let kubeconfig = kubeconfig
        .filter(|k| !k.is_empty())
        .ok_or_else(|| KcpError::MissingKubeconfig {
            namespace: namespace.to_string(),
            name: secret_name.to_string(),
        })?;
    Ok(KcpConfig {
        kcp_url: data.remove(KCP_URL_KEY).unwrap_or_default(),
        workspace_path: data.remove(WORKSPACE_PATH_KEY).unwrap_or_default(),
        kubeconfig,
    })
}

/// `<host>/clusters/<path>`. Any cluster path already on `host` is replaced.
pub fn cluster_url(host: &str, workspace_path: &str) -> String {
    let host = host.trim_end_matches('/');
    let base = match host.find("/clusters/") {
        Some(idx) => &host[..idx],
        None => host,
    };
    let path = if workspace_path.is_empty() {
        DEFAULT_WORKSPACE_PATH
    } else {
        workspace_path
    };
    format!("{base}/clusters/{path}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub name: String,
    pub url: String,
    pub phase: String,
    pub ready: bool,
}

impl WorkspaceInfo {
    fn from_object(obj: &DynamicObject) -> Self {
        let field = |section: &str, key: &str| {
            obj.data
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let phase = field("status", "phase");
        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            url: field("spec", "URL"),
            ready: phase == READY_PHASE,
            phase,
        }
    }
}

/// Workspace operations in the configured parent workspace.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// `None` when the workspace does not exist.
    async fn get_workspace(&self, name: &str) -> Result<Option<WorkspaceInfo>, KcpError>;

    async fn create_workspace(
        &self,
        name: &str,
        project_namespace: &str,
        project_name: &str,
        workspace_type: &str,
    ) -> Result<WorkspaceInfo, KcpError>;

    /// Deleting a missing workspace succeeds.
    async fn delete_workspace(&self, name: &str) -> Result<(), KcpError>;

    async fn workspace_exists(&self, name: &str) -> Result<bool, KcpError> {
        Ok(self.get_workspace(name).await?.is_some())
    }

    async fn wait_for_workspace_ready(&self, name: &str) -> Result<WorkspaceInfo, KcpError> {
        wait_until_ready(self, name, WORKSPACE_CHECK_INTERVAL, WORKSPACE_READY_TIMEOUT).await
    }
}

/// Polls `name` every `interval`, starting immediately, until it reports
/// Ready or `timeout` passes.
pub async fn wait_until_ready<W: WorkspaceApi + ?Sized>(
    api: &W,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<WorkspaceInfo, KcpError> {
    if name.is_empty() {
        return Err(KcpError::EmptyName);
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(interval);
    let mut last_phase = String::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(KcpError::NotReady {
                    name: name.to_string(),
                    phase: last_phase,
                    timeout,
                });
            }
        }
        let info = api
            .get_workspace(name)
            .await?
            .ok_or_else(|| KcpError::NotFound(name.to_string()))?;
        if info.ready {
            return Ok(info);
        }
        debug!(workspace = name, phase = %info.phase, "workspace not ready yet");
        last_phase = info.phase;
    }
}

pub struct KcpClient {
    api: Api<DynamicObject>,
    workspace_path: String,
}

impl KcpClient {
    /// Builds a client for the parent workspace from `config`. `kcp_url`
    /// overrides the kubeconfig server and the workspace path defaults to
    /// `root`.
    pub async fn new(config: &KcpConfig) -> Result<Self, KcpError> {
        if config.kubeconfig.is_empty() {
            return Err(KcpError::Kubeconfig("kubeconfig cannot be empty".into()));
        }
        let raw = std::str::from_utf8(&config.kubeconfig)
            .map_err(|e| KcpError::Kubeconfig(e.to_string()))?;
        let mut kubeconfig =
            Kubeconfig::from_yaml(raw).map_err(|e| KcpError::Kubeconfig(e.to_string()))?;

        let workspace_path = if config.workspace_path.is_empty() {
            DEFAULT_WORKSPACE_PATH.to_string()
        } else {
            config.workspace_path.clone()
        };
        let mut url = String::new();
        for named in &mut kubeconfig.clusters {
            let Some(cluster) = named.cluster.as_mut() else {
                continue;
            };
            let host = if config.kcp_url.is_empty() {
                cluster.server.clone().unwrap_or_default()
            } else {
                config.kcp_url.clone()
            };
            if host.is_empty() {
                return Err(KcpError::InvalidUrl {
                    url: host,
                    reason: format!("cluster {} has no server", named.name),
                });
            }
            url = cluster_url(&host, &workspace_path);
            cluster.server = Some(url.clone());
        }

        let rest = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| KcpError::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(rest).map_err(KcpError::Client)?;
        info!(cluster = %url, "kcp client configured");
        Ok(Self {
            api: Api::all_with(client, &workspace_resource()),
            workspace_path,
        })
    }

    pub fn workspace_path(&self) -> &str {
        &self.workspace_path
    }
}

fn workspace_resource() -> ApiResource {
    ApiResource {
        group: "tenancy.kcp.io".into(),
        version: "v1alpha1".into(),
        api_version: "tenancy.kcp.io/v1alpha1".into(),
        kind: "Workspace".into(),
        plural: "workspaces".into(),
    }
}

fn workspace_object(
    name: &str,
    project_namespace: &str,
    project_name: &str,
    workspace_type: &str,
) -> Result<DynamicObject, serde_json::Error> {
    let workspace_type = if workspace_type.is_empty() {
        DEFAULT_WORKSPACE_TYPE
    } else {
        workspace_type
    };
    serde_json::from_value(json!({
        "apiVersion": "tenancy.kcp.io/v1alpha1",
        "kind": "Workspace",
        "metadata": {
            "name": name,
            "annotations": {
                "managed-by": MANAGED_BY,
                "project-namespace": project_namespace,
                "project-name": project_name,
            },
        },
        "spec": {
            "type": { "name": workspace_type, "path": DEFAULT_WORKSPACE_PATH },
        },
    }))
}

fn request_err(operation: &'static str, name: &str) -> impl FnOnce(kube::Error) -> KcpError {
    let name = name.to_string();
    move |source| KcpError::Request {
        operation,
        name,
        source,
    }
}

#[async_trait]
impl WorkspaceApi for KcpClient {
    async fn get_workspace(&self, name: &str) -> Result<Option<WorkspaceInfo>, KcpError> {
        if name.is_empty() {
            return Err(KcpError::EmptyName);
        }
        let obj = self
            .api
            .get_opt(name)
            .await
            .map_err(request_err("get", name))?;
        Ok(obj.as_ref().map(WorkspaceInfo::from_object))
    }

    async fn create_workspace(
        &self,
        name: &str,
        project_namespace: &str,
        project_name: &str,
        workspace_type: &str,
    ) -> Result<WorkspaceInfo, KcpError> {
        if name.is_empty() {
            return Err(KcpError::EmptyName);
        }
        let obj = workspace_object(name, project_namespace, project_name, workspace_type)
            .map_err(KcpError::Encode)?;
        let created = self
            .api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(request_err("create", name))?;
        Ok(WorkspaceInfo::from_object(&created))
    }

    async fn delete_workspace(&self, name: &str) -> Result<(), KcpError> {
        if name.is_empty() {
            return Err(KcpError::EmptyName);
        }
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(request_err("delete", name)(e)),
        }
    }
}
