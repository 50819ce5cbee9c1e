//! Controller giving every `Project` its own kcp workspace.
//!
//! The workspace is named after the lowercased Project name. Its name, URL
//! and phase are copied onto the Project as annotations and readiness is
//! reported through the `WorkspaceReady` condition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::apis::{Condition, Project};
use crate::kcp::{self, KcpClient, KcpConfig, KcpError, WorkspaceApi, WorkspaceInfo};
use crate::metrics::OperatorMetrics;

pub const WORKSPACE_READY_CONDITION: &str = "WorkspaceReady";
pub const ANNOTATION_WORKSPACE_NAME: &str = "kdp-workspaces.cncf.io/workspace-name";
pub const ANNOTATION_WORKSPACE_URL: &str = "kdp-workspaces.cncf.io/workspace-url";
pub const ANNOTATION_WORKSPACE_PHASE: &str = "kdp-workspaces.cncf.io/workspace-phase";

const FIELD_MANAGER: &str = "maintainerd-workspaces";
const NOT_READY_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to load kcp configuration: {0}")]
    Configuration(#[source] KcpError),
    #[error("failed to create kcp client: {0}")]
    Connection(#[source] KcpError),
    #[error("failed to check workspace: {0}")]
    WorkspaceCheck(#[source] KcpError),
    #[error("workspace creation failed: {0}")]
    Creation(#[source] KcpError),
    #[error("workspace not ready: {0}")]
    NotReady(#[source] KcpError),
    #[error("failed to update project: {0}")]
    Update(#[source] kube::Error),
}

impl ReconcileError {
    /// Delay before the next attempt.
    pub fn requeue_after(&self) -> Duration {
        match self {
            ReconcileError::Configuration(_)
            | ReconcileError::Connection(_)
            | ReconcileError::WorkspaceCheck(_) => Duration::from_secs(60),
            ReconcileError::Creation(_) | ReconcileError::NotReady(_) => Duration::from_secs(30),
            ReconcileError::Update(_) => Duration::from_secs(15),
        }
    }

    /// Condition reason recorded on the Project, if any.
    fn reason(&self) -> Option<&'static str> {
        match self {
            ReconcileError::Configuration(_) => Some("ConfigurationError"),
            ReconcileError::Connection(_) => Some("KCPConnectionError"),
            ReconcileError::WorkspaceCheck(_) => Some("WorkspaceCheckError"),
            ReconcileError::Creation(_) => Some("CreationFailed"),
            ReconcileError::NotReady(_) | ReconcileError::Update(_) => None,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            ReconcileError::Configuration(_) => "configuration_error",
            ReconcileError::Connection(_) => "connection_error",
            ReconcileError::WorkspaceCheck(_) => "check_error",
            ReconcileError::Creation(_) => "creation_failed",
            ReconcileError::NotReady(_) => "not_ready",
            ReconcileError::Update(_) => "update_error",
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Sets `condition` in `conditions`, replacing any condition of the same
/// type. The transition time only moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if condition.last_transition_time.is_none() {
        condition.last_transition_time = Some(now_rfc3339());
    }
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

fn workspace_condition(status: bool, reason: &str, message: String) -> Condition {
    Condition {
        type_: WORKSPACE_READY_CONDITION.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        ..Default::default()
    }
}

fn info_condition(info: &WorkspaceInfo, generation: Option<i64>) -> Condition {
    let mut condition = if info.ready {
        workspace_condition(
            true,
            "WorkspaceReady",
            format!("Workspace {} is ready at {}", info.name, info.url),
        )
    } else {
        workspace_condition(
            false,
            "WorkspaceNotReady",
            format!("Workspace {} is in phase {}", info.name, info.phase),
        )
    };
    condition.observed_generation = generation;
    condition
}

/// Everything the reconciler touches outside its own logic.
#[async_trait]
pub trait ProjectBackend: Send + Sync {
    async fn kcp_config(&self) -> Result<KcpConfig, KcpError>;

    async fn connect(&self, config: &KcpConfig) -> Result<Arc<dyn WorkspaceApi>, KcpError>;

    async fn annotate(
        &self,
        project: &Project,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error>;

    /// Applies `set_condition` to the Project's current status.
    async fn update_condition(
        &self,
        project: &Project,
        condition: Condition,
    ) -> Result<(), kube::Error>;
}

/// Where the kcp connection settings live and what kind of workspace to
/// create.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub configmap_name: String,
    pub secret_name: String,
    pub namespace: String,
    pub workspace_type: String,
}

pub struct ClusterBackend {
    client: Client,
    settings: WorkspaceSettings,
}

impl ClusterBackend {
    pub fn new(client: Client, settings: WorkspaceSettings) -> Self {
        Self { client, settings }
    }

    fn projects(&self, project: &Project) -> Api<Project> {
        let ns = project.namespace().unwrap_or_default();
        Api::namespaced(self.client.clone(), &ns)
    }
}

#[async_trait]
impl ProjectBackend for ClusterBackend {
    async fn kcp_config(&self) -> Result<KcpConfig, KcpError> {
        kcp::load_config_from_cluster(
            &self.client,
            &self.settings.configmap_name,
            &self.settings.secret_name,
            &self.settings.namespace,
        )
        .await
    }

    async fn connect(&self, config: &KcpConfig) -> Result<Arc<dyn WorkspaceApi>, KcpError> {
        Ok(Arc::new(KcpClient::new(config).await?))
    }

    async fn annotate(
        &self,
        project: &Project,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.projects(project)
            .patch(
                &project.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
    }

    async fn update_condition(
        &self,
        project: &Project,
        condition: Condition,
    ) -> Result<(), kube::Error> {
        let api = self.projects(project);
        let name = project.name_any();
        let current = api.get_status(&name).await?;
        let mut conditions = current.status.map(|s| s.conditions).unwrap_or_default();
        set_condition(&mut conditions, condition);

        let patch = json!({ "status": { "conditions": conditions } });
        api.patch_status(
            &name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await
        .map(|_| ())
    }
}

pub struct Context {
    pub backend: Arc<dyn ProjectBackend>,
    pub workspace_type: String,
    pub metrics: OperatorMetrics,
}

impl Context {
    async fn report(&self, project: &Project, condition: Condition) {
        if let Err(e) = self.backend.update_condition(project, condition).await {
            error!(project = %project.name_any(), "failed to update condition: {e}");
        }
    }

    async fn fail(&self, project: &Project, err: ReconcileError) -> ReconcileError {
        if let Some(reason) = err.reason() {
            self.report(project, workspace_condition(false, reason, err.to_string()))
                .await;
        }
        err
    }

    /// Copies the workspace details onto the Project.
    async fn record_workspace(
        &self,
        project: &Project,
        info: &WorkspaceInfo,
    ) -> Result<(), ReconcileError> {
        let annotations = BTreeMap::from([
            (ANNOTATION_WORKSPACE_NAME.to_string(), info.name.clone()),
            (ANNOTATION_WORKSPACE_URL.to_string(), info.url.clone()),
            (ANNOTATION_WORKSPACE_PHASE.to_string(), info.phase.clone()),
        ]);
        self.backend
            .annotate(project, annotations)
            .await
            .map_err(ReconcileError::Update)?;
        self.backend
            .update_condition(project, info_condition(info, project.metadata.generation))
            .await
            .map_err(ReconcileError::Update)
    }
}

pub async fn reconcile(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let result = reconcile_project(&project, &ctx).await;
    ctx.metrics
        .reconcile_duration_seconds
        .observe(start.elapsed().as_secs_f64());
    ctx.metrics.reconciled(match &result {
        Ok(_) => "ok",
        Err(e) => e.metric_label(),
    });
    result
}

async fn reconcile_project(project: &Project, ctx: &Context) -> Result<Action, ReconcileError> {
    if project.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let name = project.name_any();
    let namespace = project.namespace().unwrap_or_default();
    info!(project = %name, namespace = %namespace, "reconciling project");

    let config = match ctx.backend.kcp_config().await {
        Ok(config) => config,
        Err(e) => return Err(ctx.fail(project, ReconcileError::Configuration(e)).await),
    };
    let workspaces = match ctx.backend.connect(&config).await {
        Ok(client) => client,
        Err(e) => return Err(ctx.fail(project, ReconcileError::Connection(e)).await),
    };

    let workspace_name = name.to_lowercase();
    let existing = match workspaces.get_workspace(&workspace_name).await {
        Ok(info) => info,
        Err(e) => return Err(ctx.fail(project, ReconcileError::WorkspaceCheck(e)).await),
    };

    if let Some(info) = existing {
        info!(workspace = %workspace_name, phase = %info.phase, ready = info.ready, "workspace already exists");
        ctx.record_workspace(project, &info).await?;
        return Ok(if info.ready {
            Action::await_change()
        } else {
            Action::requeue(NOT_READY_REQUEUE)
        });
    }

    info!(workspace = %workspace_name, "creating workspace in kcp");
    ctx.report(
        project,
        workspace_condition(false, "Creating", "Creating workspace in kcp".to_string()),
    )
    .await;

    let workspace_type = if ctx.workspace_type.is_empty() {
        kcp::DEFAULT_WORKSPACE_TYPE
    } else {
        ctx.workspace_type.as_str()
    };
    let created = match workspaces
        .create_workspace(&workspace_name, &namespace, &name, workspace_type)
        .await
    {
        Ok(info) => info,
        Err(e) => return Err(ctx.fail(project, ReconcileError::Creation(e)).await),
    };
    info!(workspace = %workspace_name, phase = %created.phase, "workspace created");

    match workspaces.wait_for_workspace_ready(&workspace_name).await {
        Ok(ready) => {
            info!(workspace = %workspace_name, "workspace is ready");
            ctx.record_workspace(project, &ready).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(workspace = %workspace_name, "workspace not ready: {e}");
            if let Err(update) = ctx.record_workspace(project, &created).await {
                error!(project = %name, "failed to update status: {update}");
            }
            Err(ReconcileError::NotReady(e))
        }
    }
}

pub fn error_policy(project: Arc<Project>, err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(project = %project.name_any(), "reconcile failed: {err}");
    Action::requeue(err.requeue_after())
}

/// Runs the controller over Projects in all namespaces until SIGINT or
/// SIGTERM.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let projects = Api::<Project>::all(client);
    Controller::new(projects, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!(project = %obj.name, "reconciled"),
                Err(e) => warn!("reconcile error: {e}"),
            }
        })
        .await;
    info!("workspace controller stopped");
}
