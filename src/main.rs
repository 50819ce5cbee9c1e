mod apis;
mod config;
mod db;
mod fossa;
mod github;
mod health;
mod kcp;
mod metrics;
mod model;
mod onboarding;
mod sync;
mod workspaces;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::{Parser, Subcommand};
use prometheus_client::registry::Registry;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::MaintainerdConfig;
use crate::fossa::{FossaApi, FossaClient};
use crate::kcp::{KcpClient, WorkspaceApi};

#[derive(Parser)]
#[command(name = "maintainerd", about = "Maintainer database integrations for CNCF projects")]
struct Cli {
    /// Optional YAML configuration file
    #[arg(long, env = "MAINTAINERD_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or migrate the database and import the worksheet and FOSSA data
    Bootstrap {
        /// Saved Sheets `values.get` response holding the maintainer worksheet
        #[arg(long, env = "MD_WORKSHEET")]
        worksheet: PathBuf,
        /// Skip the FOSSA import when unset
        #[arg(long, env = "FOSSA_API_TOKEN", hide_env_values = true)]
        fossa_token: Option<String>,
        /// Do not copy an existing database aside first
        #[arg(long)]
        no_backup: bool,
    },
    /// Mirror the database into Custom Resources
    Sync,
    /// Run the Project to kcp workspace operator
    Workspaces,
    /// Inspect or remove a kcp workspace
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
    /// Serve the GitHub onboarding webhook
    Webhook {
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        github_token: String,
        #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true, default_value = "")]
        webhook_secret: String,
        #[arg(long, env = "FOSSA_API_TOKEN", hide_env_values = true)]
        fossa_token: String,
    },
    /// List FOSSA teams, or the member emails of one team
    FossaTeams {
        #[arg(long, env = "FOSSA_API_TOKEN", hide_env_values = true)]
        fossa_token: String,
        /// Team to list members of
        #[arg(long)]
        team: Option<String>,
    },
    /// Print the CustomResourceDefinitions as YAML
    Crds,
}

#[derive(Subcommand)]
enum WorkspaceAction {
    Get { name: String },
    Delete { name: String },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid address {addr:?}: {source}")]
    Addr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] db::StoreError),
    #[error(transparent)]
    Backup(#[from] db::backup::BackupError),
    #[error(transparent)]
    Import(#[from] db::bootstrap::ImportError),
    #[error(transparent)]
    Fossa(#[from] fossa::FossaError),
    #[error(transparent)]
    Sync(#[from] sync::SyncError),
    #[error(transparent)]
    Kcp(#[from] kcp::KcpError),
    #[error("failed to create Kubernetes client: {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to encode CRD: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("workspace {0} does not exist")]
    NoWorkspace(String),
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

fn parse_addr(addr: &str) -> Result<SocketAddr, CliError> {
    addr.parse().map_err(|source| CliError::Addr {
        addr: addr.to_string(),
        source,
    })
}

/// Serves `router` until `shutdown_rx` fires, flagging `health` ready once the
/// socket is bound.
async fn run_http_server(
    addr: SocketAddr,
    router: Router,
    health: health::SharedHealthState,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), CliError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| CliError::Bind { addr, source })?;

    info!(%addr, "HTTP server listening");
    health.set_ready();

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("HTTP server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("HTTP server error: {e}"));
    Ok(())
}

async fn bootstrap(
    config: &MaintainerdConfig,
    worksheet: PathBuf,
    fossa_token: Option<String>,
    no_backup: bool,
) -> Result<(), CliError> {
    let db_path = PathBuf::from(&config.database_path);
    if !no_backup {
        db::backup::backup_database(&db_path, config.max_backups)?;
    }

    let store = db::open(&db_path).await?;
    db::bootstrap::seed_services(&store).await?;

    let rows = db::bootstrap::read_worksheet_file(&worksheet)?;
    let summary = db::bootstrap::load_maintainers_and_projects(&store, &rows).await?;
    info!(
        rows = summary.rows,
        imported = summary.imported,
        skipped = summary.skipped,
        "worksheet imported"
    );

    match fossa_token {
        Some(token) => {
            let client = fossa_client(config, token);
            let summary = db::bootstrap::load_fossa(&store, &client).await?;
            info!(
                users = summary.users,
                maintainers = summary.maintainers,
                collaborators = summary.collaborators,
                links = summary.links,
                "FOSSA data imported"
            );
        }
        None => warn!("FOSSA_API_TOKEN not set, skipping FOSSA import"),
    }
    Ok(())
}

fn fossa_client(config: &MaintainerdConfig, token: String) -> FossaClient {
    FossaClient::with_base(token, &config.fossa.api_base, config.fossa.organization_id)
}

async fn sync_resources(config: &MaintainerdConfig) -> Result<(), CliError> {
    let store = db::open(&config.database_path).await?;
    let client = kube::Client::try_default().await?;
    let writer = sync::KubeWriter::new(client, &config.namespace);

    let mut registry = Registry::default();
    let sync_metrics = metrics::SyncMetrics::new(&mut registry);
    let summary = sync::Syncer::new(&store, &writer)
        .with_metrics(&sync_metrics)
        .sync_all()
        .await?;
    info!(
        namespace = %config.namespace,
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        "custom resources in sync"
    );
    Ok(())
}

async fn run_operator(config: &MaintainerdConfig) -> Result<(), CliError> {
    let metrics_addr = parse_addr(&config.metrics_addr)?;
    let client = kube::Client::try_default().await?;

    let mut registry = Registry::default();
    let ctx = Arc::new(workspaces::Context {
        backend: Arc::new(workspaces::ClusterBackend::new(
            client.clone(),
            config.workspaces.settings(),
        )),
        workspace_type: config.workspaces.workspace_type.clone(),
        metrics: metrics::OperatorMetrics::new(&mut registry),
    });
    let health_state = Arc::new(health::HealthState::new(registry));
    let router = health::router(health_state.clone()).route("/healthz", get(health::healthz));

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = tokio::spawn(run_http_server(
        metrics_addr,
        router,
        health_state,
        shutdown_rx,
    ));

    info!(
        kcp_configmap = %config.workspaces.configmap_name,
        kcp_secret = %config.workspaces.secret_name,
        namespace = %config.workspaces.namespace,
        "starting workspace operator"
    );
    workspaces::run(client, ctx).await;

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(result) => result,
        Err(e) => {
            error!("HTTP server task failed: {e}");
            Ok(())
        }
    }
}

async fn workspace_command(
    config: &MaintainerdConfig,
    action: WorkspaceAction,
) -> Result<(), CliError> {
    let client = kube::Client::try_default().await?;
    let settings = &config.workspaces;
    let kcp_config = kcp::load_config_from_cluster(
        &client,
        &settings.configmap_name,
        &settings.secret_name,
        &settings.namespace,
    )
    .await?;
    let kcp = KcpClient::new(&kcp_config).await?;
    info!(workspace_path = %kcp.workspace_path(), "connected to kcp");

    match action {
        WorkspaceAction::Get { name } => {
            let info = kcp
                .get_workspace(&name)
                .await?
                .ok_or_else(|| CliError::NoWorkspace(name.clone()))?;
            println!("name:  {}", info.name);
            println!("phase: {}", info.phase);
            println!("ready: {}", info.ready);
            println!("url:   {}", info.url);
        }
        WorkspaceAction::Delete { name } => {
            if !kcp.workspace_exists(&name).await? {
                warn!(workspace = %name, "workspace does not exist");
                return Ok(());
            }
            kcp.delete_workspace(&name).await?;
            info!(workspace = %name, "workspace deleted");
        }
    }
    Ok(())
}

async fn serve_webhook(
    config: &MaintainerdConfig,
    github_token: String,
    webhook_secret: String,
    fossa_token: String,
) -> Result<(), CliError> {
    let listen_addr = parse_addr(&config.webhook.listen_addr)?;
    let store = db::open(&config.database_path).await?;

    let mut registry = Registry::default();
    let listener = Arc::new(onboarding::EventListener {
        store,
        fossa: Arc::new(fossa_client(config, fossa_token)),
        github: Arc::new(github::GitHubClient::new(github_token)),
        secret: webhook_secret.into_bytes(),
        metrics: metrics::WebhookMetrics::new(&mut registry),
    });
    let health_state = Arc::new(health::HealthState::new(registry));
    let router = onboarding::router(listener).merge(health::router(health_state.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    info!(%listen_addr, database = %config.database_path, "starting webhook server");
    run_http_server(listen_addr, router, health_state, shutdown_rx).await
}

async fn fossa_teams(
    config: &MaintainerdConfig,
    fossa_token: String,
    team: Option<String>,
) -> Result<(), CliError> {
    let client = fossa_client(config, fossa_token);
    match team {
        Some(name) => {
            let team = client.fetch_team(&name).await?;
            for email in client.fetch_team_user_emails(team.id).await? {
                println!("{email}");
            }
        }
        None => {
            for team in client.fetch_teams().await? {
                println!("{}\t{}", team.id, team.name);
            }
        }
    }
    Ok(())
}

fn print_crds() -> Result<(), CliError> {
    for crd in apis::crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

async fn run(cli: Cli, config: MaintainerdConfig) -> Result<(), CliError> {
    match cli.command {
        Command::Bootstrap {
            worksheet,
            fossa_token,
            no_backup,
        } => bootstrap(&config, worksheet, fossa_token, no_backup).await,
        Command::Sync => sync_resources(&config).await,
        Command::Workspaces => run_operator(&config).await,
        Command::Workspace { action } => workspace_command(&config, action).await,
        Command::Webhook {
            github_token,
            webhook_secret,
            fossa_token,
        } => serve_webhook(&config, github_token, webhook_secret, fossa_token).await,
        Command::FossaTeams { fossa_token, team } => fossa_teams(&config, fossa_token, team).await,
        Command::Crds => print_crds(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = MaintainerdConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, config).await {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
