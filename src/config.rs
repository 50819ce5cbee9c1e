use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::fossa;
use crate::kcp;
use crate::workspaces::WorkspaceSettings;

fn default_database_path() -> String {
    "maintainers.db".to_string()
}

fn default_namespace() -> String {
    "maintainerd".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_fossa_api_base() -> String {
    fossa::DEFAULT_API_BASE.to_string()
}

fn default_fossa_organization_id() -> i64 {
    fossa::DEFAULT_ORGANIZATION_ID
}

fn default_kcp_configmap() -> String {
    "kcp-config".to_string()
}

fn default_kcp_secret() -> String {
    "kcp-kubeconfig".to_string()
}

fn default_kcp_namespace() -> String {
    "kdp-workspaces-system".to_string()
}

fn default_workspace_type() -> String {
    kcp::DEFAULT_WORKSPACE_TYPE.to_string()
}

fn default_max_backups() -> usize {
    crate::db::backup::DEFAULT_MAX_BACKUPS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintainerdConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Namespace the sync job writes Custom Resources into.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub fossa: FossaConfig,
    #[serde(default)]
    pub workspaces: WorkspacesConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FossaConfig {
    #[serde(default = "default_fossa_api_base")]
    pub api_base: String,
    #[serde(default = "default_fossa_organization_id")]
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspacesConfig {
    /// ConfigMap holding `kcp-url` and `kcp-workspace-path`.
    #[serde(default = "default_kcp_configmap")]
    pub configmap_name: String,
    /// Secret holding the `kubeconfig` key.
    #[serde(default = "default_kcp_secret")]
    pub secret_name: String,
    #[serde(default = "default_kcp_namespace")]
    pub namespace: String,
    #[serde(default = "default_workspace_type")]
    pub workspace_type: String,
}

impl Default for MaintainerdConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            namespace: default_namespace(),
            log_level: default_log_level(),
            metrics_addr: default_metrics_addr(),
            max_backups: default_max_backups(),
            webhook: WebhookConfig::default(),
            fossa: FossaConfig::default(),
            workspaces: WorkspacesConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for FossaConfig {
    fn default() -> Self {
        Self {
            api_base: default_fossa_api_base(),
            organization_id: default_fossa_organization_id(),
        }
    }
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            configmap_name: default_kcp_configmap(),
            secret_name: default_kcp_secret(),
            namespace: default_kcp_namespace(),
            workspace_type: default_workspace_type(),
        }
    }
}

impl WorkspacesConfig {
    pub fn settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            configmap_name: self.configmap_name.clone(),
            secret_name: self.secret_name.clone(),
            namespace: self.namespace.clone(),
            workspace_type: self.workspace_type.clone(),
        }
    }
}

impl MaintainerdConfig {
    fn figment(path: Option<&str>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(MaintainerdConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed("MAINTAINERD_").split("__"))
    }

    /// Defaults, then the YAML file at `path` if given, then `MAINTAINERD_*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_| {
            let config: MaintainerdConfig = MaintainerdConfig::figment(None).extract()?;
            assert_eq!(config, MaintainerdConfig::default());
            assert_eq!(config.database_path, "maintainers.db");
            assert_eq!(config.webhook.listen_addr, "0.0.0.0:8080");
            assert_eq!(config.fossa.organization_id, 162);
            assert_eq!(config.workspaces.workspace_type, "kdp-organization");
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "maintainerd.yaml",
                r#"
database_path: /data/maintainers.db
log_level: debug
webhook:
  listen_addr: 127.0.0.1:3000
workspaces:
  namespace: kcp-system
"#,
            )?;
            jail.set_env("MAINTAINERD_LOG_LEVEL", "warn");
            jail.set_env("MAINTAINERD_FOSSA__ORGANIZATION_ID", "7");

            let config: MaintainerdConfig =
                MaintainerdConfig::figment(Some("maintainerd.yaml")).extract()?;
            assert_eq!(config.database_path, "/data/maintainers.db");
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.webhook.listen_addr, "127.0.0.1:3000");
            assert_eq!(config.fossa.organization_id, 7);
            assert_eq!(config.fossa.api_base, "https://app.fossa.com/api");

            let settings = config.workspaces.settings();
            assert_eq!(settings.namespace, "kcp-system");
            assert_eq!(settings.configmap_name, "kcp-config");
            Ok(())
        });
    }
}
