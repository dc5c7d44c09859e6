use crate::model::PlatformKind;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Manager identity; doubles as the InstanceId prefix.
    pub name: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub base_quantity: u32,
    pub reactive: Option<ReactiveConfig>,
    pub platform: PlatformConfig,
    pub cloud: CloudConfig,
    #[serde(default)]
    pub support: SupportConfig,
    /// Back-off intervals (seconds) for the readiness wait after launch.
    #[serde(default = "default_readiness_schedule")]
    pub readiness_schedule: Vec<u64>,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,
    #[serde(default = "default_create_concurrency")]
    pub create_concurrency: usize,
    #[serde(default = "default_startup_grace")]
    pub startup_grace: u64,
    #[serde(default = "default_build_grace")]
    pub build_grace: u64,
    #[serde(default)]
    pub dispatch_check: DispatchCheckConfig,
    #[serde(default = "default_metrics_log")]
    pub metrics_log: PathBuf,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReactiveConfig {
    pub queue_uri: String,
    pub queue_name: String,
    pub max_quantity: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    pub url: String,
    pub credential: String,
    /// Organization runners are registered under; hosted-vcs only.
    pub org: Option<String>,
    #[serde(default)]
    pub group_id: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CloudConfig {
    /// Named cloud in clouds.yaml.
    pub auth: String,
    pub image: Option<String>,
    pub flavor: Option<String>,
    pub network: Option<String>,
    pub vm_prefix: Option<String>,
    pub key_name: String,
    pub ssh_key_file: PathBuf,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SupportConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    #[serde(default)]
    pub use_aproxy: bool,
    pub dockerhub_mirror: Option<String>,
    #[serde(default)]
    pub ssh_debug_endpoints: Vec<SshDebugEndpoint>,
    pub repo_policy_compliance: Option<RepoPolicyConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SshDebugEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RepoPolicyConfig {
    pub url: String,
    pub token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DispatchCheckConfig {
    pub attempts: u32,
    pub interval: u64,
}

impl Default for DispatchCheckConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

fn default_readiness_schedule() -> Vec<u64> {
    vec![30, 60, 60, 120, 240, 300]
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_create_concurrency() -> usize {
    4
}

fn default_startup_grace() -> u64 {
    900
}

fn default_build_grace() -> u64 {
    600
}

fn default_metrics_log() -> PathBuf {
    PathBuf::from("metrics.log")
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The name the cloud scopes by: explicit vm_prefix, or the manager name.
    pub fn prefix(&self) -> &str {
        self.cloud
            .vm_prefix
            .as_deref()
            .unwrap_or(self.name.as_str())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Invalid(
                "name must be lowercase alphanumeric with dashes".into(),
            ));
        }
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("labels must not be empty".into()));
        }
        if self.readiness_schedule.is_empty() {
            return Err(ConfigError::Invalid(
                "readiness_schedule must list at least one interval".into(),
            ));
        }
        if self.create_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "create_concurrency must be at least 1".into(),
            ));
        }
        if let Some(reactive) = &self.reactive {
            if reactive.queue_uri.is_empty() || reactive.queue_name.is_empty() {
                return Err(ConfigError::Invalid(
                    "reactive.queue_uri and reactive.queue_name must be set".into(),
                ));
            }
        }
        if self.platform.kind == PlatformKind::HostedVcs && self.platform.org.is_none() {
            return Err(ConfigError::Invalid(
                "platform.org is required for the hosted-vcs platform".into(),
            ));
        }
        Ok(())
    }
}
