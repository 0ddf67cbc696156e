use crate::model::{ServiceName, UpstreamId};
use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Figment(#[from] Box<figment2::Error>),
    #[error("service `{0}` is declared more than once")]
    DuplicateService(ServiceName),
    #[error("{} not found", .0.display())]
    MissingFile(PathBuf),
}

/// Figment treats a missing file as empty and searches parent directories for
/// relative paths, so the path is checked as given.
pub(crate) fn require_file(path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile(path.to_path_buf()))
    }
}

impl From<figment2::Error> for ConfigError {
    fn from(value: figment2::Error) -> Self {
        ConfigError::Figment(Box::new(value))
    }
}

/// Static definition of a routable service.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub name: ServiceName,
    /// Gateway upstream the service is published through
    pub id: UpstreamId,
    pub health_check: String,
    /// Port the service listens on inside its container
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Gateway {
    pub admin: String,
    pub key: String,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_gateway_timeout")]
    pub timeout: u64,
}

impl Gateway {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Docker {
    /// Engine endpoint, e.g. `tcp://127.0.0.1:2375`. Local defaults when unset.
    pub host: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Health {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_host")]
    pub host: String,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            host: default_health_host(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Deploy {
    #[serde(default = "default_compose")]
    pub compose: PathBuf,
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,
}

impl Default for Deploy {
    fn default() -> Self {
        Self {
            compose: default_compose(),
            pull_timeout: default_pull_timeout(),
            port_attempts: default_port_attempts(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Credentials keyed by registry host, e.g. `ghcr.io`
pub type Registries = HashMap<String, RegistryCredentials>;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub gateway: Gateway,
    #[serde(default)]
    pub docker: Docker,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub deploy: Deploy,
    #[serde(default)]
    pub registry: Registries,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

impl Config {
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name.as_str() == name)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(&service.name) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }
        Ok(self)
    }
}

fn default_upstream_host() -> String {
    "docker.local".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_gateway_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    3
}

fn default_health_timeout() -> u64 {
    60
}

fn default_health_host() -> String {
    "localhost".to_string()
}

fn default_compose() -> PathBuf {
    PathBuf::from("compose.yaml")
}

fn default_pull_timeout() -> u64 {
    600
}

fn default_port_attempts() -> u32 {
    3
}

pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    require_file(config_path)?;
    let config: Config = Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SWITCHYARD_").split("__"))
        .extract()?;
    config.validate()
}
