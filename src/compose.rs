//! Per-service compose file: `services.<name>` entries are turned into the
//! container body handed to the runtime on every deploy.
use crate::config::{ConfigError, require_file};
use crate::inventory::SERVICE_LABEL;
use crate::model::{ImageName, ServiceName};
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, HostConfigLogConfig, NetworkingConfig,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use figment2::{
    Figment,
    providers::{Format, Yaml},
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::Path;

pub type RuntimeContainerSpec = ContainerCreateBody;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl Display for Scalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(s) => write!(f, "{s}"),
            Scalar::Integer(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// `environment` accepts both compose notations: `["KEY=value"]` and `{KEY: value}`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Environment {
    List(Vec<String>),
    Map(BTreeMap<String, Scalar>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::List(Vec::new())
    }
}

impl Environment {
    fn to_vec(&self) -> Vec<String> {
        match self {
            Environment::List(list) => list.clone(),
            Environment::Map(map) => map.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Entrypoint {
    Shell(String),
    Exec(Vec<String>),
}

impl Entrypoint {
    fn to_vec(&self) -> Vec<String> {
        match self {
            Entrypoint::Shell(line) => line.split_whitespace().map(str::to_string).collect(),
            Entrypoint::Exec(args) => args.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ComposeService {
    pub image: ImageName,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub entrypoint: Option<Entrypoint>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: HashMap<String, ComposeService>,
}

impl ComposeFile {
    pub fn service(&self, name: &ServiceName) -> Option<&ComposeService> {
        self.services.get(name.as_str())
    }
}

pub fn load_compose(path: &Path) -> Result<ComposeFile, ConfigError> {
    require_file(path)?;
    let compose: ComposeFile = Figment::from(Yaml::file(path)).extract()?;
    Ok(compose)
}

fn restart_policy(policy: Option<&str>) -> RestartPolicy {
    let policy = policy.unwrap_or("unless-stopped");
    let (name, retries) = match policy.split_once(':') {
        Some((name, retries)) => (name, retries.parse::<i64>().ok()),
        None => (policy, None),
    };
    let name = match name {
        "no" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    }
}

impl ComposeService {
    /// Builds the container body with `host_port` published for the service's
    /// internal port on both IPv4 and IPv6.
    pub fn runtime_spec(
        &self,
        service: &ServiceName,
        host_port: u16,
        container_port: u16,
    ) -> RuntimeContainerSpec {
        let bindings = ["0.0.0.0", "::"]
            .into_iter()
            .map(|host_ip| PortBinding {
                host_ip: Some(host_ip.to_string()),
                host_port: Some(host_port.to_string()),
            })
            .collect();
        let port_bindings = HashMap::from([(format!("{container_port}/tcp"), Some(bindings))]);

        let host_config = HostConfig {
            binds: Some(self.volumes.clone()),
            extra_hosts: Some(self.extra_hosts.clone()),
            restart_policy: Some(restart_policy(self.restart.as_deref())),
            port_bindings: Some(port_bindings),
            log_config: Some(HostConfigLogConfig {
                typ: Some("local".to_string()),
                config: Some(HashMap::from([
                    ("max-size".to_string(), "50m".to_string()),
                    ("max-file".to_string(), "3".to_string()),
                ])),
            }),
            ..Default::default()
        };

        let endpoints = self
            .networks
            .iter()
            .map(|network| (network.clone(), EndpointSettings::default()))
            .collect();

        ContainerCreateBody {
            image: Some(self.image.as_str().to_string()),
            env: Some(self.environment.to_vec()),
            entrypoint: self.entrypoint.as_ref().map(Entrypoint::to_vec),
            labels: Some(HashMap::from([(
                SERVICE_LABEL.to_string(),
                service.as_str().to_string(),
            )])),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        }
    }
}
