//! Zero-downtime rolling deploys of containers published through an APISIX
//! gateway: pull, start on a fresh port, health check, repoint the upstream,
//! retire the previous instance.
pub mod compose;
pub mod config;
pub mod gateway;
pub mod health;
pub mod inventory;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod port;
pub mod runtime;

use bollard::errors::Error as BollardError;
use std::time::Duration;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::model::{ContainerId, ImageName, ServiceName};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] BollardError),
    #[error("pulling {image} failed: {source}")]
    PullFailed {
        image: ImageName,
        source: BollardError,
    },
    #[error("pulling {image} timed out after {timeout:?}")]
    PullTimedOut { image: ImageName, timeout: Duration },
    #[error("no port available: {0}")]
    NoPortAvailable(#[source] std::io::Error),
    #[error("creating container {name} failed: {source}")]
    CreateFailed { name: String, source: BollardError },
    #[error("starting container {container} failed: {source}")]
    StartFailed {
        container: ContainerId,
        source: BollardError,
    },
    #[error("container {container} not healthy on port {port}")]
    HealthCheckFailed { container: ContainerId, port: u16 },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("{0} has no retired instance, nothing to roll back to")]
    NothingToRollBack(ServiceName),
    #[error("{container} binds host ports {ports:?}, can't rollback")]
    AmbiguousPortBinding { container: String, ports: Vec<u16> },
    #[error("no compose definition for service {0}")]
    ComposeServiceMissing(ServiceName),
}

impl DeployError {
    /// Whether the engine refused to publish the port because something else holds it.
    pub fn is_port_conflict(&self) -> bool {
        let message = match self {
            DeployError::CreateFailed { source, .. } | DeployError::StartFailed { source, .. } => {
                source.to_string()
            }
            _ => return false,
        };
        message.contains("port is already allocated") || message.contains("address already in use")
    }
}
