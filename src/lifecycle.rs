use crate::DeployError;
use crate::compose::RuntimeContainerSpec;
use crate::config::Registries;
use crate::model::{ContainerId, ImageName, ServiceName};
use crate::runtime::ContainerRuntime;
use bollard::auth::DockerCredentials;
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::timeout;

/// Name of a container created for `service` at `now`, published on `port`.
/// Sorts by creation time at second granularity; the port tells apart two
/// deploys within the same second.
pub fn container_name(service: &ServiceName, now: DateTime<Local>, port: u16) -> String {
    format!("{service}-{}-{port}", now.format("%m.%d-%H.%M.%S"))
}

/// Runtime operations with the conventions of a deploy: registry credentials,
/// bounded pulls, container naming and best effort removal.
pub struct Lifecycle<R: ContainerRuntime> {
    runtime: R,
    registries: Registries,
    pull_timeout: Duration,
}

impl<R: ContainerRuntime> Lifecycle<R> {
    pub fn new(runtime: R, registries: Registries, pull_timeout: Duration) -> Self {
        Self {
            runtime,
            registries,
            pull_timeout,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    fn credentials(&self, image: &ImageName) -> Option<DockerCredentials> {
        let host = image.registry_host();
        match self.registries.get(host) {
            Some(registry) => {
                debug!("using credentials of {} for {host}", registry.username);
                Some(DockerCredentials {
                    username: Some(registry.username.clone()),
                    password: Some(registry.password.clone()),
                    serveraddress: Some(host.to_string()),
                    ..Default::default()
                })
            }
            None => {
                // `docker login` state in ~/.docker/config.json is not consulted
                debug!("no [registry.\"{host}\"] credentials in the catalog, pulling anonymously");
                None
            }
        }
    }

    pub async fn pull(&self, image: &ImageName) -> Result<(), DeployError> {
        let credentials = self.credentials(image);
        match timeout(self.pull_timeout, self.runtime.pull(image, credentials)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DeployError::PullFailed {
                image: image.clone(),
                source,
            }),
            Err(_) => Err(DeployError::PullTimedOut {
                image: image.clone(),
                timeout: self.pull_timeout,
            }),
        }
    }

    pub async fn create(
        &self,
        service: &ServiceName,
        port: u16,
        spec: RuntimeContainerSpec,
    ) -> Result<ContainerId, DeployError> {
        let name = container_name(service, Local::now(), port);
        match self.runtime.create(&name, spec).await {
            Ok(id) => {
                info!("Container {name} created with ID: {id}");
                Ok(id)
            }
            Err(source) => Err(DeployError::CreateFailed { name, source }),
        }
    }

    pub async fn start(&self, container: &ContainerId) -> Result<(), DeployError> {
        self.runtime
            .start(container)
            .await
            .map_err(|source| DeployError::StartFailed {
                container: container.clone(),
                source,
            })?;
        info!("Container {container} started");
        Ok(())
    }

    /// Force-removes a container. Failures are logged and reported as `false`.
    pub async fn remove(&self, container: &str) -> bool {
        match self.runtime.remove(container).await {
            Ok(()) => {
                info!("Container {container} removed");
                true
            }
            Err(e) => {
                warn!("failed to remove container {container}: {e}");
                false
            }
        }
    }
}
