use crate::model::{ContainerId, ImageName};
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, ContainerInspectResponse, ContainerSummary};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use std::collections::HashMap;

const CONNECT_TIMEOUT_SECS: u64 = 120;

const REMOVE_OPTIONS: RemoveContainerOptions = RemoveContainerOptions {
    v: false,
    force: true,
    link: false,
};

/// Container engine operations the deploys are built from.
pub trait ContainerRuntime: Send + Sync + 'static {
    fn list_running(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerSummary>, BollardError>> + Send;

    fn inspect(
        &self,
        container_id: &str,
    ) -> impl Future<Output = Result<ContainerInspectResponse, BollardError>> + Send;

    fn pull(
        &self,
        image: &ImageName,
        credentials: Option<DockerCredentials>,
    ) -> impl Future<Output = Result<(), BollardError>> + Send;

    fn create(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> impl Future<Output = Result<ContainerId, BollardError>> + Send;

    fn start(&self, container_id: &str) -> impl Future<Output = Result<(), BollardError>> + Send;

    /// Force-removes a container, running or not.
    fn remove(&self, container_id: &str) -> impl Future<Output = Result<(), BollardError>> + Send;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(host: Option<&str>) -> Result<Self, BollardError> {
        let docker = match host {
            Some(host) => {
                debug!("connecting to docker engine at {host}");
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), BollardError> {
        let response = self.docker.ping().await?;
        debug!("docker engine answered ping: {response}");
        Ok(())
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSummary>, BollardError> {
        let filters = HashMap::from([("status".to_string(), vec!["running".to_string()])]);
        let options = ListContainersOptions {
            all: false,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        debug!("found {} running containers", containers.len());
        Ok(containers)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse, BollardError> {
        let details = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        trace!(
            "container details: {}",
            serde_json::to_string_pretty(&details).unwrap_or_default()
        );
        Ok(details)
    }

    async fn pull(
        &self,
        image: &ImageName,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), BollardError> {
        let (from_image, tag) = image.split();
        let options = CreateImageOptions {
            from_image: Some(from_image.to_owned()),
            tag: tag.map(str::to_owned),
            ..Default::default()
        };
        info!("Pulling from {image}");
        let mut pull_stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = pull_stream.next().await {
            let output = result?;
            match (&output.progress, &output.status) {
                (Some(progress), _) => debug!("{progress}"),
                (None, Some(status)) if status.starts_with("Digest:") || status.starts_with("Status:") => {
                    info!("{status}")
                }
                (None, Some(status)) => debug!("{status}"),
                (None, None) => {}
            }
        }
        info!("Image pulled: {image}");
        Ok(())
    }

    async fn create(&self, name: &str, body: ContainerCreateBody) -> Result<ContainerId, BollardError> {
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
        };
        let container = self.docker.create_container(Some(options), body).await?;
        for warning in &container.warnings {
            warn!("creating {name}: {warning}");
        }
        Ok(container.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), BollardError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await
    }

    async fn remove(&self, container_id: &str) -> Result<(), BollardError> {
        self.docker
            .remove_container(container_id, Some(REMOVE_OPTIONS))
            .await
    }
}
