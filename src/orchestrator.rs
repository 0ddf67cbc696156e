//! Up, rollback and prune of a service. Every operation rebuilds its view of
//! the world from the container runtime; nothing is kept between calls except
//! the per-service locks.
use crate::DeployError;
use crate::compose::{ComposeFile, ComposeService};
use crate::config::{Config, ServiceDefinition};
use crate::gateway::UpstreamSwitcher;
use crate::health::HealthCheck;
use crate::inventory::{InstanceGroup, list_instances};
use crate::lifecycle::Lifecycle;
use crate::model::{ContainerId, ServiceName};
use crate::port::allocate_port;
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune target covering every configured service
pub const PRUNE_ALL: &str = "all";

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    NotFound(ServiceName),
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::NotFound(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    Resolving,
    Pulling,
    PortAlloc,
    Creating,
    Starting,
    HealthCheck,
    Switching,
    Pruning,
    Done,
    Failed,
}

impl Display for DeployState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployState::Resolving => write!(f, "resolving"),
            DeployState::Pulling => write!(f, "pulling"),
            DeployState::PortAlloc => write!(f, "allocating port"),
            DeployState::Creating => write!(f, "creating"),
            DeployState::Starting => write!(f, "starting"),
            DeployState::HealthCheck => write!(f, "health checking"),
            DeployState::Switching => write!(f, "switching upstream"),
            DeployState::Pruning => write!(f, "pruning"),
            DeployState::Done => write!(f, "done"),
            DeployState::Failed => write!(f, "failed"),
        }
    }
}

/// Bookkeeping of a single `up` call.
#[derive(Debug)]
pub struct DeploymentAttempt {
    pub service: ServiceName,
    pub port: Option<u16>,
    pub container: Option<ContainerId>,
    state: DeployState,
}

impl DeploymentAttempt {
    fn new(service: ServiceName) -> Self {
        Self {
            service,
            port: None,
            container: None,
            state: DeployState::Resolving,
        }
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    fn transition(&mut self, next: DeployState) {
        debug!("{}: {} -> {}", self.service, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub service: ServiceName,
    pub container: ContainerId,
    pub port: u16,
    /// Retired instances removed after the switch
    pub pruned: Vec<ContainerId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RolledBack {
    pub service: ServiceName,
    pub container: ContainerId,
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PruneReport {
    pub service: ServiceName,
    pub removed: Vec<ContainerId>,
    pub failed: Vec<ContainerId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub id: ContainerId,
    pub name: String,
    pub created: DateTime<Utc>,
    pub ports: BTreeSet<u16>,
    pub current: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Host the gateway reaches the containers' published ports on
    pub upstream_host: String,
    /// Fresh ports tried when the engine reports a port conflict
    pub port_attempts: u32,
}

pub struct Orchestrator<R: ContainerRuntime, G: UpstreamSwitcher, H: HealthCheck> {
    services: Vec<ServiceDefinition>,
    compose: ComposeFile,
    lifecycle: Lifecycle<R>,
    gateway: G,
    health: H,
    settings: Settings,
    locks: Mutex<HashMap<ServiceName, Arc<AsyncMutex<()>>>>,
}

impl<R: ContainerRuntime, G: UpstreamSwitcher, H: HealthCheck> Orchestrator<R, G, H> {
    pub fn new(
        services: Vec<ServiceDefinition>,
        compose: ComposeFile,
        lifecycle: Lifecycle<R>,
        gateway: G,
        health: H,
        settings: Settings,
    ) -> Self {
        Self {
            services,
            compose,
            lifecycle,
            gateway,
            health,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config, compose: ComposeFile, runtime: R, gateway: G, health: H) -> Self {
        for service in &config.services {
            if compose.service(&service.name).is_none() {
                warn!("service {} has no entry in the compose file", service.name);
            }
        }
        let lifecycle = Lifecycle::new(
            runtime,
            config.registry.clone(),
            Duration::from_secs(config.deploy.pull_timeout),
        );
        let settings = Settings {
            upstream_host: config.gateway.upstream_host.clone(),
            port_attempts: config.deploy.port_attempts,
        };
        Self::new(config.services.clone(), compose, lifecycle, gateway, health, settings)
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name.as_str() == name)
    }

    fn compose_service(&self, service: &ServiceDefinition) -> Result<&ComposeService, DeployError> {
        self.compose
            .service(&service.name)
            .ok_or_else(|| DeployError::ComposeServiceMissing(service.name.clone()))
    }

    /// Serializes operations on one service.
    async fn lock(&self, service: &ServiceName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(service.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn group_for(
        &self,
        service: &ServiceDefinition,
        compose: &ComposeService,
    ) -> Result<InstanceGroup, DeployError> {
        let mut inventory = list_instances(self.lifecycle.runtime())
            .await
            .map_err(DeployError::RuntimeUnavailable)?;
        let group = inventory
            .remove(&compose.image)
            .unwrap_or_default()
            .for_service(&service.name);
        debug!("{} has {} running instance(s)", service.name, group.len());
        Ok(group)
    }

    /// Removes every retired instance of `group`, keeping the current one.
    async fn prune_retired(&self, service: &ServiceName, group: &InstanceGroup) -> PruneReport {
        let mut report = PruneReport {
            service: service.clone(),
            removed: Vec::new(),
            failed: Vec::new(),
        };
        for instance in group.retired() {
            info!("Prune container {} of {service}", instance.name);
            if self.lifecycle.remove(&instance.id).await {
                report.removed.push(instance.id.clone());
            } else {
                report.failed.push(instance.id.clone());
            }
        }
        report
    }

    pub async fn up(&self, name: &str) -> Result<Outcome<Deployment>, DeployError> {
        let Some(service) = self.service(name) else {
            info!("service {name} not found");
            return Ok(Outcome::NotFound(ServiceName::new(name)));
        };
        let _guard = self.lock(&service.name).await;
        info!("prepare to up new instance of {}", service.name);

        let mut attempt = DeploymentAttempt::new(service.name.clone());
        match self.run_up(service, &mut attempt).await {
            Ok(deployment) => {
                attempt.transition(DeployState::Done);
                info!(
                    "{} deployed: container {} on port {}",
                    service.name, deployment.container, deployment.port
                );
                Ok(Outcome::Completed(deployment))
            }
            Err(e) => {
                error!("deploying {} failed while {}: {e}", service.name, attempt.state());
                attempt.transition(DeployState::Failed);
                Err(e)
            }
        }
    }

    async fn run_up(
        &self,
        service: &ServiceDefinition,
        attempt: &mut DeploymentAttempt,
    ) -> Result<Deployment, DeployError> {
        let compose = self.compose_service(service)?;
        let previous = self.group_for(service, compose).await?;
        if previous.is_empty() {
            info!("no running instance of {}, deploying fresh", service.name);
        }

        attempt.transition(DeployState::Pulling);
        self.lifecycle.pull(&compose.image).await?;

        let (container, port) = self.launch(service, compose, attempt).await?;

        attempt.transition(DeployState::HealthCheck);
        if !self.health.probe(port, &service.health_check).await {
            self.lifecycle.remove(&container).await;
            return Err(DeployError::HealthCheckFailed { container, port });
        }

        // from here on a failure leaves the new container in place, the
        // upstream state is what needs attention
        attempt.transition(DeployState::Switching);
        self.gateway
            .set_upstream(&service.id, &self.settings.upstream_host, port)
            .await?;

        attempt.transition(DeployState::Pruning);
        let report = self.prune_retired(&service.name, &previous).await;

        Ok(Deployment {
            service: service.name.clone(),
            container,
            port,
            pruned: report.removed,
        })
    }

    /// Allocates a port, creates and starts the container. A port lost to
    /// another process between allocation and bind is retried with a fresh one.
    async fn launch(
        &self,
        service: &ServiceDefinition,
        compose: &ComposeService,
        attempt: &mut DeploymentAttempt,
    ) -> Result<(ContainerId, u16), DeployError> {
        let mut attempts_left = self.settings.port_attempts.max(1);
        loop {
            attempts_left -= 1;

            attempt.transition(DeployState::PortAlloc);
            let port = allocate_port().map_err(DeployError::NoPortAvailable)?;
            info!("Get random port {port}");
            attempt.port = Some(port);

            attempt.transition(DeployState::Creating);
            let spec = compose.runtime_spec(&service.name, port, service.port);
            let container = match self.lifecycle.create(&service.name, port, spec).await {
                Ok(container) => container,
                Err(e) if e.is_port_conflict() && attempts_left > 0 => {
                    warn!("{e}, retrying with another port");
                    continue;
                }
                Err(e) => return Err(e),
            };
            attempt.container = Some(container.clone());

            attempt.transition(DeployState::Starting);
            match self.lifecycle.start(&container).await {
                Ok(()) => return Ok((container, port)),
                Err(e) => {
                    self.lifecycle.remove(&container).await;
                    attempt.container = None;
                    if e.is_port_conflict() && attempts_left > 0 {
                        warn!("{e}, retrying with another port");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Points the upstream back at the retired instance. Containers are left untouched.
    pub async fn rollback(&self, name: &str) -> Result<Outcome<RolledBack>, DeployError> {
        let Some(service) = self.service(name) else {
            info!("service {name} not found");
            return Ok(Outcome::NotFound(ServiceName::new(name)));
        };
        let _guard = self.lock(&service.name).await;
        info!("prepare to rollback {}", service.name);

        let compose = self.compose_service(service)?;
        let group = self.group_for(service, compose).await?;
        let Some(target) = group.retired().first() else {
            return Err(DeployError::NothingToRollBack(service.name.clone()));
        };
        let port = target
            .single_host_port()
            .ok_or_else(|| DeployError::AmbiguousPortBinding {
                container: target.name.clone(),
                ports: target.host_ports().into_iter().collect(),
            })?;

        self.gateway
            .set_upstream(&service.id, &self.settings.upstream_host, port)
            .await?;
        info!("{} rolled back to {} on port {port}", service.name, target.name);
        Ok(Outcome::Completed(RolledBack {
            service: service.name.clone(),
            container: target.id.clone(),
            name: target.name.clone(),
            port,
        }))
    }

    /// Removes retired instances of one service, or of every service for [`PRUNE_ALL`].
    pub async fn prune(&self, target: &str) -> Result<Outcome<Vec<PruneReport>>, DeployError> {
        let services: Vec<&ServiceDefinition> = if target == PRUNE_ALL {
            self.services.iter().collect()
        } else {
            match self.service(target) {
                Some(service) => vec![service],
                None => {
                    info!("service {target} not found");
                    return Ok(Outcome::NotFound(ServiceName::new(target)));
                }
            }
        };

        let mut reports = Vec::with_capacity(services.len());
        for service in services {
            let _guard = self.lock(&service.name).await;
            let compose = match self.compose_service(service) {
                Ok(compose) => compose,
                Err(e) => {
                    warn!("{e}, skip prune");
                    continue;
                }
            };
            let group = self.group_for(service, compose).await?;
            if group.len() < 2 {
                info!("{} has {} instance(s), skip prune", service.name, group.len());
                reports.push(PruneReport {
                    service: service.name.clone(),
                    removed: Vec::new(),
                    failed: Vec::new(),
                });
                continue;
            }
            reports.push(self.prune_retired(&service.name, &group).await);
        }
        Ok(Outcome::Completed(reports))
    }

    /// Running instances of a service, newest first.
    pub async fn status(&self, name: &str) -> Result<Outcome<Vec<InstanceStatus>>, DeployError> {
        let Some(service) = self.service(name) else {
            return Ok(Outcome::NotFound(ServiceName::new(name)));
        };
        let compose = self.compose_service(service)?;
        let group = self.group_for(service, compose).await?;
        let statuses = group
            .instances()
            .iter()
            .enumerate()
            .map(|(i, instance)| InstanceStatus {
                id: instance.id.clone(),
                name: instance.name.clone(),
                created: instance.created,
                ports: instance.host_ports(),
                current: i == 0,
            })
            .collect();
        Ok(Outcome::Completed(statuses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::RuntimeContainerSpec;
    use crate::gateway::GatewayError;
    use crate::inventory::SERVICE_LABEL;
    use crate::model::{ImageName, UpstreamId};
    use bollard::auth::DockerCredentials;
    use bollard::errors::Error as BollardError;
    use bollard::models::{
        ContainerConfig, ContainerInspectResponse, ContainerSummary, HostConfig, PortBinding,
    };
    use reqwest::StatusCode;
    use tokio::sync::Semaphore;

    const WEB_IMAGE: &str = "example/web:latest";
    const API_IMAGE: &str = "example/api:latest";

    fn server_error(message: &str) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code: 500,
            message: message.to_string(),
        }
    }

    struct FakeContainer {
        id: String,
        name: String,
        image: String,
        created: i64,
        ports: Vec<u16>,
        service: Option<String>,
        running: bool,
    }

    impl FakeContainer {
        fn inspect(&self) -> ContainerInspectResponse {
            let bindings = self
                .ports
                .iter()
                .map(|port| {
                    (
                        format!("{port}/tcp"),
                        Some(vec![PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: Some(port.to_string()),
                        }]),
                    )
                })
                .collect();
            ContainerInspectResponse {
                id: Some(self.id.clone()),
                name: Some(format!("/{}", self.name)),
                created: DateTime::from_timestamp(self.created, 0).map(|t| t.to_rfc3339()),
                config: Some(ContainerConfig {
                    image: Some(self.image.clone()),
                    labels: self
                        .service
                        .as_ref()
                        .map(|s| HashMap::from([(SERVICE_LABEL.to_string(), s.clone())])),
                    ..Default::default()
                }),
                host_config: Some(HostConfig {
                    port_bindings: Some(bindings),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    }

    #[derive(Default)]
    struct RuntimeState {
        containers: Vec<FakeContainer>,
        calls: Vec<String>,
        fail_pull: bool,
        fail_remove: bool,
        // ids whose inspect times out
        inspect_timeouts: Vec<String>,
        // ids listed as running but gone by the time they are inspected
        vanished: Vec<String>,
        start_failures: Vec<String>,
        clock: i64,
    }

    #[derive(Clone, Default)]
    struct FakeRuntime {
        state: Arc<Mutex<RuntimeState>>,
        // pulls wait for a permit when set
        pull_gate: Option<Arc<Semaphore>>,
    }

    impl FakeRuntime {
        fn state(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
            self.state.lock().unwrap()
        }

        fn seed(&self, id: &str, image: &str, created: i64, ports: &[u16]) {
            self.state().containers.push(FakeContainer {
                id: id.to_string(),
                name: id.to_string(),
                image: image.to_string(),
                created,
                ports: ports.to_vec(),
                service: None,
                running: true,
            });
        }

        fn running(&self, image: &str) -> Vec<String> {
            let state = self.state();
            let mut running: Vec<_> = state
                .containers
                .iter()
                .filter(|c| c.running && c.image == image)
                .collect();
            running.sort_by(|a, b| b.created.cmp(&a.created));
            running.iter().map(|c| c.id.clone()).collect()
        }

        fn calls(&self) -> Vec<String> {
            self.state().calls.clone()
        }

        fn mutating_calls(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter(|c| !c.starts_with("list") && !c.starts_with("inspect"))
                .collect()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        async fn list_running(&self) -> Result<Vec<ContainerSummary>, BollardError> {
            let mut state = self.state();
            state.calls.push("list".to_string());
            Ok(state
                .containers
                .iter()
                .filter(|c| c.running)
                .map(|c| ContainerSummary {
                    id: Some(c.id.clone()),
                    names: Some(vec![format!("/{}", c.name)]),
                    image: Some(c.image.clone()),
                    ..Default::default()
                })
                .collect())
        }

        async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse, BollardError> {
            let mut state = self.state();
            state.calls.push(format!("inspect {container_id}"));
            if state.inspect_timeouts.iter().any(|id| id == container_id) {
                return Err(BollardError::RequestTimeoutError);
            }
            if state.vanished.iter().any(|id| id == container_id) {
                return Err(BollardError::DockerResponseServerError {
                    status_code: 404,
                    message: format!("No such container: {container_id}"),
                });
            }
            state
                .containers
                .iter()
                .find(|c| c.id == container_id)
                .map(FakeContainer::inspect)
                .ok_or_else(|| server_error("No such container"))
        }

        async fn pull(
            &self,
            image: &ImageName,
            _credentials: Option<DockerCredentials>,
        ) -> Result<(), BollardError> {
            let fail_pull = {
                let mut state = self.state();
                state.calls.push(format!("pull {image}"));
                state.fail_pull
            };
            if let Some(gate) = &self.pull_gate {
                gate.acquire().await.unwrap().forget();
            }
            if fail_pull {
                return Err(server_error("manifest unknown"));
            }
            Ok(())
        }

        async fn create(&self, name: &str, body: RuntimeContainerSpec) -> Result<ContainerId, BollardError> {
            let mut state = self.state();
            state.calls.push(format!("create {name}"));
            state.clock += 1;
            let id = format!("new-{}", state.clock);
            let ports: BTreeSet<u16> = body
                .host_config
                .and_then(|h| h.port_bindings)
                .into_iter()
                .flat_map(|bindings| bindings.into_values())
                .flatten()
                .flatten()
                .filter_map(|b| b.host_port?.parse().ok())
                .collect();
            let created = 1000 + state.clock;
            state.containers.push(FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image: body.image.unwrap_or_default(),
                created,
                ports: ports.into_iter().collect(),
                service: body.labels.and_then(|mut l| l.remove(SERVICE_LABEL)),
                running: false,
            });
            Ok(id)
        }

        async fn start(&self, container_id: &str) -> Result<(), BollardError> {
            let mut state = self.state();
            state.calls.push(format!("start {container_id}"));
            if !state.start_failures.is_empty() {
                let message = state.start_failures.remove(0);
                return Err(server_error(&message));
            }
            if let Some(container) = state.containers.iter_mut().find(|c| c.id == container_id) {
                container.running = true;
            }
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> Result<(), BollardError> {
            let mut state = self.state();
            state.calls.push(format!("remove {container_id}"));
            if state.fail_remove {
                return Err(server_error("removal already in progress"));
            }
            state.containers.retain(|c| c.id != container_id);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeGateway {
        calls: Arc<Mutex<Vec<(UpstreamId, String, u16)>>>,
        reject: bool,
    }

    impl FakeGateway {
        fn calls(&self) -> Vec<(UpstreamId, String, u16)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl UpstreamSwitcher for FakeGateway {
        async fn set_upstream(&self, upstream: &UpstreamId, host: &str, port: u16) -> Result<(), GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push((upstream.clone(), host.to_string(), port));
            if self.reject {
                return Err(GatewayError::Rejected {
                    status: StatusCode::NOT_FOUND,
                    body: "upstream not found".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct FakeHealth {
        healthy: bool,
        probes: Arc<Mutex<Vec<(u16, String)>>>,
    }

    impl HealthCheck for FakeHealth {
        async fn probe(&self, port: u16, path: &str) -> bool {
            self.probes.lock().unwrap().push((port, path.to_string()));
            self.healthy
        }
    }

    struct Harness {
        runtime: FakeRuntime,
        gateway: FakeGateway,
        health: FakeHealth,
        orchestrator: Orchestrator<FakeRuntime, FakeGateway, FakeHealth>,
    }

    fn service(name: &str, id: &str, health_check: &str, port: u16) -> ServiceDefinition {
        ServiceDefinition {
            name: ServiceName::new(name),
            id: UpstreamId::new(id),
            health_check: health_check.to_string(),
            port,
        }
    }

    fn harness_with(runtime: FakeRuntime, gateway: FakeGateway, healthy: bool) -> Harness {
        let services = vec![
            service("web", "1", "/health", 8080),
            service("api", "2", "/ready", 3000),
        ];
        let compose = ComposeFile {
            services: HashMap::from([
                (
                    "web".to_string(),
                    ComposeService {
                        image: ImageName::new(WEB_IMAGE),
                        ..Default::default()
                    },
                ),
                (
                    "api".to_string(),
                    ComposeService {
                        image: ImageName::new(API_IMAGE),
                        ..Default::default()
                    },
                ),
            ]),
        };
        let health = FakeHealth {
            healthy,
            probes: Default::default(),
        };
        let orchestrator = Orchestrator::new(
            services,
            compose,
            Lifecycle::new(runtime.clone(), HashMap::new(), Duration::from_secs(5)),
            gateway.clone(),
            health.clone(),
            Settings {
                upstream_host: "docker.local".to_string(),
                port_attempts: 3,
            },
        );
        Harness {
            runtime,
            gateway,
            health,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeRuntime::default(), FakeGateway::default(), true)
    }

    #[tokio::test]
    async fn test_up_fresh_service() {
        let h = harness();

        let deployment = h.orchestrator.up("web").await.unwrap().completed().unwrap();

        assert_eq!(h.runtime.running(WEB_IMAGE), vec![deployment.container.clone()]);
        assert_eq!(
            h.gateway.calls(),
            vec![(UpstreamId::new("1"), "docker.local".to_string(), deployment.port)]
        );
        assert_eq!(
            *h.health.probes.lock().unwrap(),
            vec![(deployment.port, "/health".to_string())]
        );
        assert!(deployment.pruned.is_empty());

        let state = h.runtime.state();
        let created = state
            .containers
            .iter()
            .find(|c| c.id == deployment.container)
            .unwrap();
        assert_eq!(created.ports, vec![deployment.port]);
        assert_eq!(created.service.as_deref(), Some("web"));
        assert!(created.name.starts_with("web-"));
        assert!(created.name.ends_with(&format!("-{}", deployment.port)));
    }

    #[tokio::test]
    async fn test_second_up_keeps_previous_as_retired() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);

        let deployment = h.orchestrator.up("web").await.unwrap().completed().unwrap();

        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec![deployment.container, "c1".to_string()]
        );
        assert!(deployment.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_up_prunes_older_retired_instances() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("a1", API_IMAGE, 3, &[9000]);

        let deployment = h.orchestrator.up("web").await.unwrap().completed().unwrap();

        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec![deployment.container, "c1".to_string()]
        );
        assert_eq!(deployment.pruned, vec!["c2".to_string(), "c3".to_string()]);
        assert_eq!(h.runtime.running(API_IMAGE), vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn test_up_unknown_service() {
        let h = harness();

        let outcome = h.orchestrator.up("unknown-service").await.unwrap();

        assert_eq!(outcome, Outcome::NotFound(ServiceName::new("unknown-service")));
        assert!(h.runtime.calls().is_empty());
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_creates_nothing() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.state().fail_pull = true;

        let err = h.orchestrator.up("web").await.unwrap_err();

        assert!(matches!(err, DeployError::PullFailed { .. }));
        assert_eq!(h.runtime.mutating_calls(), vec![format!("pull {WEB_IMAGE}")]);
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_removes_created_container() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime
            .state()
            .start_failures
            .push("OCI runtime create failed".to_string());

        let err = h.orchestrator.up("web").await.unwrap_err();

        assert!(matches!(err, DeployError::StartFailed { ref container, .. } if container == "new-1"));
        let calls = h.runtime.mutating_calls();
        assert_eq!(calls.last().unwrap(), "remove new-1");
        assert_eq!(h.runtime.state().containers.len(), 2);
        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec!["c1".to_string(), "c2".to_string()]
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_port_conflict_is_retried_with_fresh_port() {
        let h = harness();
        h.runtime.state().start_failures.push(
            "driver failed programming external connectivity on endpoint: Bind for 0.0.0.0:41234 failed: port is already allocated"
                .to_string(),
        );

        let deployment = h.orchestrator.up("web").await.unwrap().completed().unwrap();

        let calls = h.runtime.mutating_calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("create")).count(), 2);
        assert!(calls.contains(&"remove new-1".to_string()));
        assert_eq!(deployment.container, "new-2");
        assert_eq!(h.runtime.running(WEB_IMAGE), vec!["new-2".to_string()]);
        assert_eq!(h.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_health_failure_removes_container_and_keeps_upstream() {
        let h = harness_with(FakeRuntime::default(), FakeGateway::default(), false);
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);

        let err = h.orchestrator.up("web").await.unwrap_err();

        assert!(matches!(err, DeployError::HealthCheckFailed { .. }));
        assert_eq!(h.runtime.mutating_calls().last().unwrap(), "remove new-1");
        assert_eq!(h.runtime.running(WEB_IMAGE), vec!["c1".to_string()]);
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_keeps_new_container() {
        let gateway = FakeGateway {
            reject: true,
            ..Default::default()
        };
        let h = harness_with(FakeRuntime::default(), gateway, true);
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);

        let err = h.orchestrator.up("web").await.unwrap_err();

        assert!(matches!(err, DeployError::Gateway(GatewayError::Rejected { .. })));
        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec!["new-1".to_string(), "c1".to_string(), "c2".to_string()]
        );
        assert!(
            !h.runtime
                .mutating_calls()
                .iter()
                .any(|c| c.starts_with("remove"))
        );
    }

    #[tokio::test]
    async fn test_prune_failures_do_not_fail_up() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.state().fail_remove = true;

        let deployment = h.orchestrator.up("web").await.unwrap().completed().unwrap();

        assert!(deployment.pruned.is_empty());
        assert_eq!(h.runtime.running(WEB_IMAGE).len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_switches_to_retired_instance() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);

        let rolled_back = h
            .orchestrator
            .rollback("web")
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(rolled_back.container, "c2");
        assert_eq!(rolled_back.port, 8000);
        assert_eq!(
            h.gateway.calls(),
            vec![(UpstreamId::new("1"), "docker.local".to_string(), 8000)]
        );
        assert!(h.runtime.mutating_calls().is_empty());
        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec!["c1".to_string(), "c2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rollback_without_retired_instance() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);

        let err = h.orchestrator.rollback("web").await.unwrap_err();

        assert!(matches!(err, DeployError::NothingToRollBack(ref s) if s.as_str() == "web"));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_with_ambiguous_ports() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000, 9000]);

        let err = h.orchestrator.rollback("web").await.unwrap_err();

        assert!(
            matches!(err, DeployError::AmbiguousPortBinding { ref ports, .. } if *ports == vec![8000, 9000])
        );
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_unknown_service() {
        let h = harness();
        let outcome = h.orchestrator.rollback("nope").await.unwrap();
        assert_eq!(outcome, Outcome::NotFound(ServiceName::new("nope")));
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prune_all_keeps_current_instances() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.seed("a2", API_IMAGE, 2, &[9001]);
        h.runtime.seed("a1", API_IMAGE, 4, &[9002]);

        let reports = h
            .orchestrator
            .prune(PRUNE_ALL)
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].removed, vec!["c2".to_string(), "c3".to_string()]);
        assert_eq!(reports[1].removed, vec!["a2".to_string()]);
        assert_eq!(h.runtime.running(WEB_IMAGE), vec!["c1".to_string()]);
        assert_eq!(h.runtime.running(API_IMAGE), vec!["a1".to_string()]);
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prune_skips_single_instance() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);

        let reports = h.orchestrator.prune("web").await.unwrap().completed().unwrap();

        assert_eq!(reports.len(), 1);
        assert!(reports[0].removed.is_empty());
        assert!(h.runtime.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_prune_continues_after_remove_failure() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.state().fail_remove = true;

        let reports = h.orchestrator.prune("web").await.unwrap().completed().unwrap();

        assert_eq!(reports[0].failed, vec!["c2".to_string(), "c3".to_string()]);
        assert_eq!(
            h.runtime.mutating_calls(),
            vec!["remove c2".to_string(), "remove c3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prune_unknown_service() {
        let h = harness();
        let outcome = h.orchestrator.prune("nope").await.unwrap();
        assert_eq!(outcome, Outcome::NotFound(ServiceName::new("nope")));
    }

    #[tokio::test]
    async fn test_foreign_labelled_instances_are_left_alone() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.state().containers[1].service = Some("admin".to_string());

        let reports = h.orchestrator.prune("web").await.unwrap().completed().unwrap();

        assert!(reports[0].removed.is_empty());
        assert_eq!(h.runtime.running(WEB_IMAGE).len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_fails_when_an_instance_cannot_be_inspected() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.state().inspect_timeouts.push("c1".to_string());

        let err = h.orchestrator.rollback("web").await.unwrap_err();

        assert!(matches!(err, DeployError::RuntimeUnavailable(_)));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prune_fails_when_an_instance_cannot_be_inspected() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.state().inspect_timeouts.push("c1".to_string());

        let err = h.orchestrator.prune("web").await.unwrap_err();

        assert!(matches!(err, DeployError::RuntimeUnavailable(_)));
        assert!(h.runtime.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_container_gone_before_inspect_is_skipped() {
        let h = harness();
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c3", WEB_IMAGE, 1, &[7999]);
        h.runtime.state().vanished.push("c3".to_string());

        let rolled_back = h
            .orchestrator
            .rollback("web")
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(rolled_back.container, "c2");
        assert_eq!(
            h.gateway.calls(),
            vec![(UpstreamId::new("1"), "docker.local".to_string(), 8000)]
        );
    }

    #[tokio::test]
    async fn test_concurrent_ups_of_one_service_are_serialized() {
        let gate = Arc::new(Semaphore::new(0));
        let runtime = FakeRuntime {
            pull_gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = harness_with(runtime, FakeGateway::default(), true);

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(2);
        };
        let (first, second, ()) = tokio::join!(
            h.orchestrator.up("web"),
            h.orchestrator.up("web"),
            release
        );
        let first = first.unwrap().completed().unwrap();
        let second = second.unwrap().completed().unwrap();

        let calls = h.runtime.calls();
        let first_start = calls
            .iter()
            .position(|c| *c == format!("start {}", first.container))
            .unwrap();
        let second_list = calls.iter().rposition(|c| c == "list").unwrap();
        assert_eq!(calls.iter().filter(|c| *c == "list").count(), 2);
        assert!(first_start < second_list);

        assert_eq!(
            h.runtime.running(WEB_IMAGE),
            vec![second.container, first.container]
        );
        assert_eq!(h.gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness();
        h.runtime.seed("c2", WEB_IMAGE, 5, &[8000]);
        h.runtime.seed("c1", WEB_IMAGE, 10, &[8001]);

        let statuses = h.orchestrator.status("web").await.unwrap().completed().unwrap();

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, "c1");
        assert!(statuses[0].current);
        assert_eq!(statuses[1].ports, BTreeSet::from([8000]));
        assert!(!statuses[1].current);
    }

    #[tokio::test]
    async fn test_runtime_unavailable() {
        struct Down;
        impl ContainerRuntime for Down {
            async fn list_running(&self) -> Result<Vec<ContainerSummary>, BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
            async fn inspect(&self, _: &str) -> Result<ContainerInspectResponse, BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
            async fn pull(&self, _: &ImageName, _: Option<DockerCredentials>) -> Result<(), BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
            async fn create(&self, _: &str, _: RuntimeContainerSpec) -> Result<ContainerId, BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
            async fn start(&self, _: &str) -> Result<(), BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
            async fn remove(&self, _: &str) -> Result<(), BollardError> {
                Err(BollardError::RequestTimeoutError)
            }
        }

        let h = harness();
        let orchestrator = Orchestrator::new(
            h.orchestrator.services.clone(),
            h.orchestrator.compose.clone(),
            Lifecycle::new(Down, HashMap::new(), Duration::from_secs(5)),
            h.gateway.clone(),
            h.health.clone(),
            h.orchestrator.settings.clone(),
        );

        let err = orchestrator.up("web").await.unwrap_err();
        assert!(matches!(err, DeployError::RuntimeUnavailable(_)));
        assert!(h.gateway.calls().is_empty());
    }
}
