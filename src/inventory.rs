//! Live view of the running containers, grouped by image reference and
//! ordered newest first. Rebuilt from the runtime on every operation.
use crate::model::{ContainerId, ImageName, ServiceName};
use crate::runtime::ContainerRuntime;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};

/// Label put on every container created for a service.
pub const SERVICE_LABEL: &str = "switchyard.service";

#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub id: ContainerId,
    pub name: String,
    pub image: ImageName,
    pub created: DateTime<Utc>,
    pub details: ContainerInspectResponse,
}

impl RunningInstance {
    fn new(summary: ContainerSummary, details: ContainerInspectResponse) -> Self {
        let id = details
            .id
            .clone()
            .or(summary.id)
            .unwrap_or_default();
        let name = details
            .name
            .clone()
            .or_else(|| summary.names.and_then(|names| names.into_iter().next()))
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        // the summary shows the image id once the tag moved on, the config keeps the reference
        let image = details
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .or(summary.image)
            .unwrap_or_default();
        let created = details
            .created
            .as_deref()
            .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
            .map(|created| created.with_timezone(&Utc))
            .or_else(|| summary.created.and_then(|secs| DateTime::from_timestamp(secs, 0)))
            .unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            id,
            name,
            image: ImageName::new(image),
            created,
            details,
        }
    }

    /// Distinct host ports across all of the container's port bindings.
    pub fn host_ports(&self) -> BTreeSet<u16> {
        self.details
            .host_config
            .as_ref()
            .and_then(|host_config| host_config.port_bindings.as_ref())
            .into_iter()
            .flat_map(|bindings| bindings.values())
            .flatten()
            .flatten()
            .filter_map(|binding| binding.host_port.as_deref()?.parse().ok())
            .collect()
    }

    /// The host port, if the container publishes exactly one.
    pub fn single_host_port(&self) -> Option<u16> {
        let ports = self.host_ports();
        match ports.len() {
            1 => ports.first().copied(),
            _ => None,
        }
    }

    pub fn service_label(&self) -> Option<&str> {
        self.details
            .config
            .as_ref()?
            .labels
            .as_ref()?
            .get(SERVICE_LABEL)
            .map(String::as_str)
    }
}

/// Instances sharing one image reference, newest first. The first instance is
/// the current one, the rest are retired.
#[derive(Debug, Clone, Default)]
pub struct InstanceGroup {
    instances: Vec<RunningInstance>,
}

impl InstanceGroup {
    pub fn new(mut instances: Vec<RunningInstance>) -> Self {
        // stable sort, ties keep insertion order
        instances.sort_by(|a, b| b.created.cmp(&a.created));
        Self { instances }
    }

    pub fn current(&self) -> Option<&RunningInstance> {
        self.instances.first()
    }

    pub fn retired(&self) -> &[RunningInstance] {
        self.instances.get(1..).unwrap_or_default()
    }

    pub fn instances(&self) -> &[RunningInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drops instances labelled for another service. Unlabelled instances stay.
    pub fn for_service(self, service: &ServiceName) -> Self {
        let instances = self
            .instances
            .into_iter()
            .filter(|instance| {
                instance
                    .service_label()
                    .is_none_or(|label| label == service.as_str())
            })
            .collect();
        Self { instances }
    }
}

pub type Inventory = HashMap<ImageName, InstanceGroup>;

pub async fn list_instances<R: ContainerRuntime>(runtime: &R) -> Result<Inventory, BollardError> {
    let containers = runtime.list_running().await?;
    let mut grouped: HashMap<ImageName, Vec<RunningInstance>> = HashMap::new();
    for summary in containers {
        let Some(id) = summary.id.clone() else {
            continue;
        };
        let details = match runtime.inspect(&id).await {
            Ok(details) => details,
            // removed between list and inspect
            Err(BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            }) => {
                warn!("skipping container {id}, gone before inspect: {message}");
                continue;
            }
            Err(e) => return Err(e),
        };
        let instance = RunningInstance::new(summary, details);
        debug!(
            "running instance {} ({}) created {}",
            instance.name, instance.image, instance.created
        );
        grouped
            .entry(instance.image.clone())
            .or_default()
            .push(instance);
    }
    Ok(grouped
        .into_iter()
        .map(|(image, instances)| (image, InstanceGroup::new(instances)))
        .collect())
}
