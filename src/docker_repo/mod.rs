// Container runtime access: the RuntimeClient seam and its Docker implementation

mod build;
mod stats;

pub use stats::{RawStats, cpu_percent, memory_percent};

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::RuntimeError;
use crate::models::{BuildDescriptor, PortMapping};

/// Label put on every container this service creates.
pub const UNIT_LABEL: &str = "fleetwarden.unit";

/// Seconds Docker waits for a graceful stop before killing.
const STOP_GRACE_SECS: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningUnit {
    pub id: String,
    pub name: String,
}

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltArtifact {
    Image { tag: String },
    Compose {
        project: String,
        file: PathBuf,
        dir: PathBuf,
    },
}

impl BuiltArtifact {
    /// Image reference recorded on the unit.
    pub fn image_ref(&self) -> String {
        match self {
            BuiltArtifact::Image { tag } => tag.clone(),
            BuiltArtifact::Compose { project, .. } => format!("compose:{}", project),
        }
    }
}

/// Everything needed to start the replacement unit.
#[derive(Debug, Clone)]
pub struct UnitLaunch {
    pub name: String,
    pub artifact: BuiltArtifact,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
}

/// The container runtime operations the collector and deployer depend on.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn list_running(&self) -> Result<Vec<RunningUnit>, RuntimeError>;

    /// One-shot stats; the response carries both current and previous cumulative counters.
    async fn fetch_stats(&self, id: &str) -> Result<RawStats, RuntimeError>;

    /// Stop (graceful, then forced) and remove. A unit that is already gone is not an error.
    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn build(
        &self,
        source_dir: &Path,
        descriptor: &BuildDescriptor,
        tag: &str,
    ) -> Result<BuiltArtifact, RuntimeError>;

    /// Create and start the unit; returns its runtime id.
    async fn start(&self, launch: &UnitLaunch) -> Result<String, RuntimeError>;
}

pub struct DockerRepo {
    docker: Docker,
}

impl DockerRepo {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_unix_defaults()?;
        Ok(Self { docker })
    }

    /// Fails when the daemon does not answer a ping.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn list_with_filters(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<RunningUnit>, RuntimeError> {
        let options = ListContainersOptions {
            all: false,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(RunningUnit { id, name })
            })
            .collect())
    }

    async fn create_and_start(&self, launch: &UnitLaunch, image: &str) -> Result<String, RuntimeError> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = launch
            .ports
            .iter()
            .map(|p| {
                (
                    format!("{}/tcp", p.container_port),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();
        let env: Vec<String> = launch
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut labels = HashMap::new();
        labels.insert(UNIT_LABEL.to_string(), launch.name.clone());

        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds: Some(launch.volumes.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(launch.name.clone()),
            ..Default::default()
        };
        let created = self.docker.create_container(Some(options), body).await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl RuntimeClient for DockerRepo {
    #[tracing::instrument(skip(self))]
    async fn list_running(&self) -> Result<Vec<RunningUnit>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        self.list_with_filters(filters).await
    }

    async fn fetch_stats(&self, id: &str) -> Result<RawStats, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            ..Default::default()
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(RawStats::from_response(&response)),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Api(format!("empty stats stream for {}", id))),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn stop_and_remove(&self, id: &str) -> Result<(), RuntimeError> {
        let stop = StopContainerOptions {
            t: Some(STOP_GRACE_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(stop)).await {
            Ok(()) => {}
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => return Ok(()),
                other => return Err(other),
            },
        }
        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(remove)).await {
            Ok(()) => Ok(()),
            Err(e) => match RuntimeError::from(e) {
                RuntimeError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn build(
        &self,
        source_dir: &Path,
        descriptor: &BuildDescriptor,
        tag: &str,
    ) -> Result<BuiltArtifact, RuntimeError> {
        match descriptor {
            BuildDescriptor::Dockerfile(file) => {
                build::image(source_dir, file, tag).await?;
                Ok(BuiltArtifact::Image {
                    tag: tag.to_string(),
                })
            }
            BuildDescriptor::Compose(file) => {
                let project = build::compose_project_name(tag);
                build::compose_build(source_dir, file, &project).await?;
                Ok(BuiltArtifact::Compose {
                    project,
                    file: file.clone(),
                    dir: source_dir.to_path_buf(),
                })
            }
        }
    }

    #[tracing::instrument(skip(self, launch), fields(unit = %launch.name))]
    async fn start(&self, launch: &UnitLaunch) -> Result<String, RuntimeError> {
        match &launch.artifact {
            BuiltArtifact::Image { tag } => self.create_and_start(launch, tag).await,
            BuiltArtifact::Compose { project, file, dir } => {
                build::compose_up(dir, file, project, &launch.env).await?;
                let mut filters = HashMap::new();
                filters.insert(
                    "label".to_string(),
                    vec![format!("com.docker.compose.project={}", project)],
                );
                let started = self.list_with_filters(filters).await?;
                started
                    .into_iter()
                    .next()
                    .map(|u| u.id)
                    .ok_or_else(|| {
                        RuntimeError::Api(format!("compose project {} has no running container", project))
                    })
            }
        }
    }
}
