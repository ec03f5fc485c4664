use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StopContainerOptions};

use crate::exec::{ExecTarget, RemoteError, RemoteExec};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
	#[error("daemon unreachable: {0}")]
	Unreachable(String),

	#[error("daemon command failed: {0}")]
	Command(String),

	#[error("unexpected daemon output: {0}")]
	Parse(String),
}

impl From<RemoteError> for DaemonError {
	fn from(err: RemoteError) -> Self {
		match err {
			RemoteError::Timeout(_) | RemoteError::Transport(_) => {
				DaemonError::Unreachable(err.to_string())
			}
			RemoteError::CommandFailed { .. } => DaemonError::Command(err.to_string()),
		}
	}
}

impl From<bollard::errors::Error> for DaemonError {
	fn from(err: bollard::errors::Error) -> Self {
		DaemonError::Unreachable(err.to_string())
	}
}

#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
	pub cpu_cores: u32,
	pub total_ram_mb: u64,
	pub containers_running: u32,
}

/// The four operations the conductor needs from a container daemon.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
	async fn ping(&self) -> Result<(), DaemonError>;
	/// Container names matching the workload naming prefix.
	async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, DaemonError>;
	async fn stop(&self, container: &str, grace: Duration) -> Result<(), DaemonError>;
	async fn system_info(&self) -> Result<SystemInfo, DaemonError>;
}

/// Local daemon over the Docker socket.
pub struct DockerDaemon {
	docker: bollard::Docker,
}

impl DockerDaemon {
	pub fn connect() -> Result<Self, DaemonError> {
		let docker = bollard::Docker::connect_with_local_defaults()?;
		Ok(Self { docker })
	}
}

#[async_trait]
impl ContainerDaemon for DockerDaemon {
	async fn ping(&self) -> Result<(), DaemonError> {
		self.docker.ping().await?;
		Ok(())
	}

	async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, DaemonError> {
		let mut filters = HashMap::new();
		filters.insert("name".to_string(), vec![format!("^/{prefix}")]);

		let containers = self
			.docker
			.list_containers(Some(ListContainersOptions {
				all: false,
				filters,
				..Default::default()
			}))
			.await?;

		Ok(containers
			.into_iter()
			.flat_map(|c| c.names.unwrap_or_default())
			.map(|name| name.trim_start_matches('/').to_string())
			.collect())
	}

	async fn stop(&self, container: &str, grace: Duration) -> Result<(), DaemonError> {
		self.docker
			.stop_container(
				container,
				Some(StopContainerOptions {
					t: grace.as_secs() as i64,
				}),
			)
			.await?;
		Ok(())
	}

	async fn system_info(&self) -> Result<SystemInfo, DaemonError> {
		let info = self.docker.info().await?;
		Ok(SystemInfo {
			cpu_cores: info.ncpu.unwrap_or(0) as u32,
			total_ram_mb: (info.mem_total.unwrap_or(0) / (1024 * 1024)) as u64,
			containers_running: info.containers_running.unwrap_or(0) as u32,
		})
	}
}

/// Daemon on a worker node, tunneled through the shell transport.
pub struct RemoteDaemon {
	exec: Arc<dyn RemoteExec>,
	target: ExecTarget,
	timeout: Duration,
}

impl RemoteDaemon {
	pub fn new(exec: Arc<dyn RemoteExec>, target: ExecTarget, timeout: Duration) -> Self {
		Self {
			exec,
			target,
			timeout,
		}
	}
}

#[async_trait]
impl ContainerDaemon for RemoteDaemon {
	async fn ping(&self) -> Result<(), DaemonError> {
		self.exec
			.exec(
				&self.target,
				"docker info --format '{{.ServerVersion}}'",
				self.timeout,
			)
			.await?;
		Ok(())
	}

	async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, DaemonError> {
		let out = self
			.exec
			.exec(
				&self.target,
				&format!("docker ps --format '{{{{.Names}}}}' --filter 'name=^{prefix}'"),
				self.timeout,
			)
			.await?;

		Ok(out
			.lines()
			.map(str::trim)
			.filter(|l| !l.is_empty())
			.map(str::to_string)
			.collect())
	}

	async fn stop(&self, container: &str, grace: Duration) -> Result<(), DaemonError> {
		self.exec
			.exec(
				&self.target,
				&format!("docker stop -t {} {container}", grace.as_secs()),
				// Stop must be allowed to outlive the grace period.
				self.timeout + grace,
			)
			.await?;
		Ok(())
	}

	async fn system_info(&self) -> Result<SystemInfo, DaemonError> {
		let out = self
			.exec
			.exec(
				&self.target,
				"docker info --format '{{.NCPU}} {{.MemTotal}}' && docker ps -q | wc -l",
				self.timeout,
			)
			.await?;

		let mut lines = out.lines();
		let first = lines.next().unwrap_or_default();
		let mut parts = first.split_whitespace();
		let cpu_cores = parts
			.next()
			.and_then(|v| v.parse::<u32>().ok())
			.ok_or_else(|| DaemonError::Parse(first.to_string()))?;
		let total_ram_mb = parts
			.next()
			.and_then(|v| v.parse::<u64>().ok())
			.map(|bytes| bytes / (1024 * 1024))
			.ok_or_else(|| DaemonError::Parse(first.to_string()))?;
		let containers_running = lines
			.next()
			.and_then(|v| v.trim().parse::<u32>().ok())
			.unwrap_or(0);

		Ok(SystemInfo {
			cpu_cores,
			total_ram_mb,
			containers_running,
		})
	}
}
