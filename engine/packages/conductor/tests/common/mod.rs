use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use conductor::{Dependencies, ServerExecutor, StartContract};
use conductor_provision::{CloudImage, CloudProvider, CloudServer, CreateServerRequest};
use conductor_remote::{
	ContainerDaemon, DaemonError, ExecTarget, GameProxy, RemoteError, RemoteExec, SystemInfo,
};
use conductor_store::{MemoryAuditLog, MemoryContainerStore, MemoryNodeStore};
use conductor_types::{HealthStatus, Node, NodeKind, NodeLifecycle, ServerTypeSpec};

#[derive(Default)]
pub struct MockCloud {
	pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl CloudProvider for MockCloud {
	async fn create_server(&self, req: CreateServerRequest) -> anyhow::Result<CloudServer> {
		Ok(CloudServer {
			id: "4711".into(),
			name: req.name,
			public_ip: "203.0.113.7".into(),
			status: "running".into(),
			server_type: req.server_type,
			ram_mb: 8192,
			cores: 4,
			hourly_cost_eur: 0.0127,
			labels: req.labels,
			created_at: Some(Utc::now()),
		})
	}

	async fn delete_server(&self, provider_id: &str) -> anyhow::Result<()> {
		self.deleted.lock().unwrap().push(provider_id.to_string());
		Ok(())
	}

	async fn server(&self, provider_id: &str) -> anyhow::Result<CloudServer> {
		anyhow::bail!("unknown server {provider_id}")
	}

	async fn list_servers(&self, _label_selector: &str) -> anyhow::Result<Vec<CloudServer>> {
		Ok(Vec::new())
	}

	async fn server_types(&self) -> anyhow::Result<Vec<ServerTypeSpec>> {
		Ok(Vec::new())
	}

	async fn images(&self) -> anyhow::Result<Vec<CloudImage>> {
		Ok(Vec::new())
	}

	async fn wait_until_reachable(
		&self,
		provider_id: &str,
		_timeout: Duration,
	) -> anyhow::Result<CloudServer> {
		let mut server = self
			.create_server(CreateServerRequest {
				name: "cloud-test".into(),
				server_type: "cx32".into(),
				image: "docker-ce".into(),
				location: "nbg1".into(),
				labels: HashMap::new(),
			})
			.await?;
		server.id = provider_id.to_string();
		Ok(server)
	}

	async fn cpu_percent(&self, _provider_id: &str) -> anyhow::Result<f64> {
		Ok(7.5)
	}

	async fn create_snapshot(
		&self,
		_provider_id: &str,
		_description: &str,
	) -> anyhow::Result<CloudImage> {
		anyhow::bail!("not supported")
	}

	async fn delete_image(&self, _image_id: &str) -> anyhow::Result<()> {
		Ok(())
	}

	async fn hourly_price(&self, _server_type: &str) -> anyhow::Result<f64> {
		Ok(0.0127)
	}
}

#[derive(Default)]
pub struct MockExec;

#[async_trait]
impl RemoteExec for MockExec {
	async fn exec(
		&self,
		_target: &ExecTarget,
		_command: &str,
		_timeout: Duration,
	) -> Result<String, RemoteError> {
		Ok(String::new())
	}
}

#[derive(Default)]
pub struct MockDaemon {
	pub stopped: Mutex<Vec<String>>,
	pub fail_stop: bool,
}

#[async_trait]
impl ContainerDaemon for MockDaemon {
	async fn ping(&self) -> Result<(), DaemonError> {
		Ok(())
	}

	async fn list_by_prefix(&self, _prefix: &str) -> Result<Vec<String>, DaemonError> {
		Ok(Vec::new())
	}

	async fn stop(&self, container: &str, _grace: Duration) -> Result<(), DaemonError> {
		if self.fail_stop {
			return Err(DaemonError::Command("stop failed".into()));
		}
		self.stopped.lock().unwrap().push(container.to_string());
		Ok(())
	}

	async fn system_info(&self) -> Result<SystemInfo, DaemonError> {
		Ok(SystemInfo::default())
	}
}

#[derive(Default)]
pub struct RecordingProxy {
	pub registered: Mutex<Vec<(String, String)>>,
	pub unregistered: Mutex<Vec<String>>,
}

#[async_trait]
impl GameProxy for RecordingProxy {
	async fn register_server(&self, name: &str, address: &str) -> anyhow::Result<()> {
		self.registered
			.lock()
			.unwrap()
			.push((name.to_string(), address.to_string()));
		Ok(())
	}

	async fn unregister_server(&self, name: &str) -> anyhow::Result<()> {
		self.unregistered.lock().unwrap().push(name.to_string());
		Ok(())
	}

	async fn player_count(&self, _name: &str) -> anyhow::Result<u32> {
		Ok(0)
	}
}

#[derive(Default)]
pub struct RecordingExecutor {
	pub contracts: Mutex<Vec<StartContract>>,
	pub fail: bool,
}

#[async_trait]
impl ServerExecutor for RecordingExecutor {
	async fn launch(&self, contract: StartContract) -> anyhow::Result<()> {
		if self.fail {
			anyhow::bail!("image pull failed");
		}
		self.contracts.lock().unwrap().push(contract);
		Ok(())
	}
}

pub struct Harness {
	pub cloud: Arc<MockCloud>,
	pub daemon: Arc<MockDaemon>,
	pub proxy: Arc<RecordingProxy>,
	pub executor: Arc<RecordingExecutor>,
	pub node_store: Arc<MemoryNodeStore>,
	pub container_store: Arc<MemoryContainerStore>,
	pub audit: Arc<MemoryAuditLog>,
}

impl Harness {
	pub fn new() -> Self {
		Self {
			cloud: Arc::new(MockCloud::default()),
			daemon: Arc::new(MockDaemon::default()),
			proxy: Arc::new(RecordingProxy::default()),
			executor: Arc::new(RecordingExecutor::default()),
			node_store: Arc::new(MemoryNodeStore::default()),
			container_store: Arc::new(MemoryContainerStore::default()),
			audit: Arc::new(MemoryAuditLog::default()),
		}
	}

	pub fn with_failing_executor(mut self) -> Self {
		self.executor = Arc::new(RecordingExecutor {
			fail: true,
			..Default::default()
		});
		self
	}

	pub fn with_failing_stop(mut self) -> Self {
		self.daemon = Arc::new(MockDaemon {
			fail_stop: true,
			..Default::default()
		});
		self
	}

	pub fn dependencies(&self) -> Dependencies {
		Dependencies {
			cloud: self.cloud.clone(),
			exec: Arc::new(MockExec),
			local_daemon: self.daemon.clone(),
			proxy: self.proxy.clone(),
			executor: self.executor.clone(),
			events: Arc::new(conductor_events::NoopPublisher),
			node_store: Some(self.node_store.clone()),
			container_store: Some(self.container_store.clone()),
			metrics_store: None,
			audit: self.audit.clone(),
		}
	}
}

/// Config with instant admission and snapshots parked in a temp dir.
pub fn test_config(state_dir: &std::path::Path) -> conductor_config::Config {
	let mut cfg = conductor_config::Config::default();
	cfg.admission.startup_delay_secs = 0;
	cfg.paths.state_dir = state_dir.to_string_lossy().into_owned();
	cfg
}

pub fn healthy_worker(id: &str, kind: NodeKind, total_ram_mb: u64) -> Node {
	let mut n = Node::new(id, kind, total_ram_mb, 0.1);
	n.hostname = format!("{id}.example");
	n.ip = "10.0.0.7".into();
	n.ssh_user = "root".into();
	n.ssh_key_path = "/tmp/key".into();
	n.status = HealthStatus::Healthy;
	n.lifecycle = NodeLifecycle::Ready;
	n.cloud_provider_id = Some("4711".into());
	n.hourly_cost_eur = 0.0127;
	n
}
