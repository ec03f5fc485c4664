use std::{collections::HashSet, sync::Arc, time::Duration};

use conductor_registry::{ContainerRegistry, NodeRegistry};
use conductor_remote::{ContainerDaemon, ExecTarget, RemoteDaemon, RemoteExec, probe_resources};
use conductor_types::{HealthStatus, Node, NodeLifecycle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Periodic liveness probe and ghost-container reconciliation.
///
/// Health policy: an unreachable daemon (local or remote) flips the node
/// unhealthy; failing resource queries and low-resource readings are
/// warnings only, capacity pressure is the node selector's problem.
pub struct HealthChecker {
	nodes: Arc<NodeRegistry>,
	containers: Arc<ContainerRegistry>,
	local_daemon: Arc<dyn ContainerDaemon>,
	exec: Arc<dyn RemoteExec>,
	cfg: conductor_config::Health,
	container_prefix: String,
}

impl HealthChecker {
	pub fn new(
		nodes: Arc<NodeRegistry>,
		containers: Arc<ContainerRegistry>,
		local_daemon: Arc<dyn ContainerDaemon>,
		exec: Arc<dyn RemoteExec>,
		cfg: conductor_config::Health,
		container_prefix: String,
	) -> Self {
		Self {
			nodes,
			containers,
			local_daemon,
			exec,
			cfg,
			container_prefix,
		}
	}

	pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.cfg.interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => self.run_once().await,
					_ = shutdown.cancelled() => {
						tracing::debug!("health checker stopping");
						return;
					}
				}
			}
		})
	}

	/// One full pass over the fleet. Failures are per-node; the pass never
	/// aborts early.
	#[tracing::instrument(skip_all)]
	pub async fn run_once(&self) {
		for node in self.nodes.all() {
			// Nodes mid-provisioning belong to the provisioner.
			if matches!(
				node.lifecycle,
				NodeLifecycle::Provisioning
					| NodeLifecycle::Initializing
					| NodeLifecycle::Decommissioned
			) {
				continue;
			}

			self.check_node(&node).await;
		}
	}

	fn is_local(node: &Node) -> bool {
		node.kind == conductor_types::NodeKind::Local
			|| node.id.starts_with("local")
			|| matches!(node.ip.as_str(), "" | "127.0.0.1" | "localhost")
	}

	fn target(node: &Node) -> ExecTarget {
		ExecTarget {
			host: node.ip.clone(),
			user: node.ssh_user.clone(),
			key_path: node.ssh_key_path.clone(),
		}
	}

	async fn check_node(&self, node: &Node) {
		let status = if Self::is_local(node) {
			self.check_local(node).await
		} else {
			self.check_remote(node).await
		};

		if let Err(err) = self.nodes.update_status(&node.id, status) {
			tracing::debug!(node_id = %node.id, ?err, "node vanished during health check");
			return;
		}

		if status == HealthStatus::Healthy {
			self.reconcile_containers(node).await;
		}
	}

	async fn check_local(&self, node: &Node) -> HealthStatus {
		match timeout(self.cfg.local_ping_timeout(), self.local_daemon.ping()).await {
			Ok(Ok(())) => HealthStatus::Healthy,
			Ok(Err(err)) => {
				tracing::warn!(node_id = %node.id, ?err, "local daemon ping failed");
				HealthStatus::Unhealthy
			}
			Err(_) => {
				tracing::warn!(node_id = %node.id, "local daemon ping timed out");
				HealthStatus::Unhealthy
			}
		}
	}

	async fn check_remote(&self, node: &Node) -> HealthStatus {
		let target = Self::target(node);
		let daemon = RemoteDaemon::new(self.exec.clone(), target.clone(), self.cfg.node_timeout());

		match timeout(self.cfg.node_timeout(), daemon.ping()).await {
			Ok(Ok(())) => {}
			Ok(Err(err)) => {
				tracing::warn!(node_id = %node.id, ?err, "remote daemon unreachable");
				return HealthStatus::Unhealthy;
			}
			Err(_) => {
				tracing::warn!(node_id = %node.id, "remote health probe timed out");
				return HealthStatus::Unhealthy;
			}
		}

		// Resource pressure never flips health; the selector already books
		// against capacity and a busy node is not a dead node.
		match probe_resources(self.exec.as_ref(), &target, self.cfg.node_timeout()).await {
			Ok(res) => {
				if res.free_ram_mb < self.cfg.min_free_ram_mb {
					tracing::warn!(
						node_id = %node.id,
						free_ram_mb = res.free_ram_mb,
						"node is low on free RAM"
					);
				}
				if res.disk_used_percent > self.cfg.max_disk_percent {
					tracing::warn!(
						node_id = %node.id,
						disk_used_percent = res.disk_used_percent,
						"node root filesystem is nearly full"
					);
				}
			}
			Err(err) => {
				tracing::warn!(node_id = %node.id, ?err, "resource query failed");
			}
		}

		HealthStatus::Healthy
	}

	/// Lists the node's workload containers and sweeps registry ghosts,
	/// then resyncs the node's counters from what the registry now holds.
	async fn reconcile_containers(&self, node: &Node) {
		let listed = if Self::is_local(node) {
			timeout(
				self.cfg.list_timeout(),
				self.local_daemon.list_by_prefix(&self.container_prefix),
			)
			.await
		} else {
			let daemon = RemoteDaemon::new(
				self.exec.clone(),
				Self::target(node),
				self.cfg.list_timeout(),
			);
			timeout(
				self.cfg.list_timeout(),
				daemon.list_by_prefix(&self.container_prefix),
			)
			.await
		};

		let observed = match listed {
			Ok(Ok(names)) => names.into_iter().collect::<HashSet<_>>(),
			Ok(Err(err)) => {
				tracing::warn!(node_id = %node.id, ?err, "container listing failed");
				return;
			}
			Err(_) => {
				tracing::warn!(node_id = %node.id, "container listing timed out");
				return;
			}
		};

		let removed = self
			.containers
			.sync_node_containers(&node.id, &observed)
			.await;
		if !removed.is_empty() {
			tracing::info!(
				node_id = %node.id,
				ghosts = removed.len(),
				"ghost sweep removed containers"
			);
		}

		let (count, allocated) = self.containers.node_allocation(&node.id);
		if let Err(err) = self.nodes.update_resources(&node.id, count, allocated) {
			tracing::debug!(node_id = %node.id, ?err, "node vanished during resync");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{collections::HashMap, sync::Mutex, time::Duration};

	use async_trait::async_trait;
	use conductor_remote::{DaemonError, RemoteError, SystemInfo};
	use conductor_types::{ContainerInfo, ContainerStatus, NodeKind};

	use super::*;

	#[derive(Default)]
	struct MockDaemon {
		reachable: bool,
		containers: Vec<String>,
	}

	#[async_trait]
	impl ContainerDaemon for MockDaemon {
		async fn ping(&self) -> Result<(), DaemonError> {
			if self.reachable {
				Ok(())
			} else {
				Err(DaemonError::Unreachable("connection refused".into()))
			}
		}

		async fn list_by_prefix(&self, _prefix: &str) -> Result<Vec<String>, DaemonError> {
			Ok(self.containers.clone())
		}

		async fn stop(&self, _container: &str, _grace: Duration) -> Result<(), DaemonError> {
			Ok(())
		}

		async fn system_info(&self) -> Result<SystemInfo, DaemonError> {
			Ok(SystemInfo::default())
		}
	}

	/// Maps command substrings to canned stdout; anything unmatched errors.
	#[derive(Default)]
	struct ScriptedExec {
		responses: Mutex<HashMap<&'static str, Result<String, ()>>>,
	}

	impl ScriptedExec {
		fn respond(self, needle: &'static str, output: &str) -> Self {
			self.responses
				.lock()
				.unwrap()
				.insert(needle, Ok(output.to_string()));
			self
		}

		fn fail(self, needle: &'static str) -> Self {
			self.responses.lock().unwrap().insert(needle, Err(()));
			self
		}
	}

	#[async_trait]
	impl RemoteExec for ScriptedExec {
		async fn exec(
			&self,
			_target: &ExecTarget,
			command: &str,
			_timeout: Duration,
		) -> Result<String, RemoteError> {
			let responses = self.responses.lock().unwrap();
			for (needle, result) in responses.iter() {
				if command.contains(needle) {
					return match result {
						Ok(out) => Ok(out.clone()),
						Err(()) => Err(RemoteError::CommandFailed {
							code: 255,
							stderr: "boom".into(),
						}),
					};
				}
			}
			Err(RemoteError::Timeout(Duration::from_secs(1)))
		}
	}

	fn remote_node(id: &str) -> Node {
		let mut n = Node::new(id, NodeKind::Cloud, 8192, 0.1);
		n.ip = "10.0.0.9".into();
		n.ssh_user = "root".into();
		n.ssh_key_path = "/tmp/key".into();
		n.status = HealthStatus::Unknown;
		n
	}

	async fn fixtures(
		exec: ScriptedExec,
	) -> (Arc<NodeRegistry>, Arc<ContainerRegistry>, HealthChecker) {
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let containers = Arc::new(ContainerRegistry::new(nodes.clone()));
		let checker = HealthChecker::new(
			nodes.clone(),
			containers.clone(),
			Arc::new(MockDaemon {
				reachable: true,
				containers: Vec::new(),
			}),
			Arc::new(exec),
			conductor_config::Health::default(),
			"mc-".into(),
		);
		(nodes, containers, checker)
	}

	#[tokio::test]
	async fn low_free_ram_is_a_warning_not_unhealthy() {
		let exec = ScriptedExec::default()
			.respond("docker info", "27.1.1\n")
			.respond("free -m", "300\n")
			.respond("df -h", "50\n")
			.respond("docker ps", "");
		let (nodes, _, checker) = fixtures(exec).await;
		nodes.register(remote_node("cloud-a1")).await;

		checker.run_once().await;

		let node = nodes.get("cloud-a1").unwrap();
		assert_eq!(node.status, HealthStatus::Healthy);
		assert!(node.last_health_check.is_some());
	}

	#[tokio::test]
	async fn unreachable_daemon_flips_unhealthy() {
		let exec = ScriptedExec::default().fail("docker info");
		let (nodes, _, checker) = fixtures(exec).await;
		nodes.register(remote_node("cloud-a1")).await;

		checker.run_once().await;

		assert_eq!(
			nodes.get("cloud-a1").unwrap().status,
			HealthStatus::Unhealthy
		);
	}

	#[tokio::test]
	async fn resource_probe_failure_keeps_node_healthy() {
		let exec = ScriptedExec::default()
			.respond("docker info", "27.1.1\n")
			.fail("free -m")
			.respond("docker ps", "");
		let (nodes, _, checker) = fixtures(exec).await;
		nodes.register(remote_node("cloud-a1")).await;

		checker.run_once().await;

		assert_eq!(nodes.get("cloud-a1").unwrap().status, HealthStatus::Healthy);
	}

	#[tokio::test]
	async fn healthy_pass_sweeps_ghosts_and_resyncs_counters() {
		let exec = ScriptedExec::default()
			.respond("docker info", "27.1.1\n")
			.respond("free -m", "6000\n")
			.respond("df -h", "40\n")
			.respond("docker ps", "mc-srv-1\n");
		let (nodes, containers, checker) = fixtures(exec).await;
		nodes.register(remote_node("cloud-a1")).await;
		nodes.allocate_ram("cloud-a1", 4096);
		nodes.allocate_ram("cloud-a1", 2048);

		let mut alive = ContainerInfo::reserving("srv-1", "alpha", 4096);
		alive.node_id = "cloud-a1".into();
		alive.container_id = "mc-srv-1".into();
		alive.status = ContainerStatus::Running;
		containers.register(alive).await;

		let mut ghost = ContainerInfo::reserving("srv-2", "beta", 2048);
		ghost.node_id = "cloud-a1".into();
		ghost.container_id = "mc-srv-2".into();
		ghost.status = ContainerStatus::Running;
		containers.register(ghost).await;

		checker.run_once().await;

		assert!(containers.get("srv-2").is_none());
		let node = nodes.get("cloud-a1").unwrap();
		assert_eq!(node.container_count, 1);
		assert_eq!(node.allocated_ram_mb, 4096);
	}
}
