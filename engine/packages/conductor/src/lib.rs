mod admission;
mod executor;
mod migration;
mod recovery;
mod workers;

use std::sync::Arc;

use conductor_events::EventPublisher;
use conductor_health::HealthChecker;
use conductor_placement::NodeSelector;
use conductor_provision::{CloudProvider, Provisioner};
use conductor_registry::{ContainerRegistry, NodeRegistry, StartQueue};
use conductor_remote::{ContainerDaemon, GameProxy, RemoteDaemon, RemoteExec};
use conductor_scaler::{ConsolidationPolicy, ReactivePolicy, ScalingEngine};
use conductor_store::{AuditLog, ContainerStore, MetricsStore, NodeStore};
use conductor_types::{FleetStats, Node};
use tokio_util::sync::CancellationToken;

pub use admission::{AdmissionError, StartOutcome};
pub use executor::{LoggingExecutor, ServerExecutor, StartContract};

/// External collaborators the conductor is wired with. Everything the core
/// does not own itself arrives as a capability trait.
pub struct Dependencies {
	pub cloud: Arc<dyn CloudProvider>,
	pub exec: Arc<dyn RemoteExec>,
	pub local_daemon: Arc<dyn ContainerDaemon>,
	pub proxy: Arc<dyn GameProxy>,
	pub executor: Arc<dyn ServerExecutor>,
	pub events: Arc<dyn EventPublisher>,
	pub node_store: Option<Arc<dyn NodeStore>>,
	pub container_store: Option<Arc<dyn ContainerStore>>,
	pub metrics_store: Option<Arc<dyn MetricsStore>>,
	pub audit: Arc<dyn AuditLog>,
}

/// The orchestration brain: wires the registries, admission, health,
/// provisioning and scaling together and runs the background workers.
pub struct Conductor {
	cfg: conductor_config::Config,
	nodes: Arc<NodeRegistry>,
	containers: Arc<ContainerRegistry>,
	queue: Arc<StartQueue>,
	selector: NodeSelector,
	provisioner: Arc<Provisioner>,
	scaler: Arc<ScalingEngine>,
	health: Arc<HealthChecker>,
	events: Arc<dyn EventPublisher>,
	proxy: Arc<dyn GameProxy>,
	executor: Arc<dyn ServerExecutor>,
	cloud: Arc<dyn CloudProvider>,
	exec: Arc<dyn RemoteExec>,
	local_daemon: Arc<dyn ContainerDaemon>,
	container_store: Option<Arc<dyn ContainerStore>>,
	metrics_store: Option<Arc<dyn MetricsStore>>,
	audit: Arc<dyn AuditLog>,
	started_at: tokio::time::Instant,
	/// Serializes queue processing so concurrent triggers cannot double-start.
	queue_lock: tokio::sync::Mutex<()>,
	shutdown: CancellationToken,
	/// Back-reference for background work spawned from `&self` methods.
	weak_self: std::sync::OnceLock<std::sync::Weak<Conductor>>,
}

impl Conductor {
	pub fn new(cfg: conductor_config::Config, deps: Dependencies) -> Arc<Self> {
		let mut system_ids = cfg.cluster.control_node_ids.clone();
		system_ids.extend(cfg.cluster.proxy_node_ids.clone());

		let mut nodes = NodeRegistry::new(system_ids);
		if let Some(store) = &deps.node_store {
			nodes = nodes.with_store(store.clone());
		}
		let nodes = Arc::new(nodes);

		let mut containers = ContainerRegistry::new(nodes.clone());
		if let Some(store) = &deps.container_store {
			containers = containers.with_store(store.clone());
		}
		let containers = Arc::new(containers);
		let queue = Arc::new(StartQueue::new());

		let provisioner = Arc::new(Provisioner::new(
			deps.cloud.clone(),
			nodes.clone(),
			deps.events.clone(),
			deps.audit.clone(),
			cfg.clone(),
		));

		let scaler = Arc::new(ScalingEngine::new(
			nodes.clone(),
			containers.clone(),
			queue.clone(),
			provisioner.clone(),
			deps.events.clone(),
			cfg.clone(),
		));
		scaler.register_policy(Arc::new(ReactivePolicy::new(
			cfg.scaling.reactive.clone(),
			cfg.cloud.clone(),
		)));
		scaler.register_policy(Arc::new(ConsolidationPolicy::new(
			cfg.scaling.consolidation.clone(),
			deps.proxy.clone(),
		)));

		let health = Arc::new(HealthChecker::new(
			nodes.clone(),
			containers.clone(),
			deps.local_daemon.clone(),
			deps.exec.clone(),
			cfg.health.clone(),
			cfg.cluster.container_prefix.clone(),
		));

		let conductor = Arc::new(Self {
			selector: NodeSelector::new(nodes.clone()),
			nodes,
			containers,
			queue,
			provisioner,
			scaler,
			health,
			events: deps.events,
			proxy: deps.proxy,
			executor: deps.executor,
			cloud: deps.cloud,
			exec: deps.exec,
			local_daemon: deps.local_daemon,
			container_store: deps.container_store,
			metrics_store: deps.metrics_store,
			audit: deps.audit,
			started_at: tokio::time::Instant::now(),
			queue_lock: tokio::sync::Mutex::new(()),
			shutdown: CancellationToken::new(),
			weak_self: std::sync::OnceLock::new(),
			cfg,
		});

		let _ = conductor.weak_self.set(Arc::downgrade(&conductor));

		// The scaling engine holds only these narrow capabilities, never the
		// conductor itself.
		conductor.scaler.set_migration_executor(Arc::new(
			migration::ScalerBridge(Arc::downgrade(&conductor)),
		));
		conductor
			.scaler
			.set_queue_driver(Arc::new(migration::ScalerBridge(Arc::downgrade(&conductor))));

		conductor
	}

	/// Upgraded self-handle for spawning follow-up tasks. `None` only
	/// during teardown, when nothing should be spawned anyway.
	pub(crate) fn strong(&self) -> Option<Arc<Self>> {
		self.weak_self.get().and_then(std::sync::Weak::upgrade)
	}

	/// Recovers persisted state and starts every background worker. Returns
	/// once startup is complete; the workers run until `stop`.
	pub async fn start(&self) -> anyhow::Result<()> {
		self.recover().await?;

		self.health.clone().spawn(self.shutdown.child_token());
		self.scaler.clone().spawn(self.shutdown.child_token());
		self.spawn_workers();

		tracing::info!("conductor started");
		Ok(())
	}

	/// Cancels every background loop and flushes the recovery snapshots.
	pub async fn stop(&self) {
		self.shutdown.cancel();
		self.persist_state();
		tracing::info!("conductor stopped");
	}

	pub fn fleet_stats(&self) -> FleetStats {
		self.nodes.fleet_stats()
	}

	pub fn nodes(&self) -> &Arc<NodeRegistry> {
		&self.nodes
	}

	pub fn containers(&self) -> &Arc<ContainerRegistry> {
		&self.containers
	}

	pub fn queue(&self) -> &Arc<StartQueue> {
		&self.queue
	}

	pub fn scaler(&self) -> &Arc<ScalingEngine> {
		&self.scaler
	}

	pub async fn register_node(&self, node: Node) {
		self.nodes.register(node).await;
	}

	pub(crate) fn daemon_for(&self, node: &Node) -> Arc<dyn ContainerDaemon> {
		if node.kind == conductor_types::NodeKind::Local
			|| node.id.starts_with("local")
			|| matches!(node.ip.as_str(), "" | "127.0.0.1" | "localhost")
		{
			self.local_daemon.clone()
		} else {
			Arc::new(RemoteDaemon::new(
				self.exec.clone(),
				conductor_remote::ExecTarget {
					host: node.ip.clone(),
					user: node.ssh_user.clone(),
					key_path: node.ssh_key_path.clone(),
				},
				self.cfg.health.list_timeout(),
			))
		}
	}

	/// Writes the three recovery snapshots (cloud nodes, containers, queue).
	pub fn persist_state(&self) {
		let paths = &self.cfg.paths;

		let nodes = self.nodes.all();
		if let Err(err) = conductor_store::write_node_snapshot(&paths.node_snapshot(), nodes.iter())
		{
			tracing::warn!(?err, "failed to write node snapshot");
		}

		let containers = self.containers.all();
		if let Err(err) = conductor_store::write_container_snapshot(
			&paths.container_snapshot(),
			containers.iter(),
		) {
			tracing::warn!(?err, "failed to write container snapshot");
		}

		let queued = self.queue.all();
		if let Err(err) =
			conductor_store::write_queue_snapshot(&paths.queue_snapshot(), queued.iter())
		{
			tracing::warn!(?err, "failed to write queue snapshot");
		}
	}
}
