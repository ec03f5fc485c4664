use conductor_events::kind;
use conductor_placement::SelectionError;
use conductor_registry::ReserveError;
use conductor_types::{ContainerStatus, QueuedServer};
use serde_json::json;

use crate::{Conductor, executor::StartContract};

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
	Placed {
		node_id: String,
		actual_ram_mb: u64,
	},
	Queued {
		position: usize,
	},
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
	#[error("server {0} is already registered and not stopped")]
	AlreadyActive(String),
}

impl Conductor {
	/// Admission for "start workload X with booked RAM R".
	///
	/// Everything that cannot start right now is queued, never dropped:
	/// the startup-settling window, the fleet-wide start slot, missing
	/// capacity and allocation races all end in the FIFO.
	#[tracing::instrument(skip(self))]
	pub async fn start_server(
		&self,
		server_id: &str,
		server_name: &str,
		ram_mb: u64,
		requested_by: &str,
	) -> Result<StartOutcome, AdmissionError> {
		if let Some(existing) = self.containers.get(server_id) {
			if existing.status != ContainerStatus::Stopped {
				return Err(AdmissionError::AlreadyActive(server_id.to_string()));
			}
		}

		// CPU settles for a while after a conductor restart; starts in that
		// window wait for the release worker.
		if self.started_at.elapsed() < self.cfg.admission.startup_delay() {
			tracing::info!(%server_id, "start within startup delay window, queueing");
			return Ok(self
				.enqueue(server_id, server_name, ram_mb, requested_by)
				.await);
		}

		// One concurrent start across the fleet.
		if self.containers.starting_count() > 0 {
			tracing::debug!(%server_id, "another start in flight, queueing");
			return Ok(self
				.enqueue(server_id, server_name, ram_mb, requested_by)
				.await);
		}

		Ok(self
			.try_place(server_id, server_name, ram_mb, requested_by)
			.await)
	}

	/// Reservation, selection, allocation, executor hand-off. Any failure
	/// releases what was taken and queues the workload.
	pub(crate) async fn try_place(
		&self,
		server_id: &str,
		server_name: &str,
		ram_mb: u64,
		requested_by: &str,
	) -> StartOutcome {
		match self
			.containers
			.atomic_reserve_start_slot(server_id, server_name, ram_mb)
		{
			Ok(()) => {}
			Err(ReserveError::SlotBusy { .. }) | Err(ReserveError::AlreadyRegistered(_)) => {
				return self
					.enqueue(server_id, server_name, ram_mb, requested_by)
					.await;
			}
		}

		let strategy = self.selector.recommended_strategy();
		let node_id = match self.selector.select(ram_mb, strategy) {
			Ok(node_id) => node_id,
			Err(SelectionError::NoWorkerNodes) => {
				self.containers.remove(server_id).await;
				// First worker node is the scaling engine's problem.
				self.scaler.clone().ensure_worker_capacity();
				return self
					.enqueue(server_id, server_name, ram_mb, requested_by)
					.await;
			}
			Err(SelectionError::InsufficientCapacity { .. }) => {
				self.containers.remove(server_id).await;
				return self
					.enqueue(server_id, server_name, ram_mb, requested_by)
					.await;
			}
		};

		if !self.nodes.allocate_ram(&node_id, ram_mb) {
			// Lost the capacity race between selection and allocation.
			self.containers.remove(server_id).await;
			return self
				.enqueue(server_id, server_name, ram_mb, requested_by)
				.await;
		}

		let Some(node) = self.nodes.get(&node_id) else {
			self.containers.remove(server_id).await;
			self.nodes.release_ram(&node_id, ram_mb);
			return self
				.enqueue(server_id, server_name, ram_mb, requested_by)
				.await;
		};

		self.containers.assign_node(server_id, &node_id);
		let actual_ram_mb = node.actual_ram_mb(ram_mb);

		self.events
			.publish(
				kind::CONTAINER_CREATED,
				json!({
					"server_id": server_id,
					"node_id": &node_id,
					"ram_mb": ram_mb,
					"actual_ram_mb": actual_ram_mb,
				}),
			)
			.await;

		let contract = StartContract {
			server_id: server_id.to_string(),
			server_name: server_name.to_string(),
			node_id: node_id.clone(),
			node_ip: node.ip.clone(),
			container_name: format!("{}{server_id}", self.cfg.cluster.container_prefix),
			booked_ram_mb: ram_mb,
			actual_ram_mb,
		};

		if let Err(err) = self.executor.launch(contract).await {
			tracing::warn!(%server_id, %node_id, ?err, "executor refused start contract");
			return self.release_failed_start(server_id, requested_by).await;
		}

		tracing::info!(%server_id, %node_id, ram_mb, "start contract handed to executor");
		StartOutcome::Placed {
			node_id,
			actual_ram_mb,
		}
	}

	/// The executor accepted the container and reports its handle.
	pub async fn confirm_started(
		&self,
		server_id: &str,
		container_id: &str,
		port: u16,
		game_port: u16,
	) {
		if !self
			.containers
			.mark_started(server_id, container_id, port, game_port)
		{
			tracing::warn!(%server_id, "confirm_started for unknown server");
			return;
		}

		self.events
			.publish(
				kind::CONTAINER_STATUS_CHANGED,
				json!({ "server_id": server_id, "status": "starting" }),
			)
			.await;
	}

	/// The executor observed readiness; the server goes live on the proxy.
	pub async fn confirm_running(&self, server_id: &str) {
		if !self
			.containers
			.update_status(server_id, ContainerStatus::Running)
		{
			tracing::warn!(%server_id, "confirm_running for unknown server");
			return;
		}

		if let Some(container) = self.containers.get(server_id) {
			if let Some(node) = self.nodes.get(&container.node_id) {
				let address = format!("{}:{}", node.ip, container.game_port);
				if let Err(err) = self
					.proxy
					.register_server(&container.server_name, &address)
					.await
				{
					tracing::warn!(%server_id, ?err, "failed to register server with proxy");
				}
			}
		}

		self.events
			.publish(
				kind::CONTAINER_STATUS_CHANGED,
				json!({ "server_id": server_id, "status": "running" }),
			)
			.await;
	}

	/// Executor-side start failure: release the reservation and the RAM and
	/// re-enqueue exactly once. The admission path itself never re-enqueues
	/// a failed hand-off a second time.
	pub async fn report_start_failure(&self, server_id: &str) -> StartOutcome {
		self.release_failed_start(server_id, "start-failure").await
	}

	pub(crate) async fn release_failed_start(
		&self,
		server_id: &str,
		requested_by: &str,
	) -> StartOutcome {
		let Some(container) = self.containers.remove(server_id).await else {
			return StartOutcome::Queued { position: 0 };
		};

		if !container.node_id.is_empty() {
			// Plain release, no queue kick: the freed RAM belongs to the
			// entry we are about to re-enqueue, and an immediate drain would
			// retry the same failing start in a tight loop. The periodic
			// worker picks it up instead.
			self.nodes.release_ram(&container.node_id, container.ram_mb);
		}

		self.enqueue(
			server_id,
			&container.server_name,
			container.ram_mb,
			requested_by,
		)
		.await
	}

	/// Stops a running workload and frees its booking.
	#[tracing::instrument(skip(self))]
	pub async fn stop_server(&self, server_id: &str) -> anyhow::Result<()> {
		let container = self
			.containers
			.get(server_id)
			.ok_or_else(|| anyhow::anyhow!("server not found: {server_id}"))?;

		if let Err(err) = self.proxy.unregister_server(&container.server_name).await {
			tracing::warn!(%server_id, ?err, "failed to unregister server from proxy");
		}

		if !container.container_id.is_empty() {
			if let Some(node) = self.nodes.get(&container.node_id) {
				let daemon = self.daemon_for(&node);
				if let Err(err) = daemon
					.stop(&container.container_id, std::time::Duration::from_secs(30))
					.await
				{
					tracing::warn!(%server_id, ?err, "failed to stop container, removing anyway");
				}
			}
		}

		self.containers.remove(server_id).await;
		if !container.node_id.is_empty() {
			self.release_ram(&container.node_id, container.ram_mb);
		}

		self.events
			.publish(
				kind::CONTAINER_REMOVED,
				json!({ "server_id": server_id, "node_id": container.node_id }),
			)
			.await;
		Ok(())
	}

	/// Frees a booking and drains the queue into the new headroom.
	pub(crate) fn release_ram(&self, node_id: &str, ram_mb: u64) {
		self.nodes.release_ram(node_id, ram_mb);

		if let Some(conductor) = self.strong() {
			tokio::spawn(async move { conductor.process_start_queue().await });
		}
	}

	pub(crate) async fn enqueue(
		&self,
		server_id: &str,
		server_name: &str,
		ram_mb: u64,
		requested_by: &str,
	) -> StartOutcome {
		let position = self.queue.enqueue(QueuedServer::new(
			server_id,
			server_name,
			ram_mb,
			requested_by,
		));

		self.events
			.publish(
				kind::QUEUE_SERVER_ADDED,
				json!({ "server_id": server_id, "position": position }),
			)
			.await;
		self.events
			.publish(
				kind::QUEUE_UPDATED,
				json!({ "size": self.queue.len(), "required_ram_mb": self.queue.total_required_ram_mb() }),
			)
			.await;

		StartOutcome::Queued { position }
	}
}
