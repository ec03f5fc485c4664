use chrono::Utc;
use conductor_events::kind;
use conductor_types::{HealthStatus, NodeKind, NodeLifecycle};
use serde_json::json;

use crate::Conductor;

impl Conductor {
	/// Dequeues at most one workload whose booking fits a healthy worker
	/// node and hands it to the executor. Serialized by the queue mutex so
	/// concurrent triggers (RAM release, periodic tick, scale-up) cannot
	/// double-start; further draining comes from the next trigger.
	pub async fn process_start_queue(&self) {
		let _guard = self.queue_lock.lock().await;

		if self.queue.is_empty() {
			return;
		}
		if self.containers.starting_count() > 0 {
			return;
		}

		let workers = self.nodes.all();
		let fits = |required: u64| {
			workers.iter().any(|n| {
				n.is_worker()
					&& n.status == HealthStatus::Healthy
					&& n.available_ram_mb() >= required
			})
		};

		let Some(entry) = self
			.queue
			.all()
			.into_iter()
			.find(|q| fits(q.required_ram_mb))
		else {
			return;
		};

		self.queue.remove(&entry.server_id);
		self.events
			.publish(
				kind::QUEUE_SERVER_REMOVED,
				json!({ "server_id": &entry.server_id }),
			)
			.await;
		self.events
			.publish(kind::QUEUE_UPDATED, json!({ "size": self.queue.len() }))
			.await;

		tracing::info!(
			server_id = %entry.server_id,
			ram_mb = entry.required_ram_mb,
			"dequeued server for start"
		);
		self.try_place(
			&entry.server_id,
			&entry.server_name,
			entry.required_ram_mb,
			&entry.requested_by,
		)
		.await;
	}

	pub(crate) fn spawn_workers(&self) {
		self.spawn_queue_worker();
		self.spawn_startup_delay_release();
		self.spawn_reservation_sweep();
		self.spawn_cpu_metrics_worker();
		self.spawn_ghost_cleanup();
		self.spawn_snapshot_flush();
	}

	fn spawn_queue_worker(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(conductor.cfg.admission.queue_interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => conductor.process_start_queue().await,
					_ = shutdown.cancelled() => return,
				}
			}
		});
	}

	/// Single-shot: once the startup-settling window ends, drain whatever
	/// queued up during it.
	fn spawn_startup_delay_release(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(conductor.cfg.admission.startup_delay()) => {
					tracing::info!("startup delay elapsed, processing queue");
					conductor.process_start_queue().await;
				}
				_ = shutdown.cancelled() => {}
			}
		});
	}

	fn spawn_reservation_sweep(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			let mut interval =
				tokio::time::interval(conductor.cfg.admission.reservation_sweep_interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => conductor.sweep_stale_reservations().await,
					_ = shutdown.cancelled() => return,
				}
			}
		});
	}

	/// Deadlock recovery: a reserving/starting entry that old means the
	/// executor died mid-start and will never call back.
	pub async fn sweep_stale_reservations(&self) {
		let timeout = self.cfg.admission.reservation_timeout();

		for container in self.containers.stale_since(timeout) {
			if !container.status.occupies_start_slot() {
				continue;
			}

			tracing::warn!(
				server_id = %container.server_id,
				status = %container.status,
				"dropping stale start reservation"
			);
			self.containers.remove(&container.server_id).await;
			if !container.node_id.is_empty() {
				self.release_ram(&container.node_id, container.ram_mb);
			}
		}
	}

	/// Pulls provider-side CPU readings for cloud nodes and publishes
	/// node-stats events, feeding the time-series sink when wired.
	fn spawn_cpu_metrics_worker(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			let mut interval =
				tokio::time::interval(conductor.cfg.admission.cpu_metrics_interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => conductor.sample_cpu_metrics().await,
					_ = shutdown.cancelled() => return,
				}
			}
		});
	}

	pub(crate) async fn sample_cpu_metrics(&self) {
		for node in self.nodes.by_kind(NodeKind::Cloud) {
			if matches!(
				node.lifecycle,
				NodeLifecycle::Provisioning | NodeLifecycle::Initializing
			) {
				continue;
			}
			let Some(provider_id) = &node.cloud_provider_id else {
				continue;
			};

			let percent = match self.cloud.cpu_percent(provider_id).await {
				Ok(p) => p,
				Err(err) => {
					tracing::warn!(node_id = %node.id, ?err, "failed to fetch CPU metrics");
					continue;
				}
			};

			if let Err(err) = self.nodes.update_cpu(&node.id, percent) {
				tracing::debug!(node_id = %node.id, ?err, "node vanished during CPU sample");
				continue;
			}

			self.events
				.publish(
					kind::NODE_STATS,
					json!({
						"node_id": &node.id,
						"cpu_percent": percent,
						"allocated_ram_mb": node.allocated_ram_mb,
						"container_count": node.container_count,
					}),
				)
				.await;

			if let Some(metrics) = &self.metrics_store {
				if let Err(err) = metrics.record_node_cpu(&node.id, percent, Utc::now()).await {
					tracing::warn!(node_id = %node.id, ?err, "failed to record CPU sample");
				}
			}
		}

		if let Some(metrics) = &self.metrics_store {
			let stats = self.nodes.fleet_stats();
			if let Err(err) = metrics.record_fleet_capacity(&stats, Utc::now()).await {
				tracing::warn!(?err, "failed to record fleet capacity");
			}
		}
	}

	/// Removes registry entries whose workload identity no longer exists in
	/// the durable store (the server was deleted out from under us).
	fn spawn_ghost_cleanup(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			let mut interval =
				tokio::time::interval(conductor.cfg.admission.ghost_cleanup_interval());
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => conductor.cleanup_deleted_servers().await,
					_ = shutdown.cancelled() => return,
				}
			}
		});
	}

	pub(crate) async fn cleanup_deleted_servers(&self) {
		let Some(store) = &self.container_store else {
			return;
		};

		let known = match store.list_ids().await {
			Ok(ids) => ids,
			Err(err) => {
				tracing::warn!(?err, "failed to list persisted servers");
				return;
			}
		};

		for container in self.containers.all() {
			if known.contains(&container.server_id) {
				continue;
			}

			tracing::warn!(
				server_id = %container.server_id,
				"server no longer exists in durable store, removing"
			);
			self.containers.remove(&container.server_id).await;
			if !container.node_id.is_empty() {
				self.release_ram(&container.node_id, container.ram_mb);
			}
			self.events
				.publish(
					kind::CONTAINER_REMOVED,
					json!({ "server_id": &container.server_id, "reason": "deleted" }),
				)
				.await;
		}
	}

	fn spawn_snapshot_flush(&self) {
		let Some(conductor) = self.strong() else {
			return;
		};
		let shutdown = self.shutdown.child_token();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => conductor.persist_state(),
					_ = shutdown.cancelled() => return,
				}
			}
		});
	}
}
