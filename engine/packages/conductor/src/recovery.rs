use chrono::Utc;
use conductor_events::kind;
use conductor_store::{
	AuditEntry, load_container_snapshot, load_node_snapshot, load_queue_snapshot,
};
use conductor_types::{ContainerInfo, ContainerStatus, HealthStatus, Node, NodeLifecycle};
use serde_json::json;

use crate::Conductor;

impl Conductor {
	/// Restores node, container, and queue state from the crash-recovery
	/// snapshots. Missing files are a clean start. The relational store has
	/// the last word on container status: a workload the store no longer
	/// considers running is dropped, and one whose node vanished is marked
	/// lost rather than silently resurrected.
	#[tracing::instrument(skip_all)]
	pub async fn recover(&self) -> anyhow::Result<()> {
		self.recover_nodes().await;
		self.recover_containers().await;
		self.recover_queue().await;

		// Counters follow from what actually got restored.
		for node in self.nodes.all() {
			if !node.is_worker() {
				continue;
			}
			let (count, allocated) = self.containers.node_allocation(&node.id);
			let _ = self.nodes.update_resources(&node.id, count, allocated);
		}

		Ok(())
	}

	async fn recover_nodes(&self) {
		let path = self.cfg.paths.node_snapshot();
		let persisted = match load_node_snapshot(&path) {
			Ok(nodes) => nodes,
			Err(err) => {
				tracing::warn!(?err, "unreadable node snapshot, starting clean");
				return;
			}
		};

		for record in persisted {
			let mut node = Node::new(
				&record.id,
				record.node_type,
				record.total_ram_mb,
				self.cfg.cluster.reserve_percent,
			);
			node.hostname = record.hostname;
			node.ip = record.ip;
			node.ssh_user = self.cfg.ssh.user.clone();
			node.ssh_key_path = self.cfg.ssh.key_path.clone();
			node.total_cpu_cores = record.total_cpu_cores;
			node.cloud_provider_id = record.cloud_provider_id;
			node.hourly_cost_eur = record.hourly_cost_eur;
			node.created_at = record.created_at;
			node.labels = record.labels;
			node.lifecycle = NodeLifecycle::Ready;
			node.status = HealthStatus::Unknown;
			node.recovered_at = Some(Utc::now());
			node.recovery_grace_secs = Some(self.cfg.provision.recovery_grace().as_secs());

			tracing::info!(node_id = %node.id, "recovered node from snapshot");
			self.nodes.register(node.clone()).await;

			if self.cfg.recovery.publish_node_added {
				self.events
					.publish(
						kind::NODE_CREATED,
						json!({ "node_id": node.id, "recovered": true }),
					)
					.await;
			}
		}
	}

	async fn recover_containers(&self) {
		let path = self.cfg.paths.container_snapshot();
		let persisted = match load_container_snapshot(&path) {
			Ok(containers) => containers,
			Err(err) => {
				tracing::warn!(?err, "unreadable container snapshot, starting clean");
				return;
			}
		};

		for record in persisted {
			// The durable store beats the snapshot file on status.
			let status = match &self.container_store {
				Some(store) => match store.status(&record.server_id).await {
					Ok(status) => status,
					Err(err) => {
						tracing::warn!(
							server_id = %record.server_id,
							?err,
							"store unavailable, trusting snapshot status"
						);
						record.status.parse::<ContainerStatus>().ok()
					}
				},
				None => record.status.parse::<ContainerStatus>().ok(),
			};

			if status != Some(ContainerStatus::Running) {
				tracing::info!(
					server_id = %record.server_id,
					?status,
					"dropping non-running container from recovery"
				);
				continue;
			}

			if self.nodes.get(&record.node_id).is_none() {
				tracing::warn!(
					server_id = %record.server_id,
					node_id = %record.node_id,
					"recovered container references a missing node, marking lost"
				);
				if let Some(store) = &self.container_store {
					if let Err(err) = store.mark_lost(&record.server_id).await {
						tracing::warn!(server_id = %record.server_id, ?err, "failed to mark server lost");
					}
				}
				let entry = AuditEntry::new(
					"recovery.lost",
					&record.server_id,
					format!("node {} no longer exists", record.node_id),
					"recovery",
					json!({ "node_id": record.node_id, "ram_mb": record.ram_mb }),
				);
				if let Err(err) = self.audit.append(entry).await {
					tracing::warn!(?err, "failed to append recovery audit entry");
				}
				continue;
			}

			let container = ContainerInfo {
				server_id: record.server_id.clone(),
				server_name: record.server_name,
				container_id: record.container_id,
				node_id: record.node_id,
				ram_mb: record.ram_mb,
				status: ContainerStatus::Running,
				last_seen_at: Utc::now(),
				port: record.port,
				game_port: record.minecraft_port,
				game_version: record.minecraft_version,
				server_type: record.server_type,
			};
			tracing::info!(server_id = %container.server_id, "recovered container from snapshot");
			self.containers.register(container).await;
		}
	}

	async fn recover_queue(&self) {
		let path = self.cfg.paths.queue_snapshot();
		let persisted = match load_queue_snapshot(&path) {
			Ok(queued) => queued,
			Err(err) => {
				tracing::warn!(?err, "unreadable queue snapshot, starting clean");
				return;
			}
		};

		for entry in persisted {
			tracing::info!(server_id = %entry.server_id, "recovered queued server");
			self.queue.enqueue(entry);
		}
	}
}
