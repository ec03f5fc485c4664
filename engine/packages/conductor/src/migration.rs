use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use conductor_events::kind;
use conductor_scaler::{
	ConsolidationPlan, MigrationExecutor, MigrationReport, PlannedMigration, QueueDriver,
};
use conductor_types::QueuedServer;
use serde_json::json;

use crate::Conductor;

const MIGRATION_STOP_GRACE: Duration = Duration::from_secs(30);

/// The scaling engine never holds the conductor itself, only this bridge
/// exposing the two narrow capabilities it needs. Weak by design: the
/// engine must not keep a torn-down conductor alive.
pub(crate) struct ScalerBridge(pub(crate) std::sync::Weak<Conductor>);

#[async_trait]
impl QueueDriver for ScalerBridge {
	async fn process_start_queue(&self) {
		if let Some(conductor) = self.0.upgrade() {
			conductor.process_start_queue().await;
		}
	}
}

#[async_trait]
impl MigrationExecutor for ScalerBridge {
	async fn execute(&self, plan: &ConsolidationPlan) -> anyhow::Result<MigrationReport> {
		let Some(conductor) = self.0.upgrade() else {
			anyhow::bail!("conductor is shutting down");
		};
		conductor.execute_plan(plan).await
	}
}

impl Conductor {
	/// Executes a consolidation plan: migrate every planned workload off
	/// the nodes to remove, then decommission those nodes. A single failed
	/// migration aborts the decommission phase entirely, leaving the fleet
	/// larger but never split across half-drained nodes.
	pub async fn execute_plan(
		&self,
		plan: &ConsolidationPlan,
	) -> anyhow::Result<MigrationReport> {
		self.events
			.publish(
				kind::MIGRATION_STARTED,
				json!({
					"migrations": plan.migrations.len(),
					"nodes_to_remove": &plan.nodes_to_remove,
				}),
			)
			.await;

		let mut report = MigrationReport::default();

		for (i, migration) in plan.migrations.iter().enumerate() {
			match self.migrate_one(migration).await {
				Ok(()) => {
					report.migrated += 1;
					self.events
						.publish(
							kind::MIGRATION_PROGRESS,
							json!({
								"server_id": &migration.server_id,
								"done": i + 1,
								"total": plan.migrations.len(),
							}),
						)
						.await;
				}
				Err(err) => {
					tracing::error!(
						server_id = %migration.server_id,
						from_node = %migration.from_node,
						?err,
						"migration failed"
					);
					report.failed += 1;
				}
			}
		}

		if report.failed > 0 {
			report.decommission_aborted = true;
			self.events
				.publish(
					kind::MIGRATION_FAILED,
					json!({ "migrated": report.migrated, "failed": report.failed }),
				)
				.await;
			tracing::warn!(
				failed = report.failed,
				"aborting decommission phase after failed migrations"
			);
			return Ok(report);
		}

		self.events
			.publish(
				kind::MIGRATION_COMPLETED,
				json!({ "migrated": report.migrated }),
			)
			.await;

		// Single decommission failures do not abort the others.
		for node_id in &plan.nodes_to_remove {
			match self
				.provisioner
				.decommission_node(node_id, "consolidation", &plan.reason)
				.await
			{
				Ok(()) => report.nodes_removed += 1,
				Err(err) => {
					tracing::warn!(%node_id, ?err, "consolidation decommission failed");
				}
			}
		}

		// Migrated servers wait in the queue; restart them now.
		self.process_start_queue().await;

		Ok(report)
	}

	/// One migration: take the server off the proxy, stop its container on
	/// the source node, fix the source counters, and hand the workload back
	/// to the normal start path which re-places and re-registers it.
	async fn migrate_one(&self, migration: &PlannedMigration) -> anyhow::Result<()> {
		self.proxy
			.unregister_server(&migration.server_name)
			.await
			.context("failed to unregister from proxy")?;

		let container = self
			.containers
			.get(&migration.server_id)
			.context("server vanished from registry")?;
		let node = self
			.nodes
			.get(&migration.from_node)
			.context("source node vanished from registry")?;

		let daemon = self.daemon_for(&node);
		daemon
			.stop(&container.container_id, MIGRATION_STOP_GRACE)
			.await
			.context("failed to stop container on source node")?;

		self.containers.remove(&migration.server_id).await;
		let (count, allocated) = self.containers.node_allocation(&migration.from_node);
		self.nodes
			.update_resources(&migration.from_node, count, allocated)?;

		self.queue.enqueue(QueuedServer::new(
			&migration.server_id,
			&migration.server_name,
			migration.ram_mb,
			"consolidation",
		));

		tracing::info!(
			server_id = %migration.server_id,
			from_node = %migration.from_node,
			"server migrated off node, queued for restart"
		);
		Ok(())
	}
}
