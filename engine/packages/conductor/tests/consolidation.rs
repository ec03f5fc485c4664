mod common;

use std::sync::Arc;

use common::{Harness, healthy_worker, test_config};
use conductor::Conductor;
use conductor_scaler::{ConsolidationPlan, PlannedMigration};
use conductor_types::{ContainerInfo, ContainerStatus, NodeKind};

async fn cloud_fleet(conductor: &Arc<Conductor>, node_count: usize) {
	for i in 0..node_count {
		let id = format!("cloud-{i}");
		let mut node = healthy_worker(&id, NodeKind::Cloud, 8192);
		node.cloud_provider_id = Some(format!("47{i}"));
		conductor.register_node(node).await;

		let mut container =
			ContainerInfo::reserving(format!("srv-{i}"), format!("srv-{i}"), 2048);
		container.node_id = id.clone();
		container.container_id = format!("mc-srv-{i}");
		container.status = ContainerStatus::Running;
		conductor.containers().register(container).await;
		conductor.nodes().allocate_ram(&id, 2048);
	}
}

fn plan(migrations: Vec<PlannedMigration>, remove: Vec<String>, keep: Vec<String>) -> ConsolidationPlan {
	ConsolidationPlan {
		node_savings: remove.len() as u32,
		migrations,
		nodes_to_remove: remove,
		nodes_to_keep: keep,
		estimated_monthly_savings_eur: 18.3,
		reason: "test consolidation".into(),
	}
}

fn migration(i: usize) -> PlannedMigration {
	PlannedMigration {
		server_id: format!("srv-{i}"),
		server_name: format!("srv-{i}"),
		from_node: format!("cloud-{i}"),
		ram_mb: 2048,
	}
}

#[tokio::test]
async fn plan_execution_migrates_then_decommissions() {
	let dir = tempfile::tempdir().unwrap();
	let harness = Harness::new();
	let conductor = Conductor::new(test_config(dir.path()), harness.dependencies());
	cloud_fleet(&conductor, 3).await;

	let report = conductor
		.execute_plan(&plan(
			vec![migration(1), migration(2)],
			vec!["cloud-1".into(), "cloud-2".into()],
			vec!["cloud-0".into()],
		))
		.await
		.unwrap();

	assert_eq!(report.migrated, 2);
	assert_eq!(report.failed, 0);
	assert!(!report.decommission_aborted);
	assert_eq!(report.nodes_removed, 2);

	// Source containers were stopped and taken off the proxy.
	let stopped = harness.daemon.stopped.lock().unwrap();
	assert!(stopped.contains(&"mc-srv-1".to_string()));
	assert!(stopped.contains(&"mc-srv-2".to_string()));
	assert_eq!(harness.proxy.unregistered.lock().unwrap().len(), 2);

	// The removed nodes are gone, VMs deleted.
	assert!(conductor.nodes().get("cloud-1").is_none());
	assert!(conductor.nodes().get("cloud-2").is_none());
	let deleted = harness.cloud.deleted.lock().unwrap();
	assert!(deleted.contains(&"471".to_string()));
	assert!(deleted.contains(&"472".to_string()));

	// One migrated server already restarted on the surviving node, the
	// other is queued behind the start slot.
	assert_eq!(harness.executor.contracts.lock().unwrap().len(), 1);
	assert_eq!(conductor.queue().len(), 1);
}

#[tokio::test]
async fn failed_migration_aborts_the_decommission_phase() {
	let dir = tempfile::tempdir().unwrap();
	let harness = Harness::new().with_failing_stop();
	let conductor = Conductor::new(test_config(dir.path()), harness.dependencies());
	cloud_fleet(&conductor, 3).await;

	let report = conductor
		.execute_plan(&plan(
			vec![migration(1), migration(2)],
			vec!["cloud-1".into(), "cloud-2".into()],
			vec!["cloud-0".into()],
		))
		.await
		.unwrap();

	assert_eq!(report.failed, 2);
	assert!(report.decommission_aborted);
	assert_eq!(report.nodes_removed, 0);

	// Nothing was deleted; the fleet stays whole.
	assert!(conductor.nodes().get("cloud-1").is_some());
	assert!(conductor.nodes().get("cloud-2").is_some());
	assert!(harness.cloud.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn single_decommission_failure_does_not_stop_the_others() {
	let dir = tempfile::tempdir().unwrap();
	let harness = Harness::new();
	let conductor = Conductor::new(test_config(dir.path()), harness.dependencies());
	cloud_fleet(&conductor, 3).await;

	// cloud-2 lost its provider id; deleting its VM cannot work.
	let mut broken = conductor.nodes().get("cloud-2").unwrap();
	broken.cloud_provider_id = None;
	conductor.register_node(broken).await;

	let report = conductor
		.execute_plan(&plan(
			vec![migration(1), migration(2)],
			vec!["cloud-1".into(), "cloud-2".into()],
			vec!["cloud-0".into()],
		))
		.await
		.unwrap();

	assert_eq!(report.migrated, 2);
	assert_eq!(report.nodes_removed, 1);
	assert!(conductor.nodes().get("cloud-1").is_none());
	// The broken node survives; the audit trail has the one success.
	assert!(conductor.nodes().get("cloud-2").is_some());
}
