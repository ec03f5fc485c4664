use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc, Weekday};
use conductor_registry::{ContainerRegistry, NodeRegistry, StartQueue};
use conductor_types::{FleetStats, Node, NodeKind};

/// Everything a policy may look at for one evaluation. Built fresh each
/// tick so policies never race the registries for a consistent view.
pub struct ScalingContext {
	pub stats: FleetStats,
	pub worker_nodes: Vec<Node>,
	pub dedicated_nodes: Vec<Node>,
	pub cloud_nodes: Vec<Node>,
	pub queue_len: usize,
	pub queued_ram_mb: u64,
	pub containers: Arc<ContainerRegistry>,
	pub now: DateTime<Utc>,
	pub is_weekend: bool,
}

impl ScalingContext {
	pub fn build(
		nodes: &NodeRegistry,
		containers: Arc<ContainerRegistry>,
		queue: &StartQueue,
	) -> Self {
		let workers = nodes.workers();
		let dedicated_nodes = workers
			.iter()
			.filter(|n| n.kind == NodeKind::Dedicated)
			.cloned()
			.collect();
		let cloud_nodes = workers
			.iter()
			.filter(|n| n.kind == NodeKind::Cloud)
			.cloned()
			.collect();

		let now = Utc::now();
		Self {
			stats: nodes.fleet_stats(),
			worker_nodes: workers,
			dedicated_nodes,
			cloud_nodes,
			queue_len: queue.len(),
			queued_ram_mb: queue.total_required_ram_mb(),
			containers,
			now,
			is_weekend: matches!(now.weekday(), Weekday::Sat | Weekday::Sun),
		}
	}
}
