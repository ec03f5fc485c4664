use std::sync::Arc;

use conductor_registry::NodeRegistry;
use conductor_types::{HealthStatus, Node, NodeKind, NodeLifecycle};

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
pub enum SelectionStrategy {
	/// Smallest fit first, minimizes fragmentation.
	#[default]
	BestFit,
	/// Largest fit first, spreads load.
	WorstFit,
	/// Prefer dedicated and local nodes, overflow to cloud.
	LocalFirst,
	/// Prefer cloud nodes, overflow to dedicated.
	CloudFirst,
	/// Fewest containers first.
	RoundRobin,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SelectionError {
	#[error("no worker nodes available")]
	NoWorkerNodes,

	#[error("no worker nodes with sufficient capacity ({required_mb} MB requested)")]
	InsufficientCapacity { required_mb: u64 },
}

/// Chooses the node a new workload lands on.
pub struct NodeSelector {
	nodes: Arc<NodeRegistry>,
}

impl NodeSelector {
	pub fn new(nodes: Arc<NodeRegistry>) -> Self {
		Self { nodes }
	}

	fn placeable(node: &Node) -> bool {
		node.is_worker()
			&& node.status == HealthStatus::Healthy
			&& matches!(
				node.lifecycle,
				NodeLifecycle::Ready | NodeLifecycle::Active | NodeLifecycle::Idle
			)
	}

	/// Picks a healthy worker node with at least `required_mb` available,
	/// under the given strategy.
	pub fn select(
		&self,
		required_mb: u64,
		strategy: SelectionStrategy,
	) -> Result<String, SelectionError> {
		let all = self.nodes.all();
		if !all.iter().any(|n| n.is_worker()) {
			return Err(SelectionError::NoWorkerNodes);
		}

		let mut candidates = all
			.into_iter()
			.filter(|n| Self::placeable(n) && n.available_ram_mb() >= required_mb)
			.collect::<Vec<_>>();

		if candidates.is_empty() {
			return Err(SelectionError::InsufficientCapacity { required_mb });
		}

		let chosen = match strategy {
			SelectionStrategy::BestFit => {
				candidates.sort_by_key(|n| n.available_ram_mb());
				candidates.remove(0)
			}
			SelectionStrategy::WorstFit => {
				candidates.sort_by_key(|n| std::cmp::Reverse(n.available_ram_mb()));
				candidates.remove(0)
			}
			SelectionStrategy::LocalFirst => {
				Self::partitioned(candidates, |n| n.kind != NodeKind::Cloud)
			}
			SelectionStrategy::CloudFirst => {
				Self::partitioned(candidates, |n| n.kind == NodeKind::Cloud)
			}
			SelectionStrategy::RoundRobin => {
				candidates.sort_by_key(|n| n.container_count);
				candidates.remove(0)
			}
		};

		tracing::debug!(
			node_id = %chosen.id,
			%strategy,
			required_mb,
			available_mb = chosen.available_ram_mb(),
			"selected node"
		);
		Ok(chosen.id)
	}

	/// Best fit within the preferred partition, then within the rest.
	fn partitioned(candidates: Vec<Node>, preferred: impl Fn(&Node) -> bool) -> Node {
		let (mut first, mut rest): (Vec<_>, Vec<_>) =
			candidates.into_iter().partition(|n| preferred(n));

		let bucket = if first.is_empty() { &mut rest } else { &mut first };
		bucket.sort_by_key(|n| n.available_ram_mb());
		bucket.remove(0)
	}

	/// LocalFirst keeps dedicated hardware busy before renting cloud RAM,
	/// but only makes sense when both kinds exist.
	pub fn recommended_strategy(&self) -> SelectionStrategy {
		let all = self.nodes.all();
		let has_cloud = all
			.iter()
			.any(|n| n.is_worker() && n.kind == NodeKind::Cloud);
		let has_dedicated = all
			.iter()
			.any(|n| n.is_worker() && n.kind != NodeKind::Cloud);

		if has_cloud && has_dedicated {
			SelectionStrategy::LocalFirst
		} else {
			SelectionStrategy::BestFit
		}
	}

	pub fn has_available_worker_nodes(&self) -> bool {
		self.nodes.all().iter().any(Self::placeable)
	}

	pub fn worker_node_count(&self) -> usize {
		self.nodes.worker_count()
	}
}
