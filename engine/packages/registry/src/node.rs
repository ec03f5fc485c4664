use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use chrono::Utc;
use conductor_store::NodeStore;
use conductor_types::{FleetStats, HealthStatus, LifecycleError, Node, NodeKind, NodeLifecycle};

const SYSTEM_ID_PREFIXES: [&str; 3] = ["local", "control", "proxy"];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("node not found: {0}")]
	NodeNotFound(String),

	#[error(transparent)]
	Lifecycle(#[from] LifecycleError),
}

/// Authoritative map of node identity to capacity, allocation and
/// lifecycle. All compound check-then-act operations hold the write lock
/// for their whole duration; no caller ever sees a torn state.
pub struct NodeRegistry {
	nodes: RwLock<HashMap<String, Node>>,
	store: Option<Arc<dyn NodeStore>>,
	/// Literal ids of control-plane and proxy nodes, on top of the prefix rule.
	system_ids: Vec<String>,
}

impl NodeRegistry {
	pub fn new(system_ids: Vec<String>) -> Self {
		Self {
			nodes: RwLock::new(HashMap::new()),
			store: None,
			system_ids,
		}
	}

	pub fn with_store(mut self, store: Arc<dyn NodeStore>) -> Self {
		self.store = Some(store);
		self
	}

	fn classify_system(&self, id: &str) -> bool {
		SYSTEM_ID_PREFIXES.iter().any(|p| id.starts_with(p))
			|| self.system_ids.iter().any(|s| s == id)
	}

	/// Idempotent insert-or-update keyed by identity. Stamps `created_at`
	/// on first sight and preserves it across re-registration.
	pub async fn register(&self, mut node: Node) {
		node.is_system = self.classify_system(&node.id);

		let persisted = {
			let mut nodes = self.nodes.write().unwrap();
			if let Some(existing) = nodes.get(&node.id) {
				if node.created_at.is_none() {
					node.created_at = existing.created_at;
				}
			}
			if node.created_at.is_none() {
				node.created_at = Some(Utc::now());
			}
			nodes.insert(node.id.clone(), node.clone());
			node
		};

		tracing::info!(
			node_id = %persisted.id,
			kind = %persisted.kind,
			lifecycle = %persisted.lifecycle,
			total_ram_mb = persisted.total_ram_mb,
			"registered node"
		);

		if let Some(store) = &self.store {
			if let Err(err) = store.upsert(&persisted).await {
				tracing::warn!(node_id = %persisted.id, ?err, "failed to persist node");
			}
		}
	}

	pub async fn remove(&self, node_id: &str) -> Option<Node> {
		let removed = self.nodes.write().unwrap().remove(node_id);

		if removed.is_some() {
			tracing::info!(%node_id, "removed node");
			if let Some(store) = &self.store {
				if let Err(err) = store.remove(node_id).await {
					tracing::warn!(%node_id, ?err, "failed to remove persisted node");
				}
			}
		}

		removed
	}

	pub fn get(&self, node_id: &str) -> Option<Node> {
		self.nodes.read().unwrap().get(node_id).cloned()
	}

	pub fn all(&self) -> Vec<Node> {
		self.nodes.read().unwrap().values().cloned().collect()
	}

	pub fn healthy(&self) -> Vec<Node> {
		self.nodes
			.read()
			.unwrap()
			.values()
			.filter(|n| n.status == HealthStatus::Healthy)
			.cloned()
			.collect()
	}

	pub fn by_kind(&self, kind: NodeKind) -> Vec<Node> {
		self.nodes
			.read()
			.unwrap()
			.values()
			.filter(|n| n.kind == kind)
			.cloned()
			.collect()
	}

	/// Non-system nodes, whatever their health.
	pub fn workers(&self) -> Vec<Node> {
		self.nodes
			.read()
			.unwrap()
			.values()
			.filter(|n| n.is_worker())
			.cloned()
			.collect()
	}

	pub fn worker_count(&self) -> usize {
		self.nodes
			.read()
			.unwrap()
			.values()
			.filter(|n| n.is_worker())
			.count()
	}

	/// Sets the observed health status and stamps the check time.
	pub fn update_status(&self, node_id: &str, status: HealthStatus) -> Result<(), RegistryError> {
		let mut nodes = self.nodes.write().unwrap();
		let node = nodes
			.get_mut(node_id)
			.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
		node.status = status;
		node.last_health_check = Some(Utc::now());
		Ok(())
	}

	pub fn update_lifecycle(
		&self,
		node_id: &str,
		to: NodeLifecycle,
	) -> Result<(), RegistryError> {
		let mut nodes = self.nodes.write().unwrap();
		let node = nodes
			.get_mut(node_id)
			.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
		node.transition(to)?;
		Ok(())
	}

	/// Overwrites the counters from an external observation (health resync,
	/// migration bookkeeping).
	pub fn update_resources(
		&self,
		node_id: &str,
		container_count: u32,
		allocated_ram_mb: u64,
	) -> Result<(), RegistryError> {
		let mut nodes = self.nodes.write().unwrap();
		let node = nodes
			.get_mut(node_id)
			.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
		node.container_count = container_count;
		node.allocated_ram_mb = allocated_ram_mb;
		Ok(())
	}

	pub fn update_cpu(&self, node_id: &str, percent: f64) -> Result<(), RegistryError> {
		let mut nodes = self.nodes.write().unwrap();
		let node = nodes
			.get_mut(node_id)
			.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
		node.cpu_usage_percent = percent;
		Ok(())
	}

	/// The sole safe path to reserve capacity. Checks and books under one
	/// write lock; `false` is the normal capacity-exhausted signal.
	pub fn allocate_ram(&self, node_id: &str, ram_mb: u64) -> bool {
		let mut nodes = self.nodes.write().unwrap();
		let Some(node) = nodes.get_mut(node_id) else {
			return false;
		};

		if node.total_ram_mb.saturating_sub(node.allocated_ram_mb) < ram_mb {
			return false;
		}

		node.allocated_ram_mb += ram_mb;
		node.container_count += 1;
		true
	}

	/// Releases a booking. Floors both counters at zero; an underflow means
	/// bookkeeping drifted and is worth a warning, not a crash.
	pub fn release_ram(&self, node_id: &str, ram_mb: u64) {
		let mut nodes = self.nodes.write().unwrap();
		let Some(node) = nodes.get_mut(node_id) else {
			return;
		};

		if node.allocated_ram_mb < ram_mb {
			tracing::warn!(
				%node_id,
				allocated = node.allocated_ram_mb,
				releasing = ram_mb,
				"RAM release underflow, flooring at zero"
			);
			node.allocated_ram_mb = 0;
		} else {
			node.allocated_ram_mb -= ram_mb;
		}

		if node.container_count == 0 {
			tracing::warn!(%node_id, "container count underflow, flooring at zero");
		} else {
			node.container_count -= 1;
		}
	}

	/// Stamps container-arrival tracking and promotes the node to active.
	pub(crate) fn note_container_added(&self, node_id: &str) {
		let mut nodes = self.nodes.write().unwrap();
		let Some(node) = nodes.get_mut(node_id) else {
			return;
		};

		let now = Utc::now();
		node.last_container_added = Some(now);
		node.last_container_at = Some(now);
		if node.first_container_at.is_none() {
			node.first_container_at = Some(now);
		}
		node.total_containers_ever += 1;

		if matches!(node.lifecycle, NodeLifecycle::Ready | NodeLifecycle::Idle) {
			// Table guarantees ready->active and idle->active.
			let _ = node.transition(NodeLifecycle::Active);
		}
	}

	/// Stamps idle tracking once the last container on a node is gone.
	pub(crate) fn note_node_emptied(&self, node_id: &str) {
		let mut nodes = self.nodes.write().unwrap();
		let Some(node) = nodes.get_mut(node_id) else {
			return;
		};

		node.last_container_removed = Some(Utc::now());
		if node.lifecycle == NodeLifecycle::Active {
			let _ = node.transition(NodeLifecycle::Idle);
		}
	}

	pub(crate) fn note_sync_completed(&self, node_id: &str) {
		let mut nodes = self.nodes.write().unwrap();
		if let Some(node) = nodes.get_mut(node_id) {
			node.sync_completed_at = Some(Utc::now());
		}
	}

	/// Fleet aggregates. System nodes contribute to node-count and health
	/// totals only; every capacity field sums worker nodes alone.
	pub fn fleet_stats(&self) -> FleetStats {
		let nodes = self.nodes.read().unwrap();
		let mut stats = FleetStats::default();

		for node in nodes.values() {
			stats.total_nodes += 1;
			if node.status == HealthStatus::Healthy {
				stats.healthy_nodes += 1;
			}

			if !node.is_worker() {
				stats.system_nodes += 1;
				continue;
			}

			stats.worker_nodes += 1;
			match node.kind {
				NodeKind::Cloud => stats.cloud_nodes += 1,
				NodeKind::Dedicated => stats.dedicated_nodes += 1,
				NodeKind::Local => {}
			}

			stats.total_ram_mb += node.total_ram_mb;
			stats.usable_ram_mb += node.usable_ram_mb();
			stats.allocated_ram_mb += node.allocated_ram_mb;
			stats.available_ram_mb += node.available_ram_mb();
			stats.system_reserved_ram_mb += node.system_reserved_ram_mb;
			stats.total_cpu_cores += node.total_cpu_cores;
			stats.total_containers += node.container_count;
			stats.hourly_cost_eur += node.hourly_cost_eur;
		}

		if stats.total_ram_mb > 0 {
			stats.utilization_percent =
				stats.allocated_ram_mb as f64 / stats.total_ram_mb as f64 * 100.0;
		}

		stats
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn registry() -> NodeRegistry {
		NodeRegistry::new(vec!["panel-1".to_string()])
	}

	fn worker(id: &str, total_ram_mb: u64) -> Node {
		let mut n = Node::new(id, NodeKind::Cloud, total_ram_mb, 0.1);
		n.status = HealthStatus::Healthy;
		n
	}

	#[tokio::test]
	async fn register_preserves_created_at() {
		let reg = registry();
		reg.register(worker("cloud-a1", 8192)).await;
		let first = reg.get("cloud-a1").unwrap().created_at.unwrap();

		reg.register(worker("cloud-a1", 16384)).await;
		let node = reg.get("cloud-a1").unwrap();
		assert_eq!(node.created_at.unwrap(), first);
		assert_eq!(node.total_ram_mb, 16384);
		assert_eq!(reg.all().len(), 1);
	}

	#[tokio::test]
	async fn system_nodes_are_classified_by_prefix_and_literal_id() {
		let reg = registry();
		reg.register(worker("local-main", 8192)).await;
		reg.register(worker("proxy-eu", 8192)).await;
		reg.register(worker("panel-1", 8192)).await;
		reg.register(worker("cloud-a1", 8192)).await;

		assert!(reg.get("local-main").unwrap().is_system);
		assert!(reg.get("proxy-eu").unwrap().is_system);
		assert!(reg.get("panel-1").unwrap().is_system);
		assert!(!reg.get("cloud-a1").unwrap().is_system);
	}

	#[tokio::test]
	async fn allocate_then_release_restores_counters() {
		let reg = registry();
		reg.register(worker("cloud-a1", 8192)).await;

		assert!(reg.allocate_ram("cloud-a1", 4096));
		let node = reg.get("cloud-a1").unwrap();
		assert_eq!(node.allocated_ram_mb, 4096);
		assert_eq!(node.container_count, 1);

		reg.release_ram("cloud-a1", 4096);
		let node = reg.get("cloud-a1").unwrap();
		assert_eq!(node.allocated_ram_mb, 0);
		assert_eq!(node.container_count, 0);
	}

	#[tokio::test]
	async fn allocation_fails_past_capacity_and_zero_succeeds() {
		let reg = registry();
		reg.register(worker("cloud-a1", 8192)).await;

		assert!(reg.allocate_ram("cloud-a1", 4096));
		assert!(reg.allocate_ram("cloud-a1", 4096));
		// Exactly full: one more MB must fail, zero must pass.
		assert!(!reg.allocate_ram("cloud-a1", 1));
		assert!(reg.allocate_ram("cloud-a1", 0));

		let node = reg.get("cloud-a1").unwrap();
		assert_eq!(node.allocated_ram_mb, 8192);
	}

	#[tokio::test]
	async fn release_underflow_floors_at_zero() {
		let reg = registry();
		reg.register(worker("cloud-a1", 8192)).await;
		reg.release_ram("cloud-a1", 1024);

		let node = reg.get("cloud-a1").unwrap();
		assert_eq!(node.allocated_ram_mb, 0);
		assert_eq!(node.container_count, 0);
	}

	#[tokio::test]
	async fn fleet_stats_exclude_system_node_capacity() {
		let reg = registry();
		reg.register(worker("cloud-a1", 8192)).await;
		reg.register(worker("local-main", 32768)).await;
		assert!(reg.allocate_ram("cloud-a1", 2048));

		let stats = reg.fleet_stats();
		assert_eq!(stats.total_nodes, 2);
		assert_eq!(stats.system_nodes, 1);
		assert_eq!(stats.worker_nodes, 1);
		assert_eq!(stats.total_ram_mb, 8192);
		assert_eq!(stats.allocated_ram_mb, 2048);
		assert_eq!(stats.total_containers, 1);
		assert!((stats.utilization_percent - 25.0).abs() < f64::EPSILON);
	}

	#[tokio::test]
	async fn lifecycle_updates_go_through_the_transition_table() {
		let reg = registry();
		let mut n = worker("cloud-a1", 8192);
		n.lifecycle = NodeLifecycle::Active;
		reg.register(n).await;

		assert!(reg.update_lifecycle("cloud-a1", NodeLifecycle::Draining).is_ok());
		assert!(matches!(
			reg.update_lifecycle("cloud-a1", NodeLifecycle::Active),
			Err(RegistryError::Lifecycle(_))
		));
		assert_eq!(
			reg.get("cloud-a1").unwrap().lifecycle,
			NodeLifecycle::Draining
		);
	}
}
