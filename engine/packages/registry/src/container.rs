use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, RwLock},
	time::Duration,
};

use chrono::Utc;
use conductor_store::ContainerStore;
use conductor_types::{ContainerInfo, ContainerStatus};

use crate::node::NodeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
	/// Another workload already holds the fleet-wide start slot.
	#[error("start slot busy: {server_id} is {status}")]
	SlotBusy {
		server_id: String,
		status: ContainerStatus,
	},

	#[error("server already registered: {0}")]
	AlreadyRegistered(String),
}

/// Authoritative map of workload identity to placement and status. Owns
/// idle-transition bookkeeping on the node registry.
pub struct ContainerRegistry {
	containers: RwLock<HashMap<String, ContainerInfo>>,
	nodes: Arc<NodeRegistry>,
	store: Option<Arc<dyn ContainerStore>>,
}

impl ContainerRegistry {
	pub fn new(nodes: Arc<NodeRegistry>) -> Self {
		Self {
			containers: RwLock::new(HashMap::new()),
			nodes,
			store: None,
		}
	}

	pub fn with_store(mut self, store: Arc<dyn ContainerStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Upsert by workload identity. A genuinely new workload with a node
	/// assignment stamps that node's container-arrival tracking.
	pub async fn register(&self, mut info: ContainerInfo) {
		info.last_seen_at = Utc::now();

		let (is_new, node_id) = {
			let mut containers = self.containers.write().unwrap();
			let is_new = !containers.contains_key(&info.server_id);
			let node_id = info.node_id.clone();
			containers.insert(info.server_id.clone(), info.clone());
			(is_new, node_id)
		};

		if is_new && !node_id.is_empty() {
			self.nodes.note_container_added(&node_id);
		}

		if let Some(store) = &self.store {
			if let Err(err) = store.upsert(&info).await {
				tracing::warn!(server_id = %info.server_id, ?err, "failed to persist container");
			}
		}
	}

	pub async fn remove(&self, server_id: &str) -> Option<ContainerInfo> {
		let (removed, node_emptied) = {
			let mut containers = self.containers.write().unwrap();
			let removed = containers.remove(server_id);
			let node_emptied = removed.as_ref().and_then(|c| {
				if c.node_id.is_empty() {
					return None;
				}
				let remaining = containers.values().filter(|o| o.node_id == c.node_id).count();
				(remaining == 0).then(|| c.node_id.clone())
			});
			(removed, node_emptied)
		};

		if let Some(node_id) = node_emptied {
			self.nodes.note_node_emptied(&node_id);
		}

		if removed.is_some() {
			if let Some(store) = &self.store {
				if let Err(err) = store.remove(server_id).await {
					tracing::warn!(%server_id, ?err, "failed to remove persisted container");
				}
			}
		}

		removed
	}

	pub fn get(&self, server_id: &str) -> Option<ContainerInfo> {
		self.containers.read().unwrap().get(server_id).cloned()
	}

	pub fn all(&self) -> Vec<ContainerInfo> {
		self.containers.read().unwrap().values().cloned().collect()
	}

	pub fn by_node(&self, node_id: &str) -> Vec<ContainerInfo> {
		self.containers
			.read()
			.unwrap()
			.values()
			.filter(|c| c.node_id == node_id)
			.cloned()
			.collect()
	}

	pub fn by_status(&self, status: ContainerStatus) -> Vec<ContainerInfo> {
		self.containers
			.read()
			.unwrap()
			.values()
			.filter(|c| c.status == status)
			.cloned()
			.collect()
	}

	/// Container count and booked RAM currently recorded for a node.
	pub fn node_allocation(&self, node_id: &str) -> (u32, u64) {
		let containers = self.containers.read().unwrap();
		let mut count = 0u32;
		let mut ram = 0u64;
		for c in containers.values().filter(|c| c.node_id == node_id) {
			count += 1;
			ram += c.ram_mb;
		}
		(count, ram)
	}

	/// Workloads holding the fleet-wide start slot (reserving or starting).
	pub fn starting_count(&self) -> usize {
		self.containers
			.read()
			.unwrap()
			.values()
			.filter(|c| c.status.occupies_start_slot())
			.count()
	}

	pub fn starting_count_on(&self, node_id: &str) -> usize {
		self.containers
			.read()
			.unwrap()
			.values()
			.filter(|c| c.node_id == node_id && c.status.occupies_start_slot())
			.count()
	}

	/// Claims the fleet-wide start slot. Fails while any other workload is
	/// reserving or starting, even with free RAM everywhere.
	pub fn atomic_reserve_start_slot(
		&self,
		server_id: &str,
		server_name: &str,
		ram_mb: u64,
	) -> Result<(), ReserveError> {
		let mut containers = self.containers.write().unwrap();

		if let Some(active) = containers.values().find(|c| c.status.occupies_start_slot()) {
			return Err(ReserveError::SlotBusy {
				server_id: active.server_id.clone(),
				status: active.status,
			});
		}

		if let Some(existing) = containers.get(server_id) {
			if existing.status != ContainerStatus::Stopped {
				return Err(ReserveError::AlreadyRegistered(server_id.to_string()));
			}
		}

		containers.insert(
			server_id.to_string(),
			ContainerInfo::reserving(server_id, server_name, ram_mb),
		);
		Ok(())
	}

	/// Pins the reservation to the node selection, still holding the slot.
	pub fn assign_node(&self, server_id: &str, node_id: &str) -> bool {
		let mut containers = self.containers.write().unwrap();
		match containers.get_mut(server_id) {
			Some(c) => {
				c.node_id = node_id.to_string();
				c.last_seen_at = Utc::now();
				true
			}
			None => false,
		}
	}

	/// The executor accepted the start and handed back its container handle.
	pub fn mark_started(
		&self,
		server_id: &str,
		container_id: &str,
		port: u16,
		game_port: u16,
	) -> bool {
		let mut containers = self.containers.write().unwrap();
		match containers.get_mut(server_id) {
			Some(c) => {
				c.container_id = container_id.to_string();
				c.port = port;
				c.game_port = game_port;
				c.status = ContainerStatus::Starting;
				c.last_seen_at = Utc::now();
				true
			}
			None => false,
		}
	}

	pub fn update_status(&self, server_id: &str, status: ContainerStatus) -> bool {
		let mut containers = self.containers.write().unwrap();
		match containers.get_mut(server_id) {
			Some(c) => {
				c.status = status;
				c.last_seen_at = Utc::now();
				true
			}
			None => false,
		}
	}

	/// Re-homes a workload during migration.
	pub fn update_node(&self, server_id: &str, new_node_id: &str) -> bool {
		let mut containers = self.containers.write().unwrap();
		match containers.get_mut(server_id) {
			Some(c) => {
				c.node_id = new_node_id.to_string();
				c.last_seen_at = Utc::now();
				true
			}
			None => false,
		}
	}

	/// Ghost sweep: drops entries on `node_id` whose executor-side handle is
	/// not in the observed set. Entries without a handle yet (still
	/// reserving or starting) are left alone. Returns the removed ghosts.
	pub async fn sync_node_containers(
		&self,
		node_id: &str,
		observed: &HashSet<String>,
	) -> Vec<ContainerInfo> {
		let (removed, node_emptied) = {
			let mut containers = self.containers.write().unwrap();
			let ghost_ids = containers
				.values()
				.filter(|c| {
					c.node_id == node_id
						&& !c.container_id.is_empty()
						&& !observed.contains(&c.container_id)
				})
				.map(|c| c.server_id.clone())
				.collect::<Vec<_>>();

			let removed = ghost_ids
				.iter()
				.filter_map(|id| containers.remove(id))
				.collect::<Vec<_>>();

			let remaining = containers.values().filter(|c| c.node_id == node_id).count();
			let node_emptied = !removed.is_empty() && remaining == 0;
			(removed, node_emptied)
		};

		for ghost in &removed {
			tracing::warn!(
				server_id = %ghost.server_id,
				container_id = %ghost.container_id,
				%node_id,
				"removed ghost container"
			);
		}

		if node_emptied {
			self.nodes.note_node_emptied(node_id);
		}
		self.nodes.note_sync_completed(node_id);

		if let Some(store) = &self.store {
			for ghost in &removed {
				if let Err(err) = store.remove(&ghost.server_id).await {
					tracing::warn!(server_id = %ghost.server_id, ?err, "failed to remove persisted ghost");
				}
			}
		}

		removed
	}

	/// Entries not seen for at least `age`. Used for orphan detection.
	pub fn stale_since(&self, age: Duration) -> Vec<ContainerInfo> {
		let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
		self.containers
			.read()
			.unwrap()
			.values()
			.filter(|c| c.last_seen_at < cutoff)
			.cloned()
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use conductor_types::{HealthStatus, Node, NodeKind, NodeLifecycle};

	use super::*;

	async fn fixtures() -> (Arc<NodeRegistry>, ContainerRegistry) {
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let mut n = Node::new("cloud-a1", NodeKind::Cloud, 8192, 0.1);
		n.status = HealthStatus::Healthy;
		nodes.register(n).await;
		let containers = ContainerRegistry::new(nodes.clone());
		(nodes, containers)
	}

	fn running(server_id: &str, node_id: &str, ram_mb: u64) -> ContainerInfo {
		let mut c = ContainerInfo::reserving(server_id, server_id, ram_mb);
		c.node_id = node_id.to_string();
		c.container_id = format!("docker-{server_id}");
		c.status = ContainerStatus::Running;
		c
	}

	#[tokio::test]
	async fn new_container_promotes_node_and_stamps_tracking() {
		let (nodes, containers) = fixtures().await;
		containers.register(running("srv-1", "cloud-a1", 2048)).await;

		let node = nodes.get("cloud-a1").unwrap();
		assert_eq!(node.lifecycle, NodeLifecycle::Active);
		assert_eq!(node.total_containers_ever, 1);
		assert!(node.last_container_added.is_some());

		// Re-registering the same identity is not an arrival.
		containers.register(running("srv-1", "cloud-a1", 2048)).await;
		assert_eq!(nodes.get("cloud-a1").unwrap().total_containers_ever, 1);
	}

	#[tokio::test]
	async fn removing_last_container_marks_node_idle() {
		let (nodes, containers) = fixtures().await;
		containers.register(running("srv-1", "cloud-a1", 2048)).await;
		containers.register(running("srv-2", "cloud-a1", 2048)).await;

		containers.remove("srv-1").await;
		assert_eq!(nodes.get("cloud-a1").unwrap().lifecycle, NodeLifecycle::Active);
		assert!(nodes.get("cloud-a1").unwrap().last_container_removed.is_none());

		containers.remove("srv-2").await;
		let node = nodes.get("cloud-a1").unwrap();
		assert_eq!(node.lifecycle, NodeLifecycle::Idle);
		assert!(node.last_container_removed.is_some());
	}

	#[tokio::test]
	async fn start_slot_is_exclusive_even_with_free_ram() {
		let (_, containers) = fixtures().await;

		containers
			.atomic_reserve_start_slot("srv-1", "alpha", 2048)
			.unwrap();
		let err = containers
			.atomic_reserve_start_slot("srv-2", "beta", 1024)
			.unwrap_err();
		assert!(matches!(err, ReserveError::SlotBusy { .. }));

		// Slot frees once the holder is running.
		containers.assign_node("srv-1", "cloud-a1");
		containers.mark_started("srv-1", "docker-srv-1", 8443, 25565);
		containers.update_status("srv-1", ContainerStatus::Running);
		assert!(containers
			.atomic_reserve_start_slot("srv-2", "beta", 1024)
			.is_ok());
	}

	#[tokio::test]
	async fn sync_removes_ghosts_but_spares_handleless_entries() {
		let (nodes, containers) = fixtures().await;
		containers.register(running("srv-1", "cloud-a1", 2048)).await;
		containers.register(running("srv-2", "cloud-a1", 2048)).await;

		let mut starting = ContainerInfo::reserving("srv-3", "gamma", 1024);
		starting.node_id = "cloud-a1".to_string();
		starting.status = ContainerStatus::Starting;
		containers.register(starting).await;

		let observed = HashSet::from(["docker-srv-1".to_string()]);
		let removed = containers.sync_node_containers("cloud-a1", &observed).await;

		assert_eq!(removed.len(), 1);
		assert_eq!(removed[0].server_id, "srv-2");
		assert!(containers.get("srv-1").is_some());
		assert!(containers.get("srv-3").is_some());
		assert!(nodes.get("cloud-a1").unwrap().sync_completed_at.is_some());
	}

	#[tokio::test]
	async fn sync_against_empty_set_clears_node_and_stamps_idle() {
		let (nodes, containers) = fixtures().await;
		containers.register(running("srv-1", "cloud-a1", 2048)).await;
		containers.register(running("srv-2", "cloud-a1", 2048)).await;

		let removed = containers
			.sync_node_containers("cloud-a1", &HashSet::new())
			.await;
		assert_eq!(removed.len(), 2);
		assert!(containers.by_node("cloud-a1").is_empty());
		assert!(nodes.get("cloud-a1").unwrap().last_container_removed.is_some());
	}

	#[tokio::test]
	async fn node_allocation_sums_booked_ram() {
		let (_, containers) = fixtures().await;
		containers.register(running("srv-1", "cloud-a1", 2048)).await;
		containers.register(running("srv-2", "cloud-a1", 1024)).await;
		containers.register(running("srv-3", "elsewhere", 4096)).await;

		assert_eq!(containers.node_allocation("cloud-a1"), (2, 3072));
	}
}
