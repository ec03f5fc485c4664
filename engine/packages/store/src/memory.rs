use std::{
	collections::{HashMap, HashSet},
	sync::RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_types::{ContainerInfo, ContainerStatus, FleetStats, Node};

use crate::traits::{AuditEntry, AuditLog, ContainerStore, MetricsStore, NodeStore};

/// In-memory stand-ins for the durable stores. Used in tests and when the
/// daemon runs without a relational backend wired.
#[derive(Default)]
pub struct MemoryNodeStore {
	nodes: RwLock<HashMap<String, Node>>,
}

impl MemoryNodeStore {
	pub fn get(&self, node_id: &str) -> Option<Node> {
		self.nodes.read().unwrap().get(node_id).cloned()
	}

	pub fn len(&self) -> usize {
		self.nodes.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
	async fn upsert(&self, node: &Node) -> anyhow::Result<()> {
		self.nodes
			.write()
			.unwrap()
			.insert(node.id.clone(), node.clone());
		Ok(())
	}

	async fn remove(&self, node_id: &str) -> anyhow::Result<()> {
		self.nodes.write().unwrap().remove(node_id);
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryContainerStore {
	containers: RwLock<HashMap<String, ContainerInfo>>,
	lost: RwLock<HashSet<String>>,
}

impl MemoryContainerStore {
	pub fn insert(&self, container: ContainerInfo) {
		self.containers
			.write()
			.unwrap()
			.insert(container.server_id.clone(), container);
	}

	pub fn lost_ids(&self) -> HashSet<String> {
		self.lost.read().unwrap().clone()
	}
}

#[async_trait]
impl ContainerStore for MemoryContainerStore {
	async fn upsert(&self, container: &ContainerInfo) -> anyhow::Result<()> {
		self.insert(container.clone());
		Ok(())
	}

	async fn remove(&self, server_id: &str) -> anyhow::Result<()> {
		self.containers.write().unwrap().remove(server_id);
		Ok(())
	}

	async fn status(&self, server_id: &str) -> anyhow::Result<Option<ContainerStatus>> {
		Ok(self
			.containers
			.read()
			.unwrap()
			.get(server_id)
			.map(|c| c.status))
	}

	async fn list_ids(&self) -> anyhow::Result<HashSet<String>> {
		Ok(self.containers.read().unwrap().keys().cloned().collect())
	}

	async fn mark_lost(&self, server_id: &str) -> anyhow::Result<()> {
		self.lost.write().unwrap().insert(server_id.to_string());
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryAuditLog {
	entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
	pub fn entries(&self) -> Vec<AuditEntry> {
		self.entries.read().unwrap().clone()
	}
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
	async fn append(&self, entry: AuditEntry) -> anyhow::Result<()> {
		self.entries.write().unwrap().push(entry);
		Ok(())
	}
}

#[derive(Default)]
pub struct MemoryMetricsStore {
	cpu_samples: RwLock<Vec<(String, f64)>>,
}

impl MemoryMetricsStore {
	pub fn cpu_samples(&self) -> Vec<(String, f64)> {
		self.cpu_samples.read().unwrap().clone()
	}
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
	async fn record_node_cpu(
		&self,
		node_id: &str,
		percent: f64,
		_at: DateTime<Utc>,
	) -> anyhow::Result<()> {
		self.cpu_samples
			.write()
			.unwrap()
			.push((node_id.to_string(), percent));
		Ok(())
	}

	async fn record_fleet_capacity(
		&self,
		_stats: &FleetStats,
		_at: DateTime<Utc>,
	) -> anyhow::Result<()> {
		Ok(())
	}
}
