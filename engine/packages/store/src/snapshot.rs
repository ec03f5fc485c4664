use std::{
	collections::HashMap,
	path::Path,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use conductor_types::{ContainerInfo, Node, NodeKind, QueuedServer};
use serde::{Deserialize, Serialize};

/// Crash-recovery snapshot of a cloud node. Field names are a wire
/// contract shared with the ops tooling that inspects these files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedNodeState {
	pub id: String,
	pub hostname: String,
	pub ip: String,
	#[serde(rename = "type")]
	pub node_type: NodeKind,
	#[serde(rename = "totalRAMMB")]
	pub total_ram_mb: u64,
	#[serde(rename = "totalCPUCores")]
	pub total_cpu_cores: u32,
	#[serde(rename = "cloudProviderID")]
	pub cloud_provider_id: Option<String>,
	#[serde(rename = "hourlyCostEUR")]
	pub hourly_cost_eur: f64,
	#[serde(rename = "createdAt")]
	pub created_at: Option<DateTime<Utc>>,
	pub labels: HashMap<String, String>,
}

impl From<&Node> for PersistedNodeState {
	fn from(node: &Node) -> Self {
		Self {
			id: node.id.clone(),
			hostname: node.hostname.clone(),
			ip: node.ip.clone(),
			node_type: node.kind,
			total_ram_mb: node.total_ram_mb,
			total_cpu_cores: node.total_cpu_cores,
			cloud_provider_id: node.cloud_provider_id.clone(),
			hourly_cost_eur: node.hourly_cost_eur,
			created_at: node.created_at,
			labels: node.labels.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedContainerState {
	#[serde(rename = "serverID")]
	pub server_id: String,
	#[serde(rename = "serverName")]
	pub server_name: String,
	#[serde(rename = "containerID")]
	pub container_id: String,
	#[serde(rename = "nodeID")]
	pub node_id: String,
	pub status: String,
	#[serde(rename = "ramMB")]
	pub ram_mb: u64,
	pub port: u16,
	#[serde(rename = "minecraftPort")]
	pub minecraft_port: u16,
	#[serde(rename = "minecraftVersion", skip_serializing_if = "Option::is_none")]
	pub minecraft_version: Option<String>,
	#[serde(rename = "serverType", skip_serializing_if = "Option::is_none")]
	pub server_type: Option<String>,
}

impl From<&ContainerInfo> for PersistedContainerState {
	fn from(c: &ContainerInfo) -> Self {
		Self {
			server_id: c.server_id.clone(),
			server_name: c.server_name.clone(),
			container_id: c.container_id.clone(),
			node_id: c.node_id.clone(),
			status: c.status.to_string(),
			ram_mb: c.ram_mb,
			port: c.port,
			minecraft_port: c.game_port,
			minecraft_version: c.game_version.clone(),
			server_type: c.server_type.clone(),
		}
	}
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
	let parent = path
		.parent()
		.with_context(|| format!("snapshot path has no parent: {}", path.display()))?;
	std::fs::create_dir_all(parent)?;

	let file = tempfile::NamedTempFile::new_in(parent)?;
	serde_json::to_writer_pretty(&file, value)?;
	file.persist(path)
		.with_context(|| format!("failed to persist snapshot at {}", path.display()))?;
	Ok(())
}

fn load_or_empty<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Vec<T>> {
	if !path.exists() {
		return Ok(Vec::new());
	}
	let raw = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read snapshot at {}", path.display()))?;
	serde_json::from_str(&raw)
		.with_context(|| format!("failed to parse snapshot at {}", path.display()))
}

/// Writes the node snapshot. Only cloud nodes are persisted; dedicated and
/// local nodes come back from static configuration, not recovery.
pub fn write_node_snapshot<'a>(
	path: &Path,
	nodes: impl IntoIterator<Item = &'a Node>,
) -> anyhow::Result<()> {
	let records = nodes
		.into_iter()
		.filter(|n| n.kind == NodeKind::Cloud)
		.map(PersistedNodeState::from)
		.collect::<Vec<_>>();
	write_atomic(path, &records)
}

pub fn load_node_snapshot(path: &Path) -> anyhow::Result<Vec<PersistedNodeState>> {
	load_or_empty(path)
}

pub fn write_container_snapshot<'a>(
	path: &Path,
	containers: impl IntoIterator<Item = &'a ContainerInfo>,
) -> anyhow::Result<()> {
	let records = containers
		.into_iter()
		.map(PersistedContainerState::from)
		.collect::<Vec<_>>();
	write_atomic(path, &records)
}

pub fn load_container_snapshot(path: &Path) -> anyhow::Result<Vec<PersistedContainerState>> {
	load_or_empty(path)
}

pub fn write_queue_snapshot<'a>(
	path: &Path,
	queued: impl IntoIterator<Item = &'a QueuedServer>,
) -> anyhow::Result<()> {
	let records = queued.into_iter().cloned().collect::<Vec<_>>();
	write_atomic(path, &records)
}

pub fn load_queue_snapshot(path: &Path) -> anyhow::Result<Vec<QueuedServer>> {
	load_or_empty(path)
}
