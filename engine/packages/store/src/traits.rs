use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_types::{ContainerInfo, ContainerStatus, FleetStats, Node};
use serde::{Deserialize, Serialize};

/// Relational-store surface for nodes. Write failures are tolerated by
/// callers; the in-memory registries stay authoritative.
#[async_trait]
pub trait NodeStore: Send + Sync {
	async fn upsert(&self, node: &Node) -> anyhow::Result<()>;
	async fn remove(&self, node_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ContainerStore: Send + Sync {
	async fn upsert(&self, container: &ContainerInfo) -> anyhow::Result<()>;
	async fn remove(&self, server_id: &str) -> anyhow::Result<()>;
	/// Last status the durable store knows for the workload, if any.
	async fn status(&self, server_id: &str) -> anyhow::Result<Option<ContainerStatus>>;
	/// All workload identities the durable store still tracks.
	async fn list_ids(&self) -> anyhow::Result<HashSet<String>>;
	/// Flag a workload whose node vanished across a restart.
	async fn mark_lost(&self, server_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
	pub at: DateTime<Utc>,
	pub action: String,
	pub subject: String,
	pub reason: String,
	pub decided_by: String,
	pub snapshot: serde_json::Value,
}

impl AuditEntry {
	pub fn new(
		action: impl Into<String>,
		subject: impl Into<String>,
		reason: impl Into<String>,
		decided_by: impl Into<String>,
		snapshot: serde_json::Value,
	) -> Self {
		Self {
			at: Utc::now(),
			action: action.into(),
			subject: subject.into(),
			reason: reason.into(),
			decided_by: decided_by.into(),
			snapshot,
		}
	}
}

/// Append-only record of decommission decisions and recovery losses.
#[async_trait]
pub trait AuditLog: Send + Sync {
	async fn append(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Time-series sink for CPU and capacity samples.
#[async_trait]
pub trait MetricsStore: Send + Sync {
	async fn record_node_cpu(
		&self,
		node_id: &str,
		percent: f64,
		at: DateTime<Utc>,
	) -> anyhow::Result<()>;
	async fn record_fleet_capacity(&self, stats: &FleetStats, at: DateTime<Utc>)
		-> anyhow::Result<()>;
}
