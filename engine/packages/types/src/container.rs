use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerStatus {
	/// Admission accepted, no node assigned yet.
	Reserving,
	Starting,
	Running,
	Stopped,
	Sleeping,
}

impl ContainerStatus {
	/// Statuses that occupy the fleet-wide start slot.
	pub fn occupies_start_slot(self) -> bool {
		matches!(self, ContainerStatus::Reserving | ContainerStatus::Starting)
	}
}

/// Authoritative record of a workload placement. Owned by the container
/// registry; `node_id` is empty while the workload is still reserving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
	pub server_id: String,
	pub server_name: String,
	/// Executor-assigned handle, empty until the executor accepts the start.
	pub container_id: String,
	pub node_id: String,
	pub ram_mb: u64,
	pub status: ContainerStatus,
	pub last_seen_at: DateTime<Utc>,
	pub port: u16,
	pub game_port: u16,
	pub game_version: Option<String>,
	pub server_type: Option<String>,
}

impl ContainerInfo {
	pub fn reserving(server_id: impl Into<String>, server_name: impl Into<String>, ram_mb: u64) -> Self {
		Self {
			server_id: server_id.into(),
			server_name: server_name.into(),
			container_id: String::new(),
			node_id: String::new(),
			ram_mb,
			status: ContainerStatus::Reserving,
			last_seen_at: Utc::now(),
			port: 0,
			game_port: 0,
			game_version: None,
			server_type: None,
		}
	}
}
