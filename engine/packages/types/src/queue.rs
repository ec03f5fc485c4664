use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A start request waiting for capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedServer {
	pub server_id: String,
	pub server_name: String,
	pub required_ram_mb: u64,
	pub queued_at: DateTime<Utc>,
	pub requested_by: String,
}

impl QueuedServer {
	pub fn new(
		server_id: impl Into<String>,
		server_name: impl Into<String>,
		required_ram_mb: u64,
		requested_by: impl Into<String>,
	) -> Self {
		Self {
			server_id: server_id.into(),
			server_name: server_name.into(),
			required_ram_mb,
			queued_at: Utc::now(),
			requested_by: requested_by.into(),
		}
	}
}
