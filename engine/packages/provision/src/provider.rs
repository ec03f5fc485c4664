use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_types::ServerTypeSpec;

/// A VM as the cloud provider describes it.
#[derive(Debug, Clone)]
pub struct CloudServer {
	pub id: String,
	pub name: String,
	pub public_ip: String,
	pub status: String,
	pub server_type: String,
	pub ram_mb: u64,
	pub cores: u32,
	pub hourly_cost_eur: f64,
	pub labels: HashMap<String, String>,
	pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateServerRequest {
	pub name: String,
	pub server_type: String,
	/// Image id or name; snapshots are referenced by id.
	pub image: String,
	pub location: String,
	pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CloudImage {
	pub id: String,
	pub name: String,
	pub description: Option<String>,
	pub image_type: String,
}

/// Operations the conductor consumes from the cloud provider.
#[async_trait]
pub trait CloudProvider: Send + Sync {
	async fn create_server(&self, req: CreateServerRequest) -> anyhow::Result<CloudServer>;
	async fn delete_server(&self, provider_id: &str) -> anyhow::Result<()>;
	async fn server(&self, provider_id: &str) -> anyhow::Result<CloudServer>;
	async fn list_servers(&self, label_selector: &str) -> anyhow::Result<Vec<CloudServer>>;
	async fn server_types(&self) -> anyhow::Result<Vec<ServerTypeSpec>>;
	async fn images(&self) -> anyhow::Result<Vec<CloudImage>>;
	/// Blocks until the VM answers on its public address or the timeout hits.
	async fn wait_until_reachable(
		&self,
		provider_id: &str,
		timeout: Duration,
	) -> anyhow::Result<CloudServer>;
	/// Average CPU percent over the last five minutes.
	async fn cpu_percent(&self, provider_id: &str) -> anyhow::Result<f64>;
	async fn create_snapshot(
		&self,
		provider_id: &str,
		description: &str,
	) -> anyhow::Result<CloudImage>;
	async fn delete_image(&self, image_id: &str) -> anyhow::Result<()>;
	async fn hourly_price(&self, server_type: &str) -> anyhow::Result<f64>;
}
