use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use conductor_events::{EventPublisher, kind};
use conductor_registry::NodeRegistry;
use conductor_store::{AuditEntry, AuditLog};
use conductor_types::{
	DecommissionDenied, HealthStatus, Node, NodeKind, NodeLifecycle, estimated_ram_mb,
};
use conductor_util::id::short_nonce;
use serde_json::json;

use crate::provider::{CloudProvider, CreateServerRequest};

#[derive(Debug, thiserror::Error)]
pub enum DecommissionError {
	#[error("node not found: {0}")]
	NotFound(String),

	#[error("node {0} is not a cloud node")]
	NotCloudNode(String),

	#[error("node has no cloud provider id")]
	MissingProviderId,

	#[error(transparent)]
	Denied(#[from] DecommissionDenied),

	#[error("cloud provider error: {0}")]
	Cloud(#[source] anyhow::Error),
}

/// Creates and destroys worker VMs and drives node lifecycle transitions.
pub struct Provisioner {
	cloud: Arc<dyn CloudProvider>,
	nodes: Arc<NodeRegistry>,
	events: Arc<dyn EventPublisher>,
	audit: Arc<dyn AuditLog>,
	cfg: conductor_config::Config,
}

impl Provisioner {
	pub fn new(
		cloud: Arc<dyn CloudProvider>,
		nodes: Arc<NodeRegistry>,
		events: Arc<dyn EventPublisher>,
		audit: Arc<dyn AuditLog>,
		cfg: conductor_config::Config,
	) -> Self {
		Self {
			cloud,
			nodes,
			events,
			audit,
			cfg,
		}
	}

	fn managed_labels(&self) -> HashMap<String, String> {
		HashMap::from([
			("managed_by".to_string(), "payperplay".to_string()),
			("type".to_string(), "cloud".to_string()),
			(
				"created_at".to_string(),
				Utc::now().timestamp().to_string(),
			),
		])
	}

	/// True when some provisioning cycle is still in flight, i.e. a
	/// placeholder or initializing node exists.
	pub fn provisioning_in_flight(&self) -> bool {
		self.nodes.all().iter().any(|n| {
			matches!(
				n.lifecycle,
				NodeLifecycle::Provisioning | NodeLifecycle::Initializing
			)
		})
	}

	/// Orders one VM of `server_type` and registers it as a worker node.
	///
	/// A placeholder node goes into the registry before the cloud call so a
	/// concurrent scaling cycle sees capacity in flight and does not order a
	/// second VM. On any failure the placeholder (and the VM, if it was
	/// already created) is cleaned up.
	#[tracing::instrument(skip(self))]
	pub async fn provision_node(&self, server_type: &str) -> anyhow::Result<Node> {
		let nonce = short_nonce();
		let placeholder_id = format!("provisioning-{nonce}");

		let mut placeholder = Node::new(
			&placeholder_id,
			NodeKind::Cloud,
			estimated_ram_mb(server_type),
			self.cfg.cluster.reserve_percent,
		);
		placeholder.lifecycle = NodeLifecycle::Provisioning;
		placeholder.status = HealthStatus::Unhealthy;
		placeholder.provisioned_at = Some(Utc::now());
		self.nodes.register(placeholder).await;

		match self.provision_inner(&nonce, server_type, &placeholder_id).await {
			Ok(node) => Ok(node),
			Err((err, registered_node_id, cloud_id)) => {
				self.nodes.remove(&registered_node_id).await;
				if let Some(cloud_id) = cloud_id {
					if let Err(cleanup_err) = self.cloud.delete_server(&cloud_id).await {
						tracing::warn!(%cloud_id, ?cleanup_err, "failed to delete VM after provisioning failure");
					}
				}
				Err(err)
			}
		}
	}

	async fn provision_inner(
		&self,
		nonce: &str,
		server_type: &str,
		placeholder_id: &str,
	) -> Result<Node, (anyhow::Error, String, Option<String>)> {
		let fail = |err: anyhow::Error| (err, placeholder_id.to_string(), None);

		let image = self.resolve_base_image().await.map_err(fail)?;

		let name = format!("{}-{nonce}", self.cfg.cloud.server_name_prefix);
		let server = self
			.cloud
			.create_server(CreateServerRequest {
				name: name.clone(),
				server_type: server_type.to_string(),
				image,
				location: self.cfg.cloud.location.clone(),
				labels: self.managed_labels(),
			})
			.await
			.map_err(fail)?;

		tracing::info!(
			cloud_id = %server.id,
			node_name = %name,
			server_type,
			"VM created, waiting for reachability"
		);

		let server = self
			.cloud
			.wait_until_reachable(&server.id, self.cfg.provision.ready_timeout())
			.await
			.map_err(|err| (err, placeholder_id.to_string(), Some(server.id.clone())))?;

		// Swap the placeholder for the real node under its cloud-assigned
		// identity and true capacity.
		self.nodes.remove(placeholder_id).await;

		let mut node = Node::new(
			&server.name,
			NodeKind::Cloud,
			server.ram_mb,
			self.cfg.cluster.reserve_percent,
		);
		node.hostname = server.name.clone();
		node.ip = server.public_ip.clone();
		node.ssh_user = self.cfg.ssh.user.clone();
		node.ssh_key_path = self.cfg.ssh.key_path.clone();
		node.total_cpu_cores = server.cores;
		node.lifecycle = NodeLifecycle::Initializing;
		node.status = HealthStatus::Unhealthy;
		node.created_at = Some(Utc::now());
		node.provisioned_at = Some(Utc::now());
		node.labels = server.labels.clone();
		node.hourly_cost_eur = server.hourly_cost_eur;
		node.cloud_provider_id = Some(server.id.clone());
		self.nodes.register(node.clone()).await;

		// First-boot provisioning window. The fixed sleep is the default;
		// the active probe polls the node's ssh port instead.
		if self.cfg.provision.readiness_probe {
			if let Err(err) = self
				.wait_for_ssh(&node.ip, self.cfg.provision.ready_timeout())
				.await
			{
				return Err((err, node.id.clone(), Some(server.id.clone())));
			}
		} else {
			tokio::time::sleep(self.cfg.provision.init_wait()).await;
		}

		if let Err(err) = node
			.transition(NodeLifecycle::Ready)
			.context("initializing node refused ready transition")
		{
			return Err((err, node.id.clone(), Some(server.id.clone())));
		}
		node.status = HealthStatus::Healthy;
		node.initialized_at = Some(Utc::now());
		// Re-register so observers see the ready transition.
		self.nodes.register(node.clone()).await;

		self.events
			.publish(
				kind::NODE_CREATED,
				json!({
					"node_id": &node.id,
					"cloud_id": &server.id,
					"server_type": server_type,
					"total_ram_mb": node.total_ram_mb,
					"hourly_cost_eur": node.hourly_cost_eur,
				}),
			)
			.await;
		self.events
			.publish(kind::NODE_ADDED, json!({ "node_id": &node.id }))
			.await;

		tracing::info!(node_id = %node.id, "node provisioned and ready");
		Ok(node)
	}

	async fn resolve_base_image(&self) -> anyhow::Result<String> {
		// Prefer a managed snapshot over the plain base image; snapshots
		// carry pre-pulled workload images and cut first-start latency.
		let images = self.cloud.images().await.unwrap_or_default();
		let snapshot = images.iter().find(|i| {
			i.description
				.as_deref()
				.is_some_and(|d| d.starts_with("payperplay-worker"))
		});

		Ok(snapshot
			.map(|i| i.id.clone())
			.unwrap_or_else(|| self.cfg.cloud.base_image.clone()))
	}

	async fn wait_for_ssh(&self, ip: &str, timeout: Duration) -> anyhow::Result<()> {
		let deadline = tokio::time::Instant::now() + timeout;
		let addr = format!("{ip}:22");

		loop {
			let connect = tokio::time::timeout(
				Duration::from_secs(5),
				tokio::net::TcpStream::connect(&addr),
			)
			.await;
			if matches!(connect, Ok(Ok(_))) {
				return Ok(());
			}
			if tokio::time::Instant::now() >= deadline {
				anyhow::bail!("node at {ip} not reachable within {timeout:?}");
			}
			tokio::time::sleep(Duration::from_secs(10)).await;
		}
	}

	/// Deletes the VM behind an empty cloud node and unregisters it. Every
	/// decision lands in the audit log with its reason and source.
	#[tracing::instrument(skip(self))]
	pub async fn decommission_node(
		&self,
		node_id: &str,
		decided_by: &str,
		reason: &str,
	) -> Result<(), DecommissionError> {
		let node = self
			.nodes
			.get(node_id)
			.ok_or_else(|| DecommissionError::NotFound(node_id.to_string()))?;

		if node.kind != NodeKind::Cloud {
			return Err(DecommissionError::NotCloudNode(node_id.to_string()));
		}
		node.can_be_decommissioned(Utc::now())?;

		let provider_id = node
			.cloud_provider_id
			.clone()
			.ok_or(DecommissionError::MissingProviderId)?;

		self.cloud
			.delete_server(&provider_id)
			.await
			.map_err(DecommissionError::Cloud)?;
		self.nodes.remove(node_id).await;

		let entry = AuditEntry::new(
			"node.decommission",
			node_id,
			reason,
			decided_by,
			json!({
				"cloud_id": provider_id,
				"lifecycle": node.lifecycle.to_string(),
				"total_ram_mb": node.total_ram_mb,
				"total_containers_ever": node.total_containers_ever,
				"hourly_cost_eur": node.hourly_cost_eur,
			}),
		);
		if let Err(err) = self.audit.append(entry).await {
			tracing::warn!(%node_id, ?err, "failed to append decommission audit entry");
		}

		self.events
			.publish(
				kind::NODE_REMOVED,
				json!({
					"node_id": node_id,
					"decided_by": decided_by,
					"reason": reason,
				}),
			)
			.await;

		tracing::info!(%node_id, %decided_by, %reason, "node decommissioned");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use async_trait::async_trait;
	use conductor_events::NoopPublisher;
	use conductor_store::MemoryAuditLog;
	use conductor_types::ServerTypeSpec;

	use super::*;
	use crate::provider::{CloudImage, CloudServer};

	#[derive(Default)]
	struct MockCloud {
		fail_create: bool,
		fail_reachable: bool,
		deleted: Mutex<Vec<String>>,
	}

	impl MockCloud {
		fn make_server(&self, name: &str) -> CloudServer {
			CloudServer {
				id: "4711".into(),
				name: name.to_string(),
				public_ip: "203.0.113.7".into(),
				status: "running".into(),
				server_type: "cx32".into(),
				ram_mb: 8192,
				cores: 4,
				hourly_cost_eur: 0.0127,
				labels: HashMap::new(),
				created_at: Some(Utc::now()),
			}
		}
	}

	#[async_trait]
	impl CloudProvider for MockCloud {
		async fn create_server(&self, req: CreateServerRequest) -> anyhow::Result<CloudServer> {
			if self.fail_create {
				anyhow::bail!("quota exceeded");
			}
			Ok(self.make_server(&req.name))
		}

		async fn delete_server(&self, provider_id: &str) -> anyhow::Result<()> {
			self.deleted.lock().unwrap().push(provider_id.to_string());
			Ok(())
		}

		async fn server(&self, _provider_id: &str) -> anyhow::Result<CloudServer> {
			Ok(self.make_server("cloud-test"))
		}

		async fn list_servers(&self, _label_selector: &str) -> anyhow::Result<Vec<CloudServer>> {
			Ok(Vec::new())
		}

		async fn server_types(&self) -> anyhow::Result<Vec<ServerTypeSpec>> {
			Ok(Vec::new())
		}

		async fn images(&self) -> anyhow::Result<Vec<CloudImage>> {
			Ok(Vec::new())
		}

		async fn wait_until_reachable(
			&self,
			provider_id: &str,
			_timeout: Duration,
		) -> anyhow::Result<CloudServer> {
			if self.fail_reachable {
				anyhow::bail!("timed out");
			}
			let mut s = self.make_server("cloud-test");
			s.id = provider_id.to_string();
			Ok(s)
		}

		async fn cpu_percent(&self, _provider_id: &str) -> anyhow::Result<f64> {
			Ok(0.0)
		}

		async fn create_snapshot(
			&self,
			_provider_id: &str,
			_description: &str,
		) -> anyhow::Result<CloudImage> {
			anyhow::bail!("not implemented")
		}

		async fn delete_image(&self, _image_id: &str) -> anyhow::Result<()> {
			Ok(())
		}

		async fn hourly_price(&self, _server_type: &str) -> anyhow::Result<f64> {
			Ok(0.0127)
		}
	}

	fn cfg() -> conductor_config::Config {
		let mut cfg = conductor_config::Config::default();
		cfg.provision.init_wait_secs = 0;
		cfg
	}

	fn provisioner(
		cloud: Arc<MockCloud>,
		nodes: Arc<NodeRegistry>,
		audit: Arc<MemoryAuditLog>,
	) -> Provisioner {
		Provisioner::new(cloud, nodes, Arc::new(NoopPublisher), audit, cfg())
	}

	#[tokio::test]
	async fn successful_provisioning_swaps_placeholder_for_ready_node() {
		let cloud = Arc::new(MockCloud::default());
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let p = provisioner(cloud.clone(), nodes.clone(), Arc::new(MemoryAuditLog::default()));

		let node = p.provision_node("cx32").await.unwrap();

		assert_eq!(node.lifecycle, NodeLifecycle::Ready);
		assert_eq!(node.status, HealthStatus::Healthy);
		assert_eq!(node.total_ram_mb, 8192);
		assert_eq!(node.cloud_provider_id.as_deref(), Some("4711"));

		let all = nodes.all();
		assert_eq!(all.len(), 1);
		assert!(!all[0].id.starts_with("provisioning-"));
		assert!(!p.provisioning_in_flight());
	}

	#[tokio::test]
	async fn create_failure_cleans_up_the_placeholder() {
		let cloud = Arc::new(MockCloud {
			fail_create: true,
			..Default::default()
		});
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let p = provisioner(cloud, nodes.clone(), Arc::new(MemoryAuditLog::default()));

		assert!(p.provision_node("cx32").await.is_err());
		assert!(nodes.all().is_empty());
	}

	#[tokio::test]
	async fn reachability_failure_also_deletes_the_vm() {
		let cloud = Arc::new(MockCloud {
			fail_reachable: true,
			..Default::default()
		});
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let p = provisioner(cloud.clone(), nodes.clone(), Arc::new(MemoryAuditLog::default()));

		assert!(p.provision_node("cx32").await.is_err());
		assert!(nodes.all().is_empty());
		assert_eq!(cloud.deleted.lock().unwrap().as_slice(), ["4711"]);
	}

	#[tokio::test]
	async fn decommission_refuses_dedicated_and_occupied_nodes() {
		let cloud = Arc::new(MockCloud::default());
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let p = provisioner(cloud, nodes.clone(), Arc::new(MemoryAuditLog::default()));

		let mut dedicated = Node::new("ded-1", NodeKind::Dedicated, 16384, 0.1);
		dedicated.lifecycle = NodeLifecycle::Idle;
		nodes.register(dedicated).await;
		assert!(matches!(
			p.decommission_node("ded-1", "test", "idle").await,
			Err(DecommissionError::NotCloudNode(_))
		));

		let mut busy = Node::new("cloud-b2", NodeKind::Cloud, 8192, 0.1);
		busy.lifecycle = NodeLifecycle::Active;
		busy.total_containers_ever = 2;
		busy.container_count = 1;
		busy.allocated_ram_mb = 2048;
		busy.cloud_provider_id = Some("99".into());
		nodes.register(busy).await;
		assert!(matches!(
			p.decommission_node("cloud-b2", "test", "scale down").await,
			Err(DecommissionError::Denied(DecommissionDenied::NotEmpty { .. }))
		));
	}

	#[tokio::test]
	async fn decommission_deletes_vm_and_audits() {
		let cloud = Arc::new(MockCloud::default());
		let nodes = Arc::new(NodeRegistry::new(Vec::new()));
		let audit = Arc::new(MemoryAuditLog::default());
		let p = provisioner(cloud.clone(), nodes.clone(), audit.clone());

		let mut idle = Node::new("cloud-b2", NodeKind::Cloud, 8192, 0.1);
		idle.lifecycle = NodeLifecycle::Idle;
		idle.total_containers_ever = 5;
		idle.cloud_provider_id = Some("99".into());
		nodes.register(idle).await;

		p.decommission_node("cloud-b2", "reactive-policy", "fleet below 30% utilization")
			.await
			.unwrap();

		assert!(nodes.get("cloud-b2").is_none());
		assert_eq!(cloud.deleted.lock().unwrap().as_slice(), ["99"]);

		let entries = audit.entries();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].action, "node.decommission");
		assert_eq!(entries[0].decided_by, "reactive-policy");
	}
}
