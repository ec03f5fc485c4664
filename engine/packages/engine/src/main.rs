use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use conductor::{Conductor, Dependencies, LoggingExecutor};
use conductor_provision::{
	CloudImage, CloudProvider, CloudServer, CreateServerRequest, HetznerClient,
};
use conductor_remote::{DockerDaemon, HttpProxyClient, NoopProxy, SshExec};
use conductor_store::JsonlAuditLog;
use conductor_types::{HealthStatus, Node, NodeKind, ServerTypeSpec};

#[derive(Parser)]
#[command(name = "conductor-engine", version, about = "PayPerPlay fleet conductor")]
struct Cli {
	/// Path to the JSON config file; missing file means defaults.
	#[clap(long)]
	config: Option<PathBuf>,
}

/// Stands in when no cloud API token is configured: the fleet runs on
/// whatever nodes it already has and every provisioning attempt fails
/// loudly instead of silently.
struct DisabledCloud;

#[async_trait::async_trait]
impl CloudProvider for DisabledCloud {
	async fn create_server(&self, _req: CreateServerRequest) -> anyhow::Result<CloudServer> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn delete_server(&self, _provider_id: &str) -> anyhow::Result<()> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn server(&self, _provider_id: &str) -> anyhow::Result<CloudServer> {
		anyhow::bail!("no cloud api token configured")
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
		_provider_id: &str,
		_timeout: Duration,
	) -> anyhow::Result<CloudServer> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn cpu_percent(&self, _provider_id: &str) -> anyhow::Result<f64> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn create_snapshot(
		&self,
		_provider_id: &str,
		_description: &str,
	) -> anyhow::Result<CloudImage> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn delete_image(&self, _image_id: &str) -> anyhow::Result<()> {
		anyhow::bail!("no cloud api token configured")
	}

	async fn hourly_price(&self, _server_type: &str) -> anyhow::Result<f64> {
		anyhow::bail!("no cloud api token configured")
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info,conductor=debug".into()),
		)
		.init();

	let cli = Cli::parse();
	let config = conductor_config::Config::load(cli.config.as_deref())?;
	tracing::info!(state_dir = %config.paths.state_dir, "config loaded");

	let cloud: Arc<dyn CloudProvider> = match &config.cloud.api_token {
		Some(token) => Arc::new(HetznerClient::new(token)?),
		None => {
			tracing::warn!("no cloud api token configured, provisioning disabled");
			Arc::new(DisabledCloud)
		}
	};

	let proxy: Arc<dyn conductor_remote::GameProxy> = match &config.proxy.base_url {
		Some(base_url) => Arc::new(HttpProxyClient::new(base_url.clone())?),
		None => Arc::new(NoopProxy),
	};

	let local_daemon =
		Arc::new(DockerDaemon::connect().context("failed to connect to local docker daemon")?);
	let audit_path = std::path::Path::new(&config.paths.state_dir).join("audit.jsonl");

	let deps = Dependencies {
		cloud,
		exec: Arc::new(SshExec),
		local_daemon: local_daemon.clone(),
		proxy,
		// Integration seam: the game-server runtime replaces this with its
		// real executor when it embeds the conductor.
		executor: Arc::new(LoggingExecutor),
		events: Arc::new(conductor_events::EventBus::default()),
		node_store: None,
		container_store: None,
		metrics_store: None,
		audit: Arc::new(JsonlAuditLog::new(audit_path)),
	};

	let conductor = Conductor::new(config.clone(), deps);
	conductor.start().await?;

	// The control host itself shows up in fleet health, never in capacity.
	register_local_node(&conductor, &config, local_daemon).await;

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutdown signal received");
	conductor.stop().await;
	Ok(())
}

async fn register_local_node(
	conductor: &Arc<Conductor>,
	config: &conductor_config::Config,
	daemon: Arc<DockerDaemon>,
) {
	use conductor_remote::ContainerDaemon;

	let info = match daemon.system_info().await {
		Ok(info) => info,
		Err(err) => {
			tracing::warn!(?err, "failed to read local system info, skipping local node");
			return;
		}
	};

	let mut node = Node::new(
		"local-main",
		NodeKind::Local,
		info.total_ram_mb,
		config.cluster.reserve_percent,
	);
	node.hostname = "localhost".into();
	node.ip = "127.0.0.1".into();
	node.total_cpu_cores = info.cpu_cores;
	node.status = HealthStatus::Healthy;
	conductor.register_node(node).await;
}
