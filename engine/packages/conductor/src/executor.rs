use async_trait::async_trait;

/// Everything the workload executor needs to launch a game server
/// container on the chosen node.
#[derive(Debug, Clone)]
pub struct StartContract {
	pub server_id: String,
	pub server_name: String,
	pub node_id: String,
	pub node_ip: String,
	/// Name the container must be created under; the health checker finds
	/// workloads by this prefix.
	pub container_name: String,
	/// RAM the booking is billed for.
	pub booked_ram_mb: u64,
	/// cgroup limit the container actually launches with.
	pub actual_ram_mb: u64,
}

/// The component that actually runs game servers. It accepts a start
/// contract, creates the container, and reports progress back through
/// `Conductor::confirm_started` / `confirm_running` /
/// `report_start_failure`.
#[async_trait]
pub trait ServerExecutor: Send + Sync {
	async fn launch(&self, contract: StartContract) -> anyhow::Result<()>;
}

/// Placeholder executor for running the conductor without the game-server
/// runtime attached: accepts every contract and only logs it. Workloads
/// stay in reserving until the timeout sweep collects them.
#[derive(Debug, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl ServerExecutor for LoggingExecutor {
	async fn launch(&self, contract: StartContract) -> anyhow::Result<()> {
		tracing::info!(
			server_id = %contract.server_id,
			node_id = %contract.node_id,
			booked_ram_mb = contract.booked_ram_mb,
			actual_ram_mb = contract.actual_ram_mb,
			"dry-run executor accepted start contract"
		);
		Ok(())
	}
}
