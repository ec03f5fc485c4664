use serde::{Deserialize, Serialize};

/// Point-in-time fleet aggregates. Capacity fields sum worker nodes only;
/// system nodes count toward node totals and health, nothing else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetStats {
	pub total_nodes: usize,
	pub healthy_nodes: usize,
	pub system_nodes: usize,
	pub worker_nodes: usize,
	pub dedicated_nodes: usize,
	pub cloud_nodes: usize,

	pub total_ram_mb: u64,
	pub usable_ram_mb: u64,
	pub allocated_ram_mb: u64,
	pub available_ram_mb: u64,
	pub system_reserved_ram_mb: u64,
	pub utilization_percent: f64,
	pub total_cpu_cores: u32,
	pub total_containers: u32,
	pub hourly_cost_eur: f64,
}
