use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Root configuration for the conductor daemon.
///
/// Loaded from a JSON file; a missing file means all defaults. Every field
/// has a default so partial files stay valid across upgrades.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub cluster: Cluster,
	#[serde(default)]
	pub paths: Paths,
	#[serde(default)]
	pub cloud: Cloud,
	#[serde(default)]
	pub ssh: Ssh,
	#[serde(default)]
	pub proxy: Proxy,
	#[serde(default)]
	pub admission: Admission,
	#[serde(default)]
	pub health: Health,
	#[serde(default)]
	pub scaling: Scaling,
	#[serde(default)]
	pub provision: Provision,
	#[serde(default)]
	pub recovery: Recovery,
}

impl Config {
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};
		if !path.exists() {
			return Ok(Self::default());
		}
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config at {}", path.display()))?;
		serde_json::from_str(&raw)
			.with_context(|| format!("failed to parse config at {}", path.display()))
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Cluster {
	/// Workload container naming prefix on every node.
	#[serde(default = "default_container_prefix")]
	pub container_prefix: String,
	/// Fraction of total RAM reserved for the OS and daemon.
	#[serde(default = "default_reserve_percent")]
	pub reserve_percent: f64,
	/// Literal node ids of the control plane, excluded from capacity.
	#[serde(default)]
	pub control_node_ids: Vec<String>,
	/// Literal node ids of the game proxies, excluded from capacity.
	#[serde(default)]
	pub proxy_node_ids: Vec<String>,
}

impl Default for Cluster {
	fn default() -> Self {
		Self {
			container_prefix: default_container_prefix(),
			reserve_percent: default_reserve_percent(),
			control_node_ids: Vec::new(),
			proxy_node_ids: Vec::new(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Paths {
	/// Directory for crash-recovery snapshots.
	#[serde(default = "default_state_dir")]
	pub state_dir: String,
}

impl Default for Paths {
	fn default() -> Self {
		Self {
			state_dir: default_state_dir(),
		}
	}
}

impl Paths {
	pub fn node_snapshot(&self) -> std::path::PathBuf {
		Path::new(&self.state_dir).join("nodes.json")
	}

	pub fn container_snapshot(&self) -> std::path::PathBuf {
		Path::new(&self.state_dir).join("containers.json")
	}

	pub fn queue_snapshot(&self) -> std::path::PathBuf {
		Path::new(&self.state_dir).join("queue.json")
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Cloud {
	#[serde(default)]
	pub api_token: Option<String>,
	#[serde(default = "default_base_image")]
	pub base_image: String,
	#[serde(default = "default_location")]
	pub location: String,
	#[serde(default = "default_server_name_prefix")]
	pub server_name_prefix: String,
	#[serde(default = "default_server_type")]
	pub default_server_type: String,
	/// Ordered at critical utilization instead of the default type.
	#[serde(default = "default_large_server_type")]
	pub large_server_type: String,
}

impl Default for Cloud {
	fn default() -> Self {
		Self {
			api_token: None,
			base_image: default_base_image(),
			location: default_location(),
			server_name_prefix: default_server_name_prefix(),
			default_server_type: default_server_type(),
			large_server_type: default_large_server_type(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Ssh {
	#[serde(default = "default_ssh_user")]
	pub user: String,
	#[serde(default = "default_ssh_key_path")]
	pub key_path: String,
}

impl Default for Ssh {
	fn default() -> Self {
		Self {
			user: default_ssh_user(),
			key_path: default_ssh_key_path(),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Proxy {
	/// Admin endpoint of the game proxy; unset disables proxy integration.
	#[serde(default)]
	pub base_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Admission {
	/// Window after conductor start during which all starts are queued.
	#[serde(default = "default_startup_delay_secs")]
	pub startup_delay_secs: u64,
	#[serde(default = "default_queue_interval_secs")]
	pub queue_interval_secs: u64,
	/// Reserving/starting entries older than this are treated as deadlocked.
	#[serde(default = "default_reservation_timeout_mins")]
	pub reservation_timeout_mins: u64,
	#[serde(default = "default_reservation_sweep_mins")]
	pub reservation_sweep_mins: u64,
	#[serde(default = "default_cpu_metrics_secs")]
	pub cpu_metrics_interval_secs: u64,
	#[serde(default = "default_ghost_cleanup_secs")]
	pub ghost_cleanup_interval_secs: u64,
}

impl Default for Admission {
	fn default() -> Self {
		Self {
			startup_delay_secs: default_startup_delay_secs(),
			queue_interval_secs: default_queue_interval_secs(),
			reservation_timeout_mins: default_reservation_timeout_mins(),
			reservation_sweep_mins: default_reservation_sweep_mins(),
			cpu_metrics_interval_secs: default_cpu_metrics_secs(),
			ghost_cleanup_interval_secs: default_ghost_cleanup_secs(),
		}
	}
}

impl Admission {
	pub fn startup_delay(&self) -> Duration {
		Duration::from_secs(self.startup_delay_secs)
	}

	pub fn queue_interval(&self) -> Duration {
		Duration::from_secs(self.queue_interval_secs)
	}

	pub fn reservation_timeout(&self) -> Duration {
		Duration::from_secs(self.reservation_timeout_mins * 60)
	}

	pub fn reservation_sweep_interval(&self) -> Duration {
		Duration::from_secs(self.reservation_sweep_mins * 60)
	}

	pub fn cpu_metrics_interval(&self) -> Duration {
		Duration::from_secs(self.cpu_metrics_interval_secs)
	}

	pub fn ghost_cleanup_interval(&self) -> Duration {
		Duration::from_secs(self.ghost_cleanup_interval_secs)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Health {
	#[serde(default = "default_health_interval_secs")]
	pub interval_secs: u64,
	#[serde(default = "default_node_timeout_secs")]
	pub node_timeout_secs: u64,
	#[serde(default = "default_list_timeout_secs")]
	pub list_timeout_secs: u64,
	#[serde(default = "default_local_ping_timeout_secs")]
	pub local_ping_timeout_secs: u64,
	/// Below this free RAM the check logs a warning; status is unaffected.
	#[serde(default = "default_min_free_ram_mb")]
	pub min_free_ram_mb: u64,
	#[serde(default = "default_max_disk_percent")]
	pub max_disk_percent: u8,
}

impl Default for Health {
	fn default() -> Self {
		Self {
			interval_secs: default_health_interval_secs(),
			node_timeout_secs: default_node_timeout_secs(),
			list_timeout_secs: default_list_timeout_secs(),
			local_ping_timeout_secs: default_local_ping_timeout_secs(),
			min_free_ram_mb: default_min_free_ram_mb(),
			max_disk_percent: default_max_disk_percent(),
		}
	}
}

impl Health {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	pub fn node_timeout(&self) -> Duration {
		Duration::from_secs(self.node_timeout_secs)
	}

	pub fn list_timeout(&self) -> Duration {
		Duration::from_secs(self.list_timeout_secs)
	}

	pub fn local_ping_timeout(&self) -> Duration {
		Duration::from_secs(self.local_ping_timeout_secs)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Scaling {
	#[serde(default = "default_scaling_interval_secs")]
	pub interval_secs: u64,
	#[serde(default)]
	pub reactive: Reactive,
	#[serde(default)]
	pub consolidation: Consolidation,
}

impl Default for Scaling {
	fn default() -> Self {
		Self {
			interval_secs: default_scaling_interval_secs(),
			reactive: Reactive::default(),
			consolidation: Consolidation::default(),
		}
	}
}

impl Scaling {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Reactive {
	#[serde(default = "default_up_threshold")]
	pub up_threshold_percent: f64,
	#[serde(default = "default_down_threshold")]
	pub down_threshold_percent: f64,
	#[serde(default = "default_cooldown_mins")]
	pub cooldown_mins: u64,
	#[serde(default)]
	pub min_cloud_nodes: usize,
	#[serde(default = "default_max_cloud_nodes")]
	pub max_cloud_nodes: usize,
	/// No scale-down within this window after a scale-up.
	#[serde(default = "default_scale_up_grace_mins")]
	pub scale_up_grace_mins: u64,
}

impl Default for Reactive {
	fn default() -> Self {
		Self {
			up_threshold_percent: default_up_threshold(),
			down_threshold_percent: default_down_threshold(),
			cooldown_mins: default_cooldown_mins(),
			min_cloud_nodes: 0,
			max_cloud_nodes: default_max_cloud_nodes(),
			scale_up_grace_mins: default_scale_up_grace_mins(),
		}
	}
}

impl Reactive {
	pub fn cooldown(&self) -> Duration {
		Duration::from_secs(self.cooldown_mins * 60)
	}

	pub fn scale_up_grace(&self) -> Duration {
		Duration::from_secs(self.scale_up_grace_mins * 60)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Consolidation {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_consolidation_cooldown_mins")]
	pub cooldown_mins: u64,
	/// Consolidation refuses to run at or above this fleet utilization.
	#[serde(default = "default_max_utilization")]
	pub max_utilization_percent: f64,
	#[serde(default = "default_min_node_savings")]
	pub min_node_savings: u32,
	/// Bin size for packing when deriving it from the fleet is impossible.
	#[serde(default = "default_node_capacity_mb")]
	pub node_capacity_mb: u64,
}

impl Default for Consolidation {
	fn default() -> Self {
		Self {
			enabled: true,
			cooldown_mins: default_consolidation_cooldown_mins(),
			max_utilization_percent: default_max_utilization(),
			min_node_savings: default_min_node_savings(),
			node_capacity_mb: default_node_capacity_mb(),
		}
	}
}

impl Consolidation {
	pub fn cooldown(&self) -> Duration {
		Duration::from_secs(self.cooldown_mins * 60)
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Provision {
	#[serde(default = "default_ready_timeout_mins")]
	pub ready_timeout_mins: u64,
	/// Fixed first-boot window before a node is marked healthy.
	#[serde(default = "default_init_wait_secs")]
	pub init_wait_secs: u64,
	/// Replace the fixed window with an active reachability probe.
	#[serde(default)]
	pub readiness_probe: bool,
	#[serde(default = "default_recovery_grace_hours")]
	pub recovery_grace_hours: u64,
}

impl Default for Provision {
	fn default() -> Self {
		Self {
			ready_timeout_mins: default_ready_timeout_mins(),
			init_wait_secs: default_init_wait_secs(),
			readiness_probe: false,
			recovery_grace_hours: default_recovery_grace_hours(),
		}
	}
}

impl Provision {
	pub fn ready_timeout(&self) -> Duration {
		Duration::from_secs(self.ready_timeout_mins * 60)
	}

	pub fn init_wait(&self) -> Duration {
		Duration::from_secs(self.init_wait_secs)
	}

	pub fn recovery_grace(&self) -> Duration {
		Duration::from_secs(self.recovery_grace_hours * 3600)
	}
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Recovery {
	/// Publish a synthetic node.created for every recovered node. The
	/// default relies on recovered nodes simply reappearing in fleet stats.
	#[serde(default)]
	pub publish_node_added: bool,
}

fn default_container_prefix() -> String {
	"mc-".to_string()
}

fn default_reserve_percent() -> f64 {
	0.1
}

fn default_state_dir() -> String {
	"/var/lib/conductor".to_string()
}

fn default_base_image() -> String {
	"docker-ce".to_string()
}

fn default_location() -> String {
	"nbg1".to_string()
}

fn default_server_name_prefix() -> String {
	"cloud".to_string()
}

fn default_server_type() -> String {
	"cx32".to_string()
}

fn default_large_server_type() -> String {
	"cx42".to_string()
}

fn default_ssh_user() -> String {
	"root".to_string()
}

fn default_ssh_key_path() -> String {
	"/etc/conductor/ssh/id_ed25519".to_string()
}

fn default_startup_delay_secs() -> u64 {
	120
}

fn default_queue_interval_secs() -> u64 {
	30
}

fn default_reservation_timeout_mins() -> u64 {
	30
}

fn default_reservation_sweep_mins() -> u64 {
	5
}

fn default_cpu_metrics_secs() -> u64 {
	60
}

fn default_ghost_cleanup_secs() -> u64 {
	60
}

fn default_health_interval_secs() -> u64 {
	60
}

fn default_node_timeout_secs() -> u64 {
	15
}

fn default_list_timeout_secs() -> u64 {
	10
}

fn default_local_ping_timeout_secs() -> u64 {
	5
}

fn default_min_free_ram_mb() -> u64 {
	500
}

fn default_max_disk_percent() -> u8 {
	90
}

fn default_scaling_interval_secs() -> u64 {
	120
}

fn default_up_threshold() -> f64 {
	85.0
}

fn default_down_threshold() -> f64 {
	30.0
}

fn default_cooldown_mins() -> u64 {
	5
}

fn default_max_cloud_nodes() -> usize {
	10
}

fn default_scale_up_grace_mins() -> u64 {
	20
}

fn default_true() -> bool {
	true
}

fn default_consolidation_cooldown_mins() -> u64 {
	30
}

fn default_max_utilization() -> f64 {
	70.0
}

fn default_min_node_savings() -> u32 {
	2
}

fn default_node_capacity_mb() -> u64 {
	8192
}

fn default_ready_timeout_mins() -> u64 {
	5
}

fn default_init_wait_secs() -> u64 {
	120
}

fn default_recovery_grace_hours() -> u64 {
	4
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let config = Config::load(Some(Path::new("/nonexistent/conductor.json"))).unwrap();
		assert_eq!(config.scaling.reactive.up_threshold_percent, 85.0);
		assert_eq!(config.admission.startup_delay_secs, 120);
		assert_eq!(config.scaling.consolidation.min_node_savings, 2);
	}

	#[test]
	fn partial_file_keeps_defaults_elsewhere() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{"scaling": {{"reactive": {{"max-cloud-nodes": 4}}}}}}"#
		)
		.unwrap();

		let config = Config::load(Some(file.path())).unwrap();
		assert_eq!(config.scaling.reactive.max_cloud_nodes, 4);
		assert_eq!(config.scaling.reactive.up_threshold_percent, 85.0);
		assert_eq!(config.health.min_free_ram_mb, 500);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, r#"{{"no-such-section": {{}}}}"#).unwrap();
		assert!(Config::load(Some(file.path())).is_err());
	}
}
