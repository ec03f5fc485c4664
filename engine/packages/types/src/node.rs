use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Floor and ceiling for the RAM slice kept back for the OS and the
/// container daemon. The reserve is a fixed fraction of total RAM, clamped
/// so tiny nodes keep something and huge nodes do not waste half a box.
pub const SYSTEM_RESERVE_FLOOR_MB: u64 = 256;

/// Containers are never squeezed below this, whatever the reduction factor says.
pub const ACTUAL_RAM_FLOOR_MB: u64 = 512;

/// Ready-but-never-productive nodes must reach this age before decommission.
pub const READY_NODE_MIN_AGE_MINS: i64 = 30;

pub fn system_reserved_ram(total_ram_mb: u64, reserve_percent: f64) -> u64 {
	let reserved = (total_ram_mb as f64 * reserve_percent) as u64;
	reserved.clamp(SYSTEM_RESERVE_FLOOR_MB, total_ram_mb / 2)
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
	Local,
	Dedicated,
	Cloud,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeLifecycle {
	Provisioning,
	Initializing,
	Ready,
	Active,
	Idle,
	Draining,
	Decommissioned,
	Unhealthy,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
	Healthy,
	Unhealthy,
	Unknown,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct LifecycleError {
	pub from: NodeLifecycle,
	pub to: NodeLifecycle,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecommissionDenied {
	#[error("node is still {0}")]
	StillProvisioning(NodeLifecycle),

	#[error("node is not empty ({containers} containers, {allocated_ram_mb} MB allocated)")]
	NotEmpty { containers: u32, allocated_ram_mb: u64 },

	#[error("ready node is only {age_mins} min old (minimum {READY_NODE_MIN_AGE_MINS} min)")]
	ReadyNodeTooYoung { age_mins: i64 },

	#[error("node is {0} but has never hosted a container")]
	InvalidProductiveState(NodeLifecycle),

	#[error("node is already decommissioned")]
	AlreadyDecommissioned,
}

/// A worker or system host in the fleet. Capacity accounting lives on the
/// node; compound mutation goes through the node registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
	pub id: String,
	pub kind: NodeKind,
	pub is_system: bool,
	pub hostname: String,
	pub ip: String,
	pub ssh_user: String,
	pub ssh_key_path: String,

	pub total_ram_mb: u64,
	pub total_cpu_cores: u32,
	pub cpu_usage_percent: f64,
	pub allocated_ram_mb: u64,
	pub container_count: u32,
	pub system_reserved_ram_mb: u64,

	pub lifecycle: NodeLifecycle,
	pub status: HealthStatus,

	pub created_at: Option<DateTime<Utc>>,
	pub provisioned_at: Option<DateTime<Utc>>,
	pub initialized_at: Option<DateTime<Utc>>,
	pub first_container_at: Option<DateTime<Utc>>,
	pub last_container_at: Option<DateTime<Utc>>,
	pub last_container_added: Option<DateTime<Utc>>,
	pub last_container_removed: Option<DateTime<Utc>>,
	pub recovered_at: Option<DateTime<Utc>>,
	pub recovery_grace_secs: Option<u64>,
	pub sync_completed_at: Option<DateTime<Utc>>,
	pub last_health_check: Option<DateTime<Utc>>,
	pub total_containers_ever: u64,

	pub labels: HashMap<String, String>,
	pub hourly_cost_eur: f64,
	pub cloud_provider_id: Option<String>,
}

impl Node {
	pub fn new(id: impl Into<String>, kind: NodeKind, total_ram_mb: u64, reserve_percent: f64) -> Self {
		Self {
			id: id.into(),
			kind,
			is_system: false,
			hostname: String::new(),
			ip: String::new(),
			ssh_user: String::new(),
			ssh_key_path: String::new(),
			total_ram_mb,
			total_cpu_cores: 0,
			cpu_usage_percent: 0.0,
			allocated_ram_mb: 0,
			container_count: 0,
			system_reserved_ram_mb: system_reserved_ram(total_ram_mb, reserve_percent),
			lifecycle: NodeLifecycle::Ready,
			status: HealthStatus::Unknown,
			created_at: None,
			provisioned_at: None,
			initialized_at: None,
			first_container_at: None,
			last_container_at: None,
			last_container_added: None,
			last_container_removed: None,
			recovered_at: None,
			recovery_grace_secs: None,
			sync_completed_at: None,
			last_health_check: None,
			total_containers_ever: 0,
			labels: HashMap::new(),
			hourly_cost_eur: 0.0,
			cloud_provider_id: None,
		}
	}

	pub fn is_worker(&self) -> bool {
		!self.is_system
	}

	/// Bookings are charged against total RAM at face value.
	pub fn usable_ram_mb(&self) -> u64 {
		self.total_ram_mb
	}

	pub fn available_ram_mb(&self) -> u64 {
		self.total_ram_mb.saturating_sub(self.allocated_ram_mb)
	}

	pub fn reduction_factor(&self) -> f64 {
		if self.total_ram_mb == 0 {
			return 0.0;
		}
		(self.total_ram_mb - self.system_reserved_ram_mb) as f64 / self.total_ram_mb as f64
	}

	/// The cgroup-level limit a booking actually launches with. Keeps the sum
	/// of actual sizes within total - reserved even when bookings fill total.
	pub fn actual_ram_mb(&self, booked_mb: u64) -> u64 {
		((booked_mb as f64 * self.reduction_factor()) as u64).max(ACTUAL_RAM_FLOOR_MB)
	}

	pub fn can_transition_to(&self, to: NodeLifecycle) -> bool {
		use NodeLifecycle::*;

		matches!(
			(self.lifecycle, to),
			(Provisioning, Initializing | Unhealthy | Decommissioned)
				| (Initializing, Ready | Unhealthy | Decommissioned)
				| (Ready, Active | Idle | Draining | Unhealthy | Decommissioned)
				| (Active, Idle | Unhealthy | Draining)
				| (Idle, Active | Draining | Unhealthy | Decommissioned)
				| (Draining, Decommissioned | Unhealthy)
				| (Unhealthy, Decommissioned | Ready)
		)
	}

	pub fn transition(&mut self, to: NodeLifecycle) -> Result<(), LifecycleError> {
		if !self.can_transition_to(to) {
			return Err(LifecycleError {
				from: self.lifecycle,
				to,
			});
		}
		self.lifecycle = to;
		Ok(())
	}

	/// State-aware decommission gate. Callers check emptiness and node kind on
	/// top of this; the rules here are purely about lifecycle consistency.
	pub fn can_be_decommissioned(&self, now: DateTime<Utc>) -> Result<(), DecommissionDenied> {
		use NodeLifecycle::*;

		match self.lifecycle {
			Provisioning | Initializing => {
				return Err(DecommissionDenied::StillProvisioning(self.lifecycle));
			}
			Decommissioned => return Err(DecommissionDenied::AlreadyDecommissioned),
			_ => {}
		}

		if self.container_count > 0 || self.allocated_ram_mb > 0 {
			return Err(DecommissionDenied::NotEmpty {
				containers: self.container_count,
				allocated_ram_mb: self.allocated_ram_mb,
			});
		}

		match self.lifecycle {
			// Never hosted anything: give the scheduler time to use it first.
			Ready => {
				let since = self.initialized_at.or(self.created_at).unwrap_or(now);
				let age = now - since;
				if age < Duration::minutes(READY_NODE_MIN_AGE_MINS) {
					return Err(DecommissionDenied::ReadyNodeTooYoung {
						age_mins: age.num_minutes(),
					});
				}
			}
			Active | Idle => {
				if self.total_containers_ever == 0 {
					return Err(DecommissionDenied::InvalidProductiveState(self.lifecycle));
				}
			}
			// Empty draining nodes and unhealthy nodes may always go.
			Draining | Unhealthy => {}
			Provisioning | Initializing | Decommissioned => unreachable!(),
		}

		Ok(())
	}
}
