use serde::{Deserialize, Serialize};

/// Known cloud server types with the capacity we book against before the
/// provider tells us the real numbers. Estimates only matter for the
/// placeholder node a provisioning cycle registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTypeSpec {
	pub name: String,
	pub ram_mb: u64,
	pub cores: u32,
	pub hourly_cost_eur: f64,
}

pub fn server_types() -> Vec<ServerTypeSpec> {
	[
		("cx22", 4096, 2, 0.0074),
		("cx32", 8192, 4, 0.0127),
		("cx42", 16384, 8, 0.0304),
		("cx52", 32768, 16, 0.0611),
		("cpx31", 8192, 4, 0.0252),
		("cpx41", 16384, 8, 0.0464),
	]
	.into_iter()
	.map(|(name, ram_mb, cores, hourly_cost_eur)| ServerTypeSpec {
		name: name.to_string(),
		ram_mb,
		cores,
		hourly_cost_eur,
	})
	.collect()
}

/// Estimated RAM for a server type, before the cloud API has described it.
pub fn estimated_ram_mb(server_type: &str) -> u64 {
	server_types()
		.iter()
		.find(|t| t.name == server_type)
		.map(|t| t.ram_mb)
		.unwrap_or(8192)
}

/// Plan tier a booking falls into, derived from booked RAM. Tier boundaries
/// drive migration eligibility during consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerTier {
	Micro,
	Small,
	Medium,
	Large,
	Xlarge,
	Custom,
}

impl ServerTier {
	pub fn from_ram_mb(ram_mb: u64) -> Self {
		match ram_mb {
			0..=1024 => ServerTier::Micro,
			1025..=2048 => ServerTier::Small,
			2049..=4096 => ServerTier::Medium,
			4097..=8192 => ServerTier::Large,
			8193..=16384 => ServerTier::Xlarge,
			_ => ServerTier::Custom,
		}
	}

	/// Nominal RAM used by the perfect-packing formula. A booking is
	/// "standard" when it matches its tier's nominal size exactly.
	pub fn nominal_ram_mb(self) -> Option<u64> {
		match self {
			ServerTier::Micro => Some(1024),
			ServerTier::Small => Some(2048),
			ServerTier::Medium => Some(4096),
			ServerTier::Large => Some(8192),
			ServerTier::Xlarge => Some(16384),
			ServerTier::Custom => None,
		}
	}
}
