mod container;
mod node;
mod queue;
mod server_type;
mod stats;

pub use container::{ContainerInfo, ContainerStatus};
pub use node::{
	DecommissionDenied, HealthStatus, LifecycleError, Node, NodeKind, NodeLifecycle,
	system_reserved_ram,
};
pub use queue::QueuedServer;
pub use server_type::{ServerTier, ServerTypeSpec, estimated_ram_mb, server_types};
pub use stats::FleetStats;
