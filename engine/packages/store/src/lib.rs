mod jsonl;
mod memory;
mod snapshot;
mod traits;

pub use jsonl::JsonlAuditLog;
pub use memory::{MemoryAuditLog, MemoryContainerStore, MemoryMetricsStore, MemoryNodeStore};
pub use snapshot::{
	PersistedContainerState, PersistedNodeState, load_container_snapshot, load_node_snapshot,
	load_queue_snapshot, write_container_snapshot, write_node_snapshot, write_queue_snapshot,
};
pub use traits::{AuditEntry, AuditLog, ContainerStore, MetricsStore, NodeStore};
