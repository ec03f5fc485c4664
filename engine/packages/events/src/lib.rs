use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event kind names. These strings are consumed by the dashboard push
/// channel and the event log; treat them as a wire contract.
pub mod kind {
	pub const NODE_CREATED: &str = "node.created";
	pub const NODE_ADDED: &str = "node.added";
	pub const NODE_REMOVED: &str = "node.removed";
	pub const NODE_STATS: &str = "node.stats";

	pub const CONTAINER_CREATED: &str = "container.created";
	pub const CONTAINER_STATUS_CHANGED: &str = "container.status_changed";
	pub const CONTAINER_REMOVED: &str = "container.removed";

	pub const MIGRATION_STARTED: &str = "operation.migration.started";
	pub const MIGRATION_PROGRESS: &str = "operation.migration.progress";
	pub const MIGRATION_COMPLETED: &str = "operation.migration.completed";
	pub const MIGRATION_FAILED: &str = "operation.migration.failed";

	pub const SCALING_DECISION: &str = "scaling.decision";
	pub const SCALING_ACTION: &str = "scaling.action";

	pub const CONSOLIDATION_STARTED: &str = "operation.consolidation.started";
	pub const CONSOLIDATION_COMPLETED: &str = "operation.consolidation.completed";

	pub const QUEUE_UPDATED: &str = "queue.updated";
	pub const QUEUE_SERVER_ADDED: &str = "queue.server_added";
	pub const QUEUE_SERVER_REMOVED: &str = "queue.server_removed";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	pub kind: String,
	pub data: serde_json::Value,
	pub at: DateTime<Utc>,
}

/// Sink for lifecycle and decision events. Emission is best-effort: an
/// implementation must swallow its own failures and never block the caller
/// beyond the cost of a channel send.
#[async_trait]
pub trait EventPublisher: Send + Sync {
	async fn publish(&self, kind: &str, data: serde_json::Value);
}

#[derive(Debug, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
	async fn publish(&self, _kind: &str, _data: serde_json::Value) {}
}

/// Logs every event at debug. Used when no dashboard channel is wired.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
	async fn publish(&self, kind: &str, data: serde_json::Value) {
		tracing::debug!(%kind, %data, "event");
	}
}

/// In-process broadcast bus. Subscribers that fall behind lose events,
/// which is the contract: dropped events must never block the core.
pub struct EventBus {
	tx: broadcast::Sender<Event>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.tx.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1024)
	}
}

#[async_trait]
impl EventPublisher for EventBus {
	async fn publish(&self, kind: &str, data: serde_json::Value) {
		let event = Event {
			kind: kind.to_string(),
			data,
			at: Utc::now(),
		};
		// No subscribers is fine; send only fails when nobody listens.
		let _ = self.tx.send(event);
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn bus_delivers_to_subscribers() {
		let bus = EventBus::new(8);
		let mut rx = bus.subscribe();

		bus.publish(kind::NODE_CREATED, json!({"node_id": "n1"}))
			.await;

		let event = rx.recv().await.unwrap();
		assert_eq!(event.kind, kind::NODE_CREATED);
		assert_eq!(event.data["node_id"], "n1");
	}

	#[tokio::test]
	async fn publish_without_subscribers_does_not_fail() {
		let bus = EventBus::new(8);
		bus.publish(kind::QUEUE_UPDATED, json!({"size": 0})).await;
	}
}
