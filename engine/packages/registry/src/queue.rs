use std::{
	collections::VecDeque,
	sync::Mutex,
};

use conductor_types::QueuedServer;

/// FIFO of admission-blocked workloads. One identity queues at most once;
/// a duplicate enqueue is dropped with a log, not an error.
#[derive(Default)]
pub struct StartQueue {
	queue: Mutex<VecDeque<QueuedServer>>,
}

impl StartQueue {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the 1-based position after the enqueue. A duplicate keeps
	/// its existing position.
	pub fn enqueue(&self, server: QueuedServer) -> usize {
		let mut queue = self.queue.lock().unwrap();

		if let Some(pos) = queue.iter().position(|q| q.server_id == server.server_id) {
			tracing::debug!(
				server_id = %server.server_id,
				position = pos + 1,
				"server already queued, dropping duplicate"
			);
			return pos + 1;
		}

		queue.push_back(server);
		queue.len()
	}

	pub fn dequeue(&self) -> Option<QueuedServer> {
		self.queue.lock().unwrap().pop_front()
	}

	pub fn peek(&self) -> Option<QueuedServer> {
		self.queue.lock().unwrap().front().cloned()
	}

	pub fn remove(&self, server_id: &str) -> bool {
		let mut queue = self.queue.lock().unwrap();
		match queue.iter().position(|q| q.server_id == server_id) {
			Some(pos) => {
				queue.remove(pos);
				true
			}
			None => false,
		}
	}

	/// 1-based position, 0 when absent.
	pub fn position(&self, server_id: &str) -> usize {
		self.queue
			.lock()
			.unwrap()
			.iter()
			.position(|q| q.server_id == server_id)
			.map(|p| p + 1)
			.unwrap_or(0)
	}

	pub fn len(&self) -> usize {
		self.queue.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Defensive copy in FIFO order.
	pub fn all(&self) -> Vec<QueuedServer> {
		self.queue.lock().unwrap().iter().cloned().collect()
	}

	pub fn clear(&self) {
		self.queue.lock().unwrap().clear();
	}

	pub fn total_required_ram_mb(&self) -> u64 {
		self.queue
			.lock()
			.unwrap()
			.iter()
			.map(|q| q.required_ram_mb)
			.sum()
	}
}
