use std::{io::Write, path::PathBuf};

use async_trait::async_trait;

use crate::traits::{AuditEntry, AuditLog};

/// Append-only audit log as one JSON object per line.
pub struct JsonlAuditLog {
	path: PathBuf,
}

impl JsonlAuditLog {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
	async fn append(&self, entry: AuditEntry) -> anyhow::Result<()> {
		if let Some(parent) = self.path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let mut file = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)?;
		serde_json::to_writer(&mut file, &entry)?;
		writeln!(file)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn appends_one_line_per_entry() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.jsonl");
		let log = JsonlAuditLog::new(&path);

		log.append(AuditEntry::new(
			"node.decommission",
			"cloud-a1",
			"idle",
			"test",
			json!({}),
		))
		.await
		.unwrap();
		log.append(AuditEntry::new("recovery.lost", "srv-1", "gone", "test", json!({})))
			.await
			.unwrap();

		let raw = std::fs::read_to_string(&path).unwrap();
		let lines = raw.lines().collect::<Vec<_>>();
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("node.decommission"));
		assert!(lines[1].contains("recovery.lost"));
	}
}
