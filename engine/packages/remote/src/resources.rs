use std::time::Duration;

use crate::exec::{ExecTarget, RemoteError, RemoteExec};

/// Free-memory and root-filesystem usage observed on a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeResources {
	pub free_ram_mb: u64,
	pub disk_used_percent: u8,
}

const FREE_RAM_CMD: &str = "free -m | awk '/^Mem:/ {print $7}'";
const DISK_USED_CMD: &str = "df -h / | awk 'NR==2 {gsub(\"%\",\"\"); print $5}'";

/// Runs the two canonical resource probes over the shell transport.
pub async fn probe_resources(
	exec: &dyn RemoteExec,
	target: &ExecTarget,
	timeout: Duration,
) -> Result<NodeResources, RemoteError> {
	let free_out = exec.exec(target, FREE_RAM_CMD, timeout).await?;
	let disk_out = exec.exec(target, DISK_USED_CMD, timeout).await?;

	Ok(NodeResources {
		free_ram_mb: parse_number(&free_out)?,
		disk_used_percent: parse_number::<u8>(&disk_out)?,
	})
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T, RemoteError> {
	raw.trim().parse::<T>().map_err(|_| RemoteError::CommandFailed {
		code: 0,
		stderr: format!("unparseable probe output: {raw:?}"),
	})
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use async_trait::async_trait;

	use super::*;

	struct ScriptedExec {
		outputs: Mutex<Vec<String>>,
	}

	#[async_trait]
	impl RemoteExec for ScriptedExec {
		async fn exec(
			&self,
			_target: &ExecTarget,
			_command: &str,
			_timeout: Duration,
		) -> Result<String, RemoteError> {
			Ok(self.outputs.lock().unwrap().remove(0))
		}
	}

	fn target() -> ExecTarget {
		ExecTarget {
			host: "10.0.0.5".into(),
			user: "root".into(),
			key_path: "/tmp/key".into(),
		}
	}

	#[tokio::test]
	async fn parses_free_and_disk_output() {
		let exec = ScriptedExec {
			outputs: Mutex::new(vec!["  6392\n".into(), "42\n".into()]),
		};

		let res = probe_resources(&exec, &target(), Duration::from_secs(5))
			.await
			.unwrap();
		assert_eq!(res.free_ram_mb, 6392);
		assert_eq!(res.disk_used_percent, 42);
	}

	#[tokio::test]
	async fn garbage_output_is_an_error() {
		let exec = ScriptedExec {
			outputs: Mutex::new(vec!["not-a-number".into(), "42".into()]),
		};

		assert!(probe_resources(&exec, &target(), Duration::from_secs(5))
			.await
			.is_err());
	}
}
