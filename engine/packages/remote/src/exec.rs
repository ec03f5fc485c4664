use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
	#[error("command timed out after {0:?}")]
	Timeout(Duration),

	#[error("command exited with status {code}: {stderr}")]
	CommandFailed { code: i32, stderr: String },

	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),
}

/// Where a remote command runs and how to authenticate.
#[derive(Debug, Clone)]
pub struct ExecTarget {
	pub host: String,
	pub user: String,
	pub key_path: String,
}

/// Command execution on a worker node over an authenticated shell.
#[async_trait]
pub trait RemoteExec: Send + Sync {
	async fn exec(
		&self,
		target: &ExecTarget,
		command: &str,
		timeout: Duration,
	) -> Result<String, RemoteError>;
}

/// Shells out to the system `ssh` with the configured key. Host keys of
/// freshly provisioned VMs are accepted on first contact.
#[derive(Debug, Default)]
pub struct SshExec;

#[async_trait]
impl RemoteExec for SshExec {
	async fn exec(
		&self,
		target: &ExecTarget,
		command: &str,
		timeout: Duration,
	) -> Result<String, RemoteError> {
		let mut cmd = Command::new("ssh");
		cmd.arg("-i")
			.arg(&target.key_path)
			.arg("-o")
			.arg("BatchMode=yes")
			.arg("-o")
			.arg("StrictHostKeyChecking=accept-new")
			.arg("-o")
			.arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
			.arg(format!("{}@{}", target.user, target.host))
			.arg(command)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let output = tokio::time::timeout(timeout, cmd.output())
			.await
			.map_err(|_| RemoteError::Timeout(timeout))??;

		if !output.status.success() {
			return Err(RemoteError::CommandFailed {
				code: output.status.code().unwrap_or(-1),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}

		Ok(String::from_utf8_lossy(&output.stdout).to_string())
	}
}
