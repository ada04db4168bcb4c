//! Remote shell over the system `ssh` binary
//!
//! Every call carries a hard time limit; the child is killed when the limit
//! expires. `ssh` reserves exit status 255 for its own failures
//! (unreachable host, auth refused), which is reported as a transport error
//! rather than as the remote command's exit code.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::client::CommandOutput;
use crate::config::SshCredentials;
use crate::error::ProviderError;
use crate::Result;

const SSH_TRANSPORT_EXIT: i32 = 255;

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Quote a remote path, keeping a leading `~/` expandable.
pub fn remote_path_expr(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None if path == "~" => "\"$HOME\"".to_string(),
        None => shell_quote(path),
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    let dir = &path[..idx];
    if dir.is_empty() || dir == "~" {
        None
    } else {
        Some(dir)
    }
}

/// A remote shell bound to one host.
#[derive(Debug, Clone)]
pub struct SshShell {
    host: String,
    credentials: SshCredentials,
}

impl SshShell {
    pub fn new(host: impl Into<String>, credentials: SshCredentials) -> Self {
        Self {
            host: host.into(),
            credentials,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn base_command(&self) -> Command {
        let creds = &self.credentials;
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&creds.key_path)
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                creds.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(creds.port.to_string())
            .arg(format!("{}@{}", creds.user, self.host))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `command` remotely.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut cmd = self.base_command();
        cmd.arg(command).stdin(Stdio::null());
        debug!(host = %self.host, "ssh exec");
        let child = cmd.spawn().map_err(|e| self.transport(e.to_string()))?;
        self.finish(child.wait_with_output()).await
    }

    /// Stream `bytes` into `remote_path`, creating parent directories.
    pub async fn upload(&self, bytes: &[u8], remote_path: &str) -> Result<CommandOutput> {
        let target = remote_path_expr(remote_path);
        let script = match parent_dir(remote_path) {
            Some(dir) => format!("mkdir -p {} && cat > {}", remote_path_expr(dir), target),
            None => format!("cat > {}", target),
        };

        let mut cmd = self.base_command();
        cmd.arg(script).stdin(Stdio::piped());
        debug!(host = %self.host, remote_path, bytes = bytes.len(), "ssh upload");
        let mut child = cmd.spawn().map_err(|e| self.transport(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = tokio::time::timeout(self.credentials.command_timeout, async {
                stdin.write_all(bytes).await?;
                stdin.shutdown().await
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(host = %self.host, error = %e, "upload stream closed early"),
                Err(_) => return Err(self.timeout()),
            }
        }

        self.finish(child.wait_with_output()).await
    }

    async fn finish(
        &self,
        wait: impl std::future::Future<Output = std::io::Result<std::process::Output>>,
    ) -> Result<CommandOutput> {
        let started = Instant::now();
        let output = tokio::time::timeout(self.credentials.command_timeout, wait)
            .await
            .map_err(|_| self.timeout())?
            .map_err(|e| self.transport(e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if exit_code == SSH_TRANSPORT_EXIT {
            return Err(self.transport(stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            duration_ms: elapsed_ms(started),
        })
    }

    fn transport(&self, reason: String) -> ProviderError {
        ProviderError::Transport {
            host: self.host.clone(),
            reason,
        }
    }

    fn timeout(&self) -> ProviderError {
        ProviderError::Timeout {
            host: self.host.clone(),
            limit_secs: self.credentials.command_timeout.as_secs(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
