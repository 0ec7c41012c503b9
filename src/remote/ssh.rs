use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{Result, RunError};
use crate::remote::{CommandOutput, RemoteSession};
use crate::script::shell_quote;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Session over OpenSSH with a multiplexed master connection.
///
/// Every `ssh` and `rsync` invocation shares one control socket, so the
/// handshake happens once per group.
#[derive(Debug)]
pub struct SshSession {
    connection: ConnectionConfig,
    control_path: PathBuf,
}

impl SshSession {
    /// Build the session and, when `auto_connect` is set, establish the
    /// master connection with up to `max_attempts` tries.
    pub async fn connect(connection: ConnectionConfig) -> Result<Self> {
        let control_path = std::env::temp_dir().join(format!("batchrun-{}.sock", Uuid::new_v4()));
        let session = Self {
            connection,
            control_path,
        };
        if session.connection.auto_connect {
            session.establish().await?;
        }
        Ok(session)
    }

    async fn establish(&self) -> Result<()> {
        let attempts = self.connection.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let output = Command::new("ssh")
                .args(self.ssh_options())
                .arg(self.connection.destination())
                .arg("true")
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    tracing::info!(host = %self.connection.host, attempt, "Connected");
                    return Ok(());
                }
                Ok(out) => last_error = String::from_utf8_lossy(&out.stderr).trim().to_string(),
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(
                host = %self.connection.host,
                attempt,
                attempts,
                error = %last_error,
                "Connection attempt failed"
            );
            if attempt < attempts {
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
        }
        Err(RunError::connection(&self.connection.host, last_error))
    }

    /// Options shared by `ssh` and the `rsync -e` remote shell.
    fn ssh_options(&self) -> Vec<String> {
        let c = &self.connection;
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
        ];
        if let Some(port) = c.port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }
        if let Some(identity) = &c.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        if let Some(config) = &c.config_file {
            opts.push("-F".to_string());
            opts.push(config.display().to_string());
        }
        if let Some(timeout) = c.connect_timeout_secs {
            opts.push("-o".to_string());
            opts.push(format!("ConnectTimeout={timeout}"));
        }
        opts
    }

    fn remote_shell(&self) -> String {
        let mut words = vec!["ssh".to_string()];
        words.extend(self.ssh_options().iter().map(|o| shell_quote(o)));
        words.join(" ")
    }

    fn remote_spec(&self, path: &Path) -> String {
        format!("{}:{}", self.connection.destination(), path.display())
    }

    async fn rsync(&self, sources: Vec<String>, dest: String, ignore_missing: bool) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.arg("-az");
        if ignore_missing {
            cmd.arg("--ignore-missing-args");
        }
        let output = cmd
            .arg("-e")
            .arg(self.remote_shell())
            .args(&sources)
            .arg(&dest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunError::Transfer(format!("rsync: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RunError::Transfer(format!(
                "rsync to {dest} failed ({:?}): {stderr}",
                output.status.code()
            )));
        }
        tracing::debug!(files = sources.len(), dest = %dest, "rsync finished");
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.connection.host
    }

    async fn execute(&self, command: &str, cwd: Option<&Path>) -> Result<CommandOutput> {
        let remote_command = match cwd {
            Some(dir) => format!("cd {} && {command}", shell_quote(&dir.to_string_lossy())),
            None => command.to_string(),
        };
        tracing::debug!(host = %self.connection.host, command = %remote_command, "Executing remote command");
        let output = Command::new("ssh")
            .args(self.ssh_options())
            .arg(self.connection.destination())
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunError::connection(&self.connection.host, e.to_string()))?;
        // ssh reserves 255 for its own failures
        if output.status.code() == Some(255) {
            return Err(RunError::connection(
                &self.connection.host,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(CommandOutput::from_process(output))
    }

    async fn upload(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        let mkdir = format!("mkdir -p {}", shell_quote(&dest_dir.to_string_lossy()));
        let out = self.execute(&mkdir, None).await?;
        if !out.success() {
            return Err(RunError::Transfer(format!(
                "cannot create {} on {}: {}",
                dest_dir.display(),
                self.connection.host,
                out.stderr.trim()
            )));
        }
        let sources = sources.iter().map(|p| p.display().to_string()).collect();
        self.rsync(sources, format!("{}/", self.remote_spec(dest_dir)), false)
            .await
    }

    async fn download(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let sources = sources.iter().map(|p| self.remote_spec(p)).collect();
        self.rsync(sources, format!("{}/", dest_dir.display()), true)
            .await
    }

    async fn download_dir(&self, dir: &Path, dest_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest_dir).await?;
        self.rsync(
            vec![format!("{}/", self.remote_spec(dir))],
            format!("{}/", dest_dir.display()),
            false,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        let result = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(self.connection.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::debug!(host = %self.connection.host, error = %e, "Closing control master failed");
        }
        Ok(())
    }
}
