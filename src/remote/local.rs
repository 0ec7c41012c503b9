use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::LOCALHOST;
use crate::error::{Result, RunError};
use crate::remote::{CommandOutput, RemoteSession};

/// Session on this machine. Transfers are plain file copies.
#[derive(Debug, Clone, Default)]
pub struct LocalSession;

impl LocalSession {
    pub fn new() -> Self {
        Self
    }
}

async fn copy_into(source: &Path, dest_dir: &Path) -> Result<()> {
    let Some(name) = source.file_name() else {
        return Err(RunError::Transfer(format!(
            "cannot copy {}: no file name",
            source.display()
        )));
    };
    let target = dest_dir.join(name);
    if target == source {
        return Ok(());
    }
    tokio::fs::create_dir_all(dest_dir).await?;
    tokio::fs::copy(source, &target).await.map_err(|e| {
        RunError::Transfer(format!(
            "copy {} -> {}: {e}",
            source.display(),
            target.display()
        ))
    })?;
    Ok(())
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn host(&self) -> &str {
        LOCALHOST
    }

    async fn execute(&self, command: &str, cwd: Option<&Path>) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!(command, "Executing local command");
        let output = cmd.output().await?;
        Ok(CommandOutput::from_process(output))
    }

    async fn upload(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()> {
        for source in sources {
            copy_into(source, dest_dir).await?;
        }
        Ok(())
    }

    async fn download(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()> {
        for source in sources {
            if tokio::fs::try_exists(source).await.unwrap_or(false) {
                copy_into(source, dest_dir).await?;
            } else {
                tracing::warn!(file = %source.display(), "Output file missing, skipping");
            }
        }
        Ok(())
    }

    async fn download_dir(&self, dir: &Path, dest_dir: &Path) -> Result<()> {
        if dir == dest_dir {
            return Ok(());
        }
        let mut pending = vec![(dir.to_path_buf(), dest_dir.to_path_buf())];
        while let Some((src, dst)) = pending.pop() {
            tokio::fs::create_dir_all(&dst).await?;
            let mut entries = tokio::fs::read_dir(&src).await.map_err(|e| {
                RunError::Transfer(format!("read {}: {e}", src.display()))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let target = dst.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    pending.push((path, target));
                } else {
                    tokio::fs::copy(&path, &target).await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
