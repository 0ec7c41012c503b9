//! Sessions on execution hosts: command execution and file movement.

pub mod local;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::Result;

pub use local::LocalSession;
pub use ssh::SshSession;

/// Captured result of a command run through a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub(crate) fn from_process(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// An open session on one host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Host the session executes on
    fn host(&self) -> &str;

    /// Run a shell command, optionally inside `cwd`.
    async fn execute(&self, command: &str, cwd: Option<&Path>) -> Result<CommandOutput>;

    /// Copy local files into `dest_dir` on the session host.
    async fn upload(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()>;

    /// Copy files from the session host into the local `dest_dir`.
    async fn download(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<()>;

    /// Copy the contents of a directory on the session host into `dest_dir`.
    async fn download_dir(&self, dir: &Path, dest_dir: &Path) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Opens sessions from connection configuration.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, connection: Option<&ConnectionConfig>) -> Result<Arc<dyn RemoteSession>>;
}

/// Local hosts get a [`LocalSession`], everything else an [`SshSession`].
#[derive(Debug, Clone, Default)]
pub struct DefaultSessionFactory;

#[async_trait]
impl SessionFactory for DefaultSessionFactory {
    async fn open(&self, connection: Option<&ConnectionConfig>) -> Result<Arc<dyn RemoteSession>> {
        match connection {
            Some(c) if !c.is_local() => {
                c.validate()?;
                let session = SshSession::connect(c.clone()).await?;
                Ok(Arc::new(session))
            }
            _ => Ok(Arc::new(LocalSession::new())),
        }
    }
}
