use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::LOCALHOST;

/// Placeholder replaced by the backend job id once it is known.
pub const JOB_ID_PLACEHOLDER: &str = "{job_id}";

/// A file location paired with the host it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub host: String,
}

impl ResolvedFile {
    pub fn new(path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: host.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::new(path, LOCALHOST)
    }

    pub fn is_local(&self) -> bool {
        self.host == LOCALHOST
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }

    pub fn parent(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn has_job_id_placeholder(&self) -> bool {
        self.path.to_string_lossy().contains(JOB_ID_PLACEHOLDER)
    }

    /// Replace `{job_id}` in the path.
    pub fn bind_job_id(&mut self, job_id: u64) {
        if self.has_job_id_placeholder() {
            let rebound = self
                .path
                .to_string_lossy()
                .replace(JOB_ID_PLACEHOLDER, &job_id.to_string());
            self.path = PathBuf::from(rebound);
        }
    }

    /// Same file name, relocated into `folder` on this host.
    pub fn relocated(&self, folder: &Path) -> Self {
        let name = self.path.file_name().map(PathBuf::from).unwrap_or_default();
        ResolvedFile::local(folder.join(name))
    }
}

/// Result of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub output_file: Option<ResolvedFile>,
    #[serde(default)]
    pub stdout: Option<ResolvedFile>,
    #[serde(default)]
    pub stderr: Option<ResolvedFile>,
    /// Directory the task executes in
    #[serde(default)]
    pub output_folder: Option<ResolvedFile>,
    /// Local directory results are copied back to
    #[serde(default)]
    pub local_folder: Option<PathBuf>,
    #[serde(default)]
    pub files_to_parse: Vec<ResolvedFile>,
    #[serde(default)]
    pub returncode: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Output {
    pub fn is_success(&self) -> bool {
        self.returncode == Some(0) && self.error.is_none()
    }

    /// Output, stdout, stderr and parse files that are declared.
    pub fn declared_files(&self) -> impl Iterator<Item = &ResolvedFile> {
        self.output_file
            .iter()
            .chain(self.stdout.iter())
            .chain(self.stderr.iter())
            .chain(self.files_to_parse.iter())
    }

    pub fn declared_files_mut(&mut self) -> impl Iterator<Item = &mut ResolvedFile> {
        self.output_file
            .iter_mut()
            .chain(self.stdout.iter_mut())
            .chain(self.stderr.iter_mut())
            .chain(self.files_to_parse.iter_mut())
    }

    pub fn bind_job_id(&mut self, job_id: u64) {
        for file in self.declared_files_mut() {
            file.bind_job_id(job_id);
        }
        if let Some(folder) = self.output_folder.as_mut() {
            folder.bind_job_id(job_id);
        }
    }

    /// Point every declared file at `folder` on the local host.
    pub fn relocate_to(&mut self, folder: &Path) {
        for file in self.declared_files_mut() {
            *file = file.relocated(folder);
        }
        self.output_folder = Some(ResolvedFile::local(folder));
        self.local_folder = Some(folder.to_path_buf());
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_job_id_in_paths() {
        let mut out = Output {
            stdout: Some(ResolvedFile::new("/scratch/{job_id}/run.out", "hpc")),
            output_folder: Some(ResolvedFile::new("/scratch/{job_id}", "hpc")),
            ..Default::default()
        };
        out.bind_job_id(812);
        assert_eq!(out.stdout.unwrap().path, PathBuf::from("/scratch/812/run.out"));
        assert_eq!(
            out.output_folder.unwrap().path,
            PathBuf::from("/scratch/812")
        );
    }

    #[test]
    fn relocate_keeps_file_names() {
        let mut out = Output {
            output_file: Some(ResolvedFile::new("/remote/w/mol.log", "hpc")),
            stderr: Some(ResolvedFile::new("/remote/w/job.err", "hpc")),
            ..Default::default()
        };
        out.relocate_to(Path::new("/home/me/w"));
        let file = out.output_file.unwrap();
        assert!(file.is_local());
        assert_eq!(file.path, PathBuf::from("/home/me/w/mol.log"));
        assert_eq!(out.local_folder, Some(PathBuf::from("/home/me/w")));
    }

    #[test]
    fn success_requires_zero_returncode_and_no_error() {
        let mut out = Output {
            returncode: Some(0),
            ..Default::default()
        };
        assert!(out.is_success());
        out.set_error("cancelled");
        assert!(!out.is_success());
    }
}
