//! Per-run unit of work and its temporary resources.
//!
//! Every temp file a run creates lives inside the job's own directory, which
//! is removed when the [`JobContext`] is dropped, whatever path the run exits
//! through.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{
    error::{Result, Stage},
    io::paths,
    toolchain::ToolchainHandle,
};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    ToolchainReady,
    Ingested,
    Separated,
    Mixed,
    Packaged,
    Failed(Stage),
}

pub struct JobContext {
    id: u64,
    dir: Option<TempDir>,
    toolchain: Option<ToolchainHandle>,
    state: JobState,
}

impl JobContext {
    /// New job with a unique temp dir under the configured temp root.
    pub fn new() -> Result<Self> {
        Self::in_dir(&paths::tmp_dir())
    }

    pub fn in_dir(base: &Path) -> Result<Self> {
        fs::create_dir_all(base)?;
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let dir = tempfile::Builder::new()
            .prefix(&format!("instrumental-job-{id}-"))
            .tempdir_in(base)?;
        debug!(job = id, dir = %dir.path().display(), "job created");
        Ok(Self {
            id,
            dir: Some(dir),
            toolchain: None,
            state: JobState::Created,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dir(&self) -> &Path {
        match &self.dir {
            Some(d) => d.path(),
            None => Path::new(""),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn set_state(&mut self, state: JobState) {
        debug!(job = self.id, ?state, "job state");
        self.state = state;
    }

    pub fn attach_toolchain(&mut self, handle: ToolchainHandle) {
        self.toolchain = Some(handle);
        self.set_state(JobState::ToolchainReady);
    }

    pub fn toolchain(&self) -> Option<&ToolchainHandle> {
        self.toolchain.as_ref()
    }

    /// Path for a temp file inside this job's directory.
    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    pub fn write_temp(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.temp_path(name);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Remove the temp dir now and report any failure.
    pub fn finish(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            debug!(job = self.id, state = ?self.state, "job finished");
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(job = self.id, dir = %path.display(), error = %e, "temp cleanup failed");
            } else {
                debug!(job = self.id, state = ?self.state, "job cleaned up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_removes_temp_files() {
        let base = tempfile::tempdir().unwrap();
        let job = JobContext::in_dir(base.path()).unwrap();
        let p = job.write_temp("input.mp3", b"abc").unwrap();
        assert!(p.exists());
        let dir = job.dir().to_path_buf();
        drop(job);
        assert!(!dir.exists());
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn concurrent_jobs_get_distinct_dirs() {
        let base = tempfile::tempdir().unwrap();
        let a = JobContext::in_dir(base.path()).unwrap();
        let b = JobContext::in_dir(base.path()).unwrap();
        assert_ne!(a.dir(), b.dir());
        assert_ne!(a.id(), b.id());
        a.finish().unwrap();
        assert!(b.dir().exists());
    }

    #[test]
    fn default_job_lives_under_temp_root() {
        let job = JobContext::new().unwrap();
        let dir = job.dir().to_path_buf();
        assert!(dir.starts_with(paths::tmp_dir()));
        job.finish().unwrap();
        assert!(!dir.exists());
    }
}
