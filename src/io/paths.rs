use crate::error::{Result, SeparationError};
use directories::ProjectDirs;
use std::{env, path::PathBuf};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "Instrumental", "instrumental-core")
        .ok_or(SeparationError::CacheDirUnavailable)
}

pub fn models_cache_dir() -> Result<PathBuf> {
    let proj = project_dirs()?;
    let mut p = PathBuf::from(proj.cache_dir());
    p.push("models");
    Ok(p)
}

/// Root for persisted state (toolchain record, provisioned binaries).
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(home) = env::var("INSTRUMENTAL_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(PathBuf::from(project_dirs()?.data_dir()))
}

pub fn toolchain_record_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("toolchain.txt"))
}

pub fn toolchain_install_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("ffmpeg"))
}

/// Parent directory for per-job temp dirs.
pub fn tmp_dir() -> PathBuf {
    env::var("INSTRUMENTAL_TMP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir())
}
