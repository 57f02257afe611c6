use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use tracing::{info, warn};

use super::{command, exe_name, find_in_path, ToolchainConfig};
use crate::{
    error::{Result, SeparationError, ToolchainFailure},
    io::net::{download_with_progress, http_client},
};

/// Static amd64 build used when nothing is installed on the host.
pub const LINUX_AMD64_STATIC_BUILD: &str =
    "https://johnvansickle.com/ffmpeg/releases/ffmpeg-release-amd64-static.tar.xz";

/// Obtains a decoder/prober pair that was not already on the host.
pub trait Provisioner: Send + Sync {
    /// Returns `(decoder, prober)` paths. The resolver verifies them afterwards.
    fn provision(&self, config: &ToolchainConfig, install_dir: &Path) -> Result<(PathBuf, PathBuf)>;
}

impl<P: Provisioner + ?Sized> Provisioner for Arc<P> {
    fn provision(&self, config: &ToolchainConfig, install_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        (**self).provision(config, install_dir)
    }
}

/// Static-build download first, then host package managers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProvisioner;

impl Provisioner for DefaultProvisioner {
    fn provision(&self, config: &ToolchainConfig, install_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let mut failures = Vec::new();

        if let Some(url) = &config.static_build_url {
            match install_static_build(url, install_dir, config) {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(error = %e, "static build install failed");
                    failures.push(format!("static build: {e}"));
                }
            }
        }

        if config.allow_package_manager {
            match install_with_package_manager(config) {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(error = %e, "package manager install failed");
                    failures.push(format!("package manager: {e}"));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no provisioning method enabled".into());
        }
        Err(SeparationError::toolchain(
            ToolchainFailure::NotFound,
            failures.join("; "),
        ))
    }
}

fn binaries_in(dir: &Path, config: &ToolchainConfig) -> Option<(PathBuf, PathBuf)> {
    let decoder = dir.join(exe_name(&config.decoder));
    let prober = dir.join(exe_name(&config.prober));
    (decoder.is_file() && prober.is_file()).then_some((decoder, prober))
}

fn install_static_build(
    url: &str,
    install_dir: &Path,
    config: &ToolchainConfig,
) -> Result<(PathBuf, PathBuf)> {
    if let Some(found) = binaries_in(install_dir, config) {
        info!(dir = %install_dir.display(), "static build already extracted");
        return Ok(found);
    }

    fs::create_dir_all(install_dir)?;
    let archive = install_dir.join("ffmpeg.tar.xz");
    info!(url, dir = %install_dir.display(), "downloading static toolchain build");
    let client = http_client()?;
    download_with_progress(&client, url, &archive)?;

    let status = command(Path::new("tar"))
        .arg("-xf")
        .arg(&archive)
        .arg("-C")
        .arg(install_dir)
        .arg("--strip-components=1")
        .stdin(Stdio::null())
        .status();
    fs::remove_file(&archive).ok();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            return Err(SeparationError::toolchain(
                ToolchainFailure::NotFound,
                format!("tar exited with {s} while extracting {url}"),
            ))
        }
        Err(e) => {
            return Err(SeparationError::toolchain(
                ToolchainFailure::NotFound,
                format!("could not run tar: {e}"),
            ))
        }
    }

    binaries_in(install_dir, config).ok_or_else(|| {
        SeparationError::toolchain(
            ToolchainFailure::NotFound,
            format!(
                "archive from {url} did not contain {} and {}",
                config.decoder, config.prober
            ),
        )
    })
}

const CONDA_ARGS: &[&str] = &["install", "-c", "conda-forge", "ffmpeg", "-y"];
const APT_ARGS: &[&str] = &["install", "-y", "ffmpeg"];
const DNF_ARGS: &[&str] = &["install", "-y", "ffmpeg"];
const BREW_ARGS: &[&str] = &["install", "ffmpeg"];

fn package_managers() -> Vec<(&'static str, &'static [&'static str])> {
    let mut managers = Vec::new();
    if env::var_os("CONDA_PREFIX").is_some() {
        managers.push(("conda", CONDA_ARGS));
    }
    managers.push(("apt-get", APT_ARGS));
    managers.push(("dnf", DNF_ARGS));
    managers.push(("brew", BREW_ARGS));
    managers
}

fn install_with_package_manager(config: &ToolchainConfig) -> Result<(PathBuf, PathBuf)> {
    let path_var = config.search_path_var();
    let mut tried = Vec::new();

    for (manager, args) in package_managers() {
        let Some(program) = find_in_path(manager, &path_var) else {
            continue;
        };
        tried.push(manager);
        info!(manager, "installing toolchain with package manager");
        let ok = command(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !ok {
            warn!(manager, "package manager install did not succeed");
            continue;
        }

        if let (Some(d), Some(p)) = (
            find_in_path(&config.decoder, &path_var),
            find_in_path(&config.prober, &path_var),
        ) {
            return Ok((d, p));
        }
        if let Some(prefix) = env::var_os("CONDA_PREFIX") {
            let bin = PathBuf::from(prefix).join(if cfg!(windows) { "Library/bin" } else { "bin" });
            if let Some(found) = binaries_in(&bin, config) {
                return Ok(found);
            }
        }
    }

    let detail = if tried.is_empty() {
        "no supported package manager on PATH".to_string()
    } else {
        format!("tried {}", tried.join(", "))
    };
    Err(SeparationError::toolchain(ToolchainFailure::NotFound, detail))
}
