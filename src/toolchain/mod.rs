//! Locating, verifying and provisioning the decoder/prober executable pair.
//!
//! Resolution is a single ordered chain:
//!
//! 1. the persisted record (two absolute paths),
//! 2. the executable search path,
//! 3. provisioning, whose result is written back to the record.
//!
//! Every candidate answers a version query before a [`ToolchainHandle`] is
//! handed out, and a successful resolution is injected into the process
//! environment (see [`env`]).

pub mod env;
pub mod provision;
pub mod record;

use std::{
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SeparationError, ToolchainFailure},
    io::paths,
};

pub use provision::{DefaultProvisioner, Provisioner, LINUX_AMD64_STATIC_BUILD};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub decoder: String,
    pub prober: String,
    pub version_flag: String,
    /// Defaults to `<data dir>/toolchain.txt`.
    pub record_path: Option<PathBuf>,
    /// Defaults to `<data dir>/ffmpeg`.
    pub install_dir: Option<PathBuf>,
    pub static_build_url: Option<String>,
    pub allow_package_manager: bool,
    pub inject_env: bool,
    /// Search path to scan instead of the process `PATH`.
    #[serde(skip)]
    pub search_path: Option<OsString>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let static_build_url = cfg!(all(target_os = "linux", target_arch = "x86_64"))
            .then(|| LINUX_AMD64_STATIC_BUILD.to_string());
        Self {
            decoder: "ffmpeg".into(),
            prober: "ffprobe".into(),
            version_flag: "-version".into(),
            record_path: None,
            install_dir: None,
            static_build_url,
            allow_package_manager: true,
            inject_env: true,
            search_path: None,
        }
    }
}

impl ToolchainConfig {
    pub fn record_path(&self) -> Result<PathBuf> {
        match &self.record_path {
            Some(p) => Ok(p.clone()),
            None => paths::toolchain_record_path(),
        }
    }

    pub fn install_dir(&self) -> Result<PathBuf> {
        match &self.install_dir {
            Some(p) => Ok(p.clone()),
            None => paths::toolchain_install_dir(),
        }
    }

    pub(crate) fn search_path_var(&self) -> OsString {
        self.search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolchainSource {
    Record,
    SearchPath,
    Provisioned,
}

/// A decoder/prober pair that answered the version query.
#[derive(Clone, Debug)]
pub struct ToolchainHandle {
    decoder: PathBuf,
    prober: PathBuf,
    verified_at: SystemTime,
    source: ToolchainSource,
}

impl ToolchainHandle {
    /// Run the version query on both binaries and build a handle.
    pub fn verify(
        decoder: PathBuf,
        prober: PathBuf,
        version_flag: &str,
        source: ToolchainSource,
    ) -> Result<Self> {
        for exe in [&decoder, &prober] {
            match probe(exe, version_flag) {
                Probe::Ok => {}
                Probe::Missing => {
                    return Err(SeparationError::toolchain(
                        ToolchainFailure::NotFound,
                        format!("{} does not exist", exe.display()),
                    ))
                }
                Probe::Broken(detail) => {
                    return Err(SeparationError::toolchain(
                        ToolchainFailure::NotExecutable,
                        detail,
                    ))
                }
            }
        }
        Ok(Self {
            decoder,
            prober,
            verified_at: SystemTime::now(),
            source,
        })
    }

    /// Re-run the version query; a fresh handle on success.
    pub fn reverify(&self, version_flag: &str) -> Result<Self> {
        Self::verify(
            self.decoder.clone(),
            self.prober.clone(),
            version_flag,
            self.source,
        )
    }

    pub fn decoder(&self) -> &Path {
        &self.decoder
    }

    pub fn prober(&self) -> &Path {
        &self.prober
    }

    pub fn verified_at(&self) -> SystemTime {
        self.verified_at
    }

    pub fn source(&self) -> ToolchainSource {
        self.source
    }

    /// Directories holding the binaries, decoder first, without duplicates.
    pub fn dirs(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for exe in [&self.decoder, &self.prober] {
            if let Some(dir) = exe.parent() {
                if !dir.as_os_str().is_empty() && !out.iter().any(|d| d == dir) {
                    out.push(dir.to_path_buf());
                }
            }
        }
        out
    }

    pub fn same_paths(&self, other: &ToolchainHandle) -> bool {
        self.decoder == other.decoder && self.prober == other.prober
    }
}

enum Probe {
    Ok,
    Missing,
    Broken(String),
}

fn probe(exe: &Path, version_flag: &str) -> Probe {
    if !exe.is_file() {
        return Probe::Missing;
    }
    match command(exe)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(s) if s.success() => Probe::Ok,
        Ok(s) => Probe::Broken(format!(
            "{} {version_flag} exited with {s}",
            exe.display()
        )),
        Err(e) => Probe::Broken(format!("{}: {e}", exe.display())),
    }
}

#[cfg(target_os = "windows")]
pub(crate) fn command(program: &Path) -> Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let mut cmd = Command::new(program);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn command(program: &Path) -> Command {
    Command::new(program)
}

pub(crate) fn exe_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// First executable `name` on `path_var`, as it appears there (symlinks are not followed).
pub(crate) fn find_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let file = exe_name(name);
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(&file))
        .find(|candidate| is_executable(candidate))
        .map(|candidate| std::path::absolute(&candidate).unwrap_or(candidate))
}

/// First regular file named `name` on `path_var` that lacks execute permission.
fn unrunnable_in_path(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let file = exe_name(name);
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(&file))
        .find(|candidate| candidate.is_file() && !is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Failure notes gathered along the chain; decides NotFound vs NotExecutable.
#[derive(Default)]
struct Attempts {
    broken: Vec<String>,
    missing: Vec<String>,
}

impl Attempts {
    fn note(&mut self, step: &str, err: SeparationError) {
        let detail = format!("{step}: {err}");
        match err.kind() {
            crate::error::ErrorKind::ToolchainUnavailable(ToolchainFailure::NotExecutable) => {
                self.broken.push(detail)
            }
            _ => self.missing.push(detail),
        }
    }

    fn into_error(self) -> SeparationError {
        if self.broken.is_empty() {
            SeparationError::toolchain(ToolchainFailure::NotFound, self.missing.join("; "))
        } else {
            let mut all = self.broken;
            all.extend(self.missing);
            SeparationError::toolchain(ToolchainFailure::NotExecutable, all.join("; "))
        }
    }
}

static PROVISION_LOCK: Mutex<()> = Mutex::new(());

pub struct Resolver {
    config: ToolchainConfig,
    provisioner: Box<dyn Provisioner>,
}

impl Resolver {
    pub fn new(config: ToolchainConfig) -> Self {
        Self::with_provisioner(config, DefaultProvisioner)
    }

    pub fn with_provisioner(config: ToolchainConfig, provisioner: impl Provisioner + 'static) -> Self {
        Self {
            config,
            provisioner: Box::new(provisioner),
        }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// Walk record → search path → provisioning and return the first verified pair.
    pub fn resolve(&self) -> Result<ToolchainHandle> {
        let mut attempts = Attempts::default();
        let record_path = self.config.record_path()?;

        if let Some(h) = self.from_record(&record_path, &mut attempts) {
            return Ok(self.finish(h));
        }
        if let Some(h) = self.from_search_path(&mut attempts) {
            return Ok(self.finish(h));
        }

        let _guard = PROVISION_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // A concurrent job may have provisioned while we waited on the lock.
        if let Some(h) = self.from_record(&record_path, &mut Attempts::default()) {
            return Ok(self.finish(h));
        }

        let install_dir = self.config.install_dir()?;
        info!(dir = %install_dir.display(), "provisioning toolchain");
        let provisioned = self
            .provisioner
            .provision(&self.config, &install_dir)
            .and_then(|(decoder, prober)| {
                ToolchainHandle::verify(
                    decoder,
                    prober,
                    &self.config.version_flag,
                    ToolchainSource::Provisioned,
                )
            });

        match provisioned {
            Ok(h) => {
                record::write(&record_path, h.decoder(), h.prober())?;
                info!(
                    decoder = %h.decoder().display(),
                    record = %record_path.display(),
                    "toolchain provisioned"
                );
                Ok(self.finish(h))
            }
            Err(e) => {
                attempts.note("provisioning", e);
                Err(attempts.into_error())
            }
        }
    }

    fn from_record(&self, record_path: &Path, attempts: &mut Attempts) -> Option<ToolchainHandle> {
        let (decoder, prober) = record::read(record_path)?;
        match ToolchainHandle::verify(
            decoder,
            prober,
            &self.config.version_flag,
            ToolchainSource::Record,
        ) {
            Ok(h) => {
                debug!(record = %record_path.display(), "toolchain from record");
                Some(h)
            }
            Err(e) => {
                warn!(record = %record_path.display(), error = %e, "recorded toolchain unusable");
                attempts.note("record", e);
                None
            }
        }
    }

    fn from_search_path(&self, attempts: &mut Attempts) -> Option<ToolchainHandle> {
        let path_var = self.config.search_path_var();
        let decoder = find_in_path(&self.config.decoder, &path_var);
        let prober = find_in_path(&self.config.prober, &path_var);
        let (Some(decoder), Some(prober)) = (decoder, prober) else {
            let unrunnable: Vec<String> = [&self.config.decoder, &self.config.prober]
                .into_iter()
                .filter_map(|name| unrunnable_in_path(name, &path_var))
                .map(|p| format!("{} lacks execute permission", p.display()))
                .collect();
            let err = if unrunnable.is_empty() {
                SeparationError::toolchain(
                    ToolchainFailure::NotFound,
                    format!("{} / {} not on PATH", self.config.decoder, self.config.prober),
                )
            } else {
                SeparationError::toolchain(ToolchainFailure::NotExecutable, unrunnable.join(", "))
            };
            attempts.note("search path", err);
            return None;
        };
        match ToolchainHandle::verify(
            decoder,
            prober,
            &self.config.version_flag,
            ToolchainSource::SearchPath,
        ) {
            Ok(h) => {
                debug!(decoder = %h.decoder().display(), "toolchain from search path");
                Some(h)
            }
            Err(e) => {
                attempts.note("search path", e);
                None
            }
        }
    }

    fn finish(&self, handle: ToolchainHandle) -> ToolchainHandle {
        if self.config.inject_env {
            env::inject(&handle);
        }
        handle
    }
}

static SHARED: Mutex<Option<(String, ToolchainHandle)>> = Mutex::new(None);

impl ToolchainConfig {
    /// Identifies the inputs a resolution depends on.
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{:?}|{:?}|{:?}",
            self.decoder, self.prober, self.record_path, self.install_dir, self.search_path
        )
    }
}

/// Process-wide resolution guard: the first caller resolves, later callers
/// re-verify the cached handle and only re-resolve when it stopped working
/// or the configuration changed.
pub fn resolve_shared(resolver: &Resolver) -> Result<ToolchainHandle> {
    let key = resolver.config.cache_key();
    let mut slot = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some((cached_key, cached)) = slot.as_ref() {
        if *cached_key == key {
            match cached.reverify(&resolver.config.version_flag) {
                Ok(fresh) => {
                    let age = cached.verified_at().elapsed().unwrap_or_default();
                    debug!(age_ms = age.as_millis() as u64, "reusing shared toolchain");
                    let fresh = resolver.finish(fresh);
                    *slot = Some((key, fresh.clone()));
                    return Ok(fresh);
                }
                Err(e) => warn!(error = %e, "cached toolchain failed verification, re-resolving"),
            }
        }
    }
    *slot = None;
    let handle = resolver.resolve()?;
    *slot = Some((key, handle.clone()));
    Ok(handle)
}

/// Drop the process-wide cached handle so the next call re-resolves.
pub fn invalidate_shared() {
    *SHARED.lock().unwrap_or_else(PoisonError::into_inner) = None;
}
