#![allow(dead_code)]

use std::{
    ffi::OsString,
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use instrumental_core::{
    error::{Result, SeparationError, ToolchainFailure},
    toolchain::Provisioner,
    SeparationModel, ToolchainConfig,
};
use ndarray::{Array4, ArrayView3, Axis};

static SERIAL: Mutex<()> = Mutex::new(());

/// Tests touching PATH, the shared toolchain cache or freshly written scripts run one at a time.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

const FAKE_DECODER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then echo "ffmpeg version test"; exit 0; fi
in=""; prev=""; last=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then in="$a"; fi
  prev="$a"; last="$a"
done
if [ "$(head -c 4 "$in")" != "RIFF" ]; then
  echo "$in: Invalid data found when processing input" >&2
  exit 1
fi
cp "$in" "$last"
"#;

const FAKE_PROBER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then echo "ffprobe version test"; exit 0; fi
for a in "$@"; do last="$a"; done
if [ "$(head -c 4 "$last")" != "RIFF" ]; then
  echo "$last: Invalid data found when processing input" >&2
  exit 1
fi
od -An -tu2 -j22 -N2 "$last" | tr -d ' \n'
echo
"#;

/// Answers the version query once, then drops its own execute bit.
const SELF_DISABLING_PROBER: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then chmod a-x "$0"; exit 0; fi
exit 1
"#;

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// `ffmpeg`/`ffprobe` stand-ins: WAV input is copied through, anything else is rejected.
#[cfg(unix)]
pub fn fake_toolchain(dir: &Path) -> (PathBuf, PathBuf) {
    fs::create_dir_all(dir).unwrap();
    let decoder = dir.join("ffmpeg");
    let prober = dir.join("ffprobe");
    write_script(&decoder, FAKE_DECODER, 0o755);
    write_script(&prober, FAKE_PROBER, 0o755);
    (decoder, prober)
}

#[cfg(unix)]
pub fn self_disabling_toolchain(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    write_script(&dir.join("ffmpeg"), FAKE_DECODER, 0o755);
    write_script(&dir.join("ffprobe"), SELF_DISABLING_PROBER, 0o755);
}

/// Isolated config: nothing outside `root` is read, searched or written.
pub fn test_config(root: &Path, search: Option<&Path>) -> ToolchainConfig {
    ToolchainConfig {
        record_path: Some(root.join("state/toolchain.txt")),
        install_dir: Some(root.join("install")),
        static_build_url: None,
        allow_package_manager: false,
        inject_env: false,
        search_path: Some(search.map(|p| p.as_os_str().to_owned()).unwrap_or_else(OsString::new)),
        ..ToolchainConfig::default()
    }
}

/// Writes the fake toolchain into the install dir and counts calls.
#[derive(Default)]
pub struct CountingProvisioner {
    pub calls: AtomicUsize,
}

impl Provisioner for CountingProvisioner {
    fn provision(&self, _config: &ToolchainConfig, install_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        #[cfg(unix)]
        {
            Ok(fake_toolchain(install_dir))
        }
        #[cfg(not(unix))]
        {
            let _ = install_dir;
            Err(SeparationError::toolchain(ToolchainFailure::NotFound, "unsupported"))
        }
    }
}

impl CountingProvisioner {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct NoProvisioner;

impl Provisioner for NoProvisioner {
    fn provision(&self, _config: &ToolchainConfig, _install_dir: &Path) -> Result<(PathBuf, PathBuf)> {
        Err(SeparationError::toolchain(
            ToolchainFailure::NotFound,
            "provisioning disabled",
        ))
    }
}

/// 16-bit WAV with a 220 Hz sine on every channel.
pub fn sine_wav(secs: f32, channels: u16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (secs * sample_rate as f32).round() as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.5;
            for _ in 0..channels {
                w.write_sample((s * i16::MAX as f32) as i16).unwrap();
            }
        }
        w.finalize().unwrap();
    }
    cursor.into_inner()
}

pub const STEMS: [&str; 4] = ["drums", "bass", "other", "vocals"];
pub const GAINS: [f32; 4] = [0.1, 0.2, 0.3, 0.4];

/// Linear stand-in for a separation network: stem `s` is `GAINS[s] * input`.
pub struct GainModel {
    stems: Vec<String>,
    segment: usize,
    sample_rate: u32,
    pub calls: AtomicUsize,
}

impl GainModel {
    pub fn new(segment: usize) -> Self {
        Self {
            stems: STEMS.iter().map(|s| s.to_string()).collect(),
            segment,
            sample_rate: 44_100,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SeparationModel for GainModel {
    fn name(&self) -> &str {
        "gain"
    }

    fn stems(&self) -> &[String] {
        &self.stems
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        2
    }

    fn segment_length(&self) -> usize {
        self.segment
    }

    fn apply(&self, batch: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (_, c, t) = batch.dim();
        let mut out = Array4::<f32>::zeros((1, GAINS.len(), c, t));
        for (s, gain) in GAINS.iter().enumerate() {
            out.index_axis_mut(Axis(1), s)
                .assign(&batch.mapv(|x| x * gain));
        }
        Ok(out)
    }
}

pub struct FailingModel {
    stems: Vec<String>,
}

impl FailingModel {
    pub fn new() -> Self {
        Self {
            stems: STEMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SeparationModel for FailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    fn stems(&self) -> &[String] {
        &self.stems
    }

    fn sample_rate(&self) -> u32 {
        44_100
    }

    fn channels(&self) -> usize {
        2
    }

    fn segment_length(&self) -> usize {
        1024
    }

    fn apply(&self, _batch: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
        Err(SeparationError::Inference("session run failed".into()))
    }
}
