use std::{
    ffi::OsStr,
    fs,
    io,
    path::Path,
    process::{Output, Stdio},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    core::{audio::read_audio, job::JobContext},
    error::{Result, SeparationError, ToolchainFailure},
    toolchain::{command, ToolchainHandle},
    types::Waveform,
};

/// Canonical intermediate layout every input is transcoded to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestOptions {
    pub sample_rate: u32,
    /// Inputs with more channels are downmixed to this many.
    pub max_channels: u16,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            max_channels: 2,
        }
    }
}

/// Reduce a container hint (`"mp3"`, `".MP3"`, `"song.mp3"`) to a safe file extension.
pub fn sanitize_hint(hint: Option<&str>) -> String {
    let raw = hint.unwrap_or_default();
    let ext = raw.rsplit('.').next().unwrap_or_default();
    let clean: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    if clean.is_empty() {
        "bin".into()
    } else {
        clean
    }
}

fn run(toolchain_exe: &Path, args: &[&OsStr]) -> Result<Output> {
    command(toolchain_exe)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            let failure = if e.kind() == io::ErrorKind::NotFound {
                ToolchainFailure::NotFound
            } else {
                ToolchainFailure::NotExecutable
            };
            SeparationError::toolchain(failure, format!("{}: {e}", toolchain_exe.display()))
        })
}

fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join(" | ")
}

/// Channel count of the first audio stream, as reported by the prober.
pub fn probe_channels(toolchain: &ToolchainHandle, input: &Path) -> Result<u16> {
    let output = run(
        toolchain.prober(),
        &[
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-select_streams"),
            OsStr::new("a:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=channels"),
            OsStr::new("-of"),
            OsStr::new("default=noprint_wrappers=1:nokey=1"),
            input.as_os_str(),
        ],
    )?;
    if !output.status.success() {
        return Err(SeparationError::Decode(format!(
            "input is not readable audio: {}",
            stderr_tail(&output)
        )));
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|l| l.trim().parse::<u16>().ok())
        .filter(|&c| c > 0)
        .ok_or_else(|| SeparationError::Decode("input has no audio stream".into()))
}

/// Transcode `input` to 16-bit PCM WAV at the canonical rate and `channels`.
pub fn transcode(
    toolchain: &ToolchainHandle,
    input: &Path,
    output: &Path,
    channels: u16,
    sample_rate: u32,
) -> Result<()> {
    let channels = channels.to_string();
    let sample_rate = sample_rate.to_string();
    let result = run(
        toolchain.decoder(),
        &[
            OsStr::new("-hide_banner"),
            OsStr::new("-loglevel"),
            OsStr::new("error"),
            OsStr::new("-nostdin"),
            OsStr::new("-y"),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-vn"),
            OsStr::new("-ac"),
            OsStr::new(&channels),
            OsStr::new("-ar"),
            OsStr::new(&sample_rate),
            OsStr::new("-acodec"),
            OsStr::new("pcm_s16le"),
            OsStr::new("-f"),
            OsStr::new("wav"),
            output.as_os_str(),
        ],
    )?;
    if !result.status.success() {
        return Err(SeparationError::Decode(format!(
            "decoder rejected input ({}): {}",
            result.status,
            stderr_tail(&result)
        )));
    }
    Ok(())
}

/// Decode arbitrary uploaded bytes into a canonical waveform.
///
/// The transcode always runs, even for WAV uploads, so sample rate and channel
/// layout come from the decoder rather than from the upload's metadata.
pub fn ingest(
    job: &JobContext,
    toolchain: &ToolchainHandle,
    bytes: &[u8],
    container_hint: Option<&str>,
    opts: &IngestOptions,
) -> Result<Waveform> {
    if bytes.is_empty() {
        return Err(SeparationError::Decode("input is empty".into()));
    }
    if opts.sample_rate == 0 || opts.max_channels == 0 {
        return Err(SeparationError::InvalidConfig(
            "ingest sample rate and channel limit must be positive".into(),
        ));
    }

    let input = job.write_temp(&format!("input.{}", sanitize_hint(container_hint)), bytes)?;
    let source_channels = probe_channels(toolchain, &input)?;
    let channels = source_channels.min(opts.max_channels);
    debug!(job = job.id(), source_channels, channels, "probed input");

    let decoded = job.temp_path("decoded.wav");
    transcode(toolchain, &input, &decoded, channels, opts.sample_rate)?;
    fs::remove_file(&input).ok();

    let waveform = read_audio(&decoded)?;
    fs::remove_file(&decoded).ok();

    if waveform.sample_rate() != opts.sample_rate {
        return Err(SeparationError::Decode(format!(
            "decoder produced {} Hz, expected {} Hz",
            waveform.sample_rate(),
            opts.sample_rate
        )));
    }
    if waveform.frames() == 0 {
        return Err(SeparationError::Decode("input decoded to zero frames".into()));
    }

    info!(
        job = job.id(),
        sample_rate = waveform.sample_rate(),
        channels = waveform.channel_count(),
        frames = waveform.frames(),
        "ingested"
    );
    Ok(waveform)
}

#[cfg(test)]
mod tests {
    use super::sanitize_hint;

    #[test]
    fn hint_sanitizing() {
        assert_eq!(sanitize_hint(Some("mp3")), "mp3");
        assert_eq!(sanitize_hint(Some(".MP3")), "mp3");
        assert_eq!(sanitize_hint(Some("my song.flac")), "flac");
        assert_eq!(sanitize_hint(Some("../../etc")), "etc");
        assert_eq!(sanitize_hint(Some("")), "bin");
        assert_eq!(sanitize_hint(None), "bin");
    }
}
