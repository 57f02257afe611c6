#![cfg(unix)]

mod common;

use std::fs;

use instrumental_core::{
    core::ingest::{probe_channels, sanitize_hint},
    error::{ErrorKind, ToolchainFailure},
    ingest, IngestOptions, JobContext, ToolchainHandle, ToolchainSource,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tempfile::tempdir;

use common::{fake_toolchain, serial, sine_wav};

fn handle(dir: &std::path::Path) -> ToolchainHandle {
    let (decoder, prober) = fake_toolchain(dir);
    ToolchainHandle::verify(decoder, prober, "-version", ToolchainSource::SearchPath).unwrap()
}

#[test]
fn ten_seconds_of_mono_stays_mono() {
    let _g = serial();
    let root = tempdir().unwrap();
    let tools = handle(&root.path().join("bin"));
    let work = root.path().join("work");
    let job = JobContext::in_dir(&work).unwrap();

    let bytes = sine_wav(10.0, 1, 44_100);
    let wave = ingest(&job, &tools, &bytes, Some("wav"), &IngestOptions::default()).unwrap();

    assert_eq!(wave.channel_count(), 1);
    assert_eq!(wave.sample_rate(), 44_100);
    assert!((wave.frames() as i64 - 441_000).abs() <= 1);

    job.finish().unwrap();
    assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
}

#[test]
fn stereo_input_keeps_both_channels() {
    let _g = serial();
    let root = tempdir().unwrap();
    let tools = handle(&root.path().join("bin"));
    let job = JobContext::in_dir(root.path()).unwrap();

    let bytes = sine_wav(0.5, 2, 44_100);
    let input = job.write_temp("probe.wav", &bytes).unwrap();
    assert_eq!(probe_channels(&tools, &input).unwrap(), 2);

    let wave = ingest(&job, &tools, &bytes, Some(".WAV"), &IngestOptions::default()).unwrap();
    assert_eq!(wave.shape(), (2, 22_050));
    assert!(wave.channel(0).iter().any(|&s| s.abs() > 0.1));
}

#[test]
fn random_bytes_are_a_decode_error_and_leave_nothing_behind() {
    let _g = serial();
    let root = tempdir().unwrap();
    let tools = handle(&root.path().join("bin"));
    let work = root.path().join("work");

    let mut garbage = vec![0u8; 4096];
    StdRng::seed_from_u64(7).fill_bytes(&mut garbage);

    let err = {
        let job = JobContext::in_dir(&work).unwrap();
        ingest(&job, &tools, &garbage, Some("mp3"), &IngestOptions::default()).unwrap_err()
    };
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(err.to_string().contains("Invalid data"));
    assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
}

#[test]
fn empty_upload_is_rejected_before_spawning() {
    let _g = serial();
    let root = tempdir().unwrap();
    let tools = handle(&root.path().join("bin"));
    let job = JobContext::in_dir(root.path()).unwrap();

    let err = ingest(&job, &tools, &[], None, &IngestOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[test]
fn vanished_decoder_is_toolchain_unavailable() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    let tools = handle(&bin);
    fs::remove_dir_all(&bin).unwrap();

    let job = JobContext::in_dir(&root.path().join("work")).unwrap();
    let err = ingest(&job, &tools, &sine_wav(0.1, 1, 44_100), Some("wav"), &IngestOptions::default())
        .unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ToolchainUnavailable(ToolchainFailure::NotFound)
    );
}

#[test]
fn container_hint_never_escapes_the_job_dir() {
    for hint in ["../../etc/passwd", "a/b", "..", "mp3\0", "x\\y.wav"] {
        let ext = sanitize_hint(Some(hint));
        assert!(!ext.is_empty());
        assert!(ext.chars().all(|c| c.is_ascii_alphanumeric()), "{hint:?} -> {ext:?}");
    }
}
