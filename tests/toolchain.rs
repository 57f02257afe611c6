#![cfg(unix)]

mod common;

use std::{
    env, fs,
    sync::{Arc, Barrier},
    thread,
};

use instrumental_core::{
    error::{ErrorKind, ToolchainFailure},
    toolchain::{env as tool_env, invalidate_shared, record},
    resolve_shared, Resolver, ToolchainSource,
};
use tempfile::tempdir;

use common::{fake_toolchain, serial, test_config, write_script, CountingProvisioner, NoProvisioner};

#[test]
fn finds_pair_on_search_path() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    let (decoder, prober) = fake_toolchain(&bin);

    let resolver = Resolver::with_provisioner(test_config(root.path(), Some(&bin)), NoProvisioner);
    let handle = resolver.resolve().unwrap();

    assert_eq!(handle.source(), ToolchainSource::SearchPath);
    assert_eq!(handle.decoder(), decoder);
    assert_eq!(handle.prober(), prober);
}

#[test]
fn resolve_twice_provisions_once() {
    let _g = serial();
    let root = tempdir().unwrap();
    let provisioner = Arc::new(CountingProvisioner::default());
    let config = test_config(root.path(), None);
    let record_path = config.record_path.clone().unwrap();
    let resolver = Resolver::with_provisioner(config, provisioner.clone());

    let first = resolver.resolve().unwrap();
    assert_eq!(first.source(), ToolchainSource::Provisioned);
    assert_eq!(provisioner.count(), 1);

    let (rec_decoder, rec_prober) = record::read(&record_path).unwrap();
    assert_eq!(rec_decoder, first.decoder());
    assert_eq!(rec_prober, first.prober());

    let second = resolver.resolve().unwrap();
    assert_eq!(second.source(), ToolchainSource::Record);
    assert!(first.same_paths(&second));
    assert_eq!(provisioner.count(), 1);
}

#[test]
fn stale_record_falls_through_to_search_path() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    let (decoder, _) = fake_toolchain(&bin);

    let config = test_config(root.path(), Some(&bin));
    let record_path = config.record_path.clone().unwrap();
    record::write(
        &record_path,
        &root.path().join("gone/ffmpeg"),
        &root.path().join("gone/ffprobe"),
    )
    .unwrap();

    let resolver = Resolver::with_provisioner(config, NoProvisioner);
    let handle = resolver.resolve().unwrap();
    assert_eq!(handle.source(), ToolchainSource::SearchPath);
    assert_eq!(handle.decoder(), decoder);
}

#[test]
fn nothing_anywhere_is_not_found() {
    let _g = serial();
    let root = tempdir().unwrap();
    let resolver = Resolver::with_provisioner(test_config(root.path(), None), NoProvisioner);

    let err = resolver.resolve().unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ToolchainUnavailable(ToolchainFailure::NotFound)
    );
    assert!(err.to_string().contains("not found"));
}

#[test]
fn present_but_unrunnable_is_not_executable() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("ffmpeg"), "#!/bin/sh\nexit 0\n", 0o644);
    write_script(&bin.join("ffprobe"), "#!/bin/sh\nexit 0\n", 0o644);

    let resolver = Resolver::with_provisioner(test_config(root.path(), Some(&bin)), NoProvisioner);
    let err = resolver.resolve().unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ToolchainUnavailable(ToolchainFailure::NotExecutable)
    );
    assert!(err.to_string().contains("not executable"));
}

#[test]
fn symlinked_multicall_binary_runs_under_its_path_name() {
    let _g = serial();
    let root = tempdir().unwrap();
    let real = root.path().join("real");
    let bin = root.path().join("bin");
    fs::create_dir_all(&real).unwrap();
    fs::create_dir_all(&bin).unwrap();
    write_script(
        &real.join("multicall"),
        "#!/bin/sh\ncase \"$(basename \"$0\")\" in ffmpeg|ffprobe) exit 0;; *) exit 1;; esac\n",
        0o755,
    );
    std::os::unix::fs::symlink(real.join("multicall"), bin.join("ffmpeg")).unwrap();
    std::os::unix::fs::symlink(real.join("multicall"), bin.join("ffprobe")).unwrap();

    let resolver = Resolver::with_provisioner(test_config(root.path(), Some(&bin)), NoProvisioner);
    let handle = resolver.resolve().unwrap();
    assert_eq!(handle.source(), ToolchainSource::SearchPath);
    assert_eq!(handle.decoder(), bin.join("ffmpeg"));
    assert_eq!(handle.prober(), bin.join("ffprobe"));
}

#[test]
fn unrunnable_entry_does_not_hide_later_path_entries() {
    let _g = serial();
    let root = tempdir().unwrap();
    let first = root.path().join("first");
    let second = root.path().join("second");
    fs::create_dir_all(&first).unwrap();
    write_script(&first.join("ffmpeg"), "#!/bin/sh\nexit 0\n", 0o644);
    let (decoder, prober) = fake_toolchain(&second);

    let mut config = test_config(root.path(), None);
    config.search_path = Some(env::join_paths([&first, &second]).unwrap());
    let resolver = Resolver::with_provisioner(config, NoProvisioner);

    let handle = resolver.resolve().unwrap();
    assert_eq!(handle.source(), ToolchainSource::SearchPath);
    assert_eq!(handle.decoder(), decoder);
    assert_eq!(handle.prober(), prober);
}

#[test]
fn concurrent_first_resolution_provisions_once() {
    let _g = serial();
    let root = tempdir().unwrap();
    let provisioner = Arc::new(CountingProvisioner::default());
    let config = test_config(root.path(), None);
    let barrier = Arc::new(Barrier::new(4));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            let provisioner = provisioner.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let resolver = Resolver::with_provisioner(config, provisioner);
                barrier.wait();
                resolver.resolve().unwrap()
            })
        })
        .collect();
    let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(provisioner.count(), 1);
    assert_eq!(
        handles
            .iter()
            .filter(|h| h.source() == ToolchainSource::Provisioned)
            .count(),
        1
    );
    assert!(handles.iter().all(|h| h.same_paths(&handles[0])));
}

#[test]
fn failing_version_query_is_not_executable() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    write_script(&bin.join("ffmpeg"), "#!/bin/sh\nexit 3\n", 0o755);
    write_script(&bin.join("ffprobe"), "#!/bin/sh\nexit 3\n", 0o755);

    let resolver = Resolver::with_provisioner(test_config(root.path(), Some(&bin)), NoProvisioner);
    let err = resolver.resolve().unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ToolchainUnavailable(ToolchainFailure::NotExecutable)
    ));
}

#[test]
fn path_injection_is_idempotent() {
    let _g = serial();
    let root = tempdir().unwrap();
    let bin = root.path().join("bin");
    fake_toolchain(&bin);

    let mut config = test_config(root.path(), Some(&bin));
    config.inject_env = true;
    let resolver = Resolver::with_provisioner(config, NoProvisioner);

    let before = env::var_os("PATH").unwrap_or_default();
    let handle = resolver.resolve().unwrap();
    resolver.resolve().unwrap();
    assert!(!tool_env::inject(&handle), "re-injecting the same handle changes nothing");

    let dir = handle.decoder().parent().unwrap().to_path_buf();
    let path = env::var_os("PATH").unwrap();
    let hits = env::split_paths(&path).filter(|p| *p == dir).count();
    assert_eq!(hits, 1);
    assert_eq!(
        env::var_os(tool_env::DECODER_PATH_VAR).unwrap(),
        handle.decoder().as_os_str()
    );
    assert_eq!(
        env::var_os(tool_env::PROBER_PATH_VAR).unwrap(),
        handle.prober().as_os_str()
    );
    assert!(tool_env::injected().unwrap().same_paths(&handle));

    env::set_var("PATH", before);
}

#[test]
fn shared_handle_is_reused_and_reresolved_when_broken() {
    let _g = serial();
    invalidate_shared();
    let root = tempdir().unwrap();
    let provisioner = Arc::new(CountingProvisioner::default());
    let resolver = Resolver::with_provisioner(test_config(root.path(), None), provisioner.clone());

    let a = resolve_shared(&resolver).unwrap();
    let b = resolve_shared(&resolver).unwrap();
    assert!(a.same_paths(&b));
    assert!(b.verified_at() >= a.verified_at());
    assert_eq!(provisioner.count(), 1);

    // Binaries vanish: the cached handle fails re-verification and the
    // stale record is skipped, so provisioning runs again.
    fs::remove_dir_all(root.path().join("install")).unwrap();
    let c = resolve_shared(&resolver).unwrap();
    assert_eq!(provisioner.count(), 2);
    assert!(c.decoder().exists());
    invalidate_shared();
}
