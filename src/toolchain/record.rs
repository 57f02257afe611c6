//! Persisted toolchain location: two absolute paths, decoder first, one per line.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::Result;

pub fn read(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let text = fs::read_to_string(path).ok()?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let decoder = PathBuf::from(lines.next()?);
    let prober = PathBuf::from(lines.next()?);
    Some((decoder, prober))
}

pub fn write(path: &Path, decoder: &Path, prober: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(
        &tmp,
        format!("{}\n{}\n", decoder.display(), prober.display()),
    )?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let rec = dir.path().join("nested/toolchain.txt");
        write(&rec, Path::new("/opt/ff/ffmpeg"), Path::new("/opt/ff/ffprobe")).unwrap();
        let (d, p) = read(&rec).unwrap();
        assert_eq!(d, PathBuf::from("/opt/ff/ffmpeg"));
        assert_eq!(p, PathBuf::from("/opt/ff/ffprobe"));
    }

    #[test]
    fn short_record_is_ignored() {
        let dir = tempdir().unwrap();
        let rec = dir.path().join("toolchain.txt");
        fs::write(&rec, "/opt/ff/ffmpeg\n\n").unwrap();
        assert!(read(&rec).is_none());
        assert!(read(&dir.path().join("missing.txt")).is_none());
    }
}
