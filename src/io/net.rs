use crate::{error::Result, io::progress::emit_download_progress};
use reqwest::blocking::Client;
use std::{
    fs,
    fs::File,
    io::{Read, Write},
    path::Path,
    time::Duration,
};
use tracing::debug;

pub fn http_client() -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60 * 60))
        .build()?;
    Ok(client)
}

/// Stream `url` into `dest` via a `.part` file, reporting progress.
pub fn download_with_progress(client: &Client, url: &str, dest: &Path) -> Result<()> {
    let tmp = dest.with_extension("part");

    let mut resp = client.get(url).send()?.error_for_status()?;

    let total = resp.content_length().unwrap_or(0);
    debug!(url, total, dest = %dest.display(), "downloading");

    emit_download_progress(0, total);

    let mut file = File::create(&tmp)?;
    let mut downloaded: u64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match resp.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                fs::remove_file(&tmp).ok();
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        downloaded += n as u64;
        emit_download_progress(downloaded, total);
    }
    file.flush()?;
    drop(file);

    if dest.exists() {
        fs::remove_file(dest).ok();
    }

    fs::rename(&tmp, dest)?;

    emit_download_progress(total.max(downloaded), total.max(downloaded));

    Ok(())
}
