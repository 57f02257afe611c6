use std::io::Cursor;

use tracing::debug;

use crate::{
    core::audio::{encode_wav, WavFormat},
    error::Result,
    types::Waveform,
};

/// An encoded WAV file held in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct PackagedAudio {
    bytes: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    frames: usize,
    format: WavFormat,
}

impl PackagedAudio {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn format(&self) -> WavFormat {
        self.format
    }

    pub fn content_type(&self) -> &'static str {
        "audio/wav"
    }

    /// `<stem>.wav`
    pub fn file_name(&self, stem: &str) -> String {
        format!("{stem}.wav")
    }
}

/// Encode `waveform` as WAV into an in-memory buffer.
pub fn package(waveform: &Waveform, format: WavFormat) -> Result<PackagedAudio> {
    let bytes = encode_wav(waveform, format)?;
    debug!(bytes = bytes.len(), ?format, "packaged");
    Ok(PackagedAudio {
        bytes,
        sample_rate: waveform.sample_rate(),
        channels: waveform.channel_count() as u16,
        frames: waveform.frames(),
        format,
    })
}
