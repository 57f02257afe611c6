use std::{
    fs::File,
    io::{Cursor, Seek, Write},
    path::Path,
};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, codecs::CODEC_TYPE_NULL, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, warn};

use crate::{
    error::{Result, SeparationError},
    types::Waveform,
};

/// Decode an audio file into a planar waveform.
pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<Waveform> {
    let path: &Path = path.as_ref();

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SeparationError::Decode(format!("{}: {e}", path.display())))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SeparationError::Decode("no audio track found".into()))?;
    let track_id = track.id;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SeparationError::Decode(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate: u32 = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels: u16 = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(SeparationError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(error = e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(SeparationError::Decode(e.to_string())),
        };
        sample_rate = decoded.spec().rate;
        channels = decoded.spec().channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if channels == 0 || sample_rate == 0 {
        return Err(SeparationError::Decode(format!(
            "{} has no decodable audio",
            path.display()
        )));
    }

    debug!(
        sample_rate,
        channels,
        frames = samples.len() / channels as usize,
        "read audio"
    );

    Waveform::from_interleaved(&samples, channels, sample_rate)
}

/// Sample encoding for WAV output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavFormat {
    #[default]
    Pcm16,
    Float32,
}

impl WavFormat {
    fn spec(self, channels: u16, sample_rate: u32) -> WavSpec {
        match self {
            WavFormat::Pcm16 => WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
            WavFormat::Float32 => WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            },
        }
    }
}

fn encode_error(e: hound::Error) -> SeparationError {
    SeparationError::Encode(e.to_string())
}

pub fn write_wav<W: Write + Seek>(writer: W, audio: &Waveform, format: WavFormat) -> Result<()> {
    let spec = format.spec(audio.channel_count() as u16, audio.sample_rate());
    let mut writer = WavWriter::new(writer, spec).map_err(encode_error)?;

    let samples = audio.samples();
    for frame in samples.columns() {
        for &sample in frame.iter() {
            match format {
                WavFormat::Pcm16 => {
                    let s = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                    writer.write_sample(s).map_err(encode_error)?;
                }
                WavFormat::Float32 => writer.write_sample(sample).map_err(encode_error)?,
            }
        }
    }

    writer.finalize().map_err(encode_error)?;
    Ok(())
}

/// Encode to an in-memory WAV container.
pub fn encode_wav(audio: &Waveform, format: WavFormat) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    write_wav(&mut cursor, audio, format)?;
    Ok(cursor.into_inner())
}
