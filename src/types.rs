use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeparationError};

/// Planar audio: `[channels, frames]`, immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    samples: Array2<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Array2<f32>, sample_rate: u32) -> Result<Self> {
        if samples.nrows() == 0 {
            return Err(SeparationError::InvalidConfig(
                "waveform needs at least one channel".into(),
            ));
        }
        if sample_rate == 0 {
            return Err(SeparationError::InvalidConfig(
                "waveform sample rate must be positive".into(),
            ));
        }
        Ok(Self {
            samples,
            sample_rate,
        })
    }

    /// Build from interleaved samples (`L R L R ...`). A trailing partial frame is dropped.
    pub fn from_interleaved(interleaved: &[f32], channels: u16, sample_rate: u32) -> Result<Self> {
        let ch = channels as usize;
        if ch == 0 {
            return Err(SeparationError::InvalidConfig(
                "waveform needs at least one channel".into(),
            ));
        }
        let frames = interleaved.len() / ch;
        let samples = Array2::from_shape_fn((ch, frames), |(c, i)| interleaved[i * ch + c]);
        Self::new(samples, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.samples.nrows()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.ncols()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn samples(&self) -> ArrayView2<'_, f32> {
        self.samples.view()
    }

    pub fn channel(&self, idx: usize) -> ArrayView1<'_, f32> {
        self.samples.row(idx)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.channel_count(), self.frames())
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.samples.len());
        for frame in self.samples.columns() {
            out.extend(frame.iter().copied());
        }
        out
    }

    pub fn into_samples(self) -> Array2<f32> {
        self.samples
    }
}

#[derive(Clone, Debug)]
pub struct Stem {
    pub name: String,
    pub waveform: Waveform,
}

/// Named stems in model order, all sharing one shape and sample rate.
#[derive(Clone, Debug)]
pub struct StemSet {
    stems: Vec<Stem>,
}

impl StemSet {
    pub fn new(stems: Vec<Stem>) -> Result<Self> {
        if let Some(first) = stems.first() {
            let shape = first.waveform.shape();
            let rate = first.waveform.sample_rate();
            for s in &stems[1..] {
                if s.waveform.shape() != shape || s.waveform.sample_rate() != rate {
                    return Err(SeparationError::Inference(format!(
                        "stem `{}` has shape {:?}@{}Hz, expected {:?}@{}Hz",
                        s.name,
                        s.waveform.shape(),
                        s.waveform.sample_rate(),
                        shape,
                        rate
                    )));
                }
            }
        }
        Ok(Self { stems })
    }

    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stems.iter().map(|s| s.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Waveform> {
        self.stems
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .map(|s| &s.waveform)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stem> {
        self.stems.iter()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub file: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInputs {
    /// Time-domain input `[1, C, T]`.
    #[serde(default = "default_waveform_input")]
    pub waveform: String,
    /// Complex-as-channels spectrogram input `[1, 4, F, Frames]`, when the export wants one.
    #[serde(default)]
    pub spectrogram: Option<String>,
}

/// Manifests without an `inputs` block describe the hybrid htdemucs export,
/// which takes both the waveform and its spectrogram.
impl Default for ModelInputs {
    fn default() -> Self {
        Self {
            waveform: default_waveform_input(),
            spectrogram: Some("x".into()),
        }
    }
}

fn default_waveform_input() -> String {
    "input".into()
}

fn default_output() -> String {
    "add_67".into()
}

fn default_channels() -> u16 {
    2
}

fn default_n_fft() -> usize {
    4096
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub version: String,
    pub backend: String,
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Segment length in frames the model evaluates at once.
    pub window: usize,
    /// STFT hop of the spectrogram branch.
    pub hop: usize,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    pub stems: Vec<String>,
    #[serde(default)]
    pub input_layout: Option<String>,
    #[serde(default)]
    pub output_layout: Option<String>,
    #[serde(default)]
    pub inputs: ModelInputs,
    /// Name of the time-domain stems output `[1, S, C, T]`.
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl ModelManifest {
    pub fn resolve_primary_artifact(&self) -> std::result::Result<&Artifact, String> {
        self.artifacts
            .iter()
            .find(|a| a.file.ends_with(".onnx") || a.file.ends_with(".ort"))
            .or_else(|| self.artifacts.first())
            .ok_or_else(|| format!("manifest `{}` lists no artifacts", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_round_trips_through_planar() {
        let inter: [f32; 6] = [0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let w = Waveform::from_interleaved(&inter, 2, 44_100).unwrap();
        assert_eq!(w.shape(), (2, 3));
        assert_eq!(w.channel(1).to_vec(), vec![-0.1, -0.2, -0.3]);
        assert_eq!(w.to_interleaved(), inter.to_vec());
    }

    #[test]
    fn waveform_rejects_zero_rate_and_channels() {
        assert!(Waveform::new(Array2::<f32>::zeros((1, 4)), 0).is_err());
        assert!(Waveform::new(Array2::<f32>::zeros((0, 4)), 44_100).is_err());
    }

    #[test]
    fn stem_set_rejects_mismatched_shapes() {
        let a = Waveform::new(Array2::zeros((2, 10)), 44_100).unwrap();
        let b = Waveform::new(Array2::zeros((2, 9)), 44_100).unwrap();
        let err = StemSet::new(vec![
            Stem { name: "drums".into(), waveform: a },
            Stem { name: "bass".into(), waveform: b },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("bass"));
    }
}
