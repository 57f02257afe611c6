//! The separation model collaborator.
//!
//! Anything that maps a fixed-length `[1, C, T]` batch onto per-stem
//! `[1, S, C, T]` output can sit behind [`SeparationModel`]; chunking,
//! blending and ensembling live in [`crate::core::adapter`].

use ndarray::{Array4, ArrayView3};

use crate::error::Result;

pub trait SeparationModel: Send + Sync {
    fn name(&self) -> &str;

    /// Output stem names, in output order.
    fn stems(&self) -> &[String];

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> usize;

    /// Frames evaluated per call (the model's receptive field).
    fn segment_length(&self) -> usize;

    /// `batch` is `[1, channels, segment_length]`; returns `[1, stems, channels, segment_length]`.
    fn apply(&self, batch: ArrayView3<'_, f32>) -> Result<Array4<f32>>;
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;

#[cfg(feature = "onnx")]
mod onnx {
    use std::sync::{Mutex, PoisonError};

    use ndarray::{Array4, ArrayView3, Axis};
    use ort::{
        session::{builder::GraphOptimizationLevel, Session},
        value::Tensor,
    };
    use tracing::{debug, info};

    use super::SeparationModel;
    use crate::{
        core::dsp::stft_cac_stereo_centered,
        error::{Result, SeparationError},
        model::model_manager::ModelHandle,
        types::ModelManifest,
    };

    fn inference<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> SeparationError {
        move |e| SeparationError::Inference(format!("{what}: {e}"))
    }

    /// htdemucs exported to ONNX, evaluated on CPU.
    pub struct OnnxModel {
        // `Session::run` needs `&mut self`.
        session: Mutex<Session>,
        manifest: ModelManifest,
    }

    impl OnnxModel {
        pub fn load(handle: &ModelHandle) -> Result<Self> {
            let mf = &handle.manifest;
            if mf.window == 0 || mf.stems.is_empty() || mf.channels == 0 {
                return Err(SeparationError::Manifest(format!(
                    "manifest `{}` needs a window, channels and stems",
                    mf.name
                )));
            }
            if mf.inputs.spectrogram.is_some() && (mf.channels != 2 || mf.hop == 0 || mf.n_fft < 2) {
                return Err(SeparationError::Manifest(
                    "spectrogram input requires stereo, hop > 0 and n_fft >= 2".into(),
                ));
            }

            let threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let session = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| b.with_intra_threads(threads))
                .and_then(|b| b.commit_from_file(&handle.local_path))
                .map_err(|e| {
                    SeparationError::Inference(format!(
                        "failed to load {}: {e}",
                        handle.local_path.display()
                    ))
                })?;

            info!(
                model = %mf.name,
                window = mf.window,
                stems = ?mf.stems,
                "onnx model loaded"
            );
            Ok(Self {
                session: Mutex::new(session),
                manifest: mf.clone(),
            })
        }

        pub fn manifest(&self) -> &ModelManifest {
            &self.manifest
        }
    }

    impl SeparationModel for OnnxModel {
        fn name(&self) -> &str {
            &self.manifest.name
        }

        fn stems(&self) -> &[String] {
            &self.manifest.stems
        }

        fn sample_rate(&self) -> u32 {
            self.manifest.sample_rate
        }

        fn channels(&self) -> usize {
            self.manifest.channels as usize
        }

        fn segment_length(&self) -> usize {
            self.manifest.window
        }

        fn apply(&self, batch: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
            let mf = &self.manifest;
            let (b, c, t) = batch.dim();
            if b != 1 || c != self.channels() || t != mf.window {
                return Err(SeparationError::Inference(format!(
                    "bad batch shape [{b}, {c}, {t}], expected [1, {}, {}]",
                    self.channels(),
                    mf.window
                )));
            }

            let time_value = Tensor::from_array(batch.to_owned()).map_err(inference("waveform tensor"))?;

            let spec_value = match &mf.inputs.spectrogram {
                Some(_) => {
                    let frame = batch.index_axis(Axis(0), 0);
                    let left = frame.row(0).to_vec();
                    let right = frame.row(1).to_vec();
                    let (spec, f_bins, frames) =
                        stft_cac_stereo_centered(&left, &right, mf.n_fft, mf.hop);
                    let spec = Array4::from_shape_vec((1, 4, f_bins, frames), spec)
                        .map_err(inference("spectrogram shape"))?;
                    Some(Tensor::from_array(spec).map_err(inference("spectrogram tensor"))?)
                }
                None => None,
            };

            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let outputs = match (spec_value, &mf.inputs.spectrogram) {
                (Some(spec), Some(spec_name)) => session.run(ort::inputs![
                    mf.inputs.waveform.as_str() => time_value,
                    spec_name.as_str() => spec
                ]),
                _ => session.run(ort::inputs![mf.inputs.waveform.as_str() => time_value]),
            }
            .map_err(inference("model run"))?;

            let wanted = mf.output.as_str();
            let is_wanted = |name: &str| name == wanted;
            let mut chosen = None;
            for (name, value) in outputs.iter() {
                if is_wanted(name) {
                    chosen = Some(value);
                    break;
                }
                if chosen.is_none() {
                    chosen = Some(value);
                }
            }
            let value = chosen
                .ok_or_else(|| SeparationError::Inference("model returned no outputs".into()))?;

            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(inference("output extraction"))?;
            let dims: Vec<i64> = shape.iter().copied().collect();
            debug!(?dims, "model output");

            let stems = mf.stems.len();
            if data.len() != stems * c * t {
                return Err(SeparationError::Inference(format!(
                    "unexpected output {dims:?}, expected [1, {stems}, {c}, {t}]"
                )));
            }
            Array4::from_shape_vec((1, stems, c, t), data.to_vec()).map_err(inference("output shape"))
        }
    }
}
