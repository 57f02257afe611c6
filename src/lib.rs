//! # instrumental-core
//!
//! Turns an uploaded song into an instrumental mix: the decoder toolchain is
//! located or provisioned, the upload is transcoded into a canonical
//! waveform, a pretrained stem separation model is evaluated over it in
//! overlapping segments, and every stem except the vocals is summed and
//! encoded as WAV.

pub mod config;
pub mod error;
pub mod toolchain;
pub mod types;

pub mod core {
    pub mod adapter;
    pub mod audio;
    pub mod dsp;
    pub mod engine;
    pub mod ingest;
    pub mod job;
    pub mod mixer;
    pub mod package;
    pub mod pipeline;
}

pub mod io {
    pub mod crypto;
    pub mod net;
    pub mod paths;
    pub mod progress;
}

pub mod model {
    pub mod model_manager;
    pub mod registry;
}

pub use crate::{
    config::PipelineOptions,
    core::{
        adapter::{separate, SeparateOptions},
        audio::{read_audio, WavFormat},
        engine::SeparationModel,
        ingest::{ingest, IngestOptions},
        job::{JobContext, JobState},
        mixer::{mix, MixSpec},
        package::{package, PackagedAudio},
        pipeline::{InstrumentalOutput, Separator},
    },
    error::{ErrorKind, Result, SeparationError, Stage, ToolchainFailure},
    io::progress::{set_download_progress_callback, set_split_progress_callback, SplitProgress},
    model::model_manager::{ensure_model, prepare_model, ModelHandle},
    toolchain::{resolve_shared, Resolver, ToolchainConfig, ToolchainHandle, ToolchainSource},
    types::{ModelManifest, Stem, StemSet, Waveform},
};

#[cfg(feature = "onnx")]
pub use crate::core::{engine::OnnxModel, pipeline::remove_vocals_file};
