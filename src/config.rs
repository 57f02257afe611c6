use std::{fs, path::{Path, PathBuf}};

use serde::{Deserialize, Serialize};

use crate::{
    core::{adapter::SeparateOptions, audio::WavFormat, ingest::IngestOptions, mixer::MixSpec},
    error::{Result, SeparationError},
    model::registry::DEFAULT_MODEL,
    toolchain::ToolchainConfig,
};

/// Everything a vocals-removal run can be configured with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub overlap: f32,
    pub shifts: usize,
    pub seed: u64,
    pub max_buffer_bytes: Option<u64>,
    pub model_name: String,
    pub manifest_url_override: Option<String>,
    /// Local model file; the manifest still comes from the registry or override URL.
    pub model_path: Option<PathBuf>,
    pub output_format: WavFormat,
    /// Stems summed into the instrumental.
    pub mix: MixSpec,
    /// Also package the isolated vocal stem.
    pub keep_vocals: bool,
    /// Parent of per-job temp dirs. Defaults to `INSTRUMENTAL_TMP_DIR` or the system temp dir.
    pub work_dir: Option<PathBuf>,
    pub toolchain: ToolchainConfig,
    pub ingest: IngestOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            overlap: 0.25,
            shifts: 1,
            seed: 0,
            max_buffer_bytes: None,
            model_name: DEFAULT_MODEL.into(),
            manifest_url_override: None,
            model_path: None,
            output_format: WavFormat::default(),
            mix: MixSpec::instrumental(),
            keep_vocals: false,
            work_dir: None,
            toolchain: ToolchainConfig::default(),
            ingest: IngestOptions::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let opts: Self = serde_json::from_str(&raw).map_err(|e| {
            SeparationError::InvalidConfig(format!("{}: {e}", path.display()))
        })?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn separate_options(&self) -> SeparateOptions {
        SeparateOptions {
            overlap: self.overlap,
            shifts: self.shifts,
            seed: self.seed,
            max_buffer_bytes: self.max_buffer_bytes,
            ..SeparateOptions::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.separate_options().validate()?;
        if self.mix.is_empty() {
            return Err(SeparationError::InvalidMixSpec("no stems selected".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        fs::write(&path, r#"{ "shifts": 3, "output_format": "float32" }"#).unwrap();

        let opts = PipelineOptions::from_json_file(&path).unwrap();
        assert_eq!(opts.shifts, 3);
        assert_eq!(opts.output_format, WavFormat::Float32);
        assert_eq!(opts.overlap, 0.25);
        assert_eq!(opts.model_name, DEFAULT_MODEL);
        assert!(!opts.keep_vocals);
        assert_eq!(opts.mix, MixSpec::instrumental());
    }

    #[test]
    fn out_of_range_overlap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        fs::write(&path, r#"{ "overlap": 1.5 }"#).unwrap();
        assert!(PipelineOptions::from_json_file(&path).is_err());
    }
}
