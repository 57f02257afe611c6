use std::{fs, path::Path, sync::Arc};

use tracing::{info, warn};

use crate::{
    config::PipelineOptions,
    core::{
        adapter::separate,
        engine::SeparationModel,
        ingest::ingest,
        job::{JobContext, JobState},
        mixer::{mix, MixSpec},
        package::{package, PackagedAudio},
    },
    error::{Result, Stage, StageExt},
    io::progress::{emit_split_progress, emit_stage, SplitProgress},
    toolchain::{invalidate_shared, resolve_shared, Resolver, ToolchainHandle},
    types::Waveform,
};

/// Result of one vocals-removal run.
#[derive(Clone, Debug)]
pub struct InstrumentalOutput {
    pub instrumental: PackagedAudio,
    /// Isolated vocal stem, when `keep_vocals` is set.
    pub vocals: Option<PackagedAudio>,
    /// Stem names produced by the model, in model order.
    pub stems: Vec<String>,
    pub duration_secs: f64,
}

/// A loaded model plus the options a run is executed with.
pub struct Separator {
    model: Arc<dyn SeparationModel>,
    options: PipelineOptions,
    resolver: Resolver,
}

impl Separator {
    pub fn new(model: Arc<dyn SeparationModel>, options: PipelineOptions) -> Self {
        let resolver = Resolver::new(options.toolchain.clone());
        Self::with_resolver(model, options, resolver)
    }

    pub fn with_resolver(model: Arc<dyn SeparationModel>, options: PipelineOptions, resolver: Resolver) -> Self {
        Self {
            model,
            options,
            resolver,
        }
    }

    /// Acquire the configured model and load it into ONNX Runtime.
    #[cfg(feature = "onnx")]
    pub fn from_options(options: PipelineOptions) -> Result<Self> {
        use crate::{core::engine::OnnxModel, model::model_manager::prepare_model};

        options.validate()?;
        let handle = prepare_model(
            &options.model_name,
            options.manifest_url_override.as_deref(),
            options.model_path.as_deref(),
        )
        .stage(Stage::Model)?;
        let model = OnnxModel::load(&handle).stage(Stage::Model)?;
        Ok(Self::new(Arc::new(model), options))
    }

    pub fn model(&self) -> &dyn SeparationModel {
        self.model.as_ref()
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Produce the instrumental mix of an uploaded file.
    ///
    /// `container_hint` is the upload's extension, if known. All temp files
    /// are gone by the time this returns, on success and on failure.
    pub fn remove_vocals(&self, bytes: &[u8], container_hint: Option<&str>) -> Result<InstrumentalOutput> {
        self.options.validate()?;
        let mut job = match &self.options.work_dir {
            Some(dir) => JobContext::in_dir(dir)?,
            None => JobContext::new()?,
        };

        match self.run(&mut job, bytes, container_hint) {
            Ok(out) => {
                if let Err(e) = job.finish() {
                    warn!(error = %e, "job cleanup failed");
                }
                emit_split_progress(SplitProgress::Finished);
                Ok(out)
            }
            Err(e) => {
                job.set_state(JobState::Failed(e.stage().unwrap_or(Stage::Toolchain)));
                warn!(job = job.id(), error = %e, "run failed");
                Err(e)
            }
        }
    }

    pub fn remove_vocals_path(&self, path: &Path) -> Result<InstrumentalOutput> {
        let bytes = fs::read(path)?;
        let hint = path.extension().and_then(|e| e.to_str());
        self.remove_vocals(&bytes, hint)
    }

    fn run(&self, job: &mut JobContext, bytes: &[u8], container_hint: Option<&str>) -> Result<InstrumentalOutput> {
        emit_stage("resolve_toolchain");
        let toolchain = resolve_shared(&self.resolver).stage(Stage::Toolchain)?;
        job.attach_toolchain(toolchain.clone());
        job.set_state(JobState::ToolchainReady);

        emit_stage("ingest");
        let waveform = self.ingest_with_retry(job, toolchain, bytes, container_hint)?;
        job.set_state(JobState::Ingested);

        emit_stage("separate");
        let stems = separate(self.model(), &waveform, &self.options.separate_options())
            .stage(Stage::Separate)?;
        job.set_state(JobState::Separated);

        emit_stage("mix");
        let instrumental = mix(&stems, &self.options.mix).stage(Stage::Mix)?;
        let vocals = if self.options.keep_vocals {
            Some(mix(&stems, &MixSpec::stem("vocals")).stage(Stage::Mix)?)
        } else {
            None
        };
        job.set_state(JobState::Mixed);

        emit_stage("package");
        let format = self.options.output_format;
        let instrumental = package(&instrumental, format).stage(Stage::Package)?;
        let vocals = vocals
            .map(|v| package(&v, format))
            .transpose()
            .stage(Stage::Package)?;
        job.set_state(JobState::Packaged);

        info!(
            job = job.id(),
            frames = instrumental.frames(),
            bytes = instrumental.len(),
            vocals = vocals.is_some(),
            "instrumental ready"
        );
        Ok(InstrumentalOutput {
            instrumental,
            vocals,
            stems: stems.names().map(str::to_string).collect(),
            duration_secs: waveform.duration_secs(),
        })
    }

    /// A decoder that stopped launching gets one re-resolution and one more try.
    fn ingest_with_retry(
        &self,
        job: &mut JobContext,
        toolchain: ToolchainHandle,
        bytes: &[u8],
        container_hint: Option<&str>,
    ) -> Result<Waveform> {
        match ingest(job, &toolchain, bytes, container_hint, &self.options.ingest) {
            Err(e) if e.is_toolchain_unavailable() => {
                warn!(error = %e, "decoder failed to launch, re-resolving toolchain");
                invalidate_shared();
                let fresh = resolve_shared(&self.resolver).stage(Stage::Toolchain)?;
                job.attach_toolchain(fresh.clone());
                ingest(job, &fresh, bytes, container_hint, &self.options.ingest).stage(Stage::Ingest)
            }
            other => other.stage(Stage::Ingest),
        }
    }
}

/// Load the configured model and strip the vocals from a file on disk.
#[cfg(feature = "onnx")]
pub fn remove_vocals_file(path: &Path, options: PipelineOptions) -> Result<InstrumentalOutput> {
    Separator::from_options(options)?.remove_vocals_path(path)
}
