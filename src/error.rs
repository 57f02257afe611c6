use std::fmt;
use thiserror::Error;

/// Why the decoder/prober pair could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolchainFailure {
    /// No candidate binaries were located anywhere in the resolution chain.
    NotFound,
    /// Binaries exist but failed to run or answer the version query.
    NotExecutable,
}

impl fmt::Display for ToolchainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolchainFailure::NotFound => f.write_str("not found"),
            ToolchainFailure::NotExecutable => f.write_str("found but not executable"),
        }
    }
}

/// Pipeline stage that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Toolchain,
    Model,
    Ingest,
    Separate,
    Mix,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Toolchain => "toolchain",
            Stage::Model => "model",
            Stage::Ingest => "ingest",
            Stage::Separate => "separate",
            Stage::Mix => "mix",
            Stage::Package => "package",
        };
        f.write_str(s)
    }
}

/// Central error type for the instrumental-core crate.
#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("Toolchain unavailable ({failure}): {detail}")]
    ToolchainUnavailable {
        failure: ToolchainFailure,
        detail: String,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid mix spec: {0}")]
    InvalidMixSpec(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Model acquisition
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Checksum mismatch for {path}")]
    Checksum { path: String },

    #[error("Cache dir not available")]
    CacheDirUnavailable,

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<SeparationError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic fallback
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Error classification that survives stage wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ToolchainUnavailable(ToolchainFailure),
    Decode,
    Inference,
    ResourceExhausted,
    InvalidMixSpec,
    Encode,
    InvalidConfig,
    Model,
    Io,
    Other,
}

impl SeparationError {
    pub fn toolchain(failure: ToolchainFailure, detail: impl Into<String>) -> Self {
        SeparationError::ToolchainUnavailable {
            failure,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SeparationError::ToolchainUnavailable { failure, .. } => {
                ErrorKind::ToolchainUnavailable(*failure)
            }
            SeparationError::Decode(_) => ErrorKind::Decode,
            SeparationError::Inference(_) => ErrorKind::Inference,
            SeparationError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SeparationError::InvalidMixSpec(_) => ErrorKind::InvalidMixSpec,
            SeparationError::Encode(_) => ErrorKind::Encode,
            SeparationError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SeparationError::Registry(_)
            | SeparationError::Manifest(_)
            | SeparationError::Checksum { .. }
            | SeparationError::CacheDirUnavailable => ErrorKind::Model,
            SeparationError::Stage { source, .. } => source.kind(),
            SeparationError::Io(_) => ErrorKind::Io,
            SeparationError::Anyhow(_) => ErrorKind::Other,
        }
    }

    /// Innermost stage recorded on this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SeparationError::Stage { stage, source } => source.stage().or(Some(*stage)),
            _ => None,
        }
    }

    pub fn is_toolchain_unavailable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ToolchainUnavailable(_))
    }

    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            // Already attributed; keep the innermost stage.
            e @ SeparationError::Stage { .. } => e,
            e => SeparationError::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }
}

/// Attach the failing pipeline stage to a result.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| e.in_stage(stage))
    }
}

// --- From conversions for common errors ---
impl From<serde_json::Error> for SeparationError {
    fn from(e: serde_json::Error) -> Self {
        SeparationError::Anyhow(e.into())
    }
}

impl From<reqwest::Error> for SeparationError {
    fn from(e: reqwest::Error) -> Self {
        SeparationError::Anyhow(e.into())
    }
}

impl From<hex::FromHexError> for SeparationError {
    fn from(e: hex::FromHexError) -> Self {
        SeparationError::Anyhow(e.into())
    }
}

pub type Result<T> = std::result::Result<T, SeparationError>;
