use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, SeparationError},
    types::{StemSet, Waveform},
};

/// Stems to sum, each with its own gain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MixSpec {
    entries: Vec<(String, f32)>,
}

impl MixSpec {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Everything except vocals: drums, bass and other at unity gain.
    pub fn instrumental() -> Self {
        Self::new().with("drums", 1.0).with("bass", 1.0).with("other", 1.0)
    }

    pub fn stem(name: impl Into<String>) -> Self {
        Self::new().with(name, 1.0)
    }

    pub fn with(mut self, name: impl Into<String>, gain: f32) -> Self {
        self.entries.push((name.into(), gain));
        self
    }

    pub fn entries(&self) -> &[(String, f32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MixSpec {
    fn default() -> Self {
        Self::instrumental()
    }
}

/// Weighted per-sample sum of the selected stems. No clipping is applied.
pub fn mix(stems: &StemSet, spec: &MixSpec) -> Result<Waveform> {
    let (first_name, _) = spec
        .entries
        .first()
        .ok_or_else(|| SeparationError::InvalidMixSpec("no stems selected".into()))?;

    let lookup = |name: &str| {
        stems.get(name).ok_or_else(|| {
            SeparationError::InvalidMixSpec(format!(
                "unknown stem `{name}`, available: {}",
                stems.names().collect::<Vec<_>>().join(", ")
            ))
        })
    };

    let reference = lookup(first_name)?;
    let shape = reference.shape();
    let rate = reference.sample_rate();
    let mut out = Array2::<f32>::zeros(shape);

    for (name, gain) in &spec.entries {
        let stem = lookup(name)?;
        if stem.shape() != shape || stem.sample_rate() != rate {
            return Err(SeparationError::InvalidMixSpec(format!(
                "stem `{name}` is {:?}@{}Hz, expected {:?}@{}Hz",
                stem.shape(),
                stem.sample_rate(),
                shape,
                rate
            )));
        }
        out.scaled_add(*gain, &stem.samples());
    }

    debug!(stems = spec.entries.len(), frames = shape.1, "mixed");
    Waveform::new(out, rate)
}
