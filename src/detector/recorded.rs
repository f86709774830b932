use anyhow::{Context, Result, anyhow};
use std::path::Path;

use super::{DetectionEngine, InferenceFuture, InputTensor, ModelOutput};

/// Replays a detector output captured from the model as JSON.
#[derive(Debug, Clone)]
pub struct RecordedDetector {
    output: ModelOutput,
}

impl RecordedDetector {
    pub fn new(output: ModelOutput) -> Self {
        Self { output }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let output: ModelOutput =
            serde_json::from_str(json).with_context(|| "failed to parse detector output")?;
        Ok(Self::new(output))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detector output: {}", path.display()))?;
        Self::from_json(&json)
    }
}

impl DetectionEngine for RecordedDetector {
    fn infer<'a>(&'a self, tensor: &'a InputTensor) -> InferenceFuture<'a> {
        Box::pin(async move {
            if tensor.data.len() != tensor.shape.iter().product::<usize>() {
                return Err(anyhow!(
                    "input tensor has {} values for shape {:?}",
                    tensor.data.len(),
                    tensor.shape
                ));
            }
            Ok(self.output.clone())
        })
    }
}
