//! Inception v3 feature extractor, generated from `models/inception_v3.onnx` at build time.
//!
//! The graph is expected to take `[N, 3, 299, 299]` images in `[-1, 1]` and return the
//! pool features `[N, 2048]` followed by the class logits `[N, K]`.

use std::path::Path;

use burn::{module::Module, tensor::backend::Backend, tensor::Tensor};

use crate::{
    checkpoint::CheckpointRecorder,
    error::{GanError, Result},
    eval::{ClassifierOutput, FeatureClassifier},
};

#[allow(clippy::all, dead_code, unused_imports)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/model/inception_v3.rs"));
}

pub struct InceptionClassifier<B: Backend> {
    model: generated::Model<B>,
}

impl<B: Backend> InceptionClassifier<B> {
    /// Loads weights from the `.mpk` record next to `path`.
    pub fn load(path: &Path, device: &B::Device) -> Result<Self> {
        let model = generated::Model::new(device)
            .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)
            .map_err(|e| {
                GanError::Classifier(format!("cannot load {}: {e}", path.display()))
            })?;
        tracing::info!(path = %path.display(), "inception classifier loaded");
        Ok(Self { model })
    }
}

impl<B: Backend> FeatureClassifier<B> for InceptionClassifier<B> {
    fn classify(&self, images: Tensor<B, 4>) -> Result<ClassifierOutput<B>> {
        let (pool, logits) = self.model.forward(images);
        Ok(ClassifierOutput { pool, logits })
    }
}
