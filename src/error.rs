use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GanError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data error: {0}")]
    Data(String),

    /// Non-finite generator loss. Training stops, nothing is retried.
    #[error("model diverged at step {step} with loss = {loss}")]
    Divergence { step: usize, loss: f64 },

    #[error("no checkpoint found under {0}")]
    CheckpointNotFound(PathBuf),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("record error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl GanError {
    pub(crate) fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, GanError>;
