use thiserror::Error;

use crate::features::FeatureQueryError;
use crate::services::{MailError, StorageError, WarehouseError};
use crate::training::{DatasetError, FitError};

/// Errors that end a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Feature-build parameters could not be rendered into a query.
    #[error("feature query rejected: {0}")]
    FeatureQuery(#[from] FeatureQueryError),
    /// The warehouse failed the feature build.
    #[error("feature build failed: {0}")]
    FeatureBuild(#[source] WarehouseError),
    /// The feature table could not be read.
    #[error("loading feature table failed: {0}")]
    Load(#[source] WarehouseError),
    /// The feature table does not have the expected shape or values.
    #[error("feature table unusable: {0}")]
    DataShape(#[from] DatasetError),
    /// The regression could not be fitted.
    #[error("model fit failed: {0}")]
    Fit(#[from] FitError),
    /// An artifact could not be serialized.
    #[error("serializing {artifact} failed: {source}")]
    Serialize {
        /// Artifact name.
        artifact: &'static str,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Local scratch space could not be used.
    #[error("scratch directory error: {0}")]
    Io(#[from] std::io::Error),
    /// An artifact upload failed; objects from earlier runs are left as they were.
    #[error("artifact upload failed: {0}")]
    Upload(#[from] StorageError),
}

impl PipelineError {
    /// Step the error belongs to.
    #[must_use]
    pub const fn step(&self) -> &'static str {
        match self {
            Self::FeatureQuery(_) | Self::FeatureBuild(_) => "build_features",
            _ => "train_model",
        }
    }
}

/// A notification step that did not complete.
#[derive(Debug, Error)]
#[error("{step} failed: {source}")]
pub struct NotificationError {
    /// Step name.
    pub step: &'static str,
    /// Underlying error.
    #[source]
    pub source: MailError,
}
