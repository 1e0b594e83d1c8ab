use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BratError {
    #[error("invalid watershed key: {0}")]
    InvalidWatershedKey(String),

    #[error("invalid source identifier: {0} (expected SCHEMA.TABLE)")]
    InvalidSourceId(String),

    #[error("missing config file bcbrat.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("feature source unavailable for {layer}: {message}")]
    SourceUnavailable { layer: String, message: String },

    #[error("feature source returned status {status} for {layer}: {message}")]
    SourceStatus {
        layer: String,
        status: u16,
        message: String,
    },

    #[error("hydrology layer {layer} failed: {message}")]
    PartialHydrologyFailure { layer: String, message: String },

    #[error("elevation request failed: {0}")]
    ElevationHttp(String),

    #[error("elevation service returned status {status}: {message}")]
    ElevationStatus { status: u16, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("raster tool failed: {0}")]
    RasterTool(String),

    #[error("failed to replace raster file: {0}")]
    FileReplacement(String),

    #[error("failed to write project manifest: {0}")]
    ManifestSerialization(String),

    #[error("spatial container error: {0}")]
    SpatialStore(String),

    #[error("coordinate transform failed: {0}")]
    Projection(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BratError {
    /// True for errors raised while fetching a single layer; the pipeline
    /// may skip such layers instead of aborting.
    pub fn is_layer_failure(&self) -> bool {
        matches!(
            self,
            BratError::SourceUnavailable { .. }
                | BratError::SourceStatus { .. }
                | BratError::PartialHydrologyFailure { .. }
        )
    }
}
