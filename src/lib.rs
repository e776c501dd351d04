use std::path::PathBuf;
use prost::DecodeError;

pub mod config;
pub mod download;
pub mod state_dict;
pub mod architecture;
pub mod cellpose_sam;
pub mod export;
pub mod inference;

pub use config::ExportConfig;
pub use download::{HttpTransport, Transport};
pub use export::{verify_export, ExportSummary};
pub use inference::{check_exported_model, CellposeSession, InferenceCheck};

use crate::cellpose_sam::CellposeSam;
use crate::download::acquire_checkpoint;
use crate::export::{export_model, OnnxExporter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GET {url} returned status {status}")]
    HttpStatus {
        url: String,
        status: u16,
    },
    #[error("Checkpoint read error: {0}")]
    Checkpoint(#[from] candle_core::Error),
    #[error("Graph build error: {0}")]
    Graph(#[from] onnx_graph::Error),
    #[error("Unrecognized checkpoint container: {0}")]
    UnknownCheckpointFormat(PathBuf),
    #[error("Parameter {name} has shape {found:?} in checkpoint, model declares {expected:?}")]
    ParameterShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Model expects input of shape {expected:?}, got {found:?}")]
    InputResolutionMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Model produced {found} outputs, {expected} names were given")]
    OutputCountMismatch {
        expected: usize,
        found: usize,
    },
    #[error("Serialized model is {0} bytes, over the protobuf limit; use BinFile weight storage")]
    ModelTooLarge(usize),
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("Model decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("ONNX runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),
}

/// Ensures the checkpoint is on disk, writes the ONNX model and returns its interface.
pub fn run(config: &ExportConfig, transport: &dyn Transport) -> Result<ExportSummary, Error> {
    acquire_checkpoint(transport, &config.checkpoint_url, &config.checkpoint_path, config.download_chunk_size)?;
    let mut model = CellposeSam::from_config(config)?;
    let outcome = export_model(&mut model, config, &OnnxExporter)?;
    let report = &outcome.load_report;
    log::info!(
        "Loaded {} parameters ({} missing, {} unexpected)",
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    Ok(outcome.summary)
}
