use std::path::Path;
use std::sync::Arc;
use prost::Message;
use onnx_graph::onnx::{self, ModelProto};
use onnx_graph::tensor::{DType, InputTensor, Shape, Tensor};
use onnx_graph::weights::WeightManager;
use onnx_graph::{build_proto, WeightStorageStrategy};
use crate::architecture::{load_state_dict, Architecture, LoadReport};
use crate::config::ExportConfig;
use crate::state_dict::StateDict;
use crate::Error;

/// Key of the JSON blob written into the model's `metadata_props`.
pub const METADATA_KEY: &str = "cpsam_export_metadata";

/// Protobuf messages cannot exceed 2 GiB.
const PROTOBUF_LIMIT: usize = i32::MAX as usize;

/// Everything an exporter needs besides the model itself.
#[derive(Debug, Clone)]
pub struct ExportRequest<'a> {
    pub input_name: &'a str,
    pub input_shape: Vec<usize>,
    pub output_names: &'a [String],
    pub output_path: &'a Path,
    pub opset_version: i64,
    pub weight_storage: &'a WeightStorageStrategy,
}

impl<'a> ExportRequest<'a> {
    pub fn from_config(config: &'a ExportConfig) -> Self {
        Self {
            input_name: &config.input_name,
            input_shape: config.input_shape(),
            output_names: &config.output_names,
            output_path: &config.output_path,
            opset_version: config.opset_version,
            weight_storage: &config.weight_storage,
        }
    }
}

pub trait GraphExporter {
    fn export<A: Architecture, W: WeightManager>(&self, architecture: &A, weights: &W, request: &ExportRequest) -> Result<ExportSummary, Error>;
}

/// Traces the architecture on a symbolic input and writes an ONNX model.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxExporter;

impl GraphExporter for OnnxExporter {
    fn export<A: Architecture, W: WeightManager>(&self, architecture: &A, weights: &W, request: &ExportRequest) -> Result<ExportSummary, Error> {
        let input: Arc<dyn Tensor> = InputTensor::new(request.input_name.to_string(), DType::F32, Shape::from(request.input_shape.clone()));
        let outputs = architecture.forward(weights, input.clone())?;
        if outputs.len() != request.output_names.len() {
            return Err(Error::OutputCountMismatch {
                expected: request.output_names.len(),
                found: outputs.len(),
            });
        }
        let outputs: Vec<(String, Arc<dyn Tensor>)> = request.output_names.iter().cloned().zip(outputs).collect();

        log::info!("Built graph, exporting...");
        let metadata = vec![(METADATA_KEY.to_string(), serde_json::to_string(&architecture.export_metadata())?)];
        let model = build_proto(&[input], &outputs, request.weight_storage, request.opset_version, &metadata)?;

        let encoded_len = model.encoded_len();
        if encoded_len > PROTOBUF_LIMIT {
            return Err(Error::ModelTooLarge(encoded_len));
        }
        let summary = ExportSummary::from_model(&model)?;
        std::fs::write(request.output_path, model.encode_to_vec())?;
        log::info!("Export complete: {}", request.output_path.display());
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub load_report: LoadReport,
    pub summary: ExportSummary,
}

/// Loads the checkpoint named by `config` into `architecture` non-strictly, switches it to
/// inference mode and hands it to `exporter` once.
pub fn export_model<A: Architecture, E: GraphExporter>(architecture: &mut A, config: &ExportConfig, exporter: &E) -> Result<ExportOutcome, Error> {
    log::info!("Detected {}.", architecture.description());
    log::info!("Exporting as {}...", architecture.export_label());
    let state = StateDict::open(&config.checkpoint_path)?;
    log::debug!("Checkpoint holds {} tensors ({})", state.len(), state.format());
    let (weights, load_report) = load_state_dict(architecture, &state)?;
    architecture.eval();
    let summary = exporter.export(architecture, &weights, &ExportRequest::from_config(config))?;
    Ok(ExportOutcome { load_report, summary })
}

/// Name and static shape of a graph input or output. Symbolic dims read as -1.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSignature {
    pub name: String,
    pub shape: Vec<i64>,
}

impl From<&onnx::ValueInfoProto> for TensorSignature {
    fn from(value: &onnx::ValueInfoProto) -> Self {
        let shape: Vec<i64> = match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
            Some(onnx::type_proto::Value::TensorType(tensor)) => tensor.shape.as_ref()
                .map(|shape| shape.dim.iter().map(|dim| match dim.value {
                    Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)) => v,
                    _ => -1,
                }).collect())
                .unwrap_or_default(),
            None => vec![],
        };
        Self { name: value.name.clone(), shape }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub node_count: usize,
    pub initializer_count: usize,
    pub opset_version: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl ExportSummary {
    pub fn from_model(model: &ModelProto) -> Result<Self, Error> {
        let metadata = model.metadata_props.iter()
            .find(|entry| entry.key == METADATA_KEY)
            .map(|entry| serde_json::from_str(&entry.value))
            .transpose()?;
        let graph = model.graph.as_ref();
        Ok(Self {
            inputs: graph.map(|g| g.input.iter().map(TensorSignature::from).collect()).unwrap_or_default(),
            outputs: graph.map(|g| g.output.iter().map(TensorSignature::from).collect()).unwrap_or_default(),
            node_count: graph.map_or(0, |g| g.node.len()),
            initializer_count: graph.map_or(0, |g| g.initializer.len()),
            opset_version: model.opset_import.iter().find(|x| x.domain.is_empty()).map(|x| x.version),
            metadata,
        })
    }
}

/// Decodes a written model and reports its interface.
pub fn verify_export(path: &Path) -> Result<ExportSummary, Error> {
    let bytes = std::fs::read(path)?;
    ExportSummary::from_model(&ModelProto::decode(bytes.as_slice())?)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use super::*;
    use crate::cellpose_sam::CellposeSam;
    use crate::cellpose_sam::tests::{tiny_model, tiny_vit};
    use crate::state_dict::tests::write_safetensors;

    #[derive(Debug, PartialEq)]
    struct ExportCall {
        input_name: String,
        input_shape: Vec<usize>,
        output_names: Vec<String>,
        training: bool,
        parameter_count: usize,
    }

    #[derive(Default)]
    struct RecordingExporter {
        calls: RefCell<Vec<ExportCall>>,
    }

    impl GraphExporter for RecordingExporter {
        fn export<A: Architecture, W: WeightManager>(&self, architecture: &A, weights: &W, request: &ExportRequest) -> Result<ExportSummary, Error> {
            self.calls.borrow_mut().push(ExportCall {
                input_name: request.input_name.to_string(),
                input_shape: request.input_shape.clone(),
                output_names: request.output_names.to_vec(),
                training: architecture.is_training(),
                parameter_count: weights.get_tensor_names().len(),
            });
            Ok(ExportSummary::default())
        }
    }

    fn config_in(dir: &tempfile::TempDir) -> ExportConfig {
        ExportConfig {
            checkpoint_path: dir.path().join("cpsam.pth"),
            output_path: dir.path().join("cellpose_cpsam.onnx"),
            ..ExportConfig::default()
        }
    }

    fn tiny_config_in(dir: &tempfile::TempDir) -> ExportConfig {
        ExportConfig {
            vit: Some(tiny_vit()),
            image_size: 32,
            ..config_in(dir)
        }
    }

    #[test]
    fn exporter_is_called_once_with_fixed_interface() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        write_safetensors(&config.checkpoint_path, &[("module.diam_mean", vec![1], 30.0)]);

        let mut model = CellposeSam::from_config(&config).unwrap();
        let exporter = RecordingExporter::default();
        let outcome = export_model(&mut model, &config, &exporter).unwrap();

        assert_eq!(outcome.load_report.loaded, vec!["diam_mean"]);
        assert_eq!(*exporter.calls.borrow(), vec![ExportCall {
            input_name: "input".to_string(),
            input_shape: vec![1, 3, 256, 256],
            output_names: vec!["output".to_string(), "style".to_string()],
            training: false,
            parameter_count: model.parameters().len(),
        }]);
    }

    #[test]
    fn missing_checkpoint_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let mut model = CellposeSam::from_config(&config).unwrap();
        let exporter = RecordingExporter::default();

        assert!(matches!(export_model(&mut model, &config, &exporter), Err(Error::Io(_))));
        assert!(exporter.calls.borrow().is_empty());
    }

    #[test]
    fn onnx_exporter_writes_decodable_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config_in(&dir);
        write_safetensors(&config.checkpoint_path, &[("module.encoder.pos_embed", vec![1, 4, 4, 16], 0.5)]);

        let mut model = tiny_model();
        let outcome = export_model(&mut model, &config, &OnnxExporter).unwrap();
        let summary = verify_export(&config.output_path).unwrap();
        assert_eq!(summary, outcome.summary);

        assert_eq!(summary.inputs, vec![TensorSignature { name: "input".to_string(), shape: vec![1, 3, 32, 32] }]);
        assert_eq!(summary.outputs, vec![
            TensorSignature { name: "output".to_string(), shape: vec![1, 3, 32, 32] },
            TensorSignature { name: "style".to_string(), shape: vec![1, 256] },
        ]);
        assert_eq!(summary.opset_version, Some(18));
        assert!(summary.node_count > 0);
        // diam_labels and diam_mean never reach the graph
        assert_eq!(summary.initializer_count, model.parameters().len() - 2);
        let metadata = summary.metadata.unwrap();
        assert_eq!(metadata["architecture"], "cellpose_sam");
        assert_eq!(metadata["image_size"], 32);
    }

    #[test]
    fn node_names_stay_apart_from_value_names() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config_in(&dir);
        write_safetensors(&config.checkpoint_path, &[("module.encoder.pos_embed", vec![1, 4, 4, 16], 0.5)]);
        export_model(&mut tiny_model(), &config, &OnnxExporter).unwrap();

        let bytes = std::fs::read(&config.output_path).unwrap();
        let graph = ModelProto::decode(bytes.as_slice()).unwrap().graph.unwrap();
        let mut values: HashSet<&str> = graph.input.iter().chain(&graph.output).chain(&graph.value_info).map(|v| v.name.as_str()).collect();
        values.extend(graph.initializer.iter().map(|i| i.name.as_str()));
        values.extend(graph.node.iter().flat_map(|n| n.output.iter().map(|o| o.as_str())));

        let mut node_names = HashSet::new();
        for node in &graph.node {
            assert!(!values.contains(node.name.as_str()), "node {} shares a value name", node.name);
            assert!(node_names.insert(node.name.as_str()), "node name {} repeated", node.name);
        }
        assert!(node_names.contains("/encoder/pos_embed/Add"));
        assert!(node_names.contains("/W2/ConvTranspose"));
        assert!(node_names.contains("/style/RandomNormal"));
        assert!(node_names.contains("/encoder/blocks/0/attn/qkv/Add"));
    }

    #[test]
    fn output_name_count_must_match_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config_in(&dir);
        config.output_names = vec!["output".to_string()];
        write_safetensors(&config.checkpoint_path, &[("W2", vec![192, 3, 8, 8], 0.0)]);

        let mut model = tiny_model();
        let result = export_model(&mut model, &config, &OnnxExporter);
        assert!(matches!(result, Err(Error::OutputCountMismatch { expected: 1, found: 2 })));
        assert!(!config.output_path.exists());
    }

    #[test]
    fn bin_file_storage_writes_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config_in(&dir);
        config.weight_storage = WeightStorageStrategy::BinFile(dir.path().join("cellpose_cpsam.bin"));
        write_safetensors(&config.checkpoint_path, &[("W2", vec![192, 3, 8, 8], 0.0)]);

        let mut model = tiny_model();
        export_model(&mut model, &config, &OnnxExporter).unwrap();
        let side = std::fs::metadata(dir.path().join("cellpose_cpsam.bin")).unwrap();
        assert!(side.len() > 0);
        let model_len = std::fs::metadata(&config.output_path).unwrap().len();
        assert!(model_len < side.len());
    }
}
