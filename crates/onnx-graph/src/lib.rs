pub mod operators;
pub mod weights;
pub mod tensor;
mod node;
pub mod pytorch;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tensor::*;
pub use node::Node;
use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightExternalOutputManager};

pub mod onnx {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape error: {0}")]
    InputShapeError(String),
    #[error("DType mismatch: {0} vs {1}")]
    DTypeMismatchError(DType, DType),
    #[error("Invalid input: {0}")]
    InvalidInputError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Unsupported dtype")]
    UnsupportedDTypeError,
    #[error("Tensor name {0} requested twice")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension has no concrete value")]
    UnresolvedDimensionError,
    #[error("Invalid dtype for this operand")]
    InvalidDTypeError,
    #[error("Operand is not a constant")]
    CannotResolveDataError,
    #[error("Invalid einsum equation: {0}")]
    InvalidEquationError(String),
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
    #[error(transparent)]
    SafeTensorError(#[from] safetensors::SafeTensorError),
}

/// Where initializer data goes when a graph is written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum WeightStorageStrategy {
    /// Raw data inside the model proto.
    #[default]
    EmbeddedData,
    /// ONNX external data in a side file, referenced by file name.
    BinFile(PathBuf),
}

enum Visit<'a> {
    Enter(&'a dyn Tensor),
    Exit(&'a dyn Node),
}

/// Walks back from the outputs, returning tensors in discovery order and nodes in
/// dependency order.
fn collect_graph<'a>(outputs: &'a [(String, Arc<dyn Tensor>)]) -> (Vec<&'a dyn Tensor>, Vec<&'a dyn Node>) {
    let mut seen_tensors: HashSet<&dyn Tensor> = HashSet::new();
    let mut seen_nodes: HashSet<&dyn Node> = HashSet::new();
    let mut tensors = vec![];
    let mut nodes = vec![];

    let mut stack: Vec<Visit> = outputs.iter().rev().map(|(_, t)| Visit::Enter(t.as_ref())).collect();
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(tensor) => {
                if !seen_tensors.insert(tensor) {
                    continue;
                }
                tensors.push(tensor);
                if let Some(node) = tensor.producer() {
                    if seen_nodes.insert(node) {
                        stack.push(Visit::Exit(node));
                        for input in node.get_input_tensors().into_iter().rev() {
                            stack.push(Visit::Enter(input));
                        }
                    }
                }
            }
            Visit::Exit(node) => nodes.push(node),
        }
    }
    (tensors, nodes)
}

pub fn build_proto(
    inputs: &[Arc<dyn Tensor>],
    outputs: &[(String, Arc<dyn Tensor>)],
    output_method: &WeightStorageStrategy,
    opset_version: i64,
    metadata_props: &[(String, String)],
) -> Result<onnx::ModelProto, Error> {
    let (tensors, nodes) = collect_graph(outputs);

    // Assign names to all tensors in graph
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();

    for (name, tensor) in outputs {
        if tensor_names.contains_key(&tensor.as_ref()) || !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name.clone()));
        }
        tensor_names.insert(tensor.as_ref(), name.clone());
    }
    // Assign requested names
    for tensor in &tensors {
        if tensor_names.contains_key(tensor) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            let name = name.to_string();
            if !chosen_names.insert(name.clone()) {
                return Err(Error::NameConflictError(name));
            }
            tensor_names.insert(*tensor, name);
        }
    }
    // Assign remaining names
    let mut next_tensor_id = 0;
    for tensor in &tensors {
        if !tensor_names.contains_key(tensor) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(*tensor, name);
        }
    }

    let mut graph_inputs = vec![];
    for input in inputs {
        let name = tensor_names.get(&input.as_ref())
            .ok_or_else(|| Error::NoSuchTensorError(input.get_name().unwrap_or("<unnamed>").to_string()))?;
        graph_inputs.push(input.to_value_info_proto(name.clone()));
    }

    // Gather tensor weights
    let mut data_manager: Box<dyn WeightExternalOutputManager<'_> + '_> = match output_method {
        WeightStorageStrategy::EmbeddedData => Box::new(EmbeddedOutputManager::new()),
        WeightStorageStrategy::BinFile(path) => Box::new(BinOutputManager::new(path)?),
    };
    for &tensor in &tensors {
        tensor.gather_weights(data_manager.as_mut())?;
    }
    data_manager.finalize_tensor_data()?;

    // Generate initializer blocks
    let mut initializers = vec![];
    let mut value_info = vec![];
    for &tensor in &tensors {
        let name = tensor_names[&tensor].clone();
        let is_graph_input = inputs.iter().any(|t| t.as_ref() == tensor);
        let is_graph_output = outputs.iter().any(|(_, t)| t.as_ref() == tensor);
        if let Some(initializer) = tensor.get_initializer(name.clone(), data_manager.as_mut())? {
            initializers.push(initializer);
        } else if tensor.is_input() && !is_graph_input {
            return Err(Error::InvalidInputError(format!("tensor {name} is neither a declared input nor an initializer")));
        } else if !is_graph_input && !is_graph_output {
            value_info.push(tensor.to_value_info_proto(name));
        }
    }

    // Node names share one namespace with value names for many loaders
    let mut node_protos = vec![];
    let mut node_names: HashSet<String> = chosen_names.clone();
    for node in &nodes {
        let base = node.get_name().map(|x| x.to_string()).unwrap_or_else(|| node.get_onnx_type().to_string());
        let mut name = base.clone();
        let mut suffix = 1;
        while !node_names.insert(name.clone()) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        node_protos.push(node.to_node_proto(Some(name), &tensor_names)?);
    }

    let graph = onnx::GraphProto {
        name: "main_graph".to_string(),
        node: node_protos,
        initializer: initializers,
        doc_string: String::new(),
        input: graph_inputs,
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.clone())).collect(),
        value_info,
        metadata_props: vec![],
    };

    Ok(onnx::ModelProto {
        ir_version: onnx::Version::IrVersion2024325 as i64,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        producer_name: "onnx-graph".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        domain: String::new(),
        model_version: 0,
        doc_string: String::new(),
        graph: Some(graph),
        metadata_props: metadata_props.iter().map(|(key, value)| onnx::StringStringEntryProto {
            key: key.clone(),
            value: value.clone(),
        }).collect(),
    })
}
