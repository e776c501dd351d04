use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use onnx_graph::pytorch::cast;
use onnx_graph::tensor::{DType, Shape, Tensor};
use onnx_graph::weights::{join_prefix, InitializerTensor, TensorInit, WeightManager};
use crate::state_dict::StateDict;
use crate::Error;

/// Value given to a parameter the checkpoint does not provide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterInit {
    Zeros,
    Ones,
    Constant(f32),
    /// Identity over the leading axis and the flattened rest.
    Identity,
}

impl From<ParameterInit> for TensorInit {
    fn from(value: ParameterInit) -> Self {
        match value {
            ParameterInit::Zeros => TensorInit::Fill(0.0),
            ParameterInit::Ones => TensorInit::Fill(1.0),
            ParameterInit::Constant(x) => TensorInit::Fill(x),
            ParameterInit::Identity => TensorInit::Identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: ParameterInit,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, init: ParameterInit) -> Self {
        Self { name: name.into(), shape, init }
    }
}

/// A network expressed as a graph-building forward pass over named parameters.
pub trait Architecture {
    fn name(&self) -> &str;

    /// Every parameter the forward pass may request, with its default initialization.
    fn parameters(&self) -> Vec<ParameterSpec>;

    /// Switches to inference behaviour.
    fn eval(&mut self);

    fn is_training(&self) -> bool;

    /// Reported when an export starts.
    fn description(&self) -> String {
        format!("{} architecture", self.name())
    }

    /// What the exported graph represents.
    fn export_label(&self) -> String {
        format!("{} model", self.name())
    }

    fn forward<W: WeightManager>(&self, weights: &W, input: Arc<dyn Tensor>) -> Result<Vec<Arc<dyn Tensor>>, Error>;

    /// Extra JSON stored alongside the exported graph.
    fn export_metadata(&self) -> serde_json::Value {
        serde_json::json!({ "architecture": self.name() })
    }
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Declared parameters absent from the checkpoint, left at their default.
    pub missing: Vec<String>,
    /// Checkpoint entries no declared parameter asked for.
    pub unexpected: Vec<String>,
}

/// Declared parameters bound to checkpoint tensors or default initializers.
pub struct ParameterStore {
    prefix_tail: Option<String>,
    prefix: Option<String>,
    tensors: Arc<HashMap<String, Arc<dyn Tensor>>>,
}

impl WeightManager for ParameterStore {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix_tail: Some(name.to_string()),
            prefix: Some(join_prefix(self.prefix.as_deref(), name)),
            tensors: self.tensors.clone(),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, onnx_graph::Error> {
        let name = join_prefix(self.prefix.as_deref(), name);
        self.tensors.get(&name).cloned().ok_or(onnx_graph::Error::NoSuchTensorError(name))
    }

    fn get_prefix_tail(&self) -> Option<&str> {
        self.prefix_tail.as_deref()
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Binds `architecture`'s parameters to `state` by normalized name.
///
/// Missing parameters take their declared default and unexpected checkpoint entries are
/// ignored; both are listed in the returned report. A parameter whose checkpoint shape
/// differs from the declared one is an error.
pub fn load_state_dict<A: Architecture>(architecture: &A, state: &StateDict) -> Result<(ParameterStore, LoadReport), Error> {
    let mut tensors: HashMap<String, Arc<dyn Tensor>> = HashMap::new();
    let mut report = LoadReport::default();
    let mut declared = BTreeSet::new();

    for spec in architecture.parameters() {
        declared.insert(spec.name.clone());
        let tensor: Arc<dyn Tensor> = match state.get(&spec.name) {
            Some(entry) => {
                let found = entry.shape.resolve()?;
                if found != spec.shape {
                    return Err(Error::ParameterShapeMismatch {
                        name: spec.name,
                        expected: spec.shape,
                        found,
                    });
                }
                report.loaded.push(spec.name.clone());
                cast(state.tensor(&spec.name)?, DType::F32)
            }
            None => {
                report.missing.push(spec.name.clone());
                InitializerTensor::new(spec.name.clone(), Shape::from(spec.shape.clone()), spec.init.into())?
            }
        };
        tensors.insert(spec.name, tensor);
    }
    report.unexpected = state.names()
        .filter(|name| !declared.contains(*name))
        .map(|name| name.to_string())
        .collect();

    log::debug!("Loaded {} parameters into {}", report.loaded.len(), architecture.name());
    if !report.missing.is_empty() {
        log::debug!("Missing keys (default initialized): {:?}", report.missing);
    }
    if !report.unexpected.is_empty() {
        log::debug!("Unexpected keys (ignored): {:?}", report.unexpected);
    }

    Ok((ParameterStore { prefix_tail: None, prefix: None, tensors: Arc::new(tensors) }, report))
}
