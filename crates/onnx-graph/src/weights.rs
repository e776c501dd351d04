use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::Metadata;
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{DType, Shape, Tensor, TensorData};

pub trait WeightExternalOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error>;
    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct EmbeddedOutputManager<'a> {
    tensor_data_map: HashMap<&'a dyn Tensor, TensorData>,
}

impl<'a> EmbeddedOutputManager<'a> {
    pub fn new() -> Self {
        Self {
            tensor_data_map: HashMap::new(),
        }
    }
}

impl Default for EmbeddedOutputManager<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl <'a> WeightExternalOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_data: TensorData) -> Result<(), Error> {
        self.tensor_data_map.insert(graph_tensor, tensor_data);
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some(tensor_data) = self.tensor_data_map.remove(&graph_tensor) {
            Ok(Some(tensor_data.to_tensor_data_proto(Some(tensor_name))?))
        }
        else {
            Ok(None)
        }
    }
}

/// Writes every weight into one side file and emits initializers that point at it
/// through ONNX external data.
pub struct BinOutputManager<'a> {
    output: BufWriter<File>,
    location: String,
    offset: usize,
    tensor_data_map: HashMap<&'a dyn Tensor, (usize, usize)>,
    finalized: bool
}

impl<'a> BinOutputManager<'a> {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let location = output_location.file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidInputError(format!("external data path {} has no file name", output_location.display())))?
            .to_string();
        let output = BufWriter::new(File::create(output_location)?);
        Ok(Self {
            output,
            location,
            offset: 0,
            tensor_data_map: HashMap::new(),
            finalized: false
        })
    }
}

impl<'a> WeightExternalOutputManager<'a> for BinOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: TensorData) -> Result<(), Error> {
        let data = data.to_raw_encoding();
        self.output.write_all(&data)?;
        self.tensor_data_map.insert(graph_tensor, (self.offset, data.len()));
        self.offset += data.len();
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if !self.finalized {
            return Err(Error::InvalidInputError("external data requested before the weight file was finalized".to_string()));
        }
        if let Some((byte_offset, byte_len)) = self.tensor_data_map.remove(&graph_tensor) {
            let external_data = vec![
                onnx::StringStringEntryProto {
                    key: "location".to_string(),
                    value: self.location.clone(),
                },
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{byte_len}"),
                }
            ];
            Ok(Some(TensorProto {
                name: tensor_name,
                data_type: onnx::tensor_proto::DataType::from(graph_tensor.dtype()) as i32,
                dims: graph_tensor.shape().resolve()?.iter().map(|x| *x as i64).collect(),
                data_location: onnx::tensor_proto::DataLocation::External as i32,
                external_data,
                .. Default::default()
            }))
        }
        else {
            Ok(None)
        }
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        self.finalized = true;
        Ok(())
    }
}

/// A checkpoint tensor inside a PyTorch zip pickle, read only when the graph is written.
pub struct PthTensor {
    name: String,
    tensor_info: candle_core::pickle::TensorInfo,
    tensors: Arc<candle_core::pickle::PthTensors>,
    data_type: DType,
    shape: Shape
}

impl PthTensor {
    /// `name` is the graph-visible name; `tensor_info.name` stays the key inside the archive.
    pub fn new(name: String, tensor_info: candle_core::pickle::TensorInfo, tensors: Arc<candle_core::pickle::PthTensors>) -> Result<Arc<Self>, Error> {
        let data_type = DType::from_candle(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.layout.shape());
        Ok(Arc::new(Self {
            name,
            tensors,
            shape,
            tensor_info,
            data_type
        }))
    }
}

impl Tensor for PthTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        let tensor = self.tensors.get(&self.tensor_info.name)?
            .ok_or_else(|| Error::NoSuchTensorError(self.tensor_info.name.clone()))?;
        manager.write_tensor_data(self, TensorData::from_candle_tensor(tensor)?)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// A memory-mapped safetensors file and its parsed header.
pub struct SafetensorsFile {
    mmap: Mmap,
    metadata: Metadata
}

impl SafetensorsFile {
    pub fn open(path: &Path) -> Result<Arc<Self>, Error> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (_, metadata) = SafeTensors::read_metadata(&mmap)?;
        Ok(Arc::new(Self { mmap, metadata }))
    }

    pub fn tensor_shapes(&self) -> Vec<(String, DType, Shape)> {
        let mut out = vec![];
        for (name, info) in self.metadata.tensors() {
            if let Ok(dtype) = DType::from_safetensors(info.dtype) {
                out.push((name, dtype, Shape::from(info.shape.clone())));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn load(&self, key: &str) -> Result<TensorData, Error> {
        let st = SafeTensors::deserialize(&self.mmap)?;
        TensorData::from_safetensors_view(st.tensor(key)?)
    }
}

pub struct SafetensorsTensor {
    name: String,
    key: String,
    file: Arc<SafetensorsFile>,
    data_type: DType,
    shape: Shape
}

impl SafetensorsTensor {
    pub fn new(name: String, file: Arc<SafetensorsFile>, key: &str) -> Result<Arc<Self>, Error> {
        let tensor_info = file.metadata.info(key).ok_or_else(|| Error::NoSuchTensorError(key.to_string()))?;
        let data_type = DType::from_safetensors(tensor_info.dtype)?;
        let shape = Shape::from(tensor_info.shape.clone());
        Ok(Arc::new(Self {
            name,
            key: key.to_string(),
            file,
            data_type,
            shape
        }))
    }
}

impl Tensor for SafetensorsTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_tensor_data(self, self.file.load(&self.key)?)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub enum TensorInit {
    Fill(f32),
    /// Ones on the diagonal of `[dim0, product(rest)]`.
    Identity,
}

/// A weight with no checkpoint backing. Values are only generated when the graph is written.
pub struct InitializerTensor {
    name: String,
    shape: Shape,
    init: TensorInit
}

impl InitializerTensor {
    pub fn new(name: String, shape: Shape, init: TensorInit) -> Result<Arc<Self>, Error> {
        shape.resolve()?;
        Ok(Arc::new(Self { name, shape, init }))
    }

    pub fn generate(&self) -> Result<TensorData, Error> {
        match &self.init {
            TensorInit::Fill(value) => TensorData::fill(self.shape.clone(), *value),
            TensorInit::Identity => {
                let dims = self.shape.resolve()?;
                let rows = dims.first().copied().unwrap_or(1);
                let cols: usize = dims.iter().skip(1).product();
                let mut values = vec![0f32; rows * cols];
                for i in 0..rows.min(cols) {
                    values[i * cols + i] = 1.0;
                }
                TensorData::new(values.into(), self.shape.clone())
            }
        }
    }
}

impl Tensor for InitializerTensor {
    fn dtype(&self) -> DType {
        DType::F32
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_tensor_data(self, self.generate()?)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

pub fn join_prefix(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string()
    }
}

pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self;
    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
    fn get_prefix_tail(&self) -> Option<&str>;
    fn get_prefix(&self) -> Option<&str>;
    fn get_tensor_names(&self) -> Vec<String>;
}
