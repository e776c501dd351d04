use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightExternalOutputManager;
use core::fmt;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(value as i64)),
                None => value.name.as_ref().map(|name| onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone()))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || if let (Some(a), Some(b)) = (self.value, other.value) {a == b} else {false}
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        }
        else if let Some(name) = &self.name {
            write!(f, "{}", name)
        }
        else {
            write!(f, "?")
        }
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        self.dims.iter().map(|dim| dim.resolve()).collect()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Maps a possibly negative axis onto `0..rank`.
    pub fn normalize_axis(&self, axis: i64) -> Result<usize, Error> {
        let rank = self.rank() as i64;
        let axis = if axis < 0 { rank + axis } else { axis };
        if axis < 0 || axis >= rank {
            return Err(Error::InvalidInputError(format!("axis {axis} out of range for rank {rank}")));
        }
        Ok(axis as usize)
    }

    pub fn dim(&self, index: isize) -> &Arc<Dimension> {
        let index = if index < 0 {
            self.rank() - index.unsigned_abs()
        }
        else {
            index as usize
        };
        &self.dims[index]
    }

    pub fn unsqueeze(&self, axis: usize) -> Self {
        let mut new_dims = self.dims.clone();
        new_dims.insert(axis, Dimension::new(Some(1), None, None));
        Self::new(new_dims)
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", "))
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::new(Some(*x), None, None)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64
}

impl DType {
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, Error> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn size(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl core::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: "TENSOR".to_string()
                }
            ),
            .. Default::default()
        }
    }

    /// The node computing this tensor, `None` for graph inputs and weights.
    fn producer(&self) -> Option<&dyn Node> {
        None
    }

    fn gather_weights<'a>(&'a self, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        Ok(())
    }

    fn get_initializer<'a>(&'a self, _name: String, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<onnx::TensorProto>, Error> {
        Ok(None)
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn resolve_data(&self) -> Option<TensorData> {
        None
    }

    fn is_input(&self) -> bool;
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn producer(&self) -> Option<&dyn Node> {
        Some(self)
    }

    fn resolve_data(&self) -> Option<TensorData> {
        self.resolve_output_data()
    }

    fn is_input(&self) -> bool {
        false
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_input(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        if data.len() % dtype.size() != 0 {
            return Err(Error::InvalidInputError(format!("{} bytes is not a whole number of {dtype} elements", data.len())));
        }
        Ok(match dtype {
            DType::F32 => TensorDataValue::F32(data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::F16 => TensorDataValue::F16(data.chunks_exact(2).map(|c| half::f16::from_le_bytes([c[0], c[1]])).collect()),
            DType::BF16 => TensorDataValue::BF16(data.chunks_exact(2).map(|c| half::bf16::from_le_bytes([c[0], c[1]])).collect()),
            DType::I32 => TensorDataValue::I32(data.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::I64 => TensorDataValue::I64(data.chunks_exact(8).map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])).collect()),
        })
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<half::bf16>> for TensorDataValue {
    fn from(value: Vec<half::bf16>) -> Self {
        TensorDataValue::BF16(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i32>> for TensorDataValue {
    fn from(value: Vec<i32>) -> Self {
        TensorDataValue::I32(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError(format!("{} elements do not fill shape {shape}", value.len())));
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_int_vec(&self) -> Result<Vec<i64>, Error> {
        match &self.value {
            TensorDataValue::I32(x) => Ok(x.iter().map(|x| *x as i64).collect()),
            TensorDataValue::I64(x) => Ok(x.clone()),
            _ => Err(Error::InvalidDTypeError),
        }
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            _ => return Err(Error::UnsupportedDTypeError),
        };
        Self::new(value, shape)
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }

    pub fn from_safetensors_view(tensor: safetensors::tensor::TensorView) -> Result<Self, Error> {
        let dtype = DType::from_safetensors(tensor.dtype())?;
        let shape = Shape::from(tensor.shape());
        let value = TensorDataValue::from_raw_encoding(dtype, tensor.data())?;
        Self::new(value, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding_matches_little_endian_layout() {
        let data = TensorData::new(vec![1.0f32, -2.5].into(), Shape::from(vec![2usize])).unwrap();
        let raw = data.to_raw_encoding();
        assert_eq!(raw.len(), 8);
        let decoded = TensorDataValue::from_raw_encoding(DType::F32, &raw).unwrap();
        match decoded {
            TensorDataValue::F32(v) => assert_eq!(v, vec![1.0, -2.5]),
            other => panic!("unexpected dtype {:?}", other.dtype()),
        }
    }

    #[test]
    fn element_count_must_fill_shape() {
        let result = TensorData::new(vec![0i64; 5].into(), Shape::from(vec![2usize, 3]));
        assert!(matches!(result, Err(Error::InvalidInputError(_))));
    }

    #[test]
    fn scalar_shape_holds_one_element() {
        let data = TensorData::new(vec![7i64].into(), Shape::new(vec![])).unwrap();
        assert_eq!(data.shape().rank(), 0);
        assert_eq!(data.to_int_vec().unwrap(), vec![7]);
    }

    #[test]
    fn negative_axes_wrap() {
        let shape = Shape::from(vec![1usize, 3, 8]);
        assert_eq!(shape.normalize_axis(-1).unwrap(), 2);
        assert!(shape.normalize_axis(3).is_err());
        assert_eq!(shape.dim(-2).resolve().unwrap(), 3);
    }
}
