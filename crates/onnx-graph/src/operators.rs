use std::collections::HashMap;
use std::sync::Arc;
use crate::Error;
use crate::node::{attr_float, attr_int, attr_ints, attr_string, attr_tensor, Node, SingleOutputNode};
use crate::onnx::AttributeProto;
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorData};

fn validate_index_dtype(dtype: DType) -> Result<(), Error> {
    if dtype != DType::I32 && dtype != DType::I64 {
        Err(Error::InvalidDTypeError)?;
    }
    Ok(())
}

fn validate_same_dtype(a: &dyn Tensor, b: &dyn Tensor) -> Result<DType, Error> {
    if a.dtype() != b.dtype() {
        return Err(Error::DTypeMismatchError(a.dtype(), b.dtype()));
    }
    Ok(a.dtype())
}

/// Numpy-style multidirectional broadcast of two shapes.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, Error> {
    let rank = a.rank().max(b.rank());
    let a_offset = rank - a.rank();
    let b_offset = rank - b.rank();
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let a_dim = if i >= a_offset { Some(&a.dims[i - a_offset]) } else { None };
        let b_dim = if i >= b_offset { Some(&b.dims[i - b_offset]) } else { None };
        let dim = match (a_dim, b_dim) {
            (Some(x), None) | (None, Some(x)) => x.clone(),
            (Some(x), Some(y)) => {
                if x.as_ref() == y.as_ref() || y.value == Some(1) {
                    x.clone()
                } else if x.value == Some(1) {
                    y.clone()
                } else {
                    return Err(Error::InputShapeError(format!("cannot broadcast {a} with {b}")));
                }
            }
            (None, None) => unreachable!(),
        };
        dims.push(dim);
    }
    Ok(Shape::new(dims))
}

macro_rules! elementwise_binary_op {
    ($name:ident, $onnx_type:literal) => {
        pub struct $name {
            name: Option<String>,
            a: Arc<dyn Tensor>,
            b: Arc<dyn Tensor>,
            output_shape: Shape,
        }

        impl $name {
            pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
                validate_same_dtype(a.as_ref(), b.as_ref())?;
                let output_shape = broadcast_shapes(a.shape(), b.shape())?;
                Ok(Arc::new(Self { name, a, b, output_shape }))
            }
        }

        impl Node for $name {
            fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self.a.as_ref(), self.b.as_ref()]
            }
            fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
                vec![self]
            }
            fn get_name(&self) -> Option<&str> {
                self.name.as_deref()
            }
            fn get_onnx_type(&self) -> &str {
                $onnx_type
            }
        }

        impl SingleOutputNode for $name {
            fn get_output_shape(&self) -> &Shape {
                &self.output_shape
            }
            fn get_output_dtype(&self) -> DType {
                self.a.dtype()
            }
        }
    };
}

elementwise_binary_op!(Add, "Add");
elementwise_binary_op!(Mul, "Mul");
elementwise_binary_op!(Div, "Div");

pub struct Gather {
    name: Option<String>,
    data: Arc<dyn Tensor>,
    indices: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape,
    dtype: DType
}

impl Gather {
    pub fn new(name: Option<String>, data: Arc<dyn Tensor>, indices: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Self>, Error> {
        validate_index_dtype(indices.dtype())?;
        let data_shape = data.shape();
        let u_axis = data_shape.normalize_axis(axis)?;

        let mut output_dims = vec![];
        output_dims.extend_from_slice(&data_shape.dims[..u_axis]);
        output_dims.extend_from_slice(&indices.shape().dims);
        output_dims.extend_from_slice(&data_shape.dims[u_axis + 1..]);

        let dtype = data.dtype();
        Ok(Arc::new(Self {
            name,
            data,
            indices,
            axis,
            output_shape: Shape::new(output_dims),
            dtype
        }))
    }
}

impl Node for Gather {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.data.as_ref(), self.indices.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Gather"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Gather {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}

pub struct LayerNormalization {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scale: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    axis: i64,
    epsilon: f32,
    stash_type: i64
}

impl SingleOutputNode for LayerNormalization {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

impl LayerNormalization {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, scale: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, axis: i64, epsilon: f32, stash_type: i64) -> Result<Arc<Self>, Error> {
        validate_same_dtype(input.as_ref(), scale.as_ref())?;
        let u_axis = input.shape().normalize_axis(axis)?;
        let normalized = Shape::new(input.shape().dims[u_axis..].to_vec());
        if broadcast_shapes(&normalized, scale.shape())? != normalized {
            return Err(Error::InputShapeError(format!("layer norm scale {} does not fit {}", scale.shape(), normalized)));
        }
        Ok(Arc::new(Self {
            name,
            input,
            scale,
            bias,
            axis,
            epsilon,
            stash_type
        }))
    }
}

impl Node for LayerNormalization {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.scale.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "LayerNormalization"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![
            attr_int("axis", self.axis),
            attr_float("epsilon", self.epsilon),
            attr_int("stash_type", self.stash_type),
        ])
    }
}

pub struct MatMul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    output_dtype: DType,
    output_shape: Shape
}

impl MatMul {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>) -> Result<Arc<Self>, Error> {
        let output_dtype = validate_same_dtype(a.as_ref(), b.as_ref())?;
        // Promote vectors to matrices
        let a_shape = if a.rank() == 1 {
            a.shape().unsqueeze(0)
        } else {
            a.shape().clone()
        };
        let b_shape = if b.rank() == 1 {
            b.shape().unsqueeze(1)
        } else {
            b.shape().clone()
        };

        if a_shape.dim(-1).as_ref() != b_shape.dim(-2).as_ref() {
            Err(Error::InputShapeError(format!("matmul inner dimensions differ: {} x {}", a.shape(), b.shape())))?
        }

        let a_batch = Shape::new(a_shape.dims[..a_shape.rank() - 2].to_vec());
        let b_batch = Shape::new(b_shape.dims[..b_shape.rank() - 2].to_vec());
        let mut output_dims = broadcast_shapes(&a_batch, &b_batch)?.dims;
        if a.rank() != 1 {
            output_dims.push(a_shape.dim(-2).clone());
        }
        if b.rank() != 1 {
            output_dims.push(b_shape.dim(-1).clone());
        }

        Ok(Arc::new(MatMul {
            name,
            a,
            b,
            output_dtype,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for MatMul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "MatMul"
    }
}

impl SingleOutputNode for MatMul {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Transpose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    perm: Vec<i64>,
    output_shape: Shape
}

impl Transpose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, perm: Option<Vec<i64>>) -> Result<Arc<Self>, Error> {
        let rank = input.rank();
        let perm = perm.unwrap_or_else(|| (0..rank as i64).rev().collect());
        let mut seen = vec![false; rank];
        let mut output_dims = Vec::with_capacity(rank);
        for &axis in &perm {
            let axis = input.shape().normalize_axis(axis)?;
            if seen[axis] {
                return Err(Error::InvalidInputError(format!("axis {axis} repeated in permutation {perm:?}")));
            }
            seen[axis] = true;
            output_dims.push(input.shape().dims[axis].clone());
        }
        if perm.len() != rank {
            return Err(Error::InvalidInputError(format!("permutation {perm:?} does not match rank {rank}")));
        }
        Ok(Arc::new(Self { name, input, perm, output_shape: Shape::new(output_dims) }))
    }
}

impl Node for Transpose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Transpose"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_ints("perm", self.perm.clone())])
    }
}

impl SingleOutputNode for Transpose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Reshape {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    shape: Arc<dyn Tensor>,
    output_shape: Shape
}

impl Reshape {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, shape: Arc<dyn Tensor>) -> Result<Arc<Reshape>, Error> {
        if shape.dtype() != DType::I64 {
            Err(Error::InvalidDTypeError)?
        }
        let requested = shape.resolve_data().ok_or(Error::CannotResolveDataError)?.to_int_vec()?;
        let input_dims = input.shape().resolve()?;
        let num_elements: usize = input_dims.iter().product();

        let mut output_dims = Vec::with_capacity(requested.len());
        let mut backfill_dim: Option<usize> = None;
        for (i, &dim) in requested.iter().enumerate() {
            match dim {
                0 => output_dims.push(*input_dims.get(i).ok_or_else(|| Error::InvalidInputError(format!("reshape copies missing input axis {i}")))?),
                -1 => {
                    if backfill_dim.is_some() {
                        return Err(Error::InvalidInputError("reshape with more than one -1".to_string()));
                    }
                    backfill_dim = Some(i);
                    output_dims.push(1);
                }
                d if d > 0 => output_dims.push(d as usize),
                d => return Err(Error::InvalidInputError(format!("invalid reshape dimension {d}"))),
            }
        }
        let known: usize = output_dims.iter().product();
        if let Some(i) = backfill_dim {
            if known == 0 || num_elements % known != 0 {
                return Err(Error::InputShapeError(format!("cannot reshape {} into {requested:?}", input.shape())));
            }
            output_dims[i] = num_elements / known;
        } else if known != num_elements {
            return Err(Error::InputShapeError(format!("cannot reshape {} into {requested:?}", input.shape())));
        }

        Ok(Arc::new(Reshape {
            name,
            input,
            shape,
            output_shape: Shape::from(output_dims)
        }))
    }
}

impl Node for Reshape {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.shape.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Reshape"
    }
}

impl SingleOutputNode for Reshape {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Softmax {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64
}

impl Softmax {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: i64) -> Result<Arc<Softmax>, Error> {
        input.shape().normalize_axis(axis)?;
        Ok(Arc::new(Softmax { name, input, axis }))
    }
}

impl Node for Softmax {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Softmax"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("axis", self.axis)])
    }
}

impl SingleOutputNode for Softmax {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Erf {
    name: Option<String>,
    input: Arc<dyn Tensor>
}

impl Erf {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Arc<Erf> {
        Arc::new(Erf {
            name,
            input
        })
    }
}

impl Node for Erf {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Erf"
    }
}

impl SingleOutputNode for Erf {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Constant {
    name: Option<String>,
    data: TensorData
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Arc<Constant> {
        Arc::new(Constant {
            name,
            data
        })
    }
}

impl Node for Constant {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_tensor("value", &self.data)?])
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }
    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
    fn resolve_output_data(&self) -> Option<TensorData> {
        Some(self.data.clone())
    }
}

pub struct Cast {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    to: DType
}

impl Cast {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, to: DType) -> Arc<Cast> {
        Arc::new(Cast {
            name,
            input,
            to
        })
    }
}

impl Node for Cast {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Cast"
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_int("to", crate::onnx::tensor_proto::DataType::from(self.to) as i64)])
    }
}

impl SingleOutputNode for Cast {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.to
    }
}

/// Spatial hyper-parameters shared by `Conv` and `ConvTranspose` (2D only).
#[derive(Clone, Debug, PartialEq)]
pub struct Conv2dParams {
    pub strides: [usize; 2],
    /// `[top, left, bottom, right]`
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
    pub group: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self { strides: [1, 1], pads: [0, 0, 0, 0], dilations: [1, 1], group: 1 }
    }
}

impl Conv2dParams {
    pub fn strided(stride: usize) -> Self {
        Self { strides: [stride, stride], ..Default::default() }
    }

    pub fn padded(pad: usize) -> Self {
        Self { pads: [pad; 4], ..Default::default() }
    }

    fn attributes(&self, kernel: [usize; 2]) -> Vec<AttributeProto> {
        let to_i64 = |v: &[usize]| v.iter().map(|x| *x as i64).collect::<Vec<_>>();
        vec![
            attr_ints("kernel_shape", to_i64(&kernel)),
            attr_ints("strides", to_i64(&self.strides)),
            attr_ints("pads", to_i64(&self.pads)),
            attr_ints("dilations", to_i64(&self.dilations)),
            attr_int("group", self.group as i64),
        ]
    }
}

fn conv_operands(op: &str, input: &dyn Tensor, weight: &dyn Tensor, bias: Option<&dyn Tensor>) -> Result<(Vec<usize>, Vec<usize>), Error> {
    validate_same_dtype(input, weight)?;
    if let Some(bias) = bias {
        validate_same_dtype(input, bias)?;
    }
    let input_dims = input.shape().resolve()?;
    let weight_dims = weight.shape().resolve()?;
    if input_dims.len() != 4 || weight_dims.len() != 4 {
        return Err(Error::InputShapeError(format!("{op} expects NCHW input and 4D weight, got {} and {}", input.shape(), weight.shape())));
    }
    Ok((input_dims, weight_dims))
}

pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel: [usize; 2],
    params: Conv2dParams,
    output_shape: Shape
}

impl Conv {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, params: Conv2dParams) -> Result<Arc<Self>, Error> {
        let (x, w) = conv_operands("Conv", input.as_ref(), weight.as_ref(), bias.as_deref())?;
        if params.group == 0 || x[1] != w[1] * params.group || w[0] % params.group != 0 {
            return Err(Error::InputShapeError(format!("Conv channels mismatch: input {} weight {}", input.shape(), weight.shape())));
        }
        if let Some(bias) = &bias {
            if bias.shape().resolve()? != vec![w[0]] {
                return Err(Error::InputShapeError(format!("Conv bias {} does not match {} output channels", bias.shape(), w[0])));
            }
        }
        let kernel = [w[2], w[3]];
        let mut spatial = [0usize; 2];
        for i in 0..2 {
            let padded = x[2 + i] + params.pads[i] + params.pads[i + 2];
            let extent = params.dilations[i] * (kernel[i] - 1) + 1;
            if padded < extent || params.strides[i] == 0 {
                return Err(Error::InputShapeError(format!("Conv kernel {kernel:?} larger than padded input {}", input.shape())));
            }
            spatial[i] = (padded - extent) / params.strides[i] + 1;
        }
        let output_shape = Shape::from(vec![x[0], w[0], spatial[0], spatial[1]]);
        Ok(Arc::new(Self { name, input, weight, bias, kernel, params, output_shape }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Conv"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(self.params.attributes(self.kernel))
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct ConvTranspose {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel: [usize; 2],
    params: Conv2dParams,
    output_shape: Shape
}

impl ConvTranspose {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, params: Conv2dParams) -> Result<Arc<Self>, Error> {
        let (x, w) = conv_operands("ConvTranspose", input.as_ref(), weight.as_ref(), bias.as_deref())?;
        if params.group == 0 || x[1] != w[0] || w[0] % params.group != 0 {
            return Err(Error::InputShapeError(format!("ConvTranspose channels mismatch: input {} weight {}", input.shape(), weight.shape())));
        }
        let out_channels = w[1] * params.group;
        let kernel = [w[2], w[3]];
        let mut spatial = [0usize; 2];
        for i in 0..2 {
            let full = params.strides[i] * (x[2 + i] - 1) + params.dilations[i] * (kernel[i] - 1) + 1;
            let cropped = params.pads[i] + params.pads[i + 2];
            if full <= cropped {
                return Err(Error::InputShapeError(format!("ConvTranspose pads {:?} crop the whole output", params.pads)));
            }
            spatial[i] = full - cropped;
        }
        let output_shape = Shape::from(vec![x[0], out_channels, spatial[0], spatial[1]]);
        Ok(Arc::new(Self { name, input, weight, bias, kernel, params, output_shape }))
    }
}

impl Node for ConvTranspose {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "ConvTranspose"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(self.params.attributes(self.kernel))
    }
}

impl SingleOutputNode for ConvTranspose {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Explicit-output einsum (`"bhwc,hkc->bhwk"`); ellipsis is not supported.
pub struct Einsum {
    name: Option<String>,
    inputs: Vec<Arc<dyn Tensor>>,
    equation: String,
    output_shape: Shape
}

impl Einsum {
    pub fn new(name: Option<String>, inputs: Vec<Arc<dyn Tensor>>, equation: &str) -> Result<Arc<Self>, Error> {
        let invalid = || Error::InvalidEquationError(equation.to_string());
        let (lhs, rhs) = equation.split_once("->").ok_or_else(invalid)?;
        let terms: Vec<&str> = lhs.split(',').map(str::trim).collect();
        if inputs.is_empty() || terms.len() != inputs.len() {
            return Err(invalid());
        }
        for input in &inputs[1..] {
            validate_same_dtype(inputs[0].as_ref(), input.as_ref())?;
        }

        let mut letter_dims: HashMap<char, Arc<Dimension>> = HashMap::new();
        for (term, input) in terms.iter().zip(&inputs) {
            if term.chars().count() != input.rank() || !term.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid());
            }
            for (letter, dim) in term.chars().zip(&input.shape().dims) {
                match letter_dims.get(&letter) {
                    Some(existing) if existing.as_ref() != dim.as_ref() => {
                        return Err(Error::InputShapeError(format!("einsum label '{letter}' bound to {existing} and {dim}")));
                    }
                    Some(_) => {}
                    None => {
                        letter_dims.insert(letter, dim.clone());
                    }
                }
            }
        }
        let mut output_dims = vec![];
        for letter in rhs.trim().chars() {
            output_dims.push(letter_dims.get(&letter).ok_or_else(invalid)?.clone());
        }

        Ok(Arc::new(Self {
            name,
            inputs,
            equation: equation.to_string(),
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Einsum {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        self.inputs.iter().map(|x| x.as_ref()).collect()
    }
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "Einsum"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![attr_string("equation", &self.equation)])
    }
}

impl SingleOutputNode for Einsum {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.inputs[0].dtype()
    }
}

pub struct RandomNormal {
    name: Option<String>,
    dtype: DType,
    mean: f32,
    scale: f32,
    output_shape: Shape
}

impl RandomNormal {
    pub fn new(name: Option<String>, shape: Shape, dtype: DType, mean: f32, scale: f32) -> Result<Arc<Self>, Error> {
        shape.resolve()?;
        Ok(Arc::new(Self { name, dtype, mean, scale, output_shape: shape }))
    }
}

impl Node for RandomNormal {
    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }
    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn get_onnx_type(&self) -> &str {
        "RandomNormal"
    }
    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![
            attr_ints("shape", self.output_shape.resolve()?.iter().map(|x| *x as i64).collect()),
            attr_int("dtype", crate::onnx::tensor_proto::DataType::from(self.dtype) as i64),
            attr_float("mean", self.mean),
            attr_float("scale", self.scale),
        ])
    }
}

impl SingleOutputNode for RandomNormal {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }
    fn get_output_dtype(&self) -> DType {
        self.dtype
    }
}
