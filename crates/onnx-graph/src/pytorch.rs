use std::sync::Arc;
use crate::{operators, Error};
use crate::operators::{Cast, Constant, Conv, Conv2dParams, Div, Erf, LayerNormalization, Mul, Reshape, Transpose};
use crate::tensor::{DType, Shape, Tensor, TensorData, TensorDataValue};
use crate::weights::WeightManager;

/// Node name for `op_type` inside a module, `/encoder/neck/0/Conv` style.
///
/// Slashes keep node names apart from parameter names, which are dotted.
pub fn node_name(scope: Option<&str>, op_type: &str) -> Option<String> {
    scope.map(|x| format!("/{}/{op_type}", x.replace('.', "/")))
}

/// `nn.Linear`: `input @ weight.T + bias`.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let weight = transpose(weight_manager.get_tensor("weight")?)?;
    let bias = weight_manager.get_tensor("bias").ok();
    let mat_out = operators::MatMul::new(
        node_name(weight_manager.get_prefix(), "MatMul"),
        input,
        weight
    )?;

    if let Some(bias) = bias {
        Ok(operators::Add::new(node_name(weight_manager.get_prefix(), "Add"), mat_out, bias)?)
    } else {
        Ok(mat_out)
    }
}

pub fn layer_norm(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<LayerNormalization>, Error> {
    LayerNormalization::new(
        node_name(weight_manager.get_prefix(), "LayerNormalization"),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias").ok(),
        -1,
        epsilon,
        1
    )
}

/// Channel-wise layer norm over an NCHW tensor.
pub fn layer_norm_2d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, epsilon: f32) -> Result<Arc<dyn Tensor>, Error> {
    let x = permute(input, vec![0, 2, 3, 1])?;
    let x = layer_norm(weight_manager, x, epsilon)?;
    Ok(permute(x, vec![0, 3, 1, 2])?)
}

pub fn conv2d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, params: Conv2dParams) -> Result<Arc<Conv>, Error> {
    Conv::new(
        node_name(weight_manager.get_prefix(), "Conv"),
        input,
        weight_manager.get_tensor("weight")?,
        weight_manager.get_tensor("bias").ok(),
        params
    )
}

pub fn int_constant(values: Vec<i64>) -> Result<Arc<Constant>, Error> {
    let shape = Shape::from(&[values.len()][..]);
    Ok(Constant::new(None, TensorData::new(values.into(), shape)?))
}

pub fn scalar_index(index: i64) -> Result<Arc<Constant>, Error> {
    Ok(Constant::new(None, TensorData::new(vec![index].into(), Shape::new(vec![]))?))
}

pub fn reshape(input: Arc<dyn Tensor>, dims: Vec<i64>) -> Result<Arc<Reshape>, Error> {
    Reshape::new(None, input, int_constant(dims)?)
}

pub fn permute(input: Arc<dyn Tensor>, perm: Vec<i64>) -> Result<Arc<Transpose>, Error> {
    Transpose::new(None, input, Some(perm))
}

/// Swaps the last two axes.
pub fn transpose(input: Arc<dyn Tensor>) -> Result<Arc<Transpose>, Error> {
    let rank = input.rank();
    if rank < 2 {
        return Err(Error::InputShapeError(format!("cannot transpose rank {rank} tensor")));
    }
    let mut dims: Vec<_> = (0..rank as i64).collect();
    dims.swap(rank - 2, rank - 1);
    permute(input, dims)
}

pub fn cast(input: Arc<dyn Tensor>, dtype: DType) -> Arc<dyn Tensor> {
    if input.dtype() == dtype {
        input
    } else {
        Cast::new(None, input, dtype)
    }
}

fn scalar_constant<T>(scalar: T) -> Result<Arc<Constant>, Error>
where
    T: Copy,
    TensorDataValue: From<Vec<T>>
{
    Ok(Constant::new(None, TensorData::fill(Shape::from(vec![1usize]), scalar)?))
}

pub fn mul_scalar<T>(input: Arc<dyn Tensor>, scalar: T) -> Result<Arc<Mul>, Error>
where
    T: Copy,
    TensorDataValue: From<Vec<T>>
{
    Mul::new(None, input, scalar_constant(scalar)?)
}

pub fn div_scalar<T>(input: Arc<dyn Tensor>, scalar: T) -> Result<Arc<Div>, Error>
where
    T: Copy,
    TensorDataValue: From<Vec<T>>
{
    Div::new(None, input, scalar_constant(scalar)?)
}

/// Exact GELU: `x * 0.5 * (1 + erf(x / sqrt(2)))`.
pub fn gelu(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let x = div_scalar(input.clone(), std::f32::consts::SQRT_2)?;
    let x = Erf::new(None, x);
    let x = operators::Add::new(None, x, scalar_constant(1.0f32)?)?;
    let x = mul_scalar(x, 0.5f32)?;
    Ok(Mul::new(None, input, x)?)
}
