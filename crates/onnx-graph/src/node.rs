use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::onnx::{attribute_proto::AttributeType, AttributeProto, NodeProto};
use crate::Error;

pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;

    fn get_onnx_domain(&self) -> &str {
        ""
    }

    fn get_onnx_attributes(&self) -> Result<Vec<AttributeProto>, Error> {
        Ok(vec![])
    }

    fn to_node_proto(&self, name: Option<String>, tensor_names: &HashMap<&dyn Tensor, String>) -> Result<NodeProto, Error> {
        let lookup = |tensor: &&dyn Tensor| tensor_names.get(tensor).cloned().ok_or_else(|| Error::NoSuchTensorError(format!("unnamed tensor feeding {}", self.get_onnx_type())));
        Ok(NodeProto {
            name: name.unwrap_or_default(),
            input: self.get_input_tensors().iter().map(lookup).collect::<Result<_, _>>()?,
            output: self.get_output_tensors().iter().map(lookup).collect::<Result<_, _>>()?,
            op_type: self.get_onnx_type().to_string(),
            domain: self.get_onnx_domain().to_string(),
            attribute: self.get_onnx_attributes()?,
            .. Default::default()
        })
    }
}

impl<'a> PartialEq for &'a dyn Node{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Node{}

impl<'a> Hash for &'a dyn Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

pub(crate) trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;

    fn resolve_output_data(&self) -> Option<TensorData> {
        None
    }
}

pub(crate) fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        .. Default::default()
    }
}

pub(crate) fn attr_ints(name: &str, values: Vec<i64>) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values,
        .. Default::default()
    }
}

pub(crate) fn attr_float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f: value,
        .. Default::default()
    }
}

pub(crate) fn attr_string(name: &str, value: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::String as i32,
        s: value.as_bytes().to_vec(),
        .. Default::default()
    }
}

pub(crate) fn attr_tensor(name: &str, value: &TensorData) -> Result<AttributeProto, Error> {
    Ok(AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Tensor as i32,
        t: Some(value.to_tensor_data_proto(None)?),
        .. Default::default()
    })
}
