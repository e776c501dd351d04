use std::sync::Arc;
use onnx_graph::operators::{Add, Constant, Conv2dParams, ConvTranspose, Einsum, Gather, MatMul, RandomNormal, Softmax};
use onnx_graph::pytorch::{conv2d, gelu, layer_norm, layer_norm_2d, linear, mul_scalar, node_name, permute, reshape, scalar_index, transpose};
use onnx_graph::tensor::{DType, Shape, Tensor, TensorData};
use onnx_graph::weights::WeightManager;
use crate::architecture::{Architecture, ParameterInit, ParameterSpec};
use crate::config::{Backbone, ExportConfig, VitConfig};
use crate::Error;

/// Width of the random style vector returned next to the flows.
pub const STYLE_DIM: usize = 256;

/// Row-major `[out_len, in_len]` matrix resampling a table of `in_len` rows to `out_len`
/// rows by linear interpolation with half-pixel centers.
pub fn linear_resize_matrix(in_len: usize, out_len: usize) -> Vec<f32> {
    let mut matrix = vec![0f32; out_len * in_len];
    if in_len == 0 {
        return matrix;
    }
    let scale = in_len as f32 / out_len as f32;
    for i in 0..out_len {
        let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_len - 1);
        let i1 = (i0 + 1).min(in_len - 1);
        let lambda = src - i0 as f32;
        matrix[i * in_len + i0] += 1.0 - lambda;
        matrix[i * in_len + i1] += lambda;
    }
    matrix
}

/// `[grid, grid]` table of `q - k + grid - 1`, indexing a `2 * grid - 1` row relative table.
pub fn relative_position_index(grid: usize) -> Vec<i64> {
    let grid = grid as i64;
    let mut index = Vec::with_capacity((grid * grid) as usize);
    for q in 0..grid {
        for k in 0..grid {
            index.push(q - k + grid - 1);
        }
    }
    index
}

/// Cellpose-SAM: a SAM ViT image encoder, run with global attention everywhere, read out
/// per pixel through a 1x1 conv and a fixed transposed conv.
pub struct CellposeSam {
    vit: VitConfig,
    backbone: Option<Backbone>,
    patch_size: usize,
    image_size: usize,
    nout: usize,
    training: bool,
}

impl CellposeSam {
    pub fn new(vit: VitConfig, patch_size: usize, image_size: usize, nout: usize) -> Result<Self, Error> {
        if patch_size == 0 || image_size % patch_size != 0 {
            return Err(Error::InvalidConfig(format!("image size {image_size} is not a multiple of patch size {patch_size}")));
        }
        if vit.num_heads == 0 || vit.embed_dim % vit.num_heads != 0 {
            return Err(Error::InvalidConfig(format!("embed dim {} does not split over {} heads", vit.embed_dim, vit.num_heads)));
        }
        if let Some(block) = vit.global_attn_indexes.iter().find(|x| **x >= vit.depth) {
            return Err(Error::InvalidConfig(format!("global attention block {block} beyond depth {}", vit.depth)));
        }
        Ok(Self {
            vit,
            backbone: None,
            patch_size,
            image_size,
            nout,
            training: true,
        })
    }

    pub fn from_config(config: &ExportConfig) -> Result<Self, Error> {
        let mut model = Self::new(config.vit_config(), config.patch_size, config.image_size, config.nout)?;
        if config.vit.is_none() {
            model.backbone = Some(config.backbone);
        }
        Ok(model)
    }

    /// Patches per side.
    pub fn grid(&self) -> usize {
        self.image_size / self.patch_size
    }

    fn readout_channels(&self) -> usize {
        self.nout * self.patch_size * self.patch_size
    }

    /// Resizes a relative-position table to the grid and expands it to `[grid, grid, head_dim]`.
    fn relative_positions(&self, table: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
        let grid = self.grid();
        let rows = table.shape().dim(0).resolve()?;
        let target = 2 * grid - 1;
        let table: Arc<dyn Tensor> = if rows == target {
            table
        } else {
            let resize = TensorData::new(linear_resize_matrix(rows, target).into(), Shape::from(vec![target, rows]))?;
            MatMul::new(None, Constant::new(None, resize), table)?
        };
        let index = TensorData::new(relative_position_index(grid).into(), Shape::from(vec![grid, grid]))?;
        Ok(Gather::new(None, table, Constant::new(None, index), 0)?)
    }

    fn attention<W: WeightManager>(&self, weights: &W, x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
        let g = self.grid() as i64;
        let nh = self.vit.num_heads as i64;
        let hd = self.vit.head_dim() as i64;
        let hw = g * g;

        let qkv = linear(&weights.prefix("qkv"), x)?;
        let qkv = reshape(qkv, vec![1, hw, 3, nh, hd])?;
        let qkv = permute(qkv, vec![2, 0, 3, 1, 4])?;
        let qkv: Arc<dyn Tensor> = reshape(qkv, vec![3, nh, hw, hd])?;
        let q: Arc<dyn Tensor> = Gather::new(None, qkv.clone(), scalar_index(0)?, 0)?;
        let k = Gather::new(None, qkv.clone(), scalar_index(1)?, 0)?;
        let v = Gather::new(None, qkv, scalar_index(2)?, 0)?;

        let scale = (hd as f32).powf(-0.5);
        let attn = MatMul::new(None, mul_scalar(q.clone(), scale)?, transpose(k)?)?;

        // Decomposed relative position bias
        let rel_h = self.relative_positions(weights.get_tensor("rel_pos_h")?)?;
        let rel_w = self.relative_positions(weights.get_tensor("rel_pos_w")?)?;
        let r_q: Arc<dyn Tensor> = reshape(q, vec![nh, g, g, hd])?;
        let bias_h = Einsum::new(None, vec![r_q.clone(), rel_h], "bhwc,hkc->bhwk")?;
        let bias_w = Einsum::new(None, vec![r_q, rel_w], "bhwc,wkc->bhwk")?;
        let attn = reshape(attn, vec![nh, g, g, g, g])?;
        let attn = Add::new(None, attn, reshape(bias_h, vec![nh, g, g, g, 1])?)?;
        let attn = Add::new(None, attn, reshape(bias_w, vec![nh, g, g, 1, g])?)?;
        let attn = reshape(attn, vec![nh, hw, hw])?;
        let attn = Softmax::new(node_name(weights.get_prefix(), "Softmax"), attn, -1)?;

        let x = MatMul::new(None, attn, v)?;
        let x = reshape(x, vec![1, nh, g, g, hd])?;
        let x = permute(x, vec![0, 2, 3, 1, 4])?;
        let x = reshape(x, vec![1, g, g, nh * hd])?;
        Ok(linear(&weights.prefix("proj"), x)?)
    }

    fn block<W: WeightManager>(&self, weights: &W, x: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
        let eps = self.vit.layer_norm_eps;
        let h = layer_norm(&weights.prefix("norm1"), x.clone(), eps)?;
        let h = self.attention(&weights.prefix("attn"), h)?;
        let x: Arc<dyn Tensor> = Add::new(None, x, h)?;

        let mlp = weights.prefix("mlp");
        let h = layer_norm(&weights.prefix("norm2"), x.clone(), eps)?;
        let h = linear(&mlp.prefix("lin1"), h)?;
        let h = gelu(h)?;
        let h = linear(&mlp.prefix("lin2"), h)?;
        Ok(Add::new(None, x, h)?)
    }
}

impl Architecture for CellposeSam {
    fn name(&self) -> &str {
        "cellpose_sam"
    }

    fn parameters(&self) -> Vec<ParameterSpec> {
        use ParameterInit::*;
        let d = self.vit.embed_dim;
        let hd = self.vit.head_dim();
        let hidden = d * self.vit.mlp_ratio;
        let neck = self.vit.out_chans;
        let ps = self.patch_size;
        let g = self.grid();

        let mut params = vec![
            ParameterSpec::new("encoder.patch_embed.proj.weight", vec![d, 3, ps, ps], Zeros),
            ParameterSpec::new("encoder.patch_embed.proj.bias", vec![d], Zeros),
            ParameterSpec::new("encoder.pos_embed", vec![1, g, g, d], Zeros),
        ];
        for i in 0..self.vit.depth {
            let p = |name: &str| format!("encoder.blocks.{i}.{name}");
            let rel_rows = 2 * self.vit.rel_pos_extent(i) - 1;
            params.extend([
                ParameterSpec::new(p("norm1.weight"), vec![d], Ones),
                ParameterSpec::new(p("norm1.bias"), vec![d], Zeros),
                ParameterSpec::new(p("attn.qkv.weight"), vec![3 * d, d], Zeros),
                ParameterSpec::new(p("attn.qkv.bias"), vec![3 * d], Zeros),
                ParameterSpec::new(p("attn.proj.weight"), vec![d, d], Zeros),
                ParameterSpec::new(p("attn.proj.bias"), vec![d], Zeros),
                ParameterSpec::new(p("attn.rel_pos_h"), vec![rel_rows, hd], Zeros),
                ParameterSpec::new(p("attn.rel_pos_w"), vec![rel_rows, hd], Zeros),
                ParameterSpec::new(p("norm2.weight"), vec![d], Ones),
                ParameterSpec::new(p("norm2.bias"), vec![d], Zeros),
                ParameterSpec::new(p("mlp.lin1.weight"), vec![hidden, d], Zeros),
                ParameterSpec::new(p("mlp.lin1.bias"), vec![hidden], Zeros),
                ParameterSpec::new(p("mlp.lin2.weight"), vec![d, hidden], Zeros),
                ParameterSpec::new(p("mlp.lin2.bias"), vec![d], Zeros),
            ]);
        }
        params.extend([
            ParameterSpec::new("encoder.neck.0.weight", vec![neck, d, 1, 1], Zeros),
            ParameterSpec::new("encoder.neck.1.weight", vec![neck], Ones),
            ParameterSpec::new("encoder.neck.1.bias", vec![neck], Zeros),
            ParameterSpec::new("encoder.neck.2.weight", vec![neck, neck, 3, 3], Zeros),
            ParameterSpec::new("encoder.neck.3.weight", vec![neck], Ones),
            ParameterSpec::new("encoder.neck.3.bias", vec![neck], Zeros),
            ParameterSpec::new("out.weight", vec![self.readout_channels(), neck, 1, 1], Zeros),
            ParameterSpec::new("out.bias", vec![self.readout_channels()], Zeros),
            ParameterSpec::new("W2", vec![self.readout_channels(), self.nout, ps, ps], Identity),
            ParameterSpec::new("diam_labels", vec![1], Constant(30.0)),
            ParameterSpec::new("diam_mean", vec![1], Constant(30.0)),
        ]);
        params
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn forward<W: WeightManager>(&self, weights: &W, input: Arc<dyn Tensor>) -> Result<Vec<Arc<dyn Tensor>>, Error> {
        if self.training {
            log::warn!("Tracing {} in training mode, random block dropping is not represented", self.name());
        }
        let expected = vec![1, 3, self.image_size, self.image_size];
        let found = input.shape().resolve()?;
        if found != expected {
            return Err(Error::InputResolutionMismatch { expected, found });
        }
        let ps = self.patch_size;
        let eps = self.vit.layer_norm_eps;

        let encoder = weights.prefix("encoder");
        let x = conv2d(&encoder.prefix("patch_embed").prefix("proj"), input, Conv2dParams::strided(ps))?;
        let x = permute(x, vec![0, 2, 3, 1])?;
        let mut x: Arc<dyn Tensor> = Add::new(node_name(Some("encoder.pos_embed"), "Add"), x, encoder.get_tensor("pos_embed")?)?;

        let blocks = encoder.prefix("blocks");
        for i in 0..self.vit.depth {
            x = self.block(&blocks.prefix(&i.to_string()), x)?;
        }

        let neck = encoder.prefix("neck");
        let x = permute(x, vec![0, 3, 1, 2])?;
        let x = conv2d(&neck.prefix("0"), x, Conv2dParams::default())?;
        let x = layer_norm_2d(&neck.prefix("1"), x, eps)?;
        let x = conv2d(&neck.prefix("2"), x, Conv2dParams::padded(1))?;
        let x = layer_norm_2d(&neck.prefix("3"), x, eps)?;

        let x1 = conv2d(&weights.prefix("out"), x, Conv2dParams::default())?;
        let x1 = ConvTranspose::new(node_name(Some("W2"), "ConvTranspose"), x1, weights.get_tensor("W2")?, None, Conv2dParams::strided(ps))?;
        let style = RandomNormal::new(node_name(Some("style"), "RandomNormal"), Shape::from(vec![1usize, STYLE_DIM]), DType::F32, 0.0, 1.0)?;
        Ok(vec![x1, style])
    }

    fn description(&self) -> String {
        "Cellpose-SAM architecture (ViT Backbone + Cellpose Head)".to_string()
    }

    fn export_label(&self) -> String {
        "end-to-end Cellpose model".to_string()
    }

    fn export_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "architecture": self.name(),
            "backbone": self.backbone.map(|x| x.to_string()),
            "embed_dim": self.vit.embed_dim,
            "depth": self.vit.depth,
            "patch_size": self.patch_size,
            "image_size": self.image_size,
            "nout": self.nout,
        })
    }
}
