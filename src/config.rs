use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use onnx_graph::WeightStorageStrategy;

pub const CHECKPOINT_URL: &str = "https://huggingface.co/mouseland/cellpose-sam/resolve/main/cpsam";
pub const CHECKPOINT_PATH: &str = "cpsam.pth";
pub const OUTPUT_PATH: &str = "cellpose_cpsam.onnx";
pub const DOWNLOAD_CHUNK_SIZE: usize = 8192;
pub const OPSET_VERSION: i64 = 18;
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// SAM image-encoder sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Backbone {
    VitB,
    VitL,
    VitH,
}

impl Backbone {
    pub fn vit_config(&self) -> VitConfig {
        let (embed_dim, depth, num_heads, global_attn_indexes) = match self {
            Backbone::VitB => (768, 12, 12, vec![2, 5, 8, 11]),
            Backbone::VitL => (1024, 24, 16, vec![5, 11, 17, 23]),
            Backbone::VitH => (1280, 32, 16, vec![7, 15, 23, 31]),
        };
        VitConfig {
            embed_dim,
            depth,
            num_heads,
            global_attn_indexes,
            ..VitConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VitConfig {
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub global_attn_indexes: Vec<usize>,
    /// Relative-position table size of windowed blocks.
    pub window_size: usize,
    /// Relative-position table size of global blocks, in patches.
    pub pretrain_grid: usize,
    pub mlp_ratio: usize,
    pub out_chans: usize,
    pub layer_norm_eps: f32,
}

impl Default for VitConfig {
    fn default() -> Self {
        Self {
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            global_attn_indexes: vec![5, 11, 17, 23],
            window_size: 14,
            pretrain_grid: 64,
            mlp_ratio: 4,
            out_chans: 256,
            layer_norm_eps: 1e-6,
        }
    }
}

impl VitConfig {
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn is_global(&self, block: usize) -> bool {
        self.global_attn_indexes.contains(&block)
    }

    /// Side length `S` of a block's relative-position table, which holds `2S - 1` rows.
    pub fn rel_pos_extent(&self, block: usize) -> usize {
        if self.is_global(block) {
            self.pretrain_grid
        } else {
            self.window_size
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExportConfig {
    pub checkpoint_url: String,
    pub checkpoint_path: PathBuf,
    pub output_path: PathBuf,
    pub backbone: Backbone,
    /// Overrides the backbone's encoder sizes when set.
    pub vit: Option<VitConfig>,
    pub nout: usize,
    pub patch_size: usize,
    pub image_size: usize,
    pub input_name: String,
    pub output_names: Vec<String>,
    pub opset_version: i64,
    pub download_chunk_size: usize,
    pub weight_storage: WeightStorageStrategy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            checkpoint_url: CHECKPOINT_URL.to_string(),
            checkpoint_path: PathBuf::from(CHECKPOINT_PATH),
            output_path: PathBuf::from(OUTPUT_PATH),
            backbone: Backbone::VitL,
            vit: None,
            nout: 3,
            patch_size: 8,
            image_size: 256,
            input_name: "input".to_string(),
            output_names: vec!["output".to_string(), "style".to_string()],
            opset_version: OPSET_VERSION,
            download_chunk_size: DOWNLOAD_CHUNK_SIZE,
            weight_storage: WeightStorageStrategy::EmbeddedData,
        }
    }
}

impl ExportConfig {
    pub fn vit_config(&self) -> VitConfig {
        self.vit.clone().unwrap_or_else(|| self.backbone.vit_config())
    }

    /// `[1, 3, image_size, image_size]`
    pub fn input_shape(&self) -> Vec<usize> {
        vec![1, 3, self.image_size, self.image_size]
    }
}
