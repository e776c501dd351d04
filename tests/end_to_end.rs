use std::cell::Cell;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Once;

use cpsam_export::config::VitConfig;
use cpsam_export::{run, Error, ExportConfig, Transport};
use safetensors::tensor::TensorView;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Serves the same body for every GET and counts requests.
struct FixedTransport {
    body: Vec<u8>,
    status: u16,
    requests: Cell<usize>,
}

impl FixedTransport {
    fn new(body: Vec<u8>) -> Self {
        Self { body, status: 200, requests: Cell::new(0) }
    }
}

impl Transport for FixedTransport {
    fn get(&self, url: &str) -> Result<Box<dyn Read>, Error> {
        self.requests.set(self.requests.get() + 1);
        if self.status != 200 {
            return Err(Error::HttpStatus { url: url.to_string(), status: self.status });
        }
        Ok(Box::new(Cursor::new(self.body.clone())))
    }
}

/// A data-parallel style checkpoint: every key carries `module.`.
fn checkpoint_bytes(tensors: &[(&str, Vec<usize>, f32)]) -> Vec<u8> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors.iter().map(|(name, shape, value)| {
        let count: usize = shape.iter().product();
        (format!("module.{name}"), shape.clone(), (0..count).flat_map(|_| value.to_le_bytes()).collect())
    }).collect();
    let views: Vec<(String, TensorView)> = buffers.iter()
        .map(|(name, shape, bytes)| (name.clone(), TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap()))
        .collect();
    safetensors::serialize(views, &None).unwrap()
}

fn tiny_config(dir: &Path) -> ExportConfig {
    ExportConfig {
        checkpoint_url: "https://example.invalid/cpsam".to_string(),
        checkpoint_path: dir.join("cpsam.pth"),
        output_path: dir.join("cellpose_cpsam.onnx"),
        vit: Some(VitConfig {
            embed_dim: 16,
            depth: 2,
            num_heads: 2,
            global_attn_indexes: vec![1],
            window_size: 3,
            pretrain_grid: 8,
            mlp_ratio: 4,
            out_chans: 8,
            layer_norm_eps: 1e-6,
        }),
        image_size: 32,
        download_chunk_size: 64,
        ..ExportConfig::default()
    }
}

#[test]
fn downloads_once_and_exports() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let body = checkpoint_bytes(&[
        ("encoder.patch_embed.proj.weight", vec![16, 3, 8, 8], 0.01),
        ("encoder.blocks.1.attn.rel_pos_h", vec![15, 8], 0.2),
        ("out.weight", vec![192, 8, 1, 1], 0.1),
        ("diam_mean", vec![1], 30.0),
        ("unused.buffer", vec![2], 0.0),
    ]);
    let transport = FixedTransport::new(body.clone());

    let summary = run(&config, &transport).unwrap();
    assert_eq!(transport.requests.get(), 1);
    assert_eq!(std::fs::read(&config.checkpoint_path).unwrap(), body);
    assert!(std::fs::metadata(&config.output_path).unwrap().len() > 0);

    assert_eq!(summary.inputs.len(), 1);
    assert_eq!(summary.inputs[0].name, "input");
    assert_eq!(summary.inputs[0].shape, vec![1, 3, 32, 32]);
    let names: Vec<_> = summary.outputs.iter().map(|x| x.name.as_str()).collect();
    assert_eq!(names, vec!["output", "style"]);
    assert_eq!(summary.outputs[0].shape, vec![1, 3, 32, 32]);
    assert_eq!(summary.outputs[1].shape, vec![1, 256]);
    assert_eq!(summary.opset_version, Some(18));

    // Checkpoint is already on disk the second time round
    let again = run(&config, &transport).unwrap();
    assert_eq!(transport.requests.get(), 1);
    assert_eq!(again, summary);
}

#[test]
fn failed_download_writes_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let mut transport = FixedTransport::new(vec![]);
    transport.status = 503;

    let result = run(&config, &transport);
    assert!(matches!(result, Err(Error::HttpStatus { status: 503, .. })));
    assert!(!config.checkpoint_path.exists());
    assert!(!config.output_path.exists());
}

#[test]
fn mismatched_checkpoint_is_rejected_before_export() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let transport = FixedTransport::new(checkpoint_bytes(&[("encoder.pos_embed", vec![1, 64, 64, 16], 0.0)]));

    match run(&config, &transport) {
        Err(Error::ParameterShapeMismatch { name, .. }) => assert_eq!(name, "encoder.pos_embed"),
        other => panic!("expected shape mismatch, got {other:?}"),
    }
    assert!(!config.output_path.exists());
}
