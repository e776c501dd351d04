//! Runs exported graphs through ONNX Runtime and compares them against a plain loop
//! implementation of the Cellpose-SAM forward pass.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Once;

use cpsam_export::architecture::Architecture;
use cpsam_export::cellpose_sam::CellposeSam;
use cpsam_export::config::VitConfig;
use cpsam_export::export::{export_model, OnnxExporter};
use cpsam_export::inference::{preprocess, synthetic_image, CELL_PROBABILITY_CHANNEL};
use cpsam_export::{check_exported_model, CellposeSession, ExportConfig};
use image::ImageFormat;
use ndarray::Array4;
use safetensors::tensor::TensorView;

const D: usize = 16;
const HEADS: usize = 2;
const HD: usize = D / HEADS;
const PS: usize = 8;
const SIDE: usize = 32;
const G: usize = SIDE / PS;
const NECK: usize = 8;
const NOUT: usize = 3;
const EPS: f64 = 1e-6;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Block 0 attends through a 3-wide window table, block 1 through an 8-wide global one.
fn tiny_config(dir: &Path) -> ExportConfig {
    ExportConfig {
        checkpoint_path: dir.join("cpsam.pth"),
        output_path: dir.join("cellpose_cpsam.onnx"),
        vit: Some(VitConfig {
            embed_dim: D,
            depth: 2,
            num_heads: HEADS,
            global_attn_indexes: vec![1],
            window_size: 3,
            pretrain_grid: 8,
            mlp_ratio: 4,
            out_chans: NECK,
            layer_norm_eps: EPS as f32,
        }),
        image_size: SIDE,
        ..ExportConfig::default()
    }
}

/// Deterministic value in `[-1, 1)` for element `index` of tensor `name`.
fn pattern(name: &str, index: usize) -> f64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let mut z = hash ^ (index as u64).wrapping_mul(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

fn patterned_value(name: &str, index: usize) -> f32 {
    let p = pattern(name, index);
    let is_norm = name.contains("norm") || name.starts_with("encoder.neck.1") || name.starts_with("encoder.neck.3");
    let value = if is_norm && name.ends_with("weight") {
        1.0 + 0.1 * p
    } else if name.contains("rel_pos") {
        p
    } else {
        0.25 * p
    };
    value as f32
}

type Weights = HashMap<String, Vec<f32>>;

/// Writes a checkpoint covering every parameter with patterned values.
fn write_patterned_checkpoint(config: &ExportConfig) -> Weights {
    let model = CellposeSam::from_config(config).unwrap();
    let weights: Weights = model.parameters().iter()
        .map(|spec| {
            let count: usize = spec.shape.iter().product();
            (spec.name.clone(), (0..count).map(|i| patterned_value(&spec.name, i)).collect())
        })
        .collect();
    let shapes: HashMap<String, Vec<usize>> = model.parameters().into_iter().map(|spec| (spec.name, spec.shape)).collect();
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = weights.iter()
        .map(|(name, values)| (format!("module.{name}"), shapes[name].clone(), values.iter().flat_map(|v| v.to_le_bytes()).collect()))
        .collect();
    let views: Vec<(String, TensorView)> = buffers.iter()
        .map(|(name, shape, bytes)| (name.clone(), TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes).unwrap()))
        .collect();
    std::fs::write(&config.checkpoint_path, safetensors::serialize(views, &None).unwrap()).unwrap();
    weights
}

fn export_patterned(dir: &Path) -> (ExportConfig, Weights) {
    let config = tiny_config(dir);
    let weights = write_patterned_checkpoint(&config);
    let mut model = CellposeSam::from_config(&config).unwrap();
    let outcome = export_model(&mut model, &config, &OnnxExporter).unwrap();
    assert!(outcome.load_report.missing.is_empty());
    assert!(outcome.load_report.unexpected.is_empty());
    (config, weights)
}

fn patterned_input() -> Array4<f32> {
    Array4::from_shape_fn((1, 3, SIDE, SIDE), |(_, c, y, x)| {
        (0.5 + 0.5 * pattern("input", (c * SIDE + y) * SIDE + x)) as f32
    })
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let y = 1.0 - poly * (-x * x).exp();
    if x < 0.0 { -y } else { y }
}

fn gelu(x: f64) -> f64 {
    0.5 * x * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn layer_norm(x: &[f64], weight: &[f32], bias: &[f32]) -> Vec<f64> {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = (var + EPS).sqrt();
    x.iter().enumerate().map(|(i, v)| (v - mean) / std * weight[i] as f64 + bias[i] as f64).collect()
}

fn linear(x: &[f64], weight: &[f32], bias: &[f32]) -> Vec<f64> {
    let n = x.len();
    (0..bias.len())
        .map(|o| bias[o] as f64 + (0..n).map(|i| weight[o * n + i] as f64 * x[i]).sum::<f64>())
        .collect()
}

/// Resamples a `[rows, HD]` table to `out_rows` rows, linear with half-pixel centers.
fn resize_rows(table: &[f32], out_rows: usize) -> Vec<f64> {
    let rows = table.len() / HD;
    let mut out = vec![0f64; out_rows * HD];
    for i in 0..out_rows {
        let src = ((i as f64 + 0.5) * rows as f64 / out_rows as f64 - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(rows - 1);
        let i1 = (i0 + 1).min(rows - 1);
        let lambda = src - i0 as f64;
        for c in 0..HD {
            out[i * HD + c] = (1.0 - lambda) * table[i0 * HD + c] as f64 + lambda * table[i1 * HD + c] as f64;
        }
    }
    out
}

fn attention(w: &Weights, block: usize, x: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let get = |name: &str| w[&format!("encoder.blocks.{block}.attn.{name}")].as_slice();
    let qkv: Vec<Vec<f64>> = x.iter().map(|t| linear(t, get("qkv.weight"), get("qkv.bias"))).collect();
    let rel_h = resize_rows(get("rel_pos_h"), 2 * G - 1);
    let rel_w = resize_rows(get("rel_pos_w"), 2 * G - 1);
    let scale = (HD as f64).powf(-0.5);

    let mut out = vec![vec![0f64; D]; G * G];
    for n in 0..HEADS {
        for qp in 0..G * G {
            let (qy, qx) = (qp / G, qp % G);
            let q = &qkv[qp][n * HD..(n + 1) * HD];
            let logits: Vec<f64> = (0..G * G).map(|kp| {
                let (ky, kx) = (kp / G, kp % G);
                let k = &qkv[kp][D + n * HD..D + (n + 1) * HD];
                let rh = &rel_h[(qy + G - 1 - ky) * HD..];
                let rw = &rel_w[(qx + G - 1 - kx) * HD..];
                (0..HD).map(|c| q[c] * scale * k[c] + q[c] * rh[c] + q[c] * rw[c]).sum()
            }).collect();
            let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
            let total: f64 = exps.iter().sum();
            for c in 0..HD {
                out[qp][n * HD + c] = (0..G * G).map(|kp| exps[kp] / total * qkv[kp][2 * D + n * HD + c]).sum();
            }
        }
    }
    out.iter().map(|t| linear(t, get("proj.weight"), get("proj.bias"))).collect()
}

/// `[NOUT, SIDE, SIDE]` flows and logits for `input`.
fn reference_forward(w: &Weights, input: &Array4<f32>) -> Vec<f64> {
    let get = |name: &str| w[name].as_slice();

    let patch_w = get("encoder.patch_embed.proj.weight");
    let patch_b = get("encoder.patch_embed.proj.bias");
    let pos = get("encoder.pos_embed");
    let mut x = vec![vec![0f64; D]; G * G];
    for p in 0..G * G {
        let (py, px) = (p / G, p % G);
        for d in 0..D {
            let mut acc = patch_b[d] as f64;
            for c in 0..3 {
                for ky in 0..PS {
                    for kx in 0..PS {
                        acc += patch_w[((d * 3 + c) * PS + ky) * PS + kx] as f64 * input[[0, c, py * PS + ky, px * PS + kx]] as f64;
                    }
                }
            }
            x[p][d] = acc + pos[p * D + d] as f64;
        }
    }

    for block in 0..2 {
        let get = |name: &str| w[&format!("encoder.blocks.{block}.{name}")].as_slice();
        let h: Vec<Vec<f64>> = x.iter().map(|t| layer_norm(t, get("norm1.weight"), get("norm1.bias"))).collect();
        let h = attention(w, block, &h);
        for (t, r) in x.iter_mut().zip(&h) {
            t.iter_mut().zip(r).for_each(|(a, b)| *a += b);
        }
        for t in x.iter_mut() {
            let h = layer_norm(t, get("norm2.weight"), get("norm2.bias"));
            let h: Vec<f64> = linear(&h, get("mlp.lin1.weight"), get("mlp.lin1.bias")).into_iter().map(gelu).collect();
            let h = linear(&h, get("mlp.lin2.weight"), get("mlp.lin2.bias"));
            t.iter_mut().zip(&h).for_each(|(a, b)| *a += b);
        }
    }

    let neck0 = get("encoder.neck.0.weight");
    let y: Vec<Vec<f64>> = x.iter()
        .map(|t| (0..NECK).map(|o| (0..D).map(|d| neck0[o * D + d] as f64 * t[d]).sum()).collect::<Vec<f64>>())
        .map(|t| layer_norm(&t, get("encoder.neck.1.weight"), get("encoder.neck.1.bias")))
        .collect();
    let neck2 = get("encoder.neck.2.weight");
    let z: Vec<Vec<f64>> = (0..G * G).map(|p| {
        let (py, px) = ((p / G) as isize, (p % G) as isize);
        let t: Vec<f64> = (0..NECK).map(|o| {
            let mut acc = 0.0;
            for i in 0..NECK {
                for ky in 0..3isize {
                    for kx in 0..3isize {
                        let (sy, sx) = (py + ky - 1, px + kx - 1);
                        if sy < 0 || sx < 0 || sy >= G as isize || sx >= G as isize {
                            continue;
                        }
                        let weight = neck2[((o * NECK + i) * 3 + ky as usize) * 3 + kx as usize] as f64;
                        acc += weight * y[sy as usize * G + sx as usize][i];
                    }
                }
            }
            acc
        }).collect();
        layer_norm(&t, get("encoder.neck.3.weight"), get("encoder.neck.3.bias"))
    }).collect();

    let readout: Vec<Vec<f64>> = z.iter().map(|t| linear(t, get("out.weight"), get("out.bias"))).collect();
    let w2 = get("W2");
    let mut out = vec![0f64; NOUT * SIDE * SIDE];
    for c in 0..NOUT {
        for yy in 0..SIDE {
            for xx in 0..SIDE {
                let (p, ky, kx) = ((yy / PS) * G + xx / PS, yy % PS, xx % PS);
                out[(c * SIDE + yy) * SIDE + xx] = (0..NOUT * PS * PS)
                    .map(|k| readout[p][k] * w2[((k * NOUT + c) * PS + ky) * PS + kx] as f64)
                    .sum();
            }
        }
    }
    out
}

fn max_abs_difference(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[test]
fn runtime_output_matches_reference_forward() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (config, weights) = export_patterned(dir.path());
    let input = patterned_input();
    let expected = reference_forward(&weights, &input);

    let session = CellposeSession::open(&config.output_path, &config).unwrap();
    let prediction = session.predict(input.clone()).unwrap();
    assert_eq!(prediction.output.shape(), &[1, NOUT, SIDE, SIDE]);
    assert_eq!(prediction.style.shape(), &[1, 256]);
    assert!(prediction.style.iter().all(|x| x.is_finite()));

    let magnitude = expected.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    assert!(magnitude > 0.1, "reference output is degenerate");
    let (atol, rtol) = (1e-4, 1e-3);
    for (i, (actual, expected)) in prediction.output.iter().zip(&expected).enumerate() {
        let abs_diff = (*actual as f64 - expected).abs();
        assert!(abs_diff <= atol + rtol * expected.abs(), "element {i}: {actual} vs {expected}");
    }
}

#[test]
fn both_relative_tables_shape_the_reference() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    let weights = write_patterned_checkpoint(&config);
    let input = patterned_input();
    let baseline = reference_forward(&weights, &input);

    for block in 0..2 {
        let mut stripped = weights.clone();
        for axis in ["h", "w"] {
            let table = stripped.get_mut(&format!("encoder.blocks.{block}.attn.rel_pos_{axis}")).unwrap();
            table.iter_mut().for_each(|x| *x = 0.0);
        }
        assert!(max_abs_difference(&baseline, &reference_forward(&stripped, &input)) > 1e-3, "block {block}");
    }
    assert_eq!(weights["encoder.blocks.0.attn.rel_pos_h"].len(), 5 * HD);
    assert_eq!(weights["encoder.blocks.1.attn.rel_pos_h"].len(), 15 * HD);
}

#[test]
fn exported_model_passes_inference_check() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (config, _) = export_patterned(dir.path());

    let check = check_exported_model(&config.output_path, &config).unwrap();
    assert_eq!(check.output_shape, vec![1, NOUT, SIDE, SIDE]);
    assert_eq!(check.style_shape, vec![1, 256]);
    let (low, high) = check.probability_range;
    assert!(0.0 <= low && low <= high && high <= 1.0);
}

#[test]
fn segment_returns_heatmap_at_source_size() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (config, _) = export_patterned(dir.path());
    let session = CellposeSession::open(&config.output_path, &config).unwrap();

    let source = synthetic_image(45, 20);
    let mut encoded = Cursor::new(Vec::new());
    source.write_to(&mut encoded, ImageFormat::Png).unwrap();
    let heatmap = image::load_from_memory(&session.segment(encoded.get_ref()).unwrap()).unwrap();
    assert_eq!((heatmap.width(), heatmap.height()), (45, 20));

    // Logits come back as probabilities
    let raw = session.predict(preprocess(&source, SIDE as u32)).unwrap();
    let probability = session.cell_probability(&source).unwrap();
    assert_eq!(probability.dim(), (SIDE, SIDE));
    assert!(probability.iter().all(|p| (0.0..=1.0).contains(p)));
    let logit = raw.output[[0, CELL_PROBABILITY_CHANNEL, 3, 5]];
    let (min, max) = raw.output.slice(ndarray::s![0, CELL_PROBABILITY_CHANNEL, .., ..]).iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(*x), hi.max(*x)));
    let expected = if min < 0.0 || max > 1.0 { 1.0 / (1.0 + (-logit).exp()) } else { logit };
    assert!((probability[[3, 5]] - expected).abs() < 1e-5);
}
