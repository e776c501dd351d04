//! Runs an exported model the way the desktop segmentation front end does: resize to the
//! model's square input, scale to `[0, 1]`, read the cell probability channel and render it
//! as a Jet heatmap at the source resolution.

use std::io::Cursor;
use std::path::Path;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use ndarray::{s, Array, Array2, Array4, ArrayView4, Ix2, Ix4};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use crate::cellpose_sam::STYLE_DIM;
use crate::config::ExportConfig;
use crate::Error;

/// Channels 0 and 1 are the Y and X flows.
pub const CELL_PROBABILITY_CHANNEL: usize = 2;

/// Resizes to `size`×`size` and lays the pixels out as `[1, 3, size, size]` RGB in `[0, 1]`.
pub fn preprocess(image: &DynamicImage, size: u32) -> Array4<f32> {
    let resized = imageops::resize(&image.to_rgb8(), size, size, FilterType::Triangle);
    Array::from_shape_fn((1, 3, size as usize, size as usize), |(_, c, y, x)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Cell probability plane of a `[1, C, H, W]` output. Logits are squashed with a sigmoid;
/// a plane already inside `[0, 1]` is returned as is.
pub fn cell_probability(output: ArrayView4<f32>) -> Result<Array2<f32>, Error> {
    let shape = output.shape();
    if shape[0] != 1 || shape[1] <= CELL_PROBABILITY_CHANNEL {
        return Err(Error::InvalidOutput(format!("expected [1, >{CELL_PROBABILITY_CHANNEL}, H, W], got {shape:?}")));
    }
    let mut plane = output.slice(s![0, CELL_PROBABILITY_CHANNEL, .., ..]).to_owned();
    let (min, max) = value_range(plane.iter().copied());
    if min < 0.0 || max > 1.0 {
        plane.mapv_inplace(|x| 1.0 / (1.0 + (-x).exp()));
    }
    Ok(plane)
}

fn value_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)))
}

/// OpenCV's Jet colormap: dark blue at 0, dark red at 255.
pub fn jet(value: u8) -> Rgb<u8> {
    let x = value as f32 / 255.0;
    let channel = |offset: f32| ((1.5 - (4.0 * x - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Renders a probability plane as a Jet heatmap of `width`×`height`.
pub fn probability_heatmap(probability: &Array2<f32>, width: u32, height: u32) -> RgbImage {
    let (rows, cols) = probability.dim();
    let gray = GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        image::Luma([(probability[[y as usize, x as usize]] * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    let resized = imageops::resize(&gray, width, height, FilterType::Triangle);
    RgbImage::from_fn(width, height, |x, y| jet(resized.get_pixel(x, y)[0]))
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub output: Array4<f32>,
    pub style: Array2<f32>,
}

/// An ONNX Runtime session over an exported model.
pub struct CellposeSession {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    image_size: u32,
}

impl CellposeSession {
    pub fn open(path: &Path, config: &ExportConfig) -> Result<Self, Error> {
        if config.output_names.len() != 2 {
            return Err(Error::OutputCountMismatch { expected: 2, found: config.output_names.len() });
        }
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)?;
        Ok(Self {
            session,
            input_name: config.input_name.clone(),
            output_names: config.output_names.clone(),
            image_size: config.image_size as u32,
        })
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn predict(&self, input: Array4<f32>) -> Result<Prediction, Error> {
        let size = self.image_size as usize;
        let expected = vec![1, 3, size, size];
        if input.shape() != expected.as_slice() {
            return Err(Error::InputResolutionMismatch { expected, found: input.shape().to_vec() });
        }
        let outputs = self.session.run(ort::inputs![self.input_name.as_str() => Tensor::from_array(input)?]?)?;
        let output = outputs[self.output_names[0].as_str()].try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        let style = outputs[self.output_names[1].as_str()].try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix2>()?
            .to_owned();
        Ok(Prediction { output, style })
    }

    /// Cell probability at model resolution.
    pub fn cell_probability(&self, image: &DynamicImage) -> Result<Array2<f32>, Error> {
        let prediction = self.predict(preprocess(image, self.image_size))?;
        cell_probability(prediction.output.view())
    }

    /// Decodes an encoded image and returns its probability heatmap as PNG bytes at the
    /// image's own size.
    pub fn segment(&self, image_data: &[u8]) -> Result<Vec<u8>, Error> {
        let image = image::load_from_memory(image_data)?;
        let probability = self.cell_probability(&image)?;
        let heatmap = probability_heatmap(&probability, image.width(), image.height());
        let mut encoded = Cursor::new(Vec::new());
        heatmap.write_to(&mut encoded, ImageFormat::Png)?;
        Ok(encoded.into_inner())
    }
}

/// Deterministic test card: a diagonal gradient with a checkerboard in the green channel.
pub fn synthetic_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let b = (y * 255 / height.max(1)) as u8;
        let g = if (x / 8 + y / 8) % 2 == 0 { 200 } else { 40 };
        Rgb([r, g, b])
    }))
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceCheck {
    pub output_shape: Vec<usize>,
    pub style_shape: Vec<usize>,
    pub probability_range: (f32, f32),
}

/// Runs the exported model once on a synthetic non-square image and checks the output
/// interface and the probability range.
pub fn check_exported_model(path: &Path, config: &ExportConfig) -> Result<InferenceCheck, Error> {
    let session = CellposeSession::open(path, config)?;
    let size = session.image_size();
    let image = synthetic_image(size + size / 2, size - size / 4);
    let prediction = session.predict(preprocess(&image, size))?;

    let output_shape = prediction.output.shape().to_vec();
    let expected = vec![1, config.nout, size as usize, size as usize];
    if output_shape != expected {
        return Err(Error::InvalidOutput(format!("{} has shape {output_shape:?}, expected {expected:?}", config.output_names[0])));
    }
    let style_shape = prediction.style.shape().to_vec();
    if style_shape != [1, STYLE_DIM] {
        return Err(Error::InvalidOutput(format!("{} has shape {style_shape:?}, expected [1, {STYLE_DIM}]", config.output_names[1])));
    }

    let probability = cell_probability(prediction.output.view())?;
    let probability_range = value_range(probability.iter().copied());
    if !(probability_range.0 >= 0.0 && probability_range.1 <= 1.0) {
        return Err(Error::InvalidOutput(format!("cell probability spans {probability_range:?}")));
    }
    log::info!("Inference check passed, cell probability in [{:.3}, {:.3}]", probability_range.0, probability_range.1);
    Ok(InferenceCheck { output_shape, style_shape, probability_range })
}
