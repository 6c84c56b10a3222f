use std::fmt;

use half::f16;
use image::DynamicImage;
use ndarray::{CowArray, Dimension};
use ort::tensor::{InputTensor, TensorDataToType};
use ort::OrtError;
use thiserror::Error;

mod onnx_edit;
mod request;

pub use onnx_edit::OnnxEditPipeline;
pub use request::{EditRequest, InferenceParams, RequestNormalizer};

/// A pretrained image-editing model that maps images, text and knobs to images.
pub trait EditPipeline: Send + Sync {
    fn edit(&self, params: &InferenceParams) -> Result<Vec<DynamicImage>, PipelineError>;
}

pub trait PipelineMode: Default + Send + Sync + 'static {
    type Float: Copy + Default + Into<f32> + TensorDataToType + 'static;

    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D>;
    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D>;
    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor;
}

#[derive(Debug, Default)]
pub struct Fp32Mode;

impl PipelineMode for Fp32Mode {
    type Float = f32;

    #[inline]
    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D> {
        array
    }

    #[inline]
    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D> {
        array
    }

    #[inline]
    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor {
        InputTensor::FloatTensor(cow.into_owned().into_dyn())
    }
}

#[derive(Debug, Default)]
pub struct Fp16Mode;

impl PipelineMode for Fp16Mode {
    type Float = f16;

    fn from_f32_array<D: Dimension>(array: CowArray<'_, f32, D>) -> CowArray<'_, Self::Float, D> {
        array.map(|&x| f16::from_f32(x)).into()
    }

    fn into_f32_array<D: Dimension>(array: CowArray<'_, Self::Float, D>) -> CowArray<'_, f32, D> {
        array.map(|&x| x.into()).into()
    }

    fn create_tensor<D: Dimension>(cow: CowArray<'_, f32, D>) -> InputTensor {
        InputTensor::Float16Tensor(Self::from_f32_array(cow).into_owned().into_dyn())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Stage {
    Edit,
    Decode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Edit => write!(f, "edit graph"),
            Self::Decode => write!(f, "image decoding"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("ORT error: {0}")]
    Ort(#[from] OrtError),
    #[error("unexpected tensor shape: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("unexpected output error in {0}")]
    OutputError(Stage),
    #[error("the pipeline produced no images")]
    EmptyOutput,
    #[error("the pipeline session is poisoned")]
    Poisoned,
    #[error("seed {0} does not fit the graph's i64 input")]
    SeedOutOfRange(u64),
}
