use std::sync::Mutex;

use image::{DynamicImage, Rgb32FImage};
use ndarray::prelude::*;
use ort::tensor::{FromArray, InputTensor};

use super::{EditPipeline, InferenceParams, PipelineError, PipelineMode, Stage};
use crate::tokenizers::{BpeTokenizer, EditPromptTemplate, Token};

/// Edit model exported as a single ONNX graph.
///
/// The graph takes `input_ids` and `attention_mask` (`[2, L]`, negative row first),
/// the conditioning `images` (`[N, 3, H, W]` in `[-1, 1]`), and the scalars
/// `num_inference_steps`, `true_cfg_scale` and `seed`. It returns a single
/// `[B, 3, H, W]` tensor in `[-1, 1]`.
#[derive(Debug)]
pub struct OnnxEditPipeline<Mode> {
    session: Mutex<ort::Session>,
    prompts: PromptEncoder,
    _mode: Mode,
}

impl<Mode: PipelineMode> OnnxEditPipeline<Mode> {
    pub fn new(
        session: ort::Session,
        tokenizer: BpeTokenizer,
        template: EditPromptTemplate,
        max_sequence_length: usize,
    ) -> Self {
        Self {
            session: Mutex::new(session),
            prompts: PromptEncoder {
                tokenizer,
                template,
                max_sequence_length,
            },
            _mode: Mode::default(),
        }
    }
}

impl<Mode: PipelineMode> EditPipeline for OnnxEditPipeline<Mode> {
    fn edit(&self, params: &InferenceParams) -> Result<Vec<DynamicImage>, PipelineError> {
        let count = params.images.len();
        let (ids, mask) = pad_batch(
            &[
                self.prompts.encode(&params.negative_prompt, count),
                self.prompts.encode(&params.prompt, count),
            ],
            self.prompts.tokenizer.pad_token(),
        );
        let images = images_to_array(&params.images)?;
        let seed = seed_value(params.seed)?;

        let session = self.session.lock().map_err(|_| PipelineError::Poisoned)?;
        let outputs = session.run([
            InputTensor::from_array(ids.into_dyn()),
            InputTensor::from_array(mask.into_dyn()),
            Mode::create_tensor(images.as_standard_layout()),
            InputTensor::from_array(Array1::from_elem(1, params.steps as i64).into_dyn()),
            InputTensor::FloatTensor(Array1::from_elem(1, params.true_cfg_scale).into_dyn()),
            InputTensor::from_array(Array1::from_elem(1, seed).into_dyn()),
        ])?;
        let [output] = &outputs[..] else {
            return Err(PipelineError::OutputError(Stage::Edit));
        };
        let output = output.try_extract::<Mode::Float>()?;
        let output: ArrayView4<'_, Mode::Float> = output.view().clone().into_dimensionality()?;
        let output = Mode::into_f32_array(output.into());
        array_to_images(output.view())
    }
}

/// Templated prompt tokenization, capped at the text encoder's context length.
#[derive(Debug)]
struct PromptEncoder {
    tokenizer: BpeTokenizer,
    template: EditPromptTemplate,
    max_sequence_length: usize,
}

impl PromptEncoder {
    fn encode(&self, text: &str, images: usize) -> Vec<Token> {
        let mut tokens = self.tokenizer.encode(self.template.render(text, images));
        tokens.truncate(self.max_sequence_length);
        tokens
    }
}

fn seed_value(seed: u64) -> Result<i64, PipelineError> {
    i64::try_from(seed).map_err(|_| PipelineError::SeedOutOfRange(seed))
}

/// Right-pads token rows to a common length, returning the ids and the attention mask.
fn pad_batch(rows: &[Vec<Token>], pad: Token) -> (Array2<Token>, Array2<Token>) {
    let len = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Array2::from_elem((rows.len(), len), pad);
    let mut mask = Array2::zeros((rows.len(), len));
    for (i, row) in rows.iter().enumerate() {
        ids.slice_mut(s![i, ..row.len()])
            .assign(&ArrayView1::from(row.as_slice()));
        mask.slice_mut(s![i, ..row.len()]).fill(1);
    }
    (ids, mask)
}

fn images_to_array(images: &[DynamicImage]) -> Result<Array4<f32>, PipelineError> {
    let arrays = images
        .iter()
        .map(|image| {
            let shape = (image.height() as usize, image.width() as usize, 3);
            let rgbf = image.to_rgb32f().into_raw();
            Ok(Array3::from_shape_vec(shape, rgbf)?.mapv(|f| f * 2. - 1.))
        })
        .collect::<Result<Vec<_>, ndarray::ShapeError>>()?;
    let views: Vec<_> = arrays.iter().map(Array3::view).collect();

    Ok(ndarray::stack(Axis(0), &views)?.permuted_axes([0, 3, 1, 2]))
}

fn array_to_images(output: ArrayView4<'_, f32>) -> Result<Vec<DynamicImage>, PipelineError> {
    output
        .axis_iter(Axis(0))
        .map(|chw| {
            let (channels, height, width) = chw.dim();
            if channels != 3 {
                return Err(PipelineError::OutputError(Stage::Decode));
            }
            let pixels = chw
                .permuted_axes([1, 2, 0])
                .iter()
                .map(|&f| (f / 2. + 0.5).clamp(0., 1.))
                .collect();
            Rgb32FImage::from_raw(width as u32, height as u32, pixels)
                .map(DynamicImage::from)
                .ok_or(PipelineError::OutputError(Stage::Decode))
        })
        .collect()
}
