use image::imageops::{self, FilterType};
use image::DynamicImage;

use rand::Rng;

use crate::config::{EditConfig, MAX_SEED};

/// One form submission.
#[derive(Debug, Default)]
pub struct EditRequest {
    pub target: Option<DynamicImage>,
    pub reference: Option<DynamicImage>,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct InferenceParams {
    /// Conditioning images, target first.
    pub images: Vec<DynamicImage>,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub true_cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

/// Turns edit requests into pipeline parameters at a fixed square resolution.
#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    resolution: u32,
    steps: usize,
    true_cfg_scale: f32,
    negative_prompt: String,
    seed: Option<u64>,
}

impl RequestNormalizer {
    pub fn new(config: &EditConfig) -> Self {
        Self {
            resolution: config.resolution,
            steps: config.steps,
            true_cfg_scale: config.true_cfg_scale,
            negative_prompt: config.negative_prompt.clone(),
            seed: config.seed,
        }
    }

    /// Returns `None` when either image is missing.
    pub fn normalize(&self, request: EditRequest) -> Option<InferenceParams> {
        let (Some(target), Some(reference)) = (request.target, request.reference) else {
            return None;
        };

        Some(InferenceParams {
            images: vec![self.coerce(&target), self.coerce(&reference)],
            prompt: request.instruction,
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            true_cfg_scale: self.true_cfg_scale,
            width: self.resolution,
            height: self.resolution,
            seed: self.seed.unwrap_or_else(random_seed),
        })
    }

    fn coerce(&self, image: &DynamicImage) -> DynamicImage {
        let rgb = image.to_rgb8();
        imageops::resize(&rgb, self.resolution, self.resolution, FilterType::CatmullRom).into()
    }
}

/// Draws a seed that fits the graph's signed 64-bit input.
fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..=MAX_SEED)
}

#[cfg(test)]
mod test {
    use image::{GenericImageView, Rgba, RgbaImage};
    use pretty_assertions::assert_eq;

    use super::*;

    fn blue_square() -> DynamicImage {
        RgbaImage::from_pixel(512, 512, Rgba([0, 0, 255, 128])).into()
    }

    fn normalizer() -> RequestNormalizer {
        RequestNormalizer::new(&EditConfig {
            seed: Some(7),
            ..Default::default()
        })
    }

    #[test]
    fn coerces_both_images_to_square_rgb() {
        let params = normalizer()
            .normalize(EditRequest {
                target: Some(blue_square()),
                reference: Some(RgbaImage::new(300, 40).into()),
                instruction: "Change the background to a beach".to_owned(),
            })
            .unwrap();

        assert_eq!(params.images.len(), 2);
        for image in &params.images {
            assert_eq!(image.dimensions(), (1008, 1008));
            assert!(matches!(image, DynamicImage::ImageRgb8(_)));
        }
        assert_eq!(params.images[0].to_rgb8().get_pixel(504, 504).0, [0, 0, 255]);
        assert_eq!((params.width, params.height), (1008, 1008));
        assert_eq!(params.prompt, "Change the background to a beach");
        assert_eq!(params.seed, 7);
    }

    #[test]
    fn carries_the_single_negative_prompt() {
        // the duplicated keyword in the old script resolved to its later value
        let params = normalizer()
            .normalize(EditRequest {
                target: Some(blue_square()),
                reference: Some(blue_square()),
                instruction: String::new(),
            })
            .unwrap();

        assert_eq!(params.negative_prompt, "low quality");
        assert_eq!(params.steps, 30);
        assert_eq!(params.true_cfg_scale, 4.0);
    }

    #[test]
    fn missing_image_yields_nothing() {
        let normalizer = normalizer();
        assert!(normalizer
            .normalize(EditRequest {
                target: None,
                reference: Some(blue_square()),
                instruction: "x".to_owned(),
            })
            .is_none());
        assert!(normalizer
            .normalize(EditRequest {
                target: Some(blue_square()),
                reference: None,
                instruction: "x".to_owned(),
            })
            .is_none());
    }

    #[test]
    fn random_seeds_stay_non_negative() {
        let normalizer = RequestNormalizer::new(&EditConfig::default());
        for _ in 0..64 {
            let params = normalizer
                .normalize(EditRequest {
                    target: Some(blue_square()),
                    reference: Some(blue_square()),
                    instruction: String::new(),
                })
                .unwrap();
            assert!(params.seed <= MAX_SEED);
        }
    }
}
