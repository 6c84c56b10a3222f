use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use thiserror::Error;
use tracing::info;

use crate::config::EditConfig;
use crate::persist::{PersistError, ResultStore};
use crate::pipelines::{EditPipeline, EditRequest, InferenceParams, PipelineError, RequestNormalizer};

/// Normalizes requests, runs the pipeline and persists results.
///
/// Built once at startup and shared by all request handlers.
pub struct EditService {
    pipeline: Arc<dyn EditPipeline>,
    normalizer: RequestNormalizer,
    store: ResultStore,
}

impl EditService {
    pub fn new(
        pipeline: Arc<dyn EditPipeline>,
        normalizer: RequestNormalizer,
        store: ResultStore,
    ) -> Self {
        Self {
            pipeline,
            normalizer,
            store,
        }
    }

    pub fn from_config(pipeline: Arc<dyn EditPipeline>, config: &EditConfig) -> Self {
        Self::new(
            pipeline,
            RequestNormalizer::new(config),
            ResultStore::new(&config.result_dir),
        )
    }

    pub fn result_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Creates the result directory.
    pub fn prepare(&self) -> Result<(), PersistError> {
        self.store.prepare()
    }

    /// Runs one edit. Returns `Ok(None)` without touching the pipeline when an image is missing.
    pub fn process(&self, request: EditRequest) -> Result<Option<DynamicImage>, EditError> {
        let Some(params) = self.normalizer.normalize(request) else {
            return Ok(None);
        };
        let output = invoke(self.pipeline.as_ref(), &params)?;
        self.store.save(&output)?;
        Ok(Some(output))
    }
}

/// Runs the pipeline once and keeps the first generated image.
pub fn invoke(
    pipeline: &dyn EditPipeline,
    params: &InferenceParams,
) -> Result<DynamicImage, PipelineError> {
    info!(
        width = params.width,
        height = params.height,
        steps = params.steps,
        "starting generation"
    );
    let now = Instant::now();
    let image = pipeline
        .edit(params)?
        .into_iter()
        .next()
        .ok_or(PipelineError::EmptyOutput)?;
    info!(elapsed_secs = now.elapsed().as_secs_f32(), "generation finished");
    Ok(image)
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EditError {
    #[error("inference failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    Persist(#[from] PersistError),
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};
    use pretty_assertions::assert_eq;

    use super::*;

    /// Returns a solid image at the requested size and records what it was asked.
    #[derive(Default)]
    pub(crate) struct FakePipeline {
        pub calls: AtomicUsize,
        pub last_prompt: Mutex<Option<(String, String)>>,
        pub empty: bool,
    }

    impl EditPipeline for FakePipeline {
        fn edit(&self, params: &InferenceParams) -> Result<Vec<DynamicImage>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() =
                Some((params.prompt.clone(), params.negative_prompt.clone()));
            if self.empty {
                return Ok(vec![]);
            }
            let shade = (self.calls.load(Ordering::SeqCst) * 60 % 256) as u8;
            Ok(vec![
                RgbaImage::from_pixel(params.width, params.height, Rgba([shade, 0, 0, 255])).into(),
            ])
        }
    }

    fn blue_square() -> DynamicImage {
        RgbaImage::from_pixel(512, 512, Rgba([0, 0, 255, 255])).into()
    }

    fn service(dir: &Path, pipeline: Arc<FakePipeline>) -> EditService {
        let config = EditConfig {
            result_dir: dir.join("static"),
            seed: Some(1),
            ..Default::default()
        };
        let service = EditService::from_config(pipeline, &config);
        service.prepare().unwrap();
        service
    }

    #[test]
    fn edits_and_persists_square_jpeg() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(FakePipeline::default());
        let service = service(root.path(), pipeline.clone());

        let output = service
            .process(EditRequest {
                target: Some(blue_square()),
                reference: Some(blue_square()),
                instruction: "Change the background to a beach".to_owned(),
            })
            .unwrap()
            .unwrap();

        assert_eq!(output.dimensions(), (1008, 1008));
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            pipeline.last_prompt.lock().unwrap().clone(),
            Some((
                "Change the background to a beach".to_owned(),
                "low quality".to_owned()
            ))
        );

        let bytes = std::fs::read(root.path().join("static").join("result.jpg")).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        let saved = image::load_from_memory(&bytes).unwrap();
        assert_eq!(saved.dimensions(), (1008, 1008));
        assert!(matches!(saved, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn missing_target_skips_pipeline_and_disk() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(FakePipeline::default());
        let service = service(root.path(), pipeline.clone());

        let output = service
            .process(EditRequest {
                target: None,
                reference: Some(blue_square()),
                instruction: "Change the background to a beach".to_owned(),
            })
            .unwrap();

        assert!(output.is_none());
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
        assert!(!root.path().join("static").join("result.jpg").exists());
    }

    #[test]
    fn sequential_edits_leave_the_last_result() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(FakePipeline::default());
        let service = service(root.path(), pipeline.clone());

        let mut last = None;
        for _ in 0..3 {
            last = service
                .process(EditRequest {
                    target: Some(blue_square()),
                    reference: Some(blue_square()),
                    instruction: String::new(),
                })
                .unwrap();
        }

        let expected = last.unwrap().to_rgb8().get_pixel(10, 10).0;
        let saved = image::open(root.path().join("static").join("result.jpg"))
            .unwrap()
            .to_rgb8();
        let actual = saved.get_pixel(10, 10).0;
        for (a, e) in actual.iter().zip(expected) {
            assert!(a.abs_diff(e) <= 6, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn empty_pipeline_output_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(FakePipeline {
            empty: true,
            ..Default::default()
        });
        let service = service(root.path(), pipeline);

        let result = service.process(EditRequest {
            target: Some(blue_square()),
            reference: Some(blue_square()),
            instruction: String::new(),
        });
        assert!(matches!(
            result,
            Err(EditError::Pipeline(PipelineError::EmptyOutput))
        ));
    }
}
