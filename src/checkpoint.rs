use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use ort::OrtError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AttentionBackend, Device, EditConfig, Precision};
use crate::pipelines::{EditPipeline, Fp16Mode, Fp32Mode, OnnxEditPipeline};
use crate::tokenizers::{BpeTokenizer, EditPromptTemplate, TokenizerError};

const TOKENIZER_DIR: &str = "tokenizer";
const TOKENIZER_FILES: [&str; 3] = [
    "tokenizer/tokenizer_config.json",
    "tokenizer/vocab.json",
    "tokenizer/merges.txt",
];
const MODEL_FILE: &str = "onnx/model.onnx";
const MODEL_DATA_FILE: &str = "onnx/model.onnx_data";
const FUSED_MODEL_FILE: &str = "onnx/model.fused.onnx";
const FUSED_MODEL_DATA_FILE: &str = "onnx/model.fused.onnx_data";

/// Loads the edit pipeline described by `config`.
///
/// Enabling memory-efficient attention is best effort: when the fused graph is
/// missing or fails to load, a warning is logged and the default graph is used.
pub fn load_pipeline(
    env: Arc<ort::Environment>,
    config: &EditConfig,
) -> Result<Arc<dyn EditPipeline>, CheckpointLoadError> {
    info!(
        model_id = %config.model_id,
        precision = ?config.precision,
        device = ?config.device,
        "loading edit pipeline"
    );
    let checkpoint = Checkpoint::resolve(&config.model_id)?;
    let tokenizer = BpeTokenizer::open(checkpoint.tokenizer_dir())?;
    let session = checkpoint.open_session(&env, config.device, config.attention)?;
    let template = EditPromptTemplate::default();

    let pipeline: Arc<dyn EditPipeline> = match config.precision {
        Precision::Fp32 => Arc::new(OnnxEditPipeline::<Fp32Mode>::new(
            session,
            tokenizer,
            template,
            config.max_sequence_length,
        )),
        Precision::Fp16 => Arc::new(OnnxEditPipeline::<Fp16Mode>::new(
            session,
            tokenizer,
            template,
            config.max_sequence_length,
        )),
    };
    info!("edit pipeline ready");
    Ok(pipeline)
}

/// Files of an exported edit checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    tokenizer_dir: PathBuf,
    model: PathBuf,
    fused_model: Option<PathBuf>,
}

impl Checkpoint {
    /// Treats `model_id` as a local directory when one exists, as a hub repository otherwise.
    pub fn resolve(model_id: &str) -> Result<Self, CheckpointLoadError> {
        let local = Path::new(model_id);
        if local.is_dir() {
            Self::from_dir(local)
        } else {
            Self::from_hub(model_id)
        }
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, CheckpointLoadError> {
        let dir = dir.as_ref();
        for file in TOKENIZER_FILES.into_iter().chain([MODEL_FILE]) {
            let path = dir.join(file);
            if !path.is_file() {
                return Err(CheckpointLoadError::MissingFile(path));
            }
        }
        let fused_model = dir.join(FUSED_MODEL_FILE);

        Ok(Self {
            tokenizer_dir: dir.join(TOKENIZER_DIR),
            model: dir.join(MODEL_FILE),
            fused_model: fused_model.is_file().then_some(fused_model),
        })
    }

    pub fn from_hub(model_id: &str) -> Result<Self, CheckpointLoadError> {
        info!(model_id, "fetching checkpoint from the hub");
        let repo = Api::new()?.model(model_id.to_owned());

        let mut tokenizer_files = TOKENIZER_FILES
            .into_iter()
            .map(|file| repo.get(file))
            .collect::<Result<Vec<_>, _>>()?;
        let tokenizer_dir = tokenizer_files
            .pop()
            .and_then(|path| path.parent().map(Path::to_path_buf))
            .ok_or_else(|| CheckpointLoadError::MissingFile(TOKENIZER_DIR.into()))?;

        let model = repo.get(MODEL_FILE)?;
        fetch_optional(&repo, MODEL_DATA_FILE);
        let fused_model = fetch_optional(&repo, FUSED_MODEL_FILE);
        if fused_model.is_some() {
            fetch_optional(&repo, FUSED_MODEL_DATA_FILE);
        }

        Ok(Self {
            tokenizer_dir,
            model,
            fused_model,
        })
    }

    pub fn tokenizer_dir(&self) -> &Path {
        &self.tokenizer_dir
    }

    pub fn has_fused_attention(&self) -> bool {
        self.fused_model.is_some()
    }

    fn open_session(
        &self,
        env: &Arc<ort::Environment>,
        device: Device,
        attention: AttentionBackend,
    ) -> Result<ort::Session, OrtError> {
        let preferred = preferred_graph(attention, self.fused_model.as_deref());
        if attention == AttentionBackend::MemoryEfficient && preferred.is_none() {
            warn!("the checkpoint has no fused attention graph, using default attention");
        }
        load_with_fallback(preferred, &self.model, |path| {
            build_session(env, device, path)
        })
    }
}

/// Picks the graph to try before the default one, if any.
fn preferred_graph(attention: AttentionBackend, fused_model: Option<&Path>) -> Option<&Path> {
    match attention {
        AttentionBackend::MemoryEfficient => fused_model,
        AttentionBackend::Default => None,
    }
}

/// Builds from `preferred` when given, falling back to `fallback` with a warning on failure.
fn load_with_fallback<T, E: fmt::Display>(
    preferred: Option<&Path>,
    fallback: &Path,
    mut build: impl FnMut(&Path) -> Result<T, E>,
) -> Result<T, E> {
    if let Some(path) = preferred {
        match build(path) {
            Ok(session) => {
                info!("memory-efficient attention enabled");
                return Ok(session);
            }
            Err(err) => warn!(%err, "memory-efficient attention failed, using default attention"),
        }
    }
    build(fallback)
}

fn build_session(
    env: &Arc<ort::Environment>,
    device: Device,
    path: &Path,
) -> Result<ort::Session, OrtError> {
    debug!(path = %path.display(), "building ORT session");
    ort::SessionBuilder::new(env)?
        .with_execution_providers(device.execution_providers())?
        .with_optimization_level(ort::GraphOptimizationLevel::Level3)?
        .with_model_from_file(path)
}

fn fetch_optional(repo: &ApiRepo, file: &str) -> Option<PathBuf> {
    match repo.get(file) {
        Ok(path) => Some(path),
        Err(err) => {
            debug!(file, %err, "optional checkpoint file unavailable");
            None
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointLoadError {
    #[error("ORT error: {0}")]
    Ort(#[from] OrtError),
    #[error("{0}")]
    Tokenizer(#[from] TokenizerError),
    #[error("model hub error: {0}")]
    Hub(#[from] ApiError),
    #[error("checkpoint file not found: {}", .0.display())]
    MissingFile(PathBuf),
}

#[cfg(test)]
mod test {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn touch(dir: &Path, file: &str) {
        let path = dir.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn resolves_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        for file in TOKENIZER_FILES.into_iter().chain([MODEL_FILE]) {
            touch(dir.path(), file);
        }

        let checkpoint = Checkpoint::resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(checkpoint.tokenizer_dir(), dir.path().join("tokenizer"));
        assert!(!checkpoint.has_fused_attention());

        touch(dir.path(), FUSED_MODEL_FILE);
        assert!(Checkpoint::from_dir(dir.path()).unwrap().has_fused_attention());
    }

    #[test]
    fn reports_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        for file in TOKENIZER_FILES {
            touch(dir.path(), file);
        }

        match Checkpoint::from_dir(dir.path()) {
            Err(CheckpointLoadError::MissingFile(path)) => {
                assert_eq!(path, dir.path().join(MODEL_FILE))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn prefers_fused_graph_only_for_memory_efficient_attention() {
        let fused = Path::new("onnx/model.fused.onnx");
        assert_eq!(preferred_graph(AttentionBackend::Default, Some(fused)), None);
        assert_eq!(preferred_graph(AttentionBackend::MemoryEfficient, None), None);
        assert_eq!(
            preferred_graph(AttentionBackend::MemoryEfficient, Some(fused)),
            Some(fused)
        );
    }

    #[test]
    fn falls_back_to_default_graph_when_fused_fails() {
        let fused = Path::new(FUSED_MODEL_FILE);
        let model = Path::new(MODEL_FILE);
        let mut attempts = vec![];

        let loaded = load_with_fallback(Some(fused), model, |path| {
            attempts.push(path.to_path_buf());
            if path == fused {
                Err("unsupported operator")
            } else {
                Ok(path.to_path_buf())
            }
        });

        assert_eq!(loaded, Ok(model.to_path_buf()));
        assert_eq!(attempts, [fused.to_path_buf(), model.to_path_buf()]);
    }

    #[test]
    fn uses_fused_graph_when_it_loads() {
        let fused = Path::new(FUSED_MODEL_FILE);
        let mut attempts = 0;

        let loaded = load_with_fallback(Some(fused), Path::new(MODEL_FILE), |path| {
            attempts += 1;
            Ok::<_, String>(path.to_path_buf())
        });

        assert_eq!(loaded, Ok(fused.to_path_buf()));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn default_graph_failure_is_reported() {
        let loaded: Result<(), _> =
            load_with_fallback(None, Path::new(MODEL_FILE), |_| Err("corrupt model"));
        assert_eq!(loaded, Err("corrupt model"));
    }
}
