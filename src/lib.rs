mod checkpoint;
mod config;
pub mod persist;
pub mod pipelines;
pub mod server;
pub mod service;
mod tokenizers;

pub use checkpoint::{load_pipeline, Checkpoint, CheckpointLoadError};
pub use config::{
    AttentionBackend, ConfigError, Device, DeviceId, EditConfig, Precision, MAX_SEED, PATCH_SIZE,
};
pub use ort;
pub use service::{EditError, EditService};
pub use tokenizers::{BpeTokenizer, EditPromptTemplate, TokenizerError};
