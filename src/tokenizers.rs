mod bpe;
mod template;

pub use bpe::{BpeTokenizer, TokenizerError};
pub use template::EditPromptTemplate;

pub type Token = i64;
