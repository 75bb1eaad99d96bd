use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{ChatError, Result};

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Text to token ids and back
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn eos_token_id(&self) -> u32;
}

impl<T: Tokenizer + ?Sized> Tokenizer for Arc<T> {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self).decode(ids, skip_special_tokens)
    }

    fn eos_token_id(&self) -> u32 {
        (**self).eos_token_id()
    }
}

/// Tokenizer backed by a HuggingFace `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token_id: u32,
}

impl HfTokenizer {
    /// Load `path`, taking the first of `eos_tokens` the vocabulary knows as
    /// the end-of-sequence id.
    pub fn from_file(path: impl AsRef<Path>, eos_tokens: &[&str]) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ChatError::Tokenizer(format!("failed to load {path:?}: {e}")))?;
        Self::new(inner, eos_tokens)
    }

    pub fn new(inner: tokenizers::Tokenizer, eos_tokens: &[&str]) -> Result<Self> {
        let (token, eos_token_id) = eos_tokens
            .iter()
            .find_map(|t| inner.token_to_id(t).map(|id| (*t, id)))
            .ok_or_else(|| {
                ChatError::Tokenizer(format!("none of the EOS tokens {eos_tokens:?} are in the vocabulary"))
            })?;
        info!(
            "Tokenizer ready: vocab_size={}, eos={} ({})",
            inner.get_vocab_size(true),
            token,
            eos_token_id
        );
        Ok(Self { inner, eos_token_id })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| ChatError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| ChatError::Tokenizer(format!("decode failed: {e}")))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}
