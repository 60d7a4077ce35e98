// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenization glue: turn a prompt into token IDs and token IDs back into
//! display sub-words.
//!
//! [`TokenCodec`] is the seam a session uses; [`MITokenizer`] implements
//! it on top of the `HuggingFace` `tokenizers` crate.

use crate::error::Result;
#[cfg(feature = "hf-tokenizer")]
use crate::error::MIError;

/// Encode/decode interface used by a session to build its run response.
pub trait TokenCodec: Send + Sync {
    /// Encode a prompt into token IDs, adding the model's special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`](crate::MIError::Tokenizer) if
    /// encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// The display string of a single token.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`](crate::MIError::Tokenizer) if the ID
    /// cannot be decoded.
    fn token_str(&self, id: u32) -> Result<String>;

    /// Display strings of every token in `ids`, one per token.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`](crate::MIError::Tokenizer) if any ID
    /// cannot be decoded.
    fn str_tokens(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter().map(|&id| self.token_str(id)).collect()
    }
}

/// Unified tokenizer over the `HuggingFace` backend.
///
/// # Example
///
/// ```no_run
/// use candle_patch::{MITokenizer, TokenCodec};
///
/// # fn main() -> candle_patch::Result<()> {
/// let tok = MITokenizer::from_hf_path("tokenizer.json")?;
/// let ids = tok.encode("The Eiffel Tower is in")?;
/// let words = tok.str_tokens(&ids)?;
/// assert_eq!(ids.len(), words.len());
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "hf-tokenizer")]
#[non_exhaustive]
pub enum MITokenizer {
    /// `HuggingFace` `tokenizers` backend.
    HuggingFace(Box<tokenizers::Tokenizer>),
}

#[cfg(feature = "hf-tokenizer")]
impl MITokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_hf_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            MIError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::HuggingFace(Box::new(tok)))
    }

    /// Wrap an already-loaded `HuggingFace` tokenizer.
    #[must_use]
    pub fn from_hf(tokenizer: tokenizers::Tokenizer) -> Self {
        Self::HuggingFace(Box::new(tokenizer))
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::HuggingFace(tok) => tok
                .decode(ids, false)
                .map_err(|e| MIError::Tokenizer(format!("HF decode failed: {e}"))),
        }
    }

    /// Get vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        match self {
            Self::HuggingFace(tok) => tok.get_vocab_size(true),
        }
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TokenCodec for MITokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::HuggingFace(tok) => {
                let encoding = tok
                    .encode(text, true)
                    .map_err(|e| MIError::Tokenizer(format!("HF encode failed: {e}")))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    fn token_str(&self, id: u32) -> Result<String> {
        self.decode(&[id])
    }
}

#[cfg(feature = "hf-tokenizer")]
impl std::fmt::Debug for MITokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HuggingFace(_) => f.debug_tuple("HuggingFace").field(&"...").finish(),
        }
    }
}
