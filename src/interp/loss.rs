// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token loss read-outs.

use candle_core::{D, DType, Tensor};

use crate::error::{MIError, Result};

/// Negative log-likelihood of each next token under the model's logits.
///
/// Position `i` of the result scores token `i + 1` given the prediction at
/// position `i`, for the first batch element.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - `tokens`: `[batch, seq]` -- token IDs
/// - returns: `seq - 1` losses (empty for a single-token prompt)
///
/// # Errors
///
/// Returns [`MIError::Evaluation`] if the sequence lengths disagree, and
/// [`MIError::Model`] on tensor failures.
pub fn per_token_loss(logits: &Tensor, tokens: &Tensor) -> Result<Vec<f32>> {
    let (_, seq_len, _) = logits.dims3()?;
    let (_, token_len) = tokens.dims2()?;
    if seq_len != token_len {
        return Err(MIError::Evaluation(format!(
            "logits cover {seq_len} positions but the prompt has {token_len} tokens"
        )));
    }
    if seq_len < 2 {
        return Ok(Vec::new());
    }

    // PROMOTE: log-softmax needs f32 for numerical stability
    let logits = logits.get(0)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits.narrow(0, 0, seq_len - 1)?, D::Minus1)?;
    let next = tokens
        .get(0)?
        .narrow(0, 1, seq_len - 1)?
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .contiguous()?;
    let picked = log_probs.gather(&next, 1)?.squeeze(1)?;
    Ok(picked.neg()?.to_vec1()?)
}

/// Mean of the per-token losses; `None` when there is nothing to average.
#[must_use]
pub fn mean_loss(per_token: &[f32]) -> Option<f32> {
    if per_token.is_empty() {
        return None;
    }
    let sum: f32 = per_token.iter().sum();
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    Some(sum / per_token.len() as f32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0_u32, 1, 2]], &Device::Cpu).unwrap();
        let losses = per_token_loss(&logits, &tokens).unwrap();
        assert_eq!(losses.len(), 2);
        for l in &losses {
            assert!((l - 4.0_f32.ln()).abs() < 1e-5);
        }
        let mean = mean_loss(&losses).unwrap();
        assert!((mean - 4.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn confident_prediction_has_low_loss() {
        // Position 0 strongly predicts token 2; the next token is 2.
        let logits = Tensor::new(&[[[0.0_f32, 0.0, 20.0], [0.0, 0.0, 0.0]]], &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[1_u32, 2]], &Device::Cpu).unwrap();
        let losses = per_token_loss(&logits, &tokens).unwrap();
        assert!(losses[0] < 1e-3);
    }

    #[test]
    fn single_token_has_no_loss() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[3_u32]], &Device::Cpu).unwrap();
        let losses = per_token_loss(&logits, &tokens).unwrap();
        assert!(losses.is_empty());
        assert!(mean_loss(&losses).is_none());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[0_u32, 1]], &Device::Cpu).unwrap();
        assert!(per_token_loss(&logits, &tokens).is_err());
    }
}
