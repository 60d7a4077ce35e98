// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run orchestration: one hooked forward pass per prompt.
//!
//! [`RunOrchestrator`] owns the [`GenerationalCache`]. For each run it
//! composes the hook list in the fixed phase order
//! `[ablations..., patches..., captures...]`, executes exactly one forward
//! evaluation with that list installed, derives losses and predictions
//! from the logits, and only then rotates the cache. A run that fails at
//! any step leaves `last` untouched.

use std::collections::{BTreeMap, HashSet};

use candle_core::{D, Tensor};
use serde::{Deserialize, Serialize};

use crate::backend::MIModel;
use crate::cache::GenerationalCache;
use crate::config::EngineConfig;
use crate::error::{MIError, Result};
use crate::hooks::{HookDispatch, HookEntry, HookPlan, HookPoint};
use crate::interp::ablation::AblationEntry;
use crate::interp::loss::{mean_loss, per_token_loss};
use crate::interp::patch::PatchEntry;
use crate::tokenizer::TokenCodec;

// ---------------------------------------------------------------------------
// PassContext
// ---------------------------------------------------------------------------

/// The installed hook list for one pass, wired to the generational cache.
///
/// Dropped when [`MIModel::forward`] returns, which uninstalls every hook
/// whether the pass succeeded or not.
pub struct PassContext<'a> {
    /// Immutable for the whole pass.
    plan: &'a HookPlan,
    /// Receives captures and freeze snapshots.
    cache: &'a mut GenerationalCache,
}

impl<'a> PassContext<'a> {
    /// Bind `plan` to `cache` for one pass.
    pub const fn new(plan: &'a HookPlan, cache: &'a mut GenerationalCache) -> Self {
        Self { plan, cache }
    }
}

impl HookDispatch for PassContext<'_> {
    fn is_hooked(&self, hook: &HookPoint) -> bool {
        self.plan.is_bound(hook)
    }

    fn intercept(&mut self, hook: &HookPoint, value: Tensor) -> Result<Tensor> {
        let plan = self.plan;
        let mut value = value;
        for entry in plan.entries_at(hook) {
            value = match entry {
                HookEntry::Ablate(ablation) => ablation.apply(value, self.cache)?,
                HookEntry::Patch(patch) => patch.apply(value, self.cache)?,
                HookEntry::Capture(point) => {
                    // BORROW: explicit .clone() — cache holds its own handle
                    self.cache.capture(point.clone(), value.clone());
                    value
                }
            };
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// RunOutput / RunReport
// ---------------------------------------------------------------------------

/// Everything one successful run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Logits at `[1, seq, vocab]`.
    pub logits: Tensor,
    /// Mean next-token loss; `None` for a single-token prompt.
    pub final_loss: Option<f32>,
    /// Next-token loss per position, `seq - 1` values.
    pub per_token_loss: Vec<f32>,
    /// Prompt token IDs.
    pub prompt_tokens: Vec<u32>,
    /// Prompt sub-words, one per token.
    pub prompt_sub_words: Vec<String>,
    /// Argmax prediction at every position except the last.
    pub tokens: Vec<u32>,
    /// Sub-words of [`tokens`](Self::tokens).
    pub sub_words: Vec<String>,
    /// Captured post-intervention values selected by the export policy.
    pub cache: BTreeMap<HookPoint, Tensor>,
}

impl RunOutput {
    /// Convert to plain `f32` buffers for serialization.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if a tensor cannot be read back.
    pub fn report(&self) -> Result<RunReport> {
        let cache = self
            .cache
            .iter()
            .map(|(hook, t)| Ok((hook.to_string(), ExportedTensor::from_tensor(t)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(RunReport {
            logits: ExportedTensor::from_tensor(&self.logits)?,
            final_loss: self.final_loss,
            per_token_loss: self.per_token_loss.clone(),
            prompt_tokens: self.prompt_tokens.clone(),
            prompt_sub_words: self.prompt_sub_words.clone(),
            tokens: self.tokens.clone(),
            sub_words: self.sub_words.clone(),
            cache,
        })
    }
}

/// A tensor flattened to row-major `f32` data plus its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedTensor {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl ExportedTensor {
    /// Read `tensor` back to the host as `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on dtype conversion or transfer failure.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor
                .to_dtype(candle_core::DType::F32)?
                .flatten_all()?
                .to_vec1()?,
        })
    }
}

/// Serializable form of [`RunOutput`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Logits at `[1, seq, vocab]`.
    pub logits: ExportedTensor,
    /// Mean next-token loss.
    pub final_loss: Option<f32>,
    /// Next-token loss per position.
    pub per_token_loss: Vec<f32>,
    /// Prompt token IDs.
    pub prompt_tokens: Vec<u32>,
    /// Prompt sub-words.
    pub prompt_sub_words: Vec<String>,
    /// Predicted token IDs.
    pub tokens: Vec<u32>,
    /// Predicted sub-words.
    pub sub_words: Vec<String>,
    /// Exported captures keyed by component name.
    pub cache: BTreeMap<String, ExportedTensor>,
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Drives hooked forward passes and owns the cache across them.
#[derive(Debug, Default)]
pub struct RunOrchestrator {
    /// `live` / `last` activations.
    cache: GenerationalCache,
    /// Capture and export settings.
    config: EngineConfig,
}

impl RunOrchestrator {
    /// Create an orchestrator with an empty cache.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            cache: GenerationalCache::new(),
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read access to both cache generations.
    #[must_use]
    pub const fn cache(&self) -> &GenerationalCache {
        &self.cache
    }

    /// Drop both generations.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Compose the hook list for the next pass.
    ///
    /// Entries bound to components `model` never intercepts stay in the
    /// plan; they are logged and never fire.
    ///
    /// # Errors
    ///
    /// Propagates [`MIError::Config`] from the backend's caching hooks.
    pub fn plan(
        &self,
        model: &MIModel,
        ablations: &[AblationEntry],
        patches: &[PatchEntry],
    ) -> Result<HookPlan> {
        let caching = model.caching_hooks(&self.config.names_filter, self.config.include_backward)?;
        let plan = HookPlan::compose(ablations, patches, caching.forward);

        let known: HashSet<HookPoint> = model.hook_points().into_iter().collect();
        for hook in plan.bound_hooks().filter(|hook| !known.contains(*hook)) {
            tracing::debug!(component = %hook, "no such hook point on this model; entries are inert");
        }
        Ok(plan)
    }

    /// Run one hooked pass over `prompt`.
    ///
    /// The cache rotates only after logits, losses and predictions are all
    /// computed; any failure returns early with `last` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if the prompt cannot be encoded,
    /// [`MIError::Evaluation`] for an empty prompt or malformed logits,
    /// [`MIError::InvalidAblation`] / [`MIError::InvalidPatch`] from hook
    /// bodies, and [`MIError::Model`] from the forward pass.
    pub fn run(
        &mut self,
        model: &MIModel,
        codec: &dyn TokenCodec,
        ablations: &[AblationEntry],
        patches: &[PatchEntry],
        prompt: &str,
    ) -> Result<RunOutput> {
        let prompt_tokens = codec.encode(prompt)?;
        if prompt_tokens.is_empty() {
            return Err(MIError::Evaluation("prompt encodes to no tokens".into()));
        }
        let input_ids = Tensor::new(prompt_tokens.as_slice(), model.device())?.unsqueeze(0)?;

        let plan = self.plan(model, ablations, patches)?;
        tracing::info!(
            tokens = prompt_tokens.len(),
            ablations = ablations.len(),
            patches = patches.len(),
            entries = plan.len(),
            "starting pass"
        );

        self.cache.begin_pass();
        let result = self.evaluate(model, codec, &plan, &input_ids, prompt_tokens);
        match result {
            Ok(output) => {
                self.cache.rotate();
                tracing::info!(
                    captured = self.cache.num_last(),
                    exported = output.cache.len(),
                    "pass finished"
                );
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(error = %e, "pass failed; cache not rotated");
                Err(e)
            }
        }
    }

    /// Forward pass plus every read-out, without touching `last`.
    fn evaluate(
        &mut self,
        model: &MIModel,
        codec: &dyn TokenCodec,
        plan: &HookPlan,
        input_ids: &Tensor,
        prompt_tokens: Vec<u32>,
    ) -> Result<RunOutput> {
        let logits = {
            let mut ctx = PassContext::new(plan, &mut self.cache);
            model.forward(input_ids, &mut ctx)?
        };

        let per_token = per_token_loss(&logits, input_ids)?;
        let tokens = predicted_tokens(&logits)?;

        let export = self.config.export;
        let cache = self
            .cache
            .live_entries()
            .iter()
            .filter(|(hook, _)| export.includes(hook))
            // BORROW: explicit .clone() — output outlives the next pass
            .map(|(hook, t)| (hook.clone(), t.clone()))
            .collect();

        Ok(RunOutput {
            final_loss: mean_loss(&per_token),
            per_token_loss: per_token,
            prompt_sub_words: codec.str_tokens(&prompt_tokens)?,
            prompt_tokens,
            sub_words: codec.str_tokens(&tokens)?,
            tokens,
            cache,
            logits,
        })
    }
}

/// Argmax token at every position except the last.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `seq - 1` token IDs from the first batch element
fn predicted_tokens(logits: &Tensor) -> Result<Vec<u32>> {
    let (_, seq_len, _) = logits.dims3()?;
    if seq_len < 2 {
        return Ok(Vec::new());
    }
    let ids = logits
        .get(0)?
        .narrow(0, 0, seq_len - 1)?
        .argmax(D::Minus1)?
        .to_vec1::<u32>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
