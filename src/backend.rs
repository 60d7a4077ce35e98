// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model-execution collaborator trait and model wrapper.
//!
//! [`MIBackend`] is the trait a model implements to be driven by a
//! session: it lists its hook points, hands out caching hooks, and runs
//! one forward evaluation with a [`HookDispatch`] installed.
//! [`MIModel`] wraps a backend with device metadata.

use candle_core::{Device, Tensor};

use crate::error::{MIError, Result};
use crate::hooks::{CachingHooks, HookDispatch, HookPoint, NamesFilter};

// ---------------------------------------------------------------------------
// MIBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method takes the installed hook
/// list as a [`HookDispatch`]: at every hook point it evaluates, the
/// backend passes the flowing value through
/// [`HookDispatch::intercept`] and continues with the result. The dispatch
/// only lives for the duration of the call, so hooks are uninstalled
/// whether the pass succeeds or fails.
///
/// Component names the backend never intercepts are inert: entries bound
/// to them simply never fire.
pub trait MIBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Every hook point this backend intercepts, in evaluation order.
    fn hook_points(&self) -> Vec<HookPoint>;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// One forward evaluation with `hooks` installed.
    ///
    /// When `hooks` has nothing bound at a point, implementations may skip
    /// the [`intercept`](HookDispatch::intercept) call entirely.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor operation failures and
    /// propagates any error raised by an intercepting hook.
    fn forward(&self, input_ids: &Tensor, hooks: &mut dyn HookDispatch) -> Result<Tensor>;

    // --- Caching hooks ---------------------------------------------------

    /// Hook points whose values should be captured for this pass.
    ///
    /// The default selects the matching subset of
    /// [`hook_points`](Self::hook_points) and refuses backward hooks.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if `include_backward` is requested from
    /// a backend without a backward pass.
    fn caching_hooks(&self, filter: &NamesFilter, include_backward: bool) -> Result<CachingHooks> {
        if include_backward {
            return Err(MIError::Config(
                "backward caching hooks are not supported by this backend".into(),
            ));
        }
        Ok(CachingHooks {
            forward: self
                .hook_points()
                .into_iter()
                .filter(|hook| filter.matches(hook))
                .collect(),
            backward: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// MIModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with device metadata.
pub struct MIModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn MIBackend>,
    /// The device this model lives on.
    device: Device,
}

impl MIModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn MIBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Every hook point the backend intercepts.
    #[must_use]
    pub fn hook_points(&self) -> Vec<HookPoint> {
        self.backend.hook_points()
    }

    /// Caching hooks for one pass.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn caching_hooks(&self, filter: &NamesFilter, include_backward: bool) -> Result<CachingHooks> {
        self.backend.caching_hooks(filter, include_backward)
    }

    /// Run a forward pass with `hooks` installed.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: logits at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &mut dyn HookDispatch) -> Result<Tensor> {
        self.backend.forward(input_ids, hooks)
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn MIBackend {
        &*self.backend
    }
}

impl std::fmt::Debug for MIModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MIModel")
            .field("device", &self.device)
            .field("vocab_size", &self.backend.vocab_size())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
