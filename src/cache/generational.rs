// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two-generation activation cache.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::hooks::HookPoint;

/// Captured values from the current pass (`live`) and the previous
/// successful pass (`last`).
///
/// Lifecycle: `live` is cleared when a pass begins, filled by capture
/// hooks during the pass, and promoted to `last` by [`rotate`](Self::rotate)
/// once the pass succeeds. A failed pass never rotates, so `last` stays
/// valid for the retry.
///
/// Freeze snapshots taken for components absent from `last` live in a
/// third, pass-scoped map: they are visible to later freezes in the same
/// pass and never leak into `last`.
///
/// Tensors are immutable, so every stored value is a snapshot: later
/// interceptions produce new tensors and never alias a cached one.
///
/// # Example
///
/// ```
/// use candle_patch::{GenerationalCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let mut cache = GenerationalCache::new();
/// let t = Tensor::new(&[1.0_f32, 2.0], &Device::Cpu).unwrap();
/// cache.capture(HookPoint::Embed, t);
/// assert!(cache.live(&HookPoint::Embed).is_some());
///
/// cache.rotate();
/// assert!(cache.live(&HookPoint::Embed).is_none());
/// assert!(cache.last(&HookPoint::Embed).is_some());
/// ```
#[derive(Debug, Default, Clone)]
pub struct GenerationalCache {
    /// Values captured during the in-flight pass.
    live: HashMap<HookPoint, Tensor>,
    /// Values finalized by the previous successful pass.
    last: HashMap<HookPoint, Tensor>,
    /// Freeze snapshots for components with no `last` value, this pass only.
    pinned: HashMap<HookPoint, Tensor>,
}

impl GenerationalCache {
    /// Create an empty cache (both generations empty).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass: discard anything a failed pass left in `live`.
    pub fn begin_pass(&mut self) {
        self.live.clear();
        self.pinned.clear();
    }

    /// Record `value` for `hook` in the live generation, overwriting any
    /// earlier capture of the same hook in this pass.
    pub fn capture(&mut self, hook: HookPoint, value: Tensor) {
        self.live.insert(hook, value);
    }

    /// The reference a freeze of `hook` pins against: the `last` value if
    /// there is one, else a snapshot of `value` kept for the rest of the
    /// pass.
    ///
    /// First write wins: a second freeze of the same component within one
    /// pass reuses the first snapshot. Snapshots are dropped by
    /// [`begin_pass`](Self::begin_pass) and [`rotate`](Self::rotate).
    pub fn freeze_reference(&mut self, hook: &HookPoint, value: &Tensor) -> &Tensor {
        match self.last.get(hook) {
            Some(reference) => reference,
            // BORROW: explicit .clone() — owned key and snapshot for the map
            None => self.pinned.entry(hook.clone()).or_insert_with(|| value.clone()),
        }
    }

    /// Promote `live` to `last` and start an empty `live`.
    ///
    /// The previous `last` generation is dropped.
    pub fn rotate(&mut self) {
        self.last = std::mem::take(&mut self.live);
        self.pinned.clear();
    }

    /// Drop both generations.
    pub fn clear(&mut self) {
        self.live.clear();
        self.last.clear();
        self.pinned.clear();
    }

    /// Value captured for `hook` earlier in this pass.
    #[must_use]
    pub fn live(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.live.get(hook)
    }

    /// Value finalized for `hook` by the previous pass.
    #[must_use]
    pub fn last(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.last.get(hook)
    }

    /// The whole live generation.
    #[must_use]
    pub const fn live_entries(&self) -> &HashMap<HookPoint, Tensor> {
        &self.live
    }

    /// The whole last generation.
    #[must_use]
    pub const fn last_entries(&self) -> &HashMap<HookPoint, Tensor> {
        &self.last
    }

    /// Number of values in the live generation.
    #[must_use]
    pub fn num_live(&self) -> usize {
        self.live.len()
    }

    /// Number of values in the last generation.
    #[must_use]
    pub fn num_last(&self) -> usize {
        self.last.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
