// SPDX-License-Identifier: MIT OR Apache-2.0

//! Zero and freeze ablations.
//!
//! Clients declare ablations as a nested map: component name → named-slice
//! id → `{slice, ablationType}`. [`build_ablation_hooks`] flattens that map
//! into [`AblationEntry`] records in a canonical order and sorts them by
//! kind priority; [`AblationEntry::apply`] is the interception itself.
//!
//! ## Ablation kinds
//!
//! - **Zero**: overwrite the region with zeros, unconditionally.
//! - **Freeze**: overwrite the region with the value the component had in
//!   the previous pass. With no previous value the current value is pinned
//!   as the reference for the rest of the pass, so the region is left as
//!   computed. The pin never outlives the pass.
//!   Where the previous value does not cover the region (e.g. a shorter
//!   prompt last time) the uncovered part is zero-filled.
//!
//! Freeze runs before zero so that it pins its anchor before zero wipes
//! other regions of the same component.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::cache::GenerationalCache;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;
use crate::interp::RejectedEntry;
use crate::slice::{Region, Slice, min_shape_intersect, read_region, write_region, zero_region};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// How an ablated region is overwritten.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AblationKind {
    /// Overwrite with zeros.
    Zero,
    /// Pin to the previous pass's value.
    Freeze,
}

impl AblationKind {
    /// Sort priority: lower runs first.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Freeze => 0,
            Self::Zero => 1,
        }
    }
}

/// One named-slice configuration on a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AblationSlice {
    /// Region to ablate.
    pub slice: Slice,
    /// How to ablate it.
    #[serde(rename = "ablationType")]
    pub kind: AblationKind,
}

/// Declarative ablation state: component → named-slice id → [`AblationSlice`].
///
/// Backed by ordered maps, so iteration is lexicographic by component and
/// then by slice id whatever order the client sent.
///
/// # Example
///
/// ```
/// use candle_patch::{AblationKind, AblationMap, Slice};
///
/// let map = AblationMap::new()
///     .with("blocks.0.attn.hook_q", "first-two", Slice::from_pairs(&[(0, 1), (0, 2)]), AblationKind::Zero)
///     .with("blocks.0.attn.hook_q", "anchor", Slice::from_pairs(&[(0, 1), (2, 3)]), AblationKind::Freeze);
/// assert_eq!(map.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[must_use]
pub struct AblationMap(BTreeMap<String, BTreeMap<String, AblationSlice>>);

impl AblationMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one named slice on a component.
    pub fn with(mut self, component: &str, slice_id: &str, slice: Slice, kind: AblationKind) -> Self {
        self.insert(component, slice_id, slice, kind);
        self
    }

    /// Add (or replace) one named slice on a component.
    pub fn insert(&mut self, component: &str, slice_id: &str, slice: Slice, kind: AblationKind) {
        self.0
            .entry(component.to_owned())
            .or_default()
            .insert(slice_id.to_owned(), AblationSlice { slice, kind });
    }

    /// Iterate `(component, slice_id, config)` in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &AblationSlice)> {
        self.0.iter().flat_map(|(component, slices)| {
            slices
                .iter()
                .map(move |(id, cfg)| (component.as_str(), id.as_str(), cfg))
        })
    }

    /// Total number of named slices across all components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Whether no slice is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// AblationEntry
// ---------------------------------------------------------------------------

/// One ablation bound to a hook point, as installed in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AblationEntry {
    /// Component the ablation intercepts.
    pub hook: HookPoint,
    /// Named-slice id it came from.
    pub slice_id: String,
    /// Region to overwrite.
    pub slice: Slice,
    /// How to overwrite it.
    pub kind: AblationKind,
}

impl AblationEntry {
    /// Apply this ablation to the value flowing through its hook point.
    ///
    /// Values strictly outside the resolved region are never modified.
    ///
    /// # Shapes
    /// - `value`: any shape with at least `slice.len()` dimensions
    /// - returns: same shape as `value`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidAblation`] if the slice does not resolve
    /// against the value's shape, and [`MIError::Model`] on tensor failures.
    pub fn apply(&self, value: Tensor, cache: &mut GenerationalCache) -> Result<Tensor> {
        let region = self.slice.resolve(value.dims()).map_err(|e| {
            MIError::InvalidAblation(format!("`{}` slice `{}`: {e}", self.hook, self.slice_id))
        })?;

        match self.kind {
            AblationKind::Zero => zero_region(&value, &region),
            AblationKind::Freeze => {
                let reference = cache.freeze_reference(&self.hook, &value);
                let fill = frozen_fill(reference, &region, &value)?;
                write_region(&value, &region, &fill)
            }
        }
    }
}

/// Build the tensor written into a frozen `region`: the reference values on
/// the extent both passes share, zeros elsewhere.
///
/// # Shapes
/// - returns: `region.dims()`
fn frozen_fill(reference: &Tensor, region: &Region, value: &Tensor) -> Result<Tensor> {
    let fill = Tensor::zeros(region.dims(), value.dtype(), value.device())?;
    let Some(source) = region.clamp_to(reference.dims()) else {
        // Rank changed between passes: no valid historical value.
        return Ok(fill);
    };
    let overlap = min_shape_intersect(region, &source);
    if overlap.is_empty() {
        return Ok(fill);
    }
    let piece = read_region(reference, &source.offset(&overlap))?;
    write_region(&fill, &overlap, &piece)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Flatten an [`AblationMap`] into the ordered ablation hook list.
///
/// Entries are enumerated in canonical (lexicographic) order, then stably
/// sorted by [`AblationKind::priority`]: every freeze precedes every zero,
/// and entries of the same kind keep their canonical order. Entries whose
/// slice is structurally malformed are left out and reported.
#[must_use]
pub fn build_ablation_hooks(map: &AblationMap) -> (Vec<AblationEntry>, Vec<RejectedEntry>) {
    let mut entries = Vec::with_capacity(map.len());
    let mut rejected = Vec::new();

    for (component, slice_id, cfg) in map.iter() {
        if let Err(e) = cfg.slice.validate() {
            tracing::warn!(component, slice_id, error = %e, "rejecting ablation entry");
            rejected.push(RejectedEntry::new(component, slice_id, e));
            continue;
        }
        entries.push(AblationEntry {
            hook: HookPoint::from(component),
            slice_id: slice_id.to_owned(),
            // BORROW: explicit .clone() — entry owns its slice
            slice: cfg.slice.clone(),
            kind: cfg.kind,
        });
    }

    entries.sort_by_key(|entry| entry.kind.priority());
    (entries, rejected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn vec_tensor(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    fn entry(component: &str, pairs: &[(i64, i64)], kind: AblationKind) -> AblationEntry {
        AblationEntry {
            hook: HookPoint::from(component),
            slice_id: "s".into(),
            slice: Slice::from_pairs(pairs),
            kind,
        }
    }

    #[test]
    fn freeze_sorts_before_zero() {
        let map = AblationMap::new()
            .with("a", "z1", Slice::from_pairs(&[(0, 1)]), AblationKind::Zero)
            .with("b", "f1", Slice::from_pairs(&[(0, 1)]), AblationKind::Freeze)
            .with("c", "z2", Slice::from_pairs(&[(0, 1)]), AblationKind::Zero)
            .with("d", "f2", Slice::from_pairs(&[(0, 1)]), AblationKind::Freeze);
        let (entries, rejected) = build_ablation_hooks(&map);
        assert!(rejected.is_empty());

        let order: Vec<(String, AblationKind)> = entries
            .iter()
            .map(|e| (e.hook.to_string(), e.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("b".to_string(), AblationKind::Freeze),
                ("d".to_string(), AblationKind::Freeze),
                ("a".to_string(), AblationKind::Zero),
                ("c".to_string(), AblationKind::Zero),
            ]
        );
    }

    #[test]
    fn build_is_independent_of_input_order() {
        let forward = r#"{"x": {"s1": {"slice": [[0, 1]], "ablationType": "zero"}},
                          "y": {"s2": {"slice": [[0, 2]], "ablationType": "freeze"}}}"#;
        let backward = r#"{"y": {"s2": {"slice": [[0, 2]], "ablationType": "freeze"}},
                           "x": {"s1": {"slice": [[0, 1]], "ablationType": "zero"}}}"#;
        let a: AblationMap = serde_json::from_str(forward).unwrap();
        let b: AblationMap = serde_json::from_str(backward).unwrap();
        assert_eq!(build_ablation_hooks(&a).0, build_ablation_hooks(&b).0);
    }

    #[test]
    fn malformed_entry_rejected_alone() {
        let map = AblationMap::new()
            .with("a", "bad", Slice::from_pairs(&[(3, 1)]), AblationKind::Zero)
            .with("a", "good", Slice::from_pairs(&[(0, 1)]), AblationKind::Zero);
        let (entries, rejected) = build_ablation_hooks(&map);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slice_id, "good");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].slice_id, "bad");
    }

    #[test]
    fn zero_only_touches_region() {
        let mut cache = GenerationalCache::new();
        let value = Tensor::new(&[[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu).unwrap();
        let out = entry("a", &[(0, 1), (1, -1)], AblationKind::Zero)
            .apply(value, &mut cache)
            .unwrap();
        let v: Vec<Vec<f32>> = out.to_vec2().unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0, 0.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn freeze_reuses_previous_pass() {
        let mut cache = GenerationalCache::new();
        cache.capture(HookPoint::from("blockA"), vec_tensor(&[1.0, 2.0, 3.0, 4.0]));
        cache.rotate();

        let out = entry("blockA", &[(0, 2)], AblationKind::Freeze)
            .apply(vec_tensor(&[9.0, 9.0, 9.0, 9.0]), &mut cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 9.0, 9.0]);
    }

    #[test]
    fn freeze_first_pass_pins_current_value() {
        let mut cache = GenerationalCache::new();
        let freeze = entry("blockA", &[(1, 3)], AblationKind::Freeze);
        let out = freeze
            .apply(vec_tensor(&[5.0, 6.0, 7.0, 8.0]), &mut cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
        assert!(cache.last(&HookPoint::from("blockA")).is_none());

        // Later in the same pass the snapshot still holds.
        let out = freeze
            .apply(vec_tensor(&[0.0, 0.0, 0.0, 0.0]), &mut cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![0.0, 6.0, 7.0, 0.0]);
    }

    #[test]
    fn freeze_zero_fills_beyond_previous_extent() {
        let mut cache = GenerationalCache::new();
        // Previous pass had a shorter sequence.
        cache.capture(HookPoint::from("blockA"), vec_tensor(&[1.0, 2.0]));
        cache.rotate();

        let out = entry("blockA", &[(0, -1)], AblationKind::Freeze)
            .apply(vec_tensor(&[9.0, 9.0, 9.0, 9.0]), &mut cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn slice_with_too_many_dims_is_invalid_ablation() {
        let mut cache = GenerationalCache::new();
        let err = entry("a", &[(0, 1), (0, 1)], AblationKind::Zero)
            .apply(vec_tensor(&[1.0, 2.0]), &mut cache)
            .unwrap_err();
        assert!(matches!(err, MIError::InvalidAblation(_)));
    }

    #[test]
    fn ablation_map_wire_roundtrip() {
        let json = r#"{"blockA":{"s1":{"slice":[[0,2]],"ablationType":"zero"}}}"#;
        let map: AblationMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(serde_json::to_string(&map).unwrap(), json);
    }
}
