// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation patching: copy a region of one component into a region of
//! another.
//!
//! Clients declare patches as a nested map: source component → named-slice
//! id → `{slice, edges}`, where `edges` maps target component → named-slice
//! id → `{slice}`. Every edge becomes one [`PatchEntry`] bound to its
//! **target** hook point.
//!
//! ## Source resolution
//!
//! When a patch fires on the target's value:
//!
//! 1. if the source was captured earlier in this pass (`live`), copy its
//!    region, limited to the extent both regions share;
//! 2. else if the source exists in the previous pass (`last`) and both
//!    resolved regions have identical shape, copy from there;
//! 3. else do nothing: there is no valid data to apply yet.
//!
//! The source must be upstream of the target in evaluation order for
//! step 1 to ever apply. That is the caller's responsibility.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::cache::GenerationalCache;
use crate::error::{MIError, Result};
use crate::hooks::HookPoint;
use crate::interp::RejectedEntry;
use crate::slice::{Region, Slice, min_shape_intersect, read_region, write_region};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Target side of a patch edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    /// Region of the target component to overwrite.
    pub slice: Slice,
}

/// Source side of a patch, with every target it feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSource {
    /// Region of the source component to read.
    pub slice: Slice,
    /// Target component → named-slice id → target region.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edges: BTreeMap<String, BTreeMap<String, PatchTarget>>,
}

/// Declarative patch state: source component → named-slice id →
/// [`PatchSource`].
///
/// # Example
///
/// ```
/// use candle_patch::{PatchMap, Slice};
///
/// let map = PatchMap::new().with_edge(
///     ("blocks.0.hook_resid_post", "src", Slice::from_pairs(&[(0, 1), (0, 2)])),
///     ("blocks.1.hook_resid_pre", "dst", Slice::from_pairs(&[(0, 1), (2, 4)])),
/// );
/// assert_eq!(map.num_edges(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[must_use]
pub struct PatchMap(BTreeMap<String, BTreeMap<String, PatchSource>>);

impl PatchMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one edge, given as `(component, slice_id, slice)` for the
    /// source and the target. The source slice is replaced if the source
    /// named slice already exists.
    pub fn with_edge(mut self, source: (&str, &str, Slice), target: (&str, &str, Slice)) -> Self {
        self.insert_edge(source, target);
        self
    }

    /// Add one edge; see [`with_edge`](Self::with_edge).
    pub fn insert_edge(&mut self, source: (&str, &str, Slice), target: (&str, &str, Slice)) {
        let (source_component, source_id, source_slice) = source;
        let (target_component, target_id, target_slice) = target;
        let node = self
            .0
            .entry(source_component.to_owned())
            .or_default()
            .entry(source_id.to_owned())
            .or_default();
        node.slice = source_slice;
        node.edges
            .entry(target_component.to_owned())
            .or_default()
            .insert(target_id.to_owned(), PatchTarget { slice: target_slice });
    }

    /// Iterate `(component, slice_id, source)` in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &PatchSource)> {
        self.0.iter().flat_map(|(component, slices)| {
            slices
                .iter()
                .map(move |(id, src)| (component.as_str(), id.as_str(), src))
        })
    }

    /// Total number of edges.
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.iter()
            .map(|(_, _, src)| src.edges.values().map(BTreeMap::len).sum::<usize>())
            .sum()
    }

    /// Whether no source is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}

// ---------------------------------------------------------------------------
// PatchEntry
// ---------------------------------------------------------------------------

/// One patch edge, bound to its target hook point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    /// Component to read from.
    pub source: HookPoint,
    /// Named-slice id of the source region.
    pub source_slice_id: String,
    /// Region of the source to read.
    pub source_slice: Slice,
    /// Component to write into (where the entry is installed).
    pub target: HookPoint,
    /// Named-slice id of the target region.
    pub target_slice_id: String,
    /// Region of the target to overwrite.
    pub target_slice: Slice,
}

impl PatchEntry {
    /// Apply this patch to the target's value.
    ///
    /// Copies at most `min(source_region, target_region)` elements per
    /// dimension, anchored at both regions' origins. Nothing outside that
    /// intersection is written.
    ///
    /// # Shapes
    /// - `value`: the target's value
    /// - returns: same shape as `value`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidPatch`] if the target slice does not fit
    /// `value`, or the source slice does not fit the live source value.
    pub fn apply(&self, value: Tensor, cache: &GenerationalCache) -> Result<Tensor> {
        let target_region = self
            .target_slice
            .resolve(value.dims())
            .map_err(|e| self.invalid("target", &e))?;

        if let Some(source) = cache.live(&self.source) {
            let source_region = self
                .source_slice
                .resolve(source.dims())
                .map_err(|e| self.invalid("source", &e))?;
            return copy_overlap(&value, &target_region, source, &source_region);
        }

        if let Some(source) = cache.last(&self.source) {
            match self.source_slice.resolve(source.dims()) {
                Ok(source_region) if source_region.dims() == target_region.dims() => {
                    return copy_overlap(&value, &target_region, source, &source_region);
                }
                _ => {
                    tracing::trace!(
                        source = %self.source,
                        target = %self.target,
                        "previous-pass source region does not match target; patch skipped"
                    );
                    return Ok(value);
                }
            }
        }

        tracing::trace!(source = %self.source, target = %self.target, "no source value yet; patch skipped");
        Ok(value)
    }

    /// Build an [`MIError::InvalidPatch`] naming this edge.
    fn invalid(&self, side: &str, err: &MIError) -> MIError {
        MIError::InvalidPatch(format!(
            "`{}`[{}] -> `{}`[{}]: {side} {err}",
            self.source, self.source_slice_id, self.target, self.target_slice_id
        ))
    }
}

/// Copy the shared extent of `source[source_region]` into
/// `value[target_region]`.
fn copy_overlap(
    value: &Tensor,
    target_region: &Region,
    source: &Tensor,
    source_region: &Region,
) -> Result<Tensor> {
    if target_region.rank() != source_region.rank() {
        tracing::debug!(
            target_rank = target_region.rank(),
            source_rank = source_region.rank(),
            "patch regions differ in rank; nothing copied"
        );
        return Ok(value.clone());
    }
    let overlap = min_shape_intersect(target_region, source_region);
    if overlap.is_empty() {
        return Ok(value.clone());
    }
    let piece = read_region(source, &source_region.offset(&overlap))?;
    write_region(value, &target_region.offset(&overlap), &piece)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Flatten a [`PatchMap`] into the ordered patch hook list.
///
/// One entry per edge, in canonical order (source component, source slice
/// id, target component, target slice id). A malformed source slice rejects
/// all of its edges; a malformed target slice rejects that edge only.
#[must_use]
pub fn build_patch_hooks(map: &PatchMap) -> (Vec<PatchEntry>, Vec<RejectedEntry>) {
    let mut entries = Vec::with_capacity(map.num_edges());
    let mut rejected = Vec::new();

    for (source_component, source_id, source) in map.iter() {
        if let Err(e) = source.slice.validate() {
            tracing::warn!(component = source_component, slice_id = source_id, error = %e, "rejecting patch source");
            rejected.push(RejectedEntry::new(source_component, source_id, e));
            continue;
        }
        for (target_component, targets) in &source.edges {
            for (target_id, target) in targets {
                if let Err(e) = target.slice.validate() {
                    tracing::warn!(
                        component = target_component.as_str(),
                        slice_id = target_id.as_str(),
                        error = %e,
                        "rejecting patch target"
                    );
                    rejected.push(RejectedEntry::new(target_component, target_id, e));
                    continue;
                }
                entries.push(PatchEntry {
                    source: HookPoint::from(source_component),
                    source_slice_id: source_id.to_owned(),
                    // BORROW: explicit .clone() — entries own their slices
                    source_slice: source.slice.clone(),
                    target: HookPoint::from(target_component.as_str()),
                    target_slice_id: target_id.clone(),
                    target_slice: target.slice.clone(),
                });
            }
        }
    }

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

    fn edge(source: &[(i64, i64)], target: &[(i64, i64)]) -> PatchEntry {
        PatchEntry {
            source: HookPoint::from("blockA"),
            source_slice_id: "src".into(),
            source_slice: Slice::from_pairs(source),
            target: HookPoint::from("blockB"),
            target_slice_id: "dst".into(),
            target_slice: Slice::from_pairs(target),
        }
    }

    #[test]
    fn copies_from_live_source() {
        let mut cache = GenerationalCache::new();
        cache.capture(HookPoint::from("blockA"), vec_tensor(&[5.0, 6.0, 7.0, 8.0]));
        let out = edge(&[(0, 2)], &[(0, 2)])
            .apply(vec_tensor(&[0.0; 4]), &cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn live_copy_limited_to_min_shape() {
        let mut cache = GenerationalCache::new();
        cache.capture(
            HookPoint::from("blockA"),
            Tensor::new(&[[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &Device::Cpu).unwrap(),
        );
        // Source region 2x3, target region 1x2 starting at (1, 1).
        let target = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = edge(&[(0, -1), (0, -1)], &[(1, 2), (1, 3)])
            .apply(target, &cache)
            .unwrap();
        let v: Vec<Vec<f32>> = out.to_vec2().unwrap();
        assert_eq!(v, vec![vec![0.0, 0.0, 0.0], vec![0.0, 1.0, 2.0]]);
    }

    #[test]
    fn last_source_requires_equal_shapes() {
        let mut cache = GenerationalCache::new();
        cache.capture(HookPoint::from("blockA"), vec_tensor(&[5.0, 6.0, 7.0, 8.0]));
        cache.rotate();

        let same = edge(&[(2, 4)], &[(0, 2)])
            .apply(vec_tensor(&[0.0; 4]), &cache)
            .unwrap();
        assert_eq!(same.to_vec1::<f32>().unwrap(), vec![7.0, 8.0, 0.0, 0.0]);

        let mismatched = edge(&[(0, 3)], &[(0, 2)])
            .apply(vec_tensor(&[0.0; 4]), &cache)
            .unwrap();
        assert_eq!(mismatched.to_vec1::<f32>().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn missing_source_is_noop() {
        let cache = GenerationalCache::new();
        let out = edge(&[(0, 2)], &[(0, 2)])
            .apply(vec_tensor(&[1.0, 2.0]), &cache)
            .unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn bad_target_slice_is_invalid_patch() {
        let cache = GenerationalCache::new();
        let err = edge(&[(0, 1)], &[(0, 1), (0, 1)])
            .apply(vec_tensor(&[1.0, 2.0]), &cache)
            .unwrap_err();
        assert!(matches!(err, MIError::InvalidPatch(_)));
    }

    #[test]
    fn build_binds_to_targets_in_canonical_order() {
        let map = PatchMap::new()
            .with_edge(("b", "s", Slice::from_pairs(&[(0, 1)])), ("z", "t", Slice::from_pairs(&[(0, 1)])))
            .with_edge(("a", "s", Slice::from_pairs(&[(0, 1)])), ("y", "t2", Slice::from_pairs(&[(0, 1)])))
            .with_edge(("a", "s", Slice::from_pairs(&[(0, 1)])), ("x", "t1", Slice::from_pairs(&[(0, 1)])));
        let (entries, rejected) = build_patch_hooks(&map);
        assert!(rejected.is_empty());
        let bound: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.source.to_string(), e.target.to_string()))
            .collect();
        assert_eq!(
            bound,
            vec![
                ("a".to_string(), "x".to_string()),
                ("a".to_string(), "y".to_string()),
                ("b".to_string(), "z".to_string()),
            ]
        );
    }

    #[test]
    fn build_rejects_per_entry() {
        let map = PatchMap::new()
            .with_edge(("a", "bad", Slice::from_pairs(&[(-1, 1)])), ("x", "t", Slice::from_pairs(&[(0, 1)])))
            .with_edge(("b", "s", Slice::from_pairs(&[(0, 1)])), ("y", "bad", Slice::from_pairs(&[(2, 1)])))
            .with_edge(("b", "s", Slice::from_pairs(&[(0, 1)])), ("y", "ok", Slice::from_pairs(&[(0, 1)])));
        let (entries, rejected) = build_patch_hooks(&map);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_slice_id, "ok");
        let ids: Vec<&str> = rejected.iter().map(|r| r.slice_id.as_str()).collect();
        assert_eq!(ids, vec!["bad", "bad"]);
        assert_eq!(rejected[0].component, "a");
        assert_eq!(rejected[1].component, "y");
    }

    #[test]
    fn patch_map_wire_roundtrip() {
        let json = r#"{"blockA":{"s1":{"slice":[[0,2]],"edges":{"blockB":{"t1":{"slice":[[0,2]]}}}}}}"#;
        let map: PatchMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.num_edges(), 1);
        assert_eq!(serde_json::to_string(&map).unwrap(), json);
    }

    #[test]
    fn source_without_edges_roundtrips() {
        let json = r#"{"blockA":{"s1":{"slice":[[0,2]]}}}"#;
        let map: PatchMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.num_edges(), 0);
        assert_eq!(serde_json::to_string(&map).unwrap(), json);
        let back: PatchMap = serde_json::from_str(&serde_json::to_string(&map).unwrap()).unwrap();
        assert_eq!(back, map);
    }
}
