// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slice addressing: map per-dimension `[start, end)` ranges onto a
//! concrete region of an N-dimensional value.
//!
//! A [`Slice`] is what clients send: one `[start, end]` pair per leading
//! dimension, with `end == -1` meaning "to the end of that dimension".
//! [`Slice::resolve`] turns it into a [`Region`] against the actual shape
//! of a tensor; [`min_shape_intersect`] aligns two regions of different
//! shapes so that copies only touch their overlapping extent.
//!
//! Ranges follow the tensor's axis order exactly. Dimensions past the end
//! of the slice are taken whole.

use std::ops::Range;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// Slice
// ---------------------------------------------------------------------------

/// One per-dimension range, serialized as `[start, end]`.
///
/// `start` is inclusive and `end` exclusive; `end == -1` is the
/// [`TO_END`](Self::TO_END) sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceRange(pub i64, pub i64);

impl SliceRange {
    /// Sentinel `end` value meaning "to the end of the dimension".
    pub const TO_END: i64 = -1;

    /// Inclusive start bound.
    #[must_use]
    pub const fn start(self) -> i64 {
        self.0
    }

    /// Exclusive end bound, or [`TO_END`](Self::TO_END).
    #[must_use]
    pub const fn end(self) -> i64 {
        self.1
    }

    /// Structural check that does not need the target shape.
    fn check(self, dim: usize) -> Result<()> {
        let Self(start, end) = self;
        if start < 0 {
            return Err(MIError::InvalidSlice(format!(
                "dim {dim}: negative start {start}"
            )));
        }
        if end < Self::TO_END {
            return Err(MIError::InvalidSlice(format!(
                "dim {dim}: end {end} is neither a bound nor the -1 sentinel"
            )));
        }
        if end != Self::TO_END && start > end {
            return Err(MIError::InvalidSlice(format!(
                "dim {dim}: start {start} is past end {end}"
            )));
        }
        Ok(())
    }
}

/// A rectangular sub-region request: one [`SliceRange`] per leading
/// dimension. Serialized as a list of `[start, end]` pairs.
///
/// # Example
///
/// ```
/// use candle_patch::Slice;
///
/// // Positions 0..2 of dimension 0, everything from 3 onward in dimension 1.
/// let slice = Slice::from_pairs(&[(0, 2), (3, -1)]);
/// let region = slice.resolve(&[4, 8]).unwrap();
/// assert_eq!(region.dims(), vec![2, 5]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slice(Vec<SliceRange>);

impl Slice {
    /// Create a slice from explicit ranges.
    #[must_use]
    pub const fn new(ranges: Vec<SliceRange>) -> Self {
        Self(ranges)
    }

    /// Create a slice from `(start, end)` pairs.
    #[must_use]
    pub fn from_pairs(pairs: &[(i64, i64)]) -> Self {
        Self(pairs.iter().map(|&(s, e)| SliceRange(s, e)).collect())
    }

    /// The per-dimension ranges.
    #[must_use]
    pub fn ranges(&self) -> &[SliceRange] {
        &self.0
    }

    /// Number of addressed dimensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the slice addresses no dimension (the whole value).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check the bounds that can be checked without a shape.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidSlice`] on a negative start, an end below
    /// the `-1` sentinel, or a start past a concrete end.
    pub fn validate(&self) -> Result<()> {
        self.0
            .iter()
            .enumerate()
            .try_for_each(|(dim, range)| range.check(dim))
    }

    /// Resolve this slice against a concrete shape.
    ///
    /// A `-1` end resolves to the dimension size; any other end is clamped
    /// to it. Dimensions past the end of the slice are taken whole.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidSlice`] if the slice has more ranges than
    /// `shape` has dimensions, or if any start is negative or lies past its
    /// resolved end.
    pub fn resolve(&self, shape: &[usize]) -> Result<Region> {
        if self.0.len() > shape.len() {
            return Err(MIError::InvalidSlice(format!(
                "slice addresses {} dimensions but the value has {} ({shape:?})",
                self.0.len(),
                shape.len()
            )));
        }

        let mut ranges = Vec::with_capacity(shape.len());
        for (dim, &size) in shape.iter().enumerate() {
            let Some(&SliceRange(start, end)) = self.0.get(dim) else {
                ranges.push(0..size);
                continue;
            };
            let start = usize::try_from(start).map_err(|_| {
                MIError::InvalidSlice(format!("dim {dim}: negative start {start}"))
            })?;
            let end = if end == SliceRange::TO_END {
                size
            } else {
                usize::try_from(end)
                    .map_err(|_| MIError::InvalidSlice(format!("dim {dim}: invalid end {end}")))?
                    .min(size)
            };
            if start > end {
                return Err(MIError::InvalidSlice(format!(
                    "dim {dim}: start {start} is past resolved end {end} (size {size})"
                )));
            }
            ranges.push(start..end);
        }
        Ok(Region { ranges })
    }
}

impl From<Vec<(i64, i64)>> for Slice {
    fn from(pairs: Vec<(i64, i64)>) -> Self {
        Self::from_pairs(&pairs)
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A resolved, full-rank region of a concrete tensor: one in-bounds range
/// per dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// One `start..end` range per dimension.
    ranges: Vec<Range<usize>>,
}

impl Region {
    /// The region covering all of `shape`.
    #[must_use]
    pub fn full(shape: &[usize]) -> Self {
        Self {
            ranges: shape.iter().map(|&size| 0..size).collect(),
        }
    }

    /// The per-dimension ranges.
    #[must_use]
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Size of the region along each dimension.
    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        self.ranges.iter().map(ExactSizeIterator::len).collect()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the region selects no element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(|r| r.start >= r.end)
    }

    /// Clamp every range into `shape`. Ranks must agree.
    #[must_use]
    pub fn clamp_to(&self, shape: &[usize]) -> Option<Self> {
        if shape.len() != self.rank() {
            return None;
        }
        let ranges = self
            .ranges
            .iter()
            .zip(shape)
            .map(|(r, &size)| r.start.min(size)..r.end.min(size))
            .collect();
        Some(Self { ranges })
    }

    /// The sub-region `inner` expressed in this region's coordinates.
    ///
    /// `inner` is relative to this region's origin (as produced by
    /// [`min_shape_intersect`]); the result is absolute.
    #[must_use]
    pub fn offset(&self, inner: &Self) -> Self {
        let ranges = self
            .ranges
            .iter()
            .zip(&inner.ranges)
            .map(|(outer, r)| outer.start + r.start..outer.start + r.end)
            .collect();
        Self { ranges }
    }
}

/// Per dimension, the range `0..min(a[i], b[i])`.
///
/// Used to align patch and freeze regions whose shapes differ: copies
/// only cover the overlapping extent. Never fails; if the ranks differ the
/// result covers the shared leading dimensions only, and callers treat a
/// rank mismatch as "no overlap".
#[must_use]
pub fn min_shape_intersect(a: &Region, b: &Region) -> Region {
    let ranges = a
        .dims()
        .into_iter()
        .zip(b.dims())
        .map(|(x, y)| 0..x.min(y))
        .collect();
    Region { ranges }
}

// ---------------------------------------------------------------------------
// Tensor helpers
// ---------------------------------------------------------------------------

/// Read `region` out of `tensor`.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the region does not fit the tensor.
pub fn read_region(tensor: &Tensor, region: &Region) -> Result<Tensor> {
    let mut out = tensor.clone();
    for (dim, range) in region.ranges().iter().enumerate() {
        out = out.narrow(dim, range.start, range.len())?;
    }
    Ok(out)
}

/// Overwrite `region` of `tensor` with `src`, returning the new tensor.
///
/// `src` is cast to the dtype of `tensor`. An empty region returns the
/// input unchanged.
///
/// # Shapes
/// - `src`: `region.dims()`
/// - returns: same shape as `tensor`
///
/// # Errors
///
/// Returns [`MIError::Model`] if `src` does not have the region's shape.
pub fn write_region(tensor: &Tensor, region: &Region, src: &Tensor) -> Result<Tensor> {
    if region.is_empty() {
        return Ok(tensor.clone());
    }
    let src = src.to_dtype(tensor.dtype())?;
    Ok(tensor.slice_assign(region.ranges(), &src)?)
}

/// Overwrite `region` of `tensor` with zeros.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the region does not fit the tensor.
pub fn zero_region(tensor: &Tensor, region: &Region) -> Result<Tensor> {
    if region.is_empty() {
        return Ok(tensor.clone());
    }
    let zeros = Tensor::zeros(region.dims(), tensor.dtype(), tensor.device())?;
    write_region(tensor, region, &zeros)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
