// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interventions: ablation and activation patching, plus loss read-outs.
//!
//! - [`ablation`] — zero / freeze ablations keyed by component and named
//!   slice, and their registry ordering.
//! - [`patch`] — copies from a source component's region into a target
//!   component's region, fed by the generational cache.
//! - [`loss`] — per-token and mean next-token loss from logits.

pub mod ablation;
pub mod loss;
pub mod patch;

use serde::{Deserialize, Serialize};

/// A client entry excluded from the rebuilt hook list at sync time.
///
/// Rejection is per entry: the rest of the map is still installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEntry {
    /// Component the offending slice addresses.
    pub component: String,
    /// Client-chosen named-slice id.
    pub slice_id: String,
    /// Why the entry was rejected.
    pub reason: String,
}

impl RejectedEntry {
    /// Create a rejection record.
    pub fn new(component: &str, slice_id: &str, reason: impl std::fmt::Display) -> Self {
        Self {
            component: component.to_owned(),
            slice_id: slice_id.to_owned(),
            reason: reason.to_string(),
        }
    }
}
