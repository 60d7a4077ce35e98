// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system: named interception points and the composed hook list.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookEntry`] (one interception bound to a hook point, stored as data),
//! [`HookPlan`] (the ordered, phase-sorted list installed for one pass),
//! and [`HookDispatch`] (the interface a model backend calls at each of its
//! hook points).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::interp::ablation::AblationEntry;
use crate::interp::patch::PatchEntry;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where values can be observed or
/// intercepted.
///
/// Follows the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// # String conversion
///
/// ```
/// use candle_patch::HookPoint;
///
/// let hook = HookPoint::AttnQ(0);
/// assert_eq!(hook.to_string(), "blocks.0.attn.hook_q");
///
/// let parsed: HookPoint = "blocks.0.attn.hook_q".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`]: component names are
/// opaque keys, and a name the model never exposes simply never fires.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    // -- Embedding --
    /// After token embedding (`hook_embed`).
    Embed,
    /// After positional embedding (`hook_pos_embed`).
    PosEmbed,

    // -- Per-layer --
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Query vectors in layer `i` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Key vectors in layer `i` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Value vectors in layer `i` (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax attention scores in layer `i`
    /// (`blocks.{i}.attn.hook_attn_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Per-head attention-weighted values in layer `i` (`blocks.{i}.attn.hook_z`).
    AttnZ(usize),
    /// Attention output in layer `i` (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP in layer `i`
    /// (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP pre-activation in layer `i` (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation in layer `i` (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output in layer `i` (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),

    // -- Final --
    /// After final layer norm (`ln_final.hook_normalized`).
    FinalNorm,

    // -- Escape hatch --
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// Block index of a per-layer hook point, `None` for global points.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnZ(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::PosEmbed | Self::FinalNorm | Self::Custom(_) => None,
        }
    }

    /// Whether this point belongs to the standard export set returned to
    /// clients: embeddings, residual stream snapshots, attention and MLP
    /// outputs, q/k/v/z and the attention pattern.
    ///
    /// Raw attention scores and MLP pre/post activations are withheld:
    /// they are large and rarely inspected.
    #[must_use]
    pub const fn is_standard_export(&self) -> bool {
        matches!(
            self,
            Self::Embed
                | Self::PosEmbed
                | Self::FinalNorm
                | Self::ResidPre(_)
                | Self::AttnOut(_)
                | Self::ResidMid(_)
                | Self::MlpOut(_)
                | Self::ResidPost(_)
                | Self::AttnQ(_)
                | Self::AttnK(_)
                | Self::AttnV(_)
                | Self::AttnZ(_)
                | Self::AttnPattern(_)
        )
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_attn_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnZ(i) => write!(f, "blocks.{i}.attn.hook_z"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "ln_final.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

impl Serialize for HookPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HookPoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(parse_hook_string(&s))
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_pos_embed" => return HookPoint::PosEmbed,
        "ln_final.hook_normalized" | "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    // Try "blocks.{layer}.{suffix}" pattern.
    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "hook_resid_pre" => HookPoint::ResidPre(layer),
                    "attn.hook_q" => HookPoint::AttnQ(layer),
                    "attn.hook_k" => HookPoint::AttnK(layer),
                    "attn.hook_v" => HookPoint::AttnV(layer),
                    "attn.hook_attn_scores" => HookPoint::AttnScores(layer),
                    "attn.hook_pattern" => HookPoint::AttnPattern(layer),
                    "attn.hook_z" => HookPoint::AttnZ(layer),
                    "hook_attn_out" => HookPoint::AttnOut(layer),
                    "hook_resid_mid" => HookPoint::ResidMid(layer),
                    "mlp.hook_pre" => HookPoint::MlpPre(layer),
                    "mlp.hook_post" => HookPoint::MlpPost(layer),
                    "hook_mlp_out" => HookPoint::MlpOut(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// NamesFilter
// ---------------------------------------------------------------------------

/// Selects which hook points the caching phase records into the live cache.
///
/// Serialized as `"all"`, `{"names": [...]}`, `{"suffix": "..."}` or
/// `{"prefix": "..."}`.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamesFilter {
    /// Every hook point the model exposes.
    #[default]
    All,
    /// Exactly these hook points.
    Names(BTreeSet<HookPoint>),
    /// Hook points whose name ends with the given suffix (e.g. `"pattern"`).
    Suffix(String),
    /// Hook points whose name starts with the given prefix (e.g. `"blocks.0."`).
    Prefix(String),
}

impl NamesFilter {
    /// Check whether a hook point passes this filter.
    #[must_use]
    pub fn matches(&self, hook: &HookPoint) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.contains(hook),
            Self::Suffix(suffix) => hook.to_string().ends_with(suffix.as_str()),
            Self::Prefix(prefix) => hook.to_string().starts_with(prefix.as_str()),
        }
    }
}

/// Caching hooks handed out by a backend for one pass.
///
/// Each listed hook point gets a [`HookEntry::Capture`] in the final
/// phase of the composed [`HookPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachingHooks {
    /// Forward hook points to capture, in evaluation order.
    pub forward: Vec<HookPoint>,
    /// Backward hook points to capture (empty for inference-only backends).
    pub backward: Vec<HookPoint>,
}

// ---------------------------------------------------------------------------
// HookEntry / HookPlan
// ---------------------------------------------------------------------------

/// Phase of a hook entry. Entries run in ascending phase order at any
/// given hook point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPhase {
    /// Ablations see (and override) raw activations first.
    Ablation,
    /// Patches read and write post-ablation values.
    Patch,
    /// Captures record the final, post-intervention value.
    Capture,
}

/// One interception bound to a hook point, stored as data.
///
/// The behaviour of each variant is a pure function of the entry, the
/// flowing value and the generational cache; see
/// [`AblationEntry::apply`] and [`PatchEntry::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum HookEntry {
    /// Zero or freeze a region of the value.
    Ablate(AblationEntry),
    /// Copy a region from a cached source into the value.
    Patch(PatchEntry),
    /// Record the value into the live cache.
    Capture(HookPoint),
}

impl HookEntry {
    /// The hook point this entry is bound to.
    ///
    /// Patches bind to their **target**: they are observed at the point of
    /// application, not capture.
    #[must_use]
    pub const fn hook(&self) -> &HookPoint {
        match self {
            Self::Ablate(entry) => &entry.hook,
            Self::Patch(entry) => &entry.target,
            Self::Capture(hook) => hook,
        }
    }

    /// The phase this entry runs in.
    #[must_use]
    pub const fn phase(&self) -> HookPhase {
        match self {
            Self::Ablate(_) => HookPhase::Ablation,
            Self::Patch(_) => HookPhase::Patch,
            Self::Capture(_) => HookPhase::Capture,
        }
    }
}

/// The ordered hook list installed for one forward pass.
///
/// Composed as `[ablations..., patches..., captures...]`. The order is
/// fixed for the whole pass: a plan is immutable once built.
///
/// # Example
///
/// ```
/// use candle_patch::{HookPhase, HookPlan, HookPoint};
///
/// let plan = HookPlan::compose(&[], &[], vec![HookPoint::Embed]);
/// assert_eq!(plan.len(), 1);
/// assert_eq!(plan.entries()[0].phase(), HookPhase::Capture);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookPlan {
    /// All entries, in phase order.
    entries: Vec<HookEntry>,
    /// Indices into `entries` per bound hook point, in phase order.
    by_hook: HashMap<HookPoint, Vec<usize>>,
}

impl HookPlan {
    /// Compose the hook list for one pass.
    ///
    /// `ablations` and `patches` must already be in their registry order
    /// (see [`build_ablation_hooks`](crate::interp::ablation::build_ablation_hooks)
    /// and [`build_patch_hooks`](crate::interp::patch::build_patch_hooks)).
    #[must_use]
    pub fn compose(
        ablations: &[AblationEntry],
        patches: &[PatchEntry],
        captures: Vec<HookPoint>,
    ) -> Self {
        let entries: Vec<HookEntry> = ablations
            .iter()
            .cloned()
            .map(HookEntry::Ablate)
            .chain(patches.iter().cloned().map(HookEntry::Patch))
            .chain(captures.into_iter().map(HookEntry::Capture))
            .collect();

        let mut by_hook: HashMap<HookPoint, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            // BORROW: explicit .clone() — HookPoint key owned by the index
            by_hook.entry(entry.hook().clone()).or_default().push(idx);
        }

        Self { entries, by_hook }
    }

    /// All entries in phase order.
    #[must_use]
    pub fn entries(&self) -> &[HookEntry] {
        &self.entries
    }

    /// Entries bound to `hook`, in phase order.
    pub fn entries_at<'a>(&'a self, hook: &HookPoint) -> impl Iterator<Item = &'a HookEntry> + use<'a> {
        self.by_hook
            .get(hook)
            .into_iter()
            .flatten()
            .filter_map(move |&idx| self.entries.get(idx))
    }

    /// Whether any entry is bound to `hook`.
    #[must_use]
    pub fn is_bound(&self, hook: &HookPoint) -> bool {
        self.by_hook.contains_key(hook)
    }

    /// Distinct hook points with at least one bound entry.
    pub fn bound_hooks(&self) -> impl Iterator<Item = &HookPoint> {
        self.by_hook.keys()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the plan has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// HookDispatch
// ---------------------------------------------------------------------------

/// The installed hook list, as seen by a model backend during a pass.
///
/// A backend calls [`intercept`](Self::intercept) at every hook point it
/// evaluates and continues with the returned tensor. Installation is
/// scoped to a single [`MIBackend::forward`](crate::MIBackend::forward)
/// call.
pub trait HookDispatch {
    /// Whether anything is bound to `hook`. Backends may skip the call to
    /// [`intercept`](Self::intercept) (and any clone) when this is `false`.
    fn is_hooked(&self, hook: &HookPoint) -> bool;

    /// Run every entry bound to `hook` over `value`, in order.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::InvalidAblation`](crate::MIError::InvalidAblation)
    /// or [`MIError::InvalidPatch`](crate::MIError::InvalidPatch) if an
    /// entry's slice does not fit the value, and [`MIError::Model`](crate::MIError::Model)
    /// on tensor failures.
    fn intercept(&mut self, hook: &HookPoint, value: Tensor) -> Result<Tensor>;
}

/// Empty dispatch: a plain forward pass with no hooks installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl HookDispatch for NoHooks {
    fn is_hooked(&self, _hook: &HookPoint) -> bool {
        false
    }

    fn intercept(&mut self, _hook: &HookPoint, value: Tensor) -> Result<Tensor> {
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::interp::ablation::AblationKind;
    use crate::slice::Slice;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::PosEmbed, "hook_pos_embed"),
            (HookPoint::FinalNorm, "ln_final.hook_normalized"),
            (HookPoint::ResidPre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::AttnQ(3), "blocks.3.attn.hook_q"),
            (HookPoint::AttnK(3), "blocks.3.attn.hook_k"),
            (HookPoint::AttnV(3), "blocks.3.attn.hook_v"),
            (HookPoint::AttnScores(7), "blocks.7.attn.hook_attn_scores"),
            (HookPoint::AttnPattern(5), "blocks.5.attn.hook_pattern"),
            (HookPoint::AttnZ(5), "blocks.5.attn.hook_z"),
            (HookPoint::AttnOut(2), "blocks.2.hook_attn_out"),
            (HookPoint::ResidMid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::MlpPre(1), "blocks.1.mlp.hook_pre"),
            (HookPoint::MlpPost(1), "blocks.1.mlp.hook_post"),
            (HookPoint::MlpOut(4), "blocks.4.hook_mlp_out"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blockA".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("blockA".to_string()));
        assert_eq!(hook.layer(), None);
        assert_eq!(HookPoint::AttnZ(4).layer(), Some(4));
    }

    #[test]
    fn hook_point_serde_as_string() {
        let json = serde_json::to_string(&HookPoint::AttnPattern(2)).unwrap();
        assert_eq!(json, "\"blocks.2.attn.hook_pattern\"");
        let back: HookPoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HookPoint::AttnPattern(2));
    }

    #[test]
    fn names_filter_variants() {
        assert!(NamesFilter::All.matches(&HookPoint::Embed));
        let suffix = NamesFilter::Suffix("pattern".into());
        assert!(suffix.matches(&HookPoint::AttnPattern(0)));
        assert!(!suffix.matches(&HookPoint::AttnQ(0)));
        let prefix = NamesFilter::Prefix("blocks.1.".into());
        assert!(prefix.matches(&HookPoint::MlpOut(1)));
        assert!(!prefix.matches(&HookPoint::MlpOut(0)));
        let names = NamesFilter::Names([HookPoint::Embed].into_iter().collect());
        assert!(names.matches(&HookPoint::Embed));
        assert!(!names.matches(&HookPoint::PosEmbed));

        let parsed: NamesFilter = serde_json::from_str(r#"{"suffix": "hook_q"}"#).unwrap();
        assert_eq!(parsed, NamesFilter::Suffix("hook_q".into()));
        let all: NamesFilter = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(all, NamesFilter::All);
    }

    #[test]
    fn plan_orders_phases_and_indexes_by_hook() {
        let ablation = AblationEntry {
            hook: HookPoint::Custom("blockB".into()),
            slice_id: "s".into(),
            slice: Slice::from_pairs(&[(0, 1)]),
            kind: AblationKind::Zero,
        };
        let patch = PatchEntry {
            source: HookPoint::Custom("blockA".into()),
            source_slice_id: "a".into(),
            source_slice: Slice::from_pairs(&[(0, 2)]),
            target: HookPoint::Custom("blockB".into()),
            target_slice_id: "b".into(),
            target_slice: Slice::from_pairs(&[(0, 2)]),
        };
        let plan = HookPlan::compose(
            &[ablation],
            &[patch],
            vec![HookPoint::Custom("blockA".into()), HookPoint::Custom("blockB".into())],
        );

        assert_eq!(plan.len(), 4);
        let phases: Vec<HookPhase> = plan.entries().iter().map(HookEntry::phase).collect();
        assert_eq!(
            phases,
            vec![HookPhase::Ablation, HookPhase::Patch, HookPhase::Capture, HookPhase::Capture]
        );

        // The patch is bound to its target, not its source.
        let at_b: Vec<HookPhase> = plan
            .entries_at(&HookPoint::Custom("blockB".into()))
            .map(HookEntry::phase)
            .collect();
        assert_eq!(at_b, vec![HookPhase::Ablation, HookPhase::Patch, HookPhase::Capture]);
        assert_eq!(plan.entries_at(&HookPoint::Custom("blockA".into())).count(), 1);
        assert!(!plan.is_bound(&HookPoint::Embed));
    }
}
