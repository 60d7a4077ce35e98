// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session state, last-writer-wins synchronization, and the session facade.
//!
//! A [`SessionState`] holds one logical clock shared by the ablation and
//! patch maps. A sync carrying a client clock older than the server clock
//! is a stale write: it changes nothing and the response echoes the
//! current state. Otherwise the clock advances by exactly one, the
//! relevant map is replaced wholesale (never merged), and its hook list is
//! rebuilt from scratch.
//!
//! [`Session`] serializes every sync and every run through one
//! [`parking_lot::Mutex`], so a forward pass always sees one fixed hook
//! list from start to finish.
//!
//! # Example
//!
//! ```
//! use candle_patch::{AblationKind, AblationMap, SessionState, Slice};
//!
//! let mut state = SessionState::new();
//! let map = AblationMap::new().with("blockA", "s1", Slice::from_pairs(&[(0, 2)]), AblationKind::Zero);
//!
//! let first = state.apply_ablations(0, map.clone());
//! assert!(first.accepted);
//! assert_eq!(state.logical_clock(), 1);
//!
//! // A second client that also read clock 0 lost the race.
//! let stale = state.apply_ablations(0, AblationMap::new());
//! assert!(!stale.accepted);
//! assert_eq!(state.ablations(), &map);
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::MIModel;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::interp::RejectedEntry;
use crate::interp::ablation::{AblationEntry, AblationMap, build_ablation_hooks};
use crate::interp::patch::{PatchEntry, PatchMap, build_patch_hooks};
use crate::orchestrator::{RunOrchestrator, RunOutput};
use crate::tokenizer::TokenCodec;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Result of one sync attempt against a [`SessionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `false` for a stale write.
    pub accepted: bool,
    /// Server clock after the attempt.
    pub logical_clock: u64,
    /// Entries left out of the rebuilt hook list.
    pub rejected: Vec<RejectedEntry>,
}

/// The declared experiment configuration and its compiled hook lists.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Shared by both maps.
    logical_clock: u64,
    /// Client ablation map, as sent.
    ablations: AblationMap,
    /// Client patch map, as sent.
    patches: PatchMap,
    /// Compiled from `ablations`, freeze before zero.
    ablation_hooks: Vec<AblationEntry>,
    /// Compiled from `patches`.
    patch_hooks: Vec<PatchEntry>,
}

impl SessionState {
    /// Clock 0, both maps empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current server clock.
    #[must_use]
    pub const fn logical_clock(&self) -> u64 {
        self.logical_clock
    }

    /// Current ablation map.
    #[must_use]
    pub const fn ablations(&self) -> &AblationMap {
        &self.ablations
    }

    /// Current patch map.
    #[must_use]
    pub const fn patches(&self) -> &PatchMap {
        &self.patches
    }

    /// Installed ablation entries, in application order.
    #[must_use]
    pub fn ablation_hooks(&self) -> &[AblationEntry] {
        &self.ablation_hooks
    }

    /// Installed patch entries, in application order.
    #[must_use]
    pub fn patch_hooks(&self) -> &[PatchEntry] {
        &self.patch_hooks
    }

    /// Replace the ablation map if `client_clock` is not stale.
    pub fn apply_ablations(&mut self, client_clock: i64, map: AblationMap) -> SyncOutcome {
        if let Some(stale) = self.check_clock(client_clock, "ablations") {
            return stale;
        }
        let (hooks, rejected) = build_ablation_hooks(&map);
        self.ablations = map;
        self.ablation_hooks = hooks;
        self.accept("ablations", rejected)
    }

    /// Replace the patch map if `client_clock` is not stale.
    pub fn apply_patches(&mut self, client_clock: i64, map: PatchMap) -> SyncOutcome {
        if let Some(stale) = self.check_clock(client_clock, "patches") {
            return stale;
        }
        let (hooks, rejected) = build_patch_hooks(&map);
        self.patches = map;
        self.patch_hooks = hooks;
        self.accept("patches", rejected)
    }

    /// `Some` stale outcome when `client_clock` lost the race. A negative
    /// client clock is older than any server clock.
    fn check_clock(&self, client_clock: i64, kind: &str) -> Option<SyncOutcome> {
        if u64::try_from(client_clock).is_ok_and(|clock| clock >= self.logical_clock) {
            return None;
        }
        tracing::debug!(
            kind,
            client_clock,
            server_clock = self.logical_clock,
            "stale write superseded"
        );
        Some(SyncOutcome {
            accepted: false,
            logical_clock: self.logical_clock,
            rejected: Vec::new(),
        })
    }

    /// Advance the clock after a replace.
    fn accept(&mut self, kind: &str, rejected: Vec<RejectedEntry>) -> SyncOutcome {
        self.logical_clock += 1;
        tracing::info!(
            kind,
            server_clock = self.logical_clock,
            rejected = rejected.len(),
            "sync accepted"
        );
        SyncOutcome {
            accepted: true,
            logical_clock: self.logical_clock,
            rejected,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Client request replacing the ablation map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AblationSyncRequest {
    /// Clock the client last observed; negative values are always stale.
    pub client_logical_clock: i64,
    /// Full replacement map.
    #[serde(default)]
    pub ablations: AblationMap,
}

/// Response to an [`AblationSyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AblationSyncResponse {
    /// Authoritative clock.
    pub server_logical_clock: u64,
    /// Authoritative map.
    pub ablations: AblationMap,
    /// `false` when the request was stale.
    pub accepted: bool,
    /// Entries excluded from the installed hooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEntry>,
}

/// Client request replacing the patch map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSyncRequest {
    /// Clock the client last observed; negative values are always stale.
    pub client_logical_clock: i64,
    /// Full replacement map.
    #[serde(default)]
    pub patches: PatchMap,
}

/// Response to a [`PatchSyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSyncResponse {
    /// Authoritative clock.
    pub server_logical_clock: u64,
    /// Authoritative map.
    pub patches: PatchMap,
    /// `false` when the request was stale.
    pub accepted: bool,
    /// Entries excluded from the installed hooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEntry>,
}

/// Current clock and both maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Authoritative clock.
    pub server_logical_clock: u64,
    /// Current ablation map.
    pub ablations: AblationMap,
    /// Current patch map.
    pub patches: PatchMap,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything mutated under the session lock.
#[derive(Debug, Default)]
struct SessionCore {
    /// Declared maps and compiled hooks.
    state: SessionState,
    /// Owns the generational cache.
    orchestrator: RunOrchestrator,
}

/// One model, one tokenizer, one session state.
///
/// Every public operation takes the session lock for its whole duration,
/// so syncs and runs never interleave. A forward pass that never returns
/// blocks every later call; guard with an external timeout.
pub struct Session {
    /// Model-execution collaborator.
    model: MIModel,
    /// Prompt encoding and sub-word display.
    // TRAIT_OBJECT: tokenizer backends are chosen at runtime
    codec: Box<dyn TokenCodec>,
    /// The single exclusive critical section.
    core: Mutex<SessionCore>,
}

impl Session {
    /// Create a session with the default engine configuration.
    // TRAIT_OBJECT: tokenizer backends are chosen at runtime
    #[must_use]
    pub fn new(model: MIModel, codec: Box<dyn TokenCodec>) -> Self {
        Self::with_config(model, codec, EngineConfig::default())
    }

    /// Create a session with an explicit engine configuration.
    // TRAIT_OBJECT: tokenizer backends are chosen at runtime
    #[must_use]
    pub fn with_config(model: MIModel, codec: Box<dyn TokenCodec>, config: EngineConfig) -> Self {
        Self {
            model,
            codec,
            core: Mutex::new(SessionCore {
                state: SessionState::new(),
                orchestrator: RunOrchestrator::new(config),
            }),
        }
    }

    /// The wrapped model.
    #[must_use]
    pub const fn model(&self) -> &MIModel {
        &self.model
    }

    /// Replace the ablation map (last writer wins).
    pub fn sync_ablations(&self, request: AblationSyncRequest) -> AblationSyncResponse {
        let mut core = self.core.lock();
        let outcome = core
            .state
            .apply_ablations(request.client_logical_clock, request.ablations);
        AblationSyncResponse {
            server_logical_clock: outcome.logical_clock,
            ablations: core.state.ablations().clone(),
            accepted: outcome.accepted,
            rejected: outcome.rejected,
        }
    }

    /// Replace the patch map (last writer wins).
    pub fn sync_patches(&self, request: PatchSyncRequest) -> PatchSyncResponse {
        let mut core = self.core.lock();
        let outcome = core
            .state
            .apply_patches(request.client_logical_clock, request.patches);
        PatchSyncResponse {
            server_logical_clock: outcome.logical_clock,
            patches: core.state.patches().clone(),
            accepted: outcome.accepted,
            rejected: outcome.rejected,
        }
    }

    /// Run one hooked pass over `prompt` with the installed ablations and
    /// patches.
    ///
    /// # Errors
    ///
    /// Propagates every failure from [`RunOrchestrator::run`]; the cache is
    /// left unrotated.
    pub fn run(&self, prompt: &str) -> Result<RunOutput> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        tracing::debug!(clock = core.state.logical_clock(), "run requested");
        core.orchestrator.run(
            &self.model,
            self.codec.as_ref(),
            core.state.ablation_hooks(),
            core.state.patch_hooks(),
            prompt,
        )
    }

    /// Current clock and both maps.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.core.lock();
        SessionSnapshot {
            server_logical_clock: core.state.logical_clock(),
            ablations: core.state.ablations().clone(),
            patches: core.state.patches().clone(),
        }
    }

    /// Drop both cache generations. The next freeze snapshots afresh.
    pub fn clear_cache(&self) {
        self.core.lock().orchestrator.clear_cache();
        tracing::info!("cache cleared");
    }

    /// Number of components held in the previous-pass generation.
    #[must_use]
    pub fn num_cached(&self) -> usize {
        self.core.lock().orchestrator.cache().num_last()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model", &self.model)
            .finish_non_exhaustive()
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

    fn zero_map(component: &str) -> AblationMap {
        AblationMap::new().with(component, "s1", Slice::from_pairs(&[(0, 2)]), AblationKind::Zero)
    }

    #[test]
    fn stale_write_is_superseded() {
        let mut state = SessionState::new();
        let first = state.apply_ablations(0, zero_map("blockA"));
        assert!(first.accepted);
        assert_eq!(first.logical_clock, 1);

        let stale = state.apply_ablations(0, zero_map("blockB"));
        assert!(!stale.accepted);
        assert_eq!(stale.logical_clock, 1);
        assert_eq!(state.ablations(), &zero_map("blockA"));
        assert_eq!(state.ablation_hooks().len(), 1);
    }

    #[test]
    fn accepted_write_replaces_without_merge() {
        let mut state = SessionState::new();
        state.apply_ablations(0, zero_map("blockA"));
        let outcome = state.apply_ablations(5, zero_map("blockB"));
        assert!(outcome.accepted);
        // Always exactly one step, whatever the client clock.
        assert_eq!(outcome.logical_clock, 2);
        assert_eq!(state.ablations(), &zero_map("blockB"));
        assert_eq!(state.ablation_hooks()[0].hook.to_string(), "blockB");
    }

    #[test]
    fn clock_is_shared_across_maps() {
        let mut state = SessionState::new();
        state.apply_ablations(0, zero_map("blockA"));
        let patches = PatchMap::new().with_edge(
            ("blockA", "src", Slice::from_pairs(&[(0, 2)])),
            ("blockB", "dst", Slice::from_pairs(&[(0, 2)])),
        );
        // Clock 0 is now stale for patches too.
        assert!(!state.apply_patches(0, patches.clone()).accepted);
        assert!(state.patches().is_empty());

        let outcome = state.apply_patches(1, patches.clone());
        assert!(outcome.accepted);
        assert_eq!(outcome.logical_clock, 2);
        assert_eq!(state.patches(), &patches);
        assert_eq!(state.patch_hooks().len(), 1);
    }

    #[test]
    fn malformed_entries_are_reported_but_echoed() {
        let mut state = SessionState::new();
        let map = zero_map("blockA").with("blockA", "bad", Slice::from_pairs(&[(3, 1)]), AblationKind::Zero);
        let outcome = state.apply_ablations(0, map.clone());
        assert!(outcome.accepted);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].slice_id, "bad");
        assert_eq!(state.ablations(), &map);
        assert_eq!(state.ablation_hooks().len(), 1);
    }

    #[test]
    fn sync_request_wire_names() {
        let json = serde_json::json!({
            "clientLogicalClock": 0,
            "ablations": {"blockA": {"s1": {"slice": [[0, 2]], "ablationType": "zero"}}}
        });
        let request: AblationSyncRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.ablations, zero_map("blockA"));

        let response = AblationSyncResponse {
            server_logical_clock: 1,
            ablations: request.ablations,
            accepted: true,
            rejected: Vec::new(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["serverLogicalClock"], 1);
        assert_eq!(value["ablations"]["blockA"]["s1"]["ablationType"], "zero");
        assert!(value.get("rejected").is_none());
    }

    #[test]
    fn negative_client_clock_is_stale() {
        let request: AblationSyncRequest = serde_json::from_value(serde_json::json!({
            "clientLogicalClock": -1,
            "ablations": {"blockA": {"s1": {"slice": [[0, 2]], "ablationType": "zero"}}}
        }))
        .unwrap();
        let mut state = SessionState::new();
        let outcome = state.apply_ablations(request.client_logical_clock, request.ablations);
        assert!(!outcome.accepted);
        assert_eq!(outcome.logical_clock, 0);
        assert!(state.ablations().is_empty());
    }

    #[test]
    fn patch_request_parses_edges() {
        let json = serde_json::json!({
            "clientLogicalClock": 3,
            "patches": {"blockA": {"src": {
                "slice": [[0, 2]],
                "edges": {"blockB": {"dst": {"slice": [[0, -1]]}}}
            }}}
        });
        let request: PatchSyncRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.client_logical_clock, 3);
        assert_eq!(request.patches.num_edges(), 1);
    }
}
