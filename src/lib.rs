// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-patch
//!
//! Hook orchestration for ablation and activation-patching experiments on
//! language models, built on [candle](https://github.com/huggingface/candle).
//!
//! A client declares which regions of which components to ablate (zero or
//! freeze) and which regions to copy between components. A [`Session`]
//! compiles those declarations into hook entries, runs one forward pass
//! per prompt with the entries installed in a fixed phase order
//! (ablation, then patch, then capture), and keeps a two-generation
//! activation cache so freezes and patches can reach back to the previous
//! pass.
//!
//! Component names follow the `TransformerLens` convention
//! (`blocks.0.attn.hook_q`, `blocks.3.hook_resid_post`, ...); see
//! [`HookPoint`]. Models plug in through [`MIBackend`].
//!
//! ## Quick start
//!
//! ```no_run
//! use candle_patch::{
//!     AblationKind, AblationMap, AblationSyncRequest, MIModel, MITokenizer, Session, Slice,
//! };
//!
//! # fn main() -> candle_patch::Result<()> {
//! # fn my_backend() -> Box<dyn candle_patch::MIBackend> { unimplemented!() }
//! let model = MIModel::new(my_backend(), candle_core::Device::Cpu);
//! let tokenizer = MITokenizer::from_hf_path("tokenizer.json")?;
//! let session = Session::new(model, Box::new(tokenizer));
//!
//! let ablations = AblationMap::new().with(
//!     "blocks.0.attn.hook_pattern",
//!     "bos",
//!     Slice::from_pairs(&[(0, -1), (0, -1), (0, -1), (0, 1)]),
//!     AblationKind::Zero,
//! );
//! let response = session.sync_ablations(AblationSyncRequest {
//!     client_logical_clock: 0,
//!     ablations,
//! });
//! assert!(response.accepted);
//!
//! let output = session.run("The Eiffel Tower is in")?;
//! println!("loss = {:?}", output.final_loss);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod orchestrator;
pub mod session;
pub mod slice;
pub mod tokenizer;

// --- Public re-exports ---------------------------------------------------

// Backend
pub use backend::{MIBackend, MIModel};

// Cache
pub use cache::GenerationalCache;

// Config
pub use config::{EngineConfig, ExportPolicy};

// Error
pub use error::{MIError, Result};

// Hooks
pub use hooks::{
    CachingHooks, HookDispatch, HookEntry, HookPhase, HookPlan, HookPoint, NamesFilter, NoHooks,
};

// Interventions
pub use interp::RejectedEntry;
pub use interp::ablation::{
    AblationEntry, AblationKind, AblationMap, AblationSlice, build_ablation_hooks,
};
pub use interp::loss::{mean_loss, per_token_loss};
pub use interp::patch::{PatchEntry, PatchMap, PatchSource, PatchTarget, build_patch_hooks};

// Orchestration
pub use orchestrator::{ExportedTensor, PassContext, RunOrchestrator, RunOutput, RunReport};
pub use session::{
    AblationSyncRequest, AblationSyncResponse, PatchSyncRequest, PatchSyncResponse, Session,
    SessionSnapshot, SessionState, SyncOutcome,
};

// Slices
pub use slice::{Region, Slice, SliceRange, min_shape_intersect};

// Tokenizer
pub use tokenizer::TokenCodec;
#[cfg(feature = "hf-tokenizer")]
pub use tokenizer::MITokenizer;
