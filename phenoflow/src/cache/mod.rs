//! Output cache and generation locks.
//!
//! Task outputs live in an [`OutputCache`] under `TaskOutput::{task_run_id}`.
//! A [`GenerationLock`] is an advisory marker in the same cache that keeps
//! two producers from building the same expensive output at once.

mod generation;
mod output;

pub use generation::{GenerationLock, GenerationState, DEFAULT_LOCK_PREFIX};
pub use output::{purge_matching, CacheEntry, InMemoryOutputCache, OutputCache};
