//! Dispatch Engine (§4.5): execution-policy derivation, spawn-guard
//! interpretation, prompt construction, detached process supervision,
//! transcript parsing, and the orchestration that ties them together.

mod dispatch;
mod policy;
mod process;
mod prompt;
mod spawn_guard;
mod transcript;

pub use dispatch::{dispatch, DispatchError, DispatchOutcome, DispatchRequest};
pub use policy::{derive_domain, implies_byok, is_valid_agent_id, normalize_provider, required_skill};
pub use process::{is_pid_alive, spawn_detached, stop_detached_process, StopOutcome};
pub use prompt::build_prompt;
pub use spawn_guard::{evaluate as evaluate_spawn_guard, SpawnGuardOutcome};
pub use transcript::{
    summarize_transcript_file, summarize_transcript_text, transcript_path, validate_path_segment,
    TranscriptPathError, TranscriptSummary,
};
