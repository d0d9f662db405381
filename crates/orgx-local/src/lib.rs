//! Local Fallback Mediator (§4.7) and the persisted local state it draws
//! on: the JSON-file store primitive, status overrides, the outbox, the
//! agent-launch-context store, and next-up pins.

mod launch_context;
mod mediator;
mod outbox;
mod overrides;
mod pins;
mod store;

pub use launch_context::{AgentContextsFile, LaunchContextStore, RunContext};
pub use mediator::{Mediator, MediatedRead};
pub use outbox::Outbox;
pub use overrides::OverrideTable;
pub use pins::{PinStore, PinsFile};
pub use store::{JsonFileStore, StoreError};
