//! Mission Control Graph Builder and Next-Up Ranker.

mod budget;
mod build;
mod ranker;

pub use budget::{BudgetConstants, ModelPricing};
pub use build::{build_graph, RawEntities, MAX_INITIATIVES, MAX_MILESTONES, MAX_TASKS, MAX_WORKSTREAMS};
pub use ranker::{rank_next_up, workstream_ids, RankerInput, SessionFallbackNode};
