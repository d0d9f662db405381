//! HTTP front door for the OrgX local control plane (§6): axum router, SSE
//! endpoints, auth/CORS middleware, and the handlers that glue the
//! component crates into the stable `/orgx` surface. Thin and mechanical by
//! design — almost all of its logic is delegated to `orgx-graph`,
//! `orgx-runtime`, `orgx-registry`, `orgx-scheduler`, and `orgx-local`.

mod config;
mod error;
mod http;
mod state;

pub use config::Config;
pub use error::{ApiError, ErrorEnvelope};
pub use http::serve;
pub use state::AppState;
