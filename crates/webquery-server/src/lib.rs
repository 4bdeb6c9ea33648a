//! WebQuery HTTP server: axum ingress in front of the plan orchestrator.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
