//! Server wiring: application state, router and the request pipeline.

pub mod server;
pub mod state;

pub use server::build_router;
pub use state::AppState;
