//! HTTP surface
//!
//! Every operation is exposed as a POST that answers with a server-push
//! event stream. Search and update also have plain JSON variants that wait
//! for the terminal summary.

pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{AppState, LiveOperations, router};
