//! Shared domain types for the ojforge pipeline engine.

mod concurrency;
mod errors;
mod events;
mod problem;
mod problem_ref;
mod provider;
mod statement;
mod task;

pub use concurrency::*;
pub use errors::*;
pub use events::*;
pub use problem::*;
pub use problem_ref::*;
pub use provider::*;
pub use statement::*;
pub use task::*;
