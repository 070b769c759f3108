//! Application wiring for bulwark
//!
//! [`ResilienceContext`] is built once at process start and handed to
//! whatever needs health or recovery services.

pub mod context;
pub mod error;

pub use context::{ContextShutdownReport, ResilienceContext};
pub use error::{RuntimeError, RuntimeResult};
