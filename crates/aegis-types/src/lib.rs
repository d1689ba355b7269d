pub mod error;
pub mod model;

pub use error::OrchestratorError;
pub use model::*;
