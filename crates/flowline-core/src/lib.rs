pub mod config;
pub mod error;
pub mod types;

pub use config::FlowlineConfig;
pub use error::{FlowlineError, Result};
pub use types::Identifier;
