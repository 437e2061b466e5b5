pub mod config;
pub mod error;
pub mod llm;
pub mod types;

pub use config::AppConfig;
pub use error::{RelayError, RelayResult};
