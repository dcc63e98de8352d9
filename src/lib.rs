pub mod config;
pub mod error;
pub mod eval;
pub mod indexer;
pub mod models;
pub mod rag;

pub use config::Settings;
pub use error::{Error, ProviderError, Result};
pub use rag::RagEngine;
