pub mod chunker;
pub mod walker;
