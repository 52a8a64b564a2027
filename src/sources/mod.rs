//! Concrete message sources.

pub mod jsonl;

pub use jsonl::JsonlFileSource;
