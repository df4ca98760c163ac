//! Stateful, incremental usage accounting over a passing SSE byte stream.

pub mod extractor;

pub use extractor::UsageExtractor;
