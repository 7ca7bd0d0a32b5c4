//! Storage implementations for the extraction library.
//!
//! Available backends:
//! - `MemoryStore` - In-memory storage for tests, development and
//!   single-process runs

pub mod memory;

pub use memory::MemoryStore;
