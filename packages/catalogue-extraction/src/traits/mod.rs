//! Collaborator traits for the catalogue extraction library.
//!
//! These traits define the interfaces that applications implement
//! to provide storage, LLM completions, page rendering and job queueing.

pub mod browser;
pub mod llm;
pub mod queue;
pub mod store;
