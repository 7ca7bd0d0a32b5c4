//! Domain types for catalogue recipe detection and extraction.

pub mod catalogue;
pub mod config;
pub mod extraction;
pub mod item;
pub mod page;
pub mod recipe;
pub mod status;
