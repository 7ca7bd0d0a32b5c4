//! Background job infrastructure.
//!
//! - [`memory::MemoryJobQueue`] - in-process implementation of
//!   [`JobQueue`](crate::traits::queue::JobQueue)
//! - [`worker::JobWorker`] - concurrent claim loops dispatching to a
//!   [`JobHandler`](worker::JobHandler)

pub mod memory;
pub mod worker;

pub use memory::{DeadLetter, MemoryJobQueue};
pub use worker::{JobHandler, JobWorker, JobWorkerConfig};
