//! Bounded-concurrency primitives.

mod queue;
mod semaphore;

pub use queue::{BoundedQueue, RendezvousChannel};
pub use semaphore::Semaphore;
