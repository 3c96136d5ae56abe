//! Job processing: the worker loop and its per-job scratch space.

pub mod worker;
pub mod workspace;

pub use worker::{JobOutcome, Tick, Worker, WorkerConfig};
pub use workspace::JobWorkspace;
