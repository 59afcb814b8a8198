//! Reference worker: connects to the broker, runs one job at a time through a
//! [`Backend`] and streams the output back as it is produced.

pub mod backend;
pub mod error;
pub mod runner;

pub use backend::{Backend, BackendError, EchoBackend};
pub use error::WorkerClientError;
pub use runner::{connect, serve};
