pub mod admission;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod group;
pub mod manager;
pub mod worker;

pub use admission::{AccessKeyAdmission, Admission};
pub use client::{ClientId, ClientSession};
pub use config::BrokerConfig;
pub use context::ChatContext;
pub use error::BrokerError;
pub use group::Group;
pub use manager::{ConnectionManager, DEFAULT_GROUP_TITLE};
pub use worker::{JobFailure, WorkerId, WorkerSession};
