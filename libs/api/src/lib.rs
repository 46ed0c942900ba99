//! Shared data model and transport seams of the ingestion service.
//!
//! The crate defines traits only and has no runtime dependency: broker,
//! pipeline and cache crates implement or consume them.

pub mod error;
pub mod log;
pub mod types;

pub use error::{ErrorKind, ServiceError};
pub use log::{LogClient, LogConsumer, LogProducer};
pub use types::{OutboundMessage, Payload, Record, ShutdownReport, TopicPartition};
