//! Message processing pipeline: consume → process → commit с ручным
//! управлением offset'ами.

pub mod config;
mod consumer;
pub mod error;
mod handler;
mod worker;

pub use config::{CommitPolicy, ConsumerConfig, PipelineConfig};
pub use consumer::{run_consumer, spawn_consumer};
pub use error::PipelineError;
pub use handler::{LogHandler, RecordHandler};
pub use worker::{process_record, ConsumerSummary, RecordOutcome, RecordReport};
