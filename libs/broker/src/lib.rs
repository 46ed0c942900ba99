//! Broker connection manager: один publisher на процесс, реестр consumer
//! registrations и best-effort shutdown всех соединений.
//!
//! Транспорт выбирается через [`TransportKind`]: Kafka (rdkafka) или
//! in-process [`MemoryLog`].

pub mod config;
mod error;
pub mod kafka;
mod manager;
pub mod memory;
mod registration;

pub use config::{BrokerSettings, BrokerTimeouts, Credentials, TransportKind};
pub use error::BrokerError;
pub use kafka::KafkaClient;
pub use manager::BrokerManager;
pub use memory::MemoryLog;
pub use registration::{ConsumerRegistration, ConsumerState};
