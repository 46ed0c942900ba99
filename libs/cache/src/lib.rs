//! Keyed cache client pool: по соединению на каждую логическую базу
//! кэш-сервиса и маршрутизация типизированных операций.

mod command;
mod connector;
mod error;
pub mod memory;
mod pool;
mod redis_client;

pub use command::{CacheCommand, CacheReply, DatabaseIndex};
pub use connector::{CacheConnection, CacheConnector};
pub use error::CacheError;
pub use memory::MemoryCache;
pub use pool::{connector_for, redact_uri, CachePool, Database};
pub use redis_client::RedisConnector;
