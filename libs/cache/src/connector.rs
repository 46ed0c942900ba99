use std::future::Future;
use std::pin::Pin;

use ingest_api::ServiceError;

use crate::{CacheCommand, CacheReply, DatabaseIndex};

// ═══════════════════════════════════════════════════════════════
//  Cache transport traits
// ═══════════════════════════════════════════════════════════════

/// Открывает соединения к логическим базам одного кэш-сервиса.
///
/// Реализации: `RedisConnector` (redis), `MemoryCache` (in-process).
pub trait CacheConnector: Send + Sync {
    /// Открыть соединение, уже переключённое на базу `db`.
    fn connect<'a>(
        &'a self,
        uri: &'a str,
        db: DatabaseIndex,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn CacheConnection>, ServiceError>> + Send + 'a>>;
}

/// Соединение с одной логической базой.
pub trait CacheConnection: Send + Sync {
    /// Выполнить команду и вернуть ответ как есть.
    fn execute<'a>(
        &'a self,
        command: &'a CacheCommand,
    ) -> Pin<Box<dyn Future<Output = Result<CacheReply, ServiceError>> + Send + 'a>>;

    /// Закрыть соединение.
    fn quit(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;
}
