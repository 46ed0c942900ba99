use ingest_api::ServiceError;

use crate::{CacheReply, DatabaseIndex};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// URI не задан или не распознан.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Не удалось открыть соединение с базой при инициализации.
    #[error("connection ({db}): {source}")]
    Connection { db: DatabaseIndex, source: ServiceError },

    /// Для этого индекса нет соединения (вне диапазона или пул закрыт).
    #[error("no cache client registered for {0}")]
    Unavailable(DatabaseIndex),

    #[error("{command} on {db}: {source}")]
    Command {
        command: &'static str,
        db: DatabaseIndex,
        source: ServiceError,
    },

    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: &'static str, reply: String },
}

impl CacheError {
    pub(crate) fn unexpected(command: &'static str, reply: &CacheReply) -> Self {
        CacheError::UnexpectedReply { command, reply: format!("{reply:?}") }
    }
}
