use std::future::Future;
use std::pin::Pin;

use ingest_api::{Record, ServiceError};

/// Per-record обработчик. Вызывается последовательно внутри партиции,
/// параллельно между партициями.
///
/// Ошибка не останавливает loop: что будет с offset'ом, решает
/// [`CommitPolicy`](crate::CommitPolicy).
pub trait RecordHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        record: &'a Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;
}

/// Demo handler: логирует каждую запись (`source`, `message`, `partition`, `topic`).
#[derive(Debug, Clone)]
pub struct LogHandler {
    source: String,
}

impl LogHandler {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }
}

impl RecordHandler for LogHandler {
    fn handle<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        record: &'a Record,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let message = record.payload();
            tracing::info!(
                source = %self.source,
                partition,
                %topic,
                offset = record.offset,
                "{message}"
            );
            Ok(())
        })
    }
}
