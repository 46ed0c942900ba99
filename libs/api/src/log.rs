use std::future::Future;
use std::pin::Pin;

use crate::{OutboundMessage, Record, ServiceError};

// ════════════════════════════════════════════════════════════════
//  Distributed log transport traits
// ════════════════════════════════════════════════════════════════

/// Переиспользуемый клиент распределённого лога (брокер-лист + credentials
/// уже применены). Создаёт producer'ы и consumer'ы; сам соединений не держит.
///
/// Реализации: `KafkaClient` (rdkafka), `MemoryLog` (in-process).
pub trait LogClient: Send + Sync {
    /// Новый producer. Соединение открывается через `LogProducer::connect`.
    fn producer(&self) -> Result<Box<dyn LogProducer>, ServiceError>;

    /// Новый consumer, привязанный к consumer group.
    /// Автоматический commit offset'ов у него выключен.
    fn consumer(&self, group_id: &str) -> Result<Box<dyn LogConsumer>, ServiceError>;

    /// Описание транспорта (для логирования).
    fn describe(&self) -> String;
}

/// Исходящее соединение для публикации.
pub trait LogProducer: Send + Sync {
    /// Установить соединение. Ошибка: `ErrorKind::Connection`.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    /// Отправить все сообщения одним batch'ем. Либо брокер принял весь
    /// batch, либо вызов завершился ошибкой: per-message результата нет.
    fn send_batch<'a>(
        &'a self,
        topic: &'a str,
        messages: &'a [OutboundMessage],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;

    /// Дождаться отправки буферов и закрыть соединение.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;
}

/// Consumer одной consumer group.
///
/// Все методы принимают `&self`: `recv` вызывается из receive loop,
/// а `commit` параллельно из partition worker'ов.
pub trait LogConsumer: Send + Sync {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    fn subscribe<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;

    /// Следующая запись из любой назначенной партиции.
    ///
    /// - `Ok(None)`: поток закрыт (consumer отключён).
    /// - `Err` с `ErrorKind::Io`: транзиентная ошибка, можно повторить.
    /// - Любая другая ошибка: receive loop должен остановиться.
    fn recv(&self) -> Pin<Box<dyn Future<Output = Result<Option<Record>, ServiceError>> + Send + '_>>;

    /// Закоммитить `next_offset` для (topic, partition): все записи
    /// с offset < `next_offset` считаются обработанными.
    fn commit<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        next_offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>>;

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;
}
