use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use ingest_api::{LogConsumer, ServiceError};

/// Жизненный цикл consumer registration:
/// `Uninitialized → Subscribed → Running → (Stopped | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Uninitialized,
    Subscribed,
    Running,
    /// Остановлен по shutdown сигналу (или закрытию потока).
    Stopped,
    /// Receive loop упал; автоматического рестарта нет.
    Failed,
}

impl ConsumerState {
    fn can_move_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Uninitialized, Subscribed)
                | (Subscribed, Running)
                | (Subscribed, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Failed)
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsumerState::Uninitialized => "uninitialized",
            ConsumerState::Subscribed => "subscribed",
            ConsumerState::Running => "running",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Consumer, привязанный к consumer group и набору topic'ов.
///
/// Создаётся только через `BrokerManager::register_consumer` и хранится
/// в его реестре до shutdown.
pub struct ConsumerRegistration {
    group_id: String,
    topics: BTreeSet<String>,
    consumer: Arc<dyn LogConsumer>,
    state: watch::Sender<ConsumerState>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("group_id", &self.group_id)
            .field("topics", &self.topics)
            .field("state", &self.state())
            .finish()
    }
}

impl ConsumerRegistration {
    pub(crate) fn new(
        group_id: String,
        topics: BTreeSet<String>,
        consumer: Arc<dyn LogConsumer>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Uninitialized);
        Self {
            group_id,
            topics,
            consumer,
            state,
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        &self.topics
    }

    pub fn consumer(&self) -> &Arc<dyn LogConsumer> {
        &self.consumer
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Подписка на смену состояния (например, дождаться `Failed`).
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Перевести registration в `next`. Недопустимые переходы
    /// отклоняются и возвращают `false`.
    pub fn transition(&self, next: ConsumerState) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|current| {
            if current.can_move_to(next) {
                *current = next;
                true
            } else {
                from = Some(*current);
                false
            }
        });
        if let Some(from) = from {
            tracing::warn!(
                consumer = %self.group_id,
                %from,
                to = %next,
                "rejected consumer state transition"
            );
        }
        moved
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Отключить consumer. Повторный вызов: no-op.
    pub async fn disconnect(&self) -> Result<(), ServiceError> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Loop, если он ещё не завершён, видит закрытый поток и уходит в Stopped.
        self.consumer.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use ConsumerState::*;
        assert!(Uninitialized.can_move_to(Subscribed));
        assert!(Subscribed.can_move_to(Running));
        assert!(Running.can_move_to(Stopped));
        assert!(Running.can_move_to(Failed));

        assert!(!Uninitialized.can_move_to(Running));
        assert!(!Failed.can_move_to(Running));
        assert!(!Stopped.can_move_to(Running));
        assert!(!Subscribed.can_move_to(Failed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConsumerState::Stopped.is_terminal());
        assert!(ConsumerState::Failed.is_terminal());
        assert!(!ConsumerState::Running.is_terminal());
    }
}
