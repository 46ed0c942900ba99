use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use ingest_api::{LogClient, LogProducer, OutboundMessage, ServiceError, ShutdownReport};

use crate::config::{BrokerSettings, TransportKind};
use crate::kafka::KafkaClient;
use crate::memory::MemoryLog;
use crate::registration::{ConsumerRegistration, ConsumerState};
use crate::BrokerError;

/// Владеет единственным publisher'ом и реестром consumer registrations.
///
/// `publish` не сериализует вызовы: producer клонируется из-под read lock'а
/// и используется параллельно.
pub struct BrokerManager {
    settings: BrokerSettings,
    client: Arc<dyn LogClient>,
    publisher: RwLock<Option<Arc<dyn LogProducer>>>,
    consumers: Mutex<Vec<Arc<ConsumerRegistration>>>,
}

impl std::fmt::Debug for BrokerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerManager")
            .field("client", &self.client.describe())
            .field("settings", &self.settings)
            .finish()
    }
}

impl BrokerManager {
    /// Проверить настройки и построить клиент выбранного транспорта.
    /// Сетевых вызовов не делает.
    pub fn initialize(settings: BrokerSettings) -> Result<Self, BrokerError> {
        settings.validate()?;
        let client: Arc<dyn LogClient> = match settings.transport {
            TransportKind::Kafka => Arc::new(KafkaClient::new(settings.clone())),
            TransportKind::Memory => Arc::new(MemoryLog::new()),
        };
        tracing::info!(client = %client.describe(), "broker manager initialized");
        Ok(Self::build(settings, client))
    }

    /// Как [`BrokerManager::initialize`], но с готовым клиентом.
    pub fn with_client(
        settings: BrokerSettings,
        client: Arc<dyn LogClient>,
    ) -> Result<Self, BrokerError> {
        settings.validate()?;
        Ok(Self::build(settings, client))
    }

    fn build(settings: BrokerSettings, client: Arc<dyn LogClient>) -> Self {
        Self {
            settings,
            client,
            publisher: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<dyn LogClient> {
        &self.client
    }

    // ═══════════════════════════════════════════════════════════
    //  Publisher
    // ═══════════════════════════════════════════════════════════

    /// Подключить publisher. Повторный вызов при активном publisher: no-op.
    pub async fn connect_publisher(&self) -> Result<(), BrokerError> {
        let mut slot = self.publisher.write().await;
        if slot.is_some() {
            tracing::debug!("publisher already connected");
            return Ok(());
        }

        let producer: Arc<dyn LogProducer> = Arc::from(
            self.client
                .producer()
                .map_err(|e| BrokerError::connection("publisher", e))?,
        );
        match tokio::time::timeout(self.settings.timeouts.connect, producer.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BrokerError::connection("publisher", e)),
            Err(_) => {
                return Err(BrokerError::connection(
                    "publisher",
                    ServiceError::connection(format!(
                        "connect timed out after {:?}",
                        self.settings.timeouts.connect
                    )),
                ));
            }
        }

        *slot = Some(producer);
        tracing::info!("publisher connected");
        Ok(())
    }

    pub async fn is_publisher_connected(&self) -> bool {
        self.publisher.read().await.is_some()
    }

    /// Отправить batch в topic. Пустой batch: успешный no-op.
    pub async fn publish(
        &self,
        topic: &str,
        messages: &[OutboundMessage],
    ) -> Result<(), BrokerError> {
        let producer = self.publisher.read().await.clone().ok_or_else(|| {
            BrokerError::publish(topic, ServiceError::connection("publisher is not connected"))
        })?;
        if messages.is_empty() {
            return Ok(());
        }

        match tokio::time::timeout(
            self.settings.timeouts.publish,
            producer.send_batch(topic, messages),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(%topic, count = messages.len(), "batch published");
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::publish(topic, e)),
            Err(_) => Err(BrokerError::publish(
                topic,
                ServiceError::io(format!(
                    "publish timed out after {:?}",
                    self.settings.timeouts.publish
                )),
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════
    //  Consumers
    // ═══════════════════════════════════════════════════════════

    /// Создать consumer для `group_id`, подключить и подписать на `topics`.
    ///
    /// На ошибке частично созданный consumer отключается (best effort),
    /// в реестр ничего не попадает.
    pub async fn register_consumer(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Arc<ConsumerRegistration>, BrokerError> {
        if group_id.trim().is_empty() {
            return Err(BrokerError::Configuration("consumer group id is empty".into()));
        }
        let topic_set: BTreeSet<String> = topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if topic_set.is_empty() {
            return Err(BrokerError::Configuration(format!(
                "consumer group '{group_id}' has no topics"
            )));
        }

        let consumer: Arc<dyn ingest_api::LogConsumer> = Arc::from(
            self.client
                .consumer(group_id)
                .map_err(|e| BrokerError::connection(group_id, e))?,
        );
        let topic_list: Vec<String> = topic_set.iter().cloned().collect();
        let timeout = self.settings.timeouts.connect;

        let setup = async {
            consumer.connect().await?;
            consumer.subscribe(&topic_list).await
        };
        let outcome = match tokio::time::timeout(timeout, setup).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::connection(format!(
                "connect/subscribe timed out after {timeout:?}"
            ))),
        };
        if let Err(e) = outcome {
            if let Err(cleanup) = consumer.disconnect().await {
                tracing::warn!(consumer = %group_id, error = %cleanup, "cleanup after failed registration");
            }
            return Err(BrokerError::connection(group_id, e));
        }

        let registration = Arc::new(ConsumerRegistration::new(
            group_id.to_string(),
            topic_set,
            consumer,
        ));
        registration.transition(ConsumerState::Subscribed);
        self.lock_consumers().push(registration.clone());

        tracing::info!(consumer = %group_id, topics = ?topic_list, "consumer registered");
        Ok(registration)
    }

    /// Snapshot реестра.
    pub fn consumers(&self) -> Vec<Arc<ConsumerRegistration>> {
        self.lock_consumers().clone()
    }

    fn lock_consumers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ConsumerRegistration>>> {
        self.consumers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("consumer registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // ═══════════════════════════════════════════════════════════
    //  Shutdown
    // ═══════════════════════════════════════════════════════════

    /// Отключить publisher и все consumers. Ошибка одного ресурса не мешает
    /// отключению остальных. Повторный вызов ничего не делает.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let mut report = ShutdownReport::new();
        let disconnect_timeout = self.settings.timeouts.disconnect;

        let publisher = self.publisher.write().await.take();
        if let Some(producer) = publisher {
            let result = bounded(disconnect_timeout, producer.disconnect()).await;
            if let Err(e) = &result {
                tracing::warn!(error = %e, "publisher disconnect failed");
            }
            report.record("publisher", result);
        }

        let drained: Vec<_> = std::mem::take(&mut *self.lock_consumers());
        for registration in drained {
            let name = format!("consumer:{}", registration.group_id());
            let result = bounded(disconnect_timeout, registration.disconnect()).await;
            if let Err(e) = &result {
                tracing::warn!(consumer = %registration.group_id(), error = %e, "consumer disconnect failed");
            }
            report.record(name, result);
        }

        tracing::info!(
            closed = report.closed.len(),
            failed = report.failed.len(),
            "broker connections shut down"
        );
        report
    }
}

async fn bounded(
    timeout: std::time::Duration,
    fut: impl std::future::Future<Output = Result<(), ServiceError>>,
) -> Result<(), ServiceError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(ServiceError::io(format!("disconnect timed out after {timeout:?}"))))
}
