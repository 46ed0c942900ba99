use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;

use ingest_api::{
    LogClient, LogConsumer, LogProducer, OutboundMessage, Record, ServiceError,
};

use crate::config::BrokerSettings;

// ═══════════════════════════════════════════════════════════════
//  Error mapping
// ═══════════════════════════════════════════════════════════════

/// Транзиентные ошибки чтения (EOF партиции, сбой fetch) → `Io`,
/// всё остальное → `Fatal`.
fn classify_recv(err: KafkaError) -> ServiceError {
    match err {
        KafkaError::PartitionEOF(p) => ServiceError::io(format!("partition {p} reached EOF")),
        KafkaError::MessageConsumption(code) => {
            ServiceError::io(format!("message consumption failed: {code}"))
        }
        other => ServiceError::fatal(other.to_string()),
    }
}

fn connection_err(err: KafkaError) -> ServiceError {
    ServiceError::connection(err.to_string())
}

fn join_err(err: tokio::task::JoinError) -> ServiceError {
    ServiceError::fatal(format!("blocking kafka task failed: {err}"))
}

fn kafka_offset(topic: &str, partition: i32, next_offset: u64) -> Result<i64, ServiceError> {
    i64::try_from(next_offset).map_err(|_| {
        ServiceError::format_err(format!(
            "offset {next_offset} for {topic}[{partition}] does not fit a kafka offset"
        ))
    })
}

// ═══════════════════════════════════════════════════════════════
//  KafkaClient
// ═══════════════════════════════════════════════════════════════

/// Клиент Kafka-совместимого брокера (SASL PLAIN, опционально TLS).
pub struct KafkaClient {
    settings: BrokerSettings,
}

impl KafkaClient {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.settings.bootstrap_servers());
        config.set(
            "socket.connection.setup.timeout.ms",
            self.settings.timeouts.connect.as_millis().to_string(),
        );

        match &self.settings.credentials {
            Some(creds) => {
                let protocol = if self.settings.tls { "SASL_SSL" } else { "SASL_PLAINTEXT" };
                config.set("security.protocol", protocol);
                config.set("sasl.mechanism", "PLAIN");
                config.set("sasl.username", &creds.username);
                config.set("sasl.password", &creds.password);
            }
            None => {
                config.set("security.protocol", if self.settings.tls { "SSL" } else { "PLAINTEXT" });
            }
        }
        config
    }
}

impl LogClient for KafkaClient {
    fn producer(&self) -> Result<Box<dyn LogProducer>, ServiceError> {
        let mut config = self.base_config();
        config.set("acks", "all");
        config.set(
            "message.timeout.ms",
            self.settings.timeouts.publish.as_millis().to_string(),
        );
        Ok(Box::new(KafkaProducer {
            config,
            connect_timeout: self.settings.timeouts.connect,
            flush_timeout: self.settings.timeouts.disconnect,
            producer: RwLock::new(None),
        }))
    }

    fn consumer(&self, group_id: &str) -> Result<Box<dyn LogConsumer>, ServiceError> {
        let mut config = self.base_config();
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("enable.partition.eof", "false");

        let consumer: StreamConsumer = config.create().map_err(|e| {
            ServiceError::config(format!("invalid consumer config for group '{group_id}': {e}"))
        })?;
        let (closed, _) = watch::channel(false);
        Ok(Box::new(KafkaConsumer {
            group_id: group_id.to_string(),
            consumer: Arc::new(consumer),
            connect_timeout: self.settings.timeouts.connect,
            closed,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "kafka ({}, tls={})",
            self.settings.bootstrap_servers(),
            self.settings.tls
        )
    }
}

// ═══════════════════════════════════════════════════════════════
//  Producer
// ═══════════════════════════════════════════════════════════════

struct KafkaProducer {
    config: ClientConfig,
    connect_timeout: Duration,
    flush_timeout: Duration,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaProducer {
    fn current(&self) -> Option<FutureProducer> {
        self.producer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl LogProducer for KafkaProducer {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let producer: FutureProducer = self.config.create().map_err(connection_err)?;

            // Metadata request: единственный способ убедиться, что брокер доступен.
            let metadata_client = producer.clone();
            let timeout = self.connect_timeout;
            tokio::task::spawn_blocking(move || metadata_client.client().fetch_metadata(None, timeout))
                .await
                .map_err(join_err)?
                .map_err(connection_err)?;

            *self
                .producer
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(producer);
            Ok(())
        })
    }

    fn send_batch<'a>(
        &'a self,
        topic: &'a str,
        messages: &'a [OutboundMessage],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let producer = self
                .current()
                .ok_or_else(|| ServiceError::connection("producer is not connected"))?;

            // Сначала весь batch в очередь librdkafka, потом ждём delivery reports.
            let mut deliveries = Vec::with_capacity(messages.len());
            for msg in messages {
                let mut record: FutureRecord<'_, str, str> =
                    FutureRecord::to(topic).payload(msg.value.as_str());
                if let Some(key) = &msg.key {
                    record = record.key(key.as_str());
                }
                deliveries.push(enqueue(&producer, record).await?);
            }

            let mut first_error = None;
            for delivery in deliveries {
                let failure = match delivery.await {
                    Ok(Ok(_)) => continue,
                    Ok(Err((err, _))) => ServiceError::io(err.to_string()),
                    Err(_) => ServiceError::io("delivery report dropped by producer"),
                };
                first_error.get_or_insert(failure);
            }
            match first_error {
                Some(err) => Err(err.with_context(format!("batch of {} to '{topic}'", messages.len()))),
                None => Ok(()),
            }
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let taken = self
                .producer
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            let Some(producer) = taken else {
                return Ok(());
            };
            let timeout = self.flush_timeout;
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(join_err)?
                .map_err(|e| ServiceError::io(format!("flush on disconnect failed: {e}")))
        })
    }
}

/// Поставить запись в очередь producer'а. При переполнении очереди ждём,
/// пока librdkafka отправит накопленное; общий предел задаёт publish timeout.
async fn enqueue(
    producer: &FutureProducer,
    mut record: FutureRecord<'_, str, str>,
) -> Result<DeliveryFuture, ServiceError> {
    loop {
        match producer.send_result(record) {
            Ok(delivery) => return Ok(delivery),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                record = returned;
                tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
            }
            Err((err, _)) => return Err(ServiceError::io(err.to_string())),
        }
    }
}

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

// ═══════════════════════════════════════════════════════════════
//  Consumer
// ═══════════════════════════════════════════════════════════════

struct KafkaConsumer {
    group_id: String,
    consumer: Arc<StreamConsumer>,
    connect_timeout: Duration,
    /// `true` после disconnect: `recv` возвращает `Ok(None)`.
    closed: watch::Sender<bool>,
}

fn to_record(msg: &rdkafka::message::BorrowedMessage<'_>) -> Record {
    let mut headers = HashMap::new();
    if let Some(hs) = msg.headers() {
        for header in hs.iter() {
            headers.insert(header.key.to_string(), header.value.unwrap_or_default().to_vec());
        }
    }
    Record {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset().max(0) as u64,
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

impl LogConsumer for KafkaConsumer {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let consumer = self.consumer.clone();
            let timeout = self.connect_timeout;
            tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout))
                .await
                .map_err(join_err)?
                .map_err(|e| {
                    ServiceError::connection(format!("group '{}': {e}", self.group_id))
                })?;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&names).map_err(connection_err)
        })
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Result<Option<Record>, ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Ok(None);
            }
            tokio::select! {
                _ = closed.wait_for(|c| *c) => Ok(None),
                result = self.consumer.recv() => match result {
                    Ok(msg) => Ok(Some(to_record(&msg))),
                    Err(err) => Err(classify_recv(err)),
                },
            }
        })
    }

    fn commit<'a>(
        &'a self,
        topic: &'a str,
        partition: i32,
        next_offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            let offset = kafka_offset(topic, partition, next_offset)?;
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
                .map_err(|e| ServiceError::fatal(e.to_string()))?;

            let consumer = self.consumer.clone();
            tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
                .await
                .map_err(join_err)?
                .map_err(|e| ServiceError::io(format!("commit {topic}[{partition}]: {e}")))
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.send_replace(true);
            self.consumer.unsubscribe();
            Ok(())
        })
    }
}
