use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;

use ingest_api::{
    LogClient, LogConsumer, LogProducer, OutboundMessage, Record, ServiceError, TopicPartition,
};

// ═══════════════════════════════════════════════════════════════
//  Lock helpers: recover from poisoning instead of panicking
// ═══════════════════════════════════════════════════════════════

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("memory log read lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("memory log write lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════
//  Shared state
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Faults {
    refuse_connections: AtomicBool,
    stall_connects: AtomicBool,
    stall_sends: AtomicBool,
    fail_commits: AtomicBool,
    /// Группы, чей disconnect завершается ошибкой.
    failing_disconnects: Mutex<HashSet<String>>,
    severed: AtomicBool,
}

impl Faults {
    async fn connect(&self) -> Result<(), ServiceError> {
        if self.stall_connects.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        if self.refuse_connections.load(Ordering::Acquire) {
            return Err(ServiceError::connection("memory log refused connection"));
        }
        Ok(())
    }
}

/// (group, topic-partition) → member, читающий эту партицию.
type Assignments = HashMap<(String, TopicPartition), u64>;

struct LogState {
    partitions: usize,
    /// topic → partitions → records (offset == index).
    topics: RwLock<HashMap<String, Vec<Vec<Record>>>>,
    /// group → (topic, partition) → next offset.
    committed: RwLock<HashMap<String, BTreeMap<TopicPartition, u64>>>,
    /// Внутри группы партицию читает один consumer: первый, кто её запросил.
    /// Освобождается при disconnect.
    assignments: Mutex<Assignments>,
    next_member: AtomicU64,
    /// Будит ожидающие `recv` при append / disconnect / sever.
    notify: Notify,
    faults: Faults,
}

impl LogState {
    fn partition_for(&self, key: Option<&str>) -> usize {
        match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % self.partitions as u64) as usize
            }
            None => 0,
        }
    }

    fn append(&self, topic: &str, messages: &[OutboundMessage]) {
        {
            let mut topics = write(&self.topics);
            let parts = topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.partitions]);
            for msg in messages {
                let partition = self.partition_for(msg.key.as_deref());
                let log = &mut parts[partition];
                log.push(Record {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: log.len() as u64,
                    key: msg.key.as_ref().map(|k| k.as_bytes().to_vec()),
                    value: msg.value.as_bytes().to_vec(),
                    headers: HashMap::new(),
                });
            }
        }
        self.notify.notify_waiters();
    }

    fn committed(&self, group: &str, tp: &TopicPartition) -> Option<u64> {
        read(&self.committed).get(group).and_then(|m| m.get(tp).copied())
    }

    /// Committed offset только растёт: commit назад игнорируется.
    fn commit(&self, group: &str, tp: TopicPartition, next_offset: u64) {
        let mut committed = write(&self.committed);
        let current = committed
            .entry(group.to_string())
            .or_default()
            .entry(tp)
            .or_insert(next_offset);
        if next_offset < *current {
            tracing::debug!(%group, current = *current, next_offset, "ignoring commit behind committed offset");
        } else {
            *current = next_offset;
        }
    }

    fn release(&self, member: u64) {
        lock(&self.assignments).retain(|_, owner| *owner != member);
        self.notify.notify_waiters();
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryLog
// ═══════════════════════════════════════════════════════════════

/// In-process партиционированный лог с consumer group offset'ами.
///
/// Каждому consumer'у группы назначаются все партиции подписанных
/// topic'ов. Чтение начинается с committed offset группы (или с 0).
/// Клон делит то же состояние.
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<LogState>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            state: Arc::new(LogState {
                partitions: partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: RwLock::new(HashMap::new()),
                assignments: Mutex::new(HashMap::new()),
                next_member: AtomicU64::new(1),
                notify: Notify::new(),
                faults: Faults::default(),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.state.partitions
    }

    /// Партиция, в которую попадёт сообщение с таким key.
    pub fn partition_for(&self, key: Option<&str>) -> i32 {
        self.state.partition_for(key) as i32
    }

    /// Committed offset группы для (topic, partition).
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<u64> {
        self.state.committed(group, &TopicPartition::new(topic, partition))
    }

    /// Все записи партиции.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        read(&self.state.topics)
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Append напрямую, минуя producer.
    pub fn append(&self, topic: &str, messages: &[OutboundMessage]) {
        self.state.append(topic, messages);
    }

    /// Отказывать в connect (producer и consumer).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.faults.refuse_connections.store(refuse, Ordering::Release);
    }

    /// Connect (producer и consumer) зависает, пока knob не снят.
    pub fn stall_connects(&self, stall: bool) {
        self.state.faults.stall_connects.store(stall, Ordering::Release);
    }

    /// `send_batch` зависает, пока knob не снят.
    pub fn stall_sends(&self, stall: bool) {
        self.state.faults.stall_sends.store(stall, Ordering::Release);
    }

    /// Disconnect consumer'ов группы `group` закрывает поток, но возвращает ошибку.
    pub fn fail_disconnects(&self, group: &str) {
        lock(&self.state.faults.failing_disconnects).insert(group.to_string());
    }

    /// Member группы, которому назначена партиция.
    pub fn partition_owner(&self, group: &str, topic: &str, partition: i32) -> Option<u64> {
        lock(&self.state.assignments)
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// Отклонять commit'ы с транзиентной ошибкой.
    pub fn fail_commits(&self, fail: bool) {
        self.state.faults.fail_commits.store(fail, Ordering::Release);
    }

    /// Оборвать транспорт: все `recv` и `send_batch` завершаются fatal ошибкой.
    pub fn sever(&self) {
        self.state.faults.severed.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    fn is_severed(&self) -> bool {
        self.state.faults.severed.load(Ordering::Acquire)
    }
}

impl LogClient for MemoryLog {
    fn producer(&self) -> Result<Box<dyn LogProducer>, ServiceError> {
        Ok(Box::new(MemoryProducer {
            log: self.clone(),
            connected: AtomicBool::new(false),
        }))
    }

    fn consumer(&self, group_id: &str) -> Result<Box<dyn LogConsumer>, ServiceError> {
        Ok(Box::new(MemoryConsumer {
            log: self.clone(),
            group: group_id.to_string(),
            member: self.state.next_member.fetch_add(1, Ordering::Relaxed),
            topics: RwLock::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        format!("memory (partitions={})", self.state.partitions)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Producer
// ═══════════════════════════════════════════════════════════════

struct MemoryProducer {
    log: MemoryLog,
    connected: AtomicBool,
}

impl LogProducer for MemoryProducer {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.log.state.faults.connect().await?;
            self.connected.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn send_batch<'a>(
        &'a self,
        topic: &'a str,
        messages: &'a [OutboundMessage],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(ServiceError::connection("producer is not connected"));
            }
            if self.log.state.faults.stall_sends.load(Ordering::Acquire) {
                std::future::pending::<()>().await;
            }
            if self.log.is_severed() {
                return Err(ServiceError::fatal("memory log transport severed"));
            }
            self.log.state.append(topic, messages);
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Release);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Consumer
// ═══════════════════════════════════════════════════════════════

struct MemoryConsumer {
    log: MemoryLog,
    group: String,
    member: u64,
    topics: RwLock<Vec<String>>,
    /// In-memory read cursor. Продвигается при доставке, независимо от commit.
    cursors: Mutex<HashMap<TopicPartition, u64>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn next_record(&self) -> Option<Record> {
        let topics = read(&self.topics).clone();
        let log = read(&self.log.state.topics);
        let mut assignments = lock(&self.log.state.assignments);
        let mut cursors = lock(&self.cursors);

        for topic in &topics {
            let Some(parts) = log.get(topic) else { continue };
            for (partition, records) in parts.iter().enumerate() {
                let tp = TopicPartition::new(topic.clone(), partition as i32);
                let owner = *assignments
                    .entry((self.group.clone(), tp.clone()))
                    .or_insert(self.member);
                if owner != self.member {
                    continue;
                }
                let cursor = *cursors.entry(tp.clone()).or_insert_with(|| {
                    self.log.state.committed(&self.group, &tp).unwrap_or(0)
                });
                if let Some(record) = records.get(cursor as usize) {
                    cursors.insert(tp, cursor + 1);
                    return Some(record.clone());
                }
            }
        }
        None
    }
}

impl LogConsumer for MemoryConsumer {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.log
                .state
                .faults
                .connect()
                .await
                .map_err(|e| e.with_context(format!("group '{}'", self.group)))?;
            self.connected.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::Acquire) {
                return Err(ServiceError::connection("consumer is not connected"));
            }
            *write(&self.topics) = topics.to_vec();
            Ok(())
        })
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Result<Option<Record>, ServiceError>> + Send + '_>> {
        Box::pin(async move {
            loop {
                // Регистрируемся до проверки, чтобы не потерять notify.
                let notified = self.log.state.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.closed.load(Ordering::Acquire) {
                    return Ok(None);
                }
                if self.log.is_severed() {
                    return Err(ServiceError::fatal("memory log transport severed"));
                }
                if let Some(record) = self.next_record() {
                    return Ok(Some(record));
                }
                notified.await;
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
            if self.closed.load(Ordering::Acquire) {
                return Err(ServiceError::fatal("consumer is disconnected"));
            }
            if self.log.state.faults.fail_commits.load(Ordering::Acquire) {
                return Err(ServiceError::io(format!(
                    "commit rejected for {topic}[{partition}]"
                )));
            }
            self.log
                .state
                .commit(&self.group, TopicPartition::new(topic, partition), next_offset);
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.connected.store(false, Ordering::Release);
            self.log.state.release(self.member);
            if lock(&self.log.state.faults.failing_disconnects).contains(&self.group) {
                return Err(ServiceError::io(format!(
                    "disconnect failed for group '{}'",
                    self.group
                )));
            }
            Ok(())
        })
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.log.state.release(self.member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn connected_consumer(log: &MemoryLog, group: &str, topic: &str) -> Box<dyn LogConsumer> {
        let consumer = log.consumer(group).unwrap();
        consumer.connect().await.unwrap();
        consumer.subscribe(&[topic.to_string()]).await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_offset_order() {
        let log = MemoryLog::new();
        let producer = log.producer().unwrap();
        producer.connect().await.unwrap();
        producer
            .send_batch("demo", &[OutboundMessage::new("a"), OutboundMessage::new("b")])
            .await
            .unwrap();

        let consumer = connected_consumer(&log, "g1", "demo").await;
        let first = consumer.recv().await.unwrap().unwrap();
        let second = consumer.recv().await.unwrap().unwrap();
        assert_eq!((first.offset, first.value.as_slice()), (0, b"a".as_slice()));
        assert_eq!((second.offset, second.value.as_slice()), (1, b"b".as_slice()));
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let log = MemoryLog::new();
        let producer = log.producer().unwrap();
        let err = producer.send_batch("demo", &[OutboundMessage::new("x")]).await.unwrap_err();
        assert_eq!(err.kind(), ingest_api::ErrorKind::Connection);
        assert!(log.records("demo", 0).is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_append() {
        let log = MemoryLog::new();
        let consumer = connected_consumer(&log, "g1", "demo").await;

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("demo", &[OutboundMessage::new("late")]);
        });

        let record = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
            .await
            .expect("recv should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(record.value, b"late");
    }

    #[tokio::test]
    async fn test_new_consumer_resumes_from_committed_offset() {
        let log = MemoryLog::new();
        log.append("demo", &[OutboundMessage::new("0"), OutboundMessage::new("1"), OutboundMessage::new("2")]);

        let consumer = connected_consumer(&log, "g1", "demo").await;
        let record = consumer.recv().await.unwrap().unwrap();
        consumer.commit(&record.topic, record.partition, record.next_offset()).await.unwrap();
        consumer.disconnect().await.unwrap();

        let restarted = connected_consumer(&log, "g1", "demo").await;
        let record = restarted.recv().await.unwrap().unwrap();
        assert_eq!(record.offset, 1);
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_closes_stream() {
        let log = MemoryLog::new();
        let consumer = connected_consumer(&log, "g1", "demo").await;
        consumer.disconnect().await.unwrap();
        assert_eq!(consumer.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sever_fails_recv_fatally() {
        let log = MemoryLog::new();
        let consumer = connected_consumer(&log, "g1", "demo").await;
        log.sever();
        let err = consumer.recv().await.unwrap_err();
        assert_eq!(err.kind(), ingest_api::ErrorKind::Fatal);
    }

    #[tokio::test]
    async fn test_partition_goes_to_one_member_of_group() {
        let log = MemoryLog::new();
        log.append("demo", &[OutboundMessage::new("only")]);

        let first = connected_consumer(&log, "g1", "demo").await;
        let second = connected_consumer(&log, "g1", "demo").await;

        let record = first.recv().await.unwrap().unwrap();
        assert_eq!(record.value, b"only");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), second.recv()).await.is_err(),
            "second member of the group must not see the partition"
        );

        // Другая группа читает те же записи независимо.
        let other = connected_consumer(&log, "g2", "demo").await;
        assert_eq!(other.recv().await.unwrap().unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_partition_reassigned_after_disconnect() {
        let log = MemoryLog::new();
        log.append("demo", &[OutboundMessage::new("0"), OutboundMessage::new("1")]);

        let first = connected_consumer(&log, "g1", "demo").await;
        let second = connected_consumer(&log, "g1", "demo").await;
        let record = first.recv().await.unwrap().unwrap();
        first.commit(&record.topic, record.partition, record.next_offset()).await.unwrap();

        let waiting = tokio::spawn(async move { second.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.disconnect().await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("released partition must be picked up")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.offset, 1);
    }

    #[tokio::test]
    async fn test_committed_offset_never_moves_back() {
        let log = MemoryLog::new();
        let consumer = connected_consumer(&log, "g1", "demo").await;
        consumer.commit("demo", 0, 5).await.unwrap();
        consumer.commit("demo", 0, 3).await.unwrap();
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(5));

        consumer.commit("demo", 0, 6).await.unwrap();
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(6));
    }

    #[tokio::test]
    async fn test_failing_disconnect_still_closes_stream() {
        let log = MemoryLog::new();
        log.fail_disconnects("g1");
        let consumer = connected_consumer(&log, "g1", "demo").await;
        let err = consumer.disconnect().await.unwrap_err();
        assert_eq!(err.kind(), ingest_api::ErrorKind::Io);
        assert_eq!(consumer.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keyed_messages_stay_on_one_partition() {
        let log = MemoryLog::with_partitions(4);
        let msgs: Vec<_> = (0..5).map(|i| OutboundMessage::keyed("user-7", i.to_string())).collect();
        log.append("events", &msgs);

        let partition = log.partition_for(Some("user-7"));
        let offsets: Vec<u64> = log.records("events", partition).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }
}
