use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use broker::{ConsumerRegistration, ConsumerState};
use ingest_api::{ServiceError, TopicPartition};

use crate::worker::{spawn_partition_worker, ConsumerSummary, PartitionWorker};
use crate::{PipelineConfig, PipelineError, RecordHandler};

/// Пауза после транзиентной ошибки recv.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

// ═══════════════════════════════════════════════════════════════
//  Consumer task: recv → partition worker → handler → commit
// ═══════════════════════════════════════════════════════════════

/// Запустить consumer loop для registration в отдельной задаче.
pub fn spawn_consumer(
    registration: Arc<ConsumerRegistration>,
    handler: Arc<dyn RecordHandler>,
    config: PipelineConfig,
    token: CancellationToken,
) -> JoinHandle<Result<ConsumerSummary, PipelineError>> {
    tokio::spawn(run_consumer(registration, handler, config, token))
}

/// Consumer loop: `Subscribed → Running → (Stopped | Failed)`.
///
/// Каждая запись уходит в worker своей (topic, partition); worker'ы
/// создаются лениво. После сигнала shutdown новые записи не читаются,
/// начатые дорабатываются. Фатальная ошибка recv переводит registration
/// в `Failed` и возвращается как `ConsumerLoop`; рестарта нет.
pub async fn run_consumer(
    registration: Arc<ConsumerRegistration>,
    handler: Arc<dyn RecordHandler>,
    config: PipelineConfig,
    token: CancellationToken,
) -> Result<ConsumerSummary, PipelineError> {
    let group_id = registration.group_id().to_string();
    if !registration.transition(ConsumerState::Running) {
        return Err(PipelineError::consumer_loop(
            &group_id,
            ServiceError::fatal(format!(
                "registration is {}, expected subscribed",
                registration.state()
            )),
        ));
    }

    tracing::info!(
        consumer = %group_id,
        topics = ?registration.topics(),
        policy = %config.policy,
        commit_delay_ms = config.commit_delay.as_millis() as u64,
        "consumer loop started"
    );

    let consumer = registration.consumer().clone();
    let mut workers: HashMap<TopicPartition, PartitionWorker> = HashMap::new();
    let mut failure: Option<ServiceError> = None;

    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(consumer = %group_id, "shutdown signal received");
                break;
            }
            received = consumer.recv() => received,
        };

        let record = match received {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!(consumer = %group_id, "record stream closed");
                break;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(consumer = %group_id, error = %e, "transient receive error, backing off");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(TRANSIENT_BACKOFF) => continue,
                }
            }
            Err(e) => {
                tracing::error!(consumer = %group_id, error = %e, "receive loop failed");
                failure = Some(e);
                break;
            }
        };

        let tp = record.topic_partition();
        let worker = workers.entry(tp.clone()).or_insert_with(|| {
            spawn_partition_worker(
                group_id.clone(),
                tp.clone(),
                consumer.clone(),
                handler.clone(),
                config.clone(),
                token.clone(),
            )
        });

        let sent = tokio::select! {
            _ = token.cancelled() => break,
            sent = worker.tx.send(record) => sent,
        };
        if sent.is_err() {
            tracing::error!(consumer = %group_id, partition = %tp, "partition worker is gone");
            workers.remove(&tp);
        }
    }

    // Закрываем очереди и ждём, пока worker'ы закончат текущие записи.
    let mut summary = ConsumerSummary::default();
    for (tp, worker) in workers.drain() {
        drop(worker.tx);
        match worker.handle.await {
            Ok(partial) => summary.merge(&partial),
            Err(e) => tracing::error!(consumer = %group_id, partition = %tp, error = %e, "partition worker panicked"),
        }
    }

    match failure {
        Some(source) => {
            registration.transition(ConsumerState::Failed);
            tracing::error!(consumer = %group_id, ?summary, "consumer loop failed");
            Err(PipelineError::consumer_loop(&group_id, source))
        }
        None => {
            registration.transition(ConsumerState::Stopped);
            tracing::info!(consumer = %group_id, ?summary, "consumer loop stopped");
            Ok(summary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use broker::{BrokerManager, BrokerSettings, MemoryLog, TransportKind};
    use ingest_api::{OutboundMessage, Payload, Record};

    use crate::CommitPolicy;

    /// Запоминает всё, что видел; опционально падает на каждой записи.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Record>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn seen(&self) -> Vec<Record> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl RecordHandler for Recorder {
        fn handle<'a>(
            &'a self,
            _topic: &'a str,
            _partition: i32,
            record: &'a Record,
        ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(record.clone());
                if self.fail {
                    Err(ServiceError::new("cannot handle record"))
                } else {
                    Ok(())
                }
            })
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn setup(log: &MemoryLog) -> BrokerManager {
        let settings = BrokerSettings::from_env_values(Some("localhost:9092"), Some("svc"), Some("secret"))
            .with_transport(TransportKind::Memory);
        let mgr = BrokerManager::with_client(settings, Arc::new(log.clone())).unwrap();
        mgr.connect_publisher().await.unwrap();
        mgr
    }

    fn demo() -> Vec<String> {
        vec!["demo".to_string()]
    }

    fn policy(policy: CommitPolicy) -> PipelineConfig {
        PipelineConfig { policy, ..PipelineConfig::default() }
    }

    #[tokio::test]
    async fn test_demo_scenario_commits_exactly_one() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::keyed("k1", r#"{"n":1}"#)])
            .await
            .unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let task = spawn_consumer(reg.clone(), handler.clone(), PipelineConfig::default(), token.clone());

        wait_until("commit", || log.committed_offset("g1", "demo", 0) == Some(1)).await;
        assert_eq!(reg.state(), ConsumerState::Running);

        token.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(reg.state(), ConsumerState::Stopped);

        let seen = handler.seen();
        assert_eq!(seen[0].key_str().as_deref(), Some("k1"));
        assert_eq!(seen[0].payload(), Payload::Json(serde_json::json!({"n": 1})));
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(1));
    }

    #[tokio::test]
    async fn test_fail_stop_leaves_offset_untouched() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::new("not json at all")]).await.unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let handler = Arc::new(Recorder::failing());
        let token = CancellationToken::new();
        let task = spawn_consumer(reg, handler.clone(), policy(CommitPolicy::FailStop), token.clone());

        wait_until("handler call", || handler.count() == 1).await;
        token.cancel();
        let summary = task.await.unwrap().unwrap();

        assert_eq!(summary.processing_failures, 1);
        assert_eq!(summary.uncommitted, 1);
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
    }

    #[tokio::test]
    async fn test_isolation_still_advances_offset() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::new("a"), OutboundMessage::new("b")])
            .await
            .unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let token = CancellationToken::new();
        let task = spawn_consumer(
            reg,
            Arc::new(Recorder::failing()),
            policy(CommitPolicy::CommitAfterIsolation),
            token.clone(),
        );

        wait_until("commit", || log.committed_offset("g1", "demo", 0) == Some(2)).await;
        token.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processing_failures, 2);
        assert_eq!(summary.committed, 2);
    }

    #[tokio::test]
    async fn test_commit_failure_does_not_stop_loop() {
        let log = MemoryLog::new();
        log.fail_commits(true);
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::new("first"), OutboundMessage::new("second")])
            .await
            .unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let task = spawn_consumer(
            reg.clone(),
            handler.clone(),
            policy(CommitPolicy::CommitAfterIsolation),
            token.clone(),
        );

        wait_until("both records", || handler.count() == 2).await;
        assert_eq!(reg.state(), ConsumerState::Running);

        token.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processing_failures, 0);
        assert_eq!(summary.commit_failures, 2);
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
        assert_eq!(reg.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_severed_transport_fails_registration() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let task = spawn_consumer(
            reg.clone(),
            Arc::new(Recorder::default()),
            PipelineConfig::default(),
            CancellationToken::new(),
        );

        log.sever();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::ConsumerLoop { ref group_id, .. } if group_id == "g1"));
        assert_eq!(reg.state(), ConsumerState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_mid_delay_abandons_commit() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::new("slow")]).await.unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let cfg = PipelineConfig {
            commit_delay: Duration::from_secs(60),
            ..PipelineConfig::default()
        };
        let task = spawn_consumer(reg, handler.clone(), cfg, token.clone());

        wait_until("handler call", || handler.count() == 1).await;
        token.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("shutdown must preempt the commit delay")
            .unwrap()
            .unwrap();

        assert_eq!(summary.abandoned, 1);
        mgr.shutdown_all().await;
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
    }

    #[tokio::test]
    async fn test_offsets_non_decreasing_per_partition() {
        let log = MemoryLog::with_partitions(3);
        let mgr = setup(&log).await;
        let batch: Vec<_> = (0..30)
            .map(|i| OutboundMessage::keyed(format!("key-{}", i % 5), i.to_string()))
            .collect();
        mgr.publish("demo", &batch).await.unwrap();

        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let task = spawn_consumer(reg, handler.clone(), PipelineConfig::default(), token.clone());

        wait_until("all records", || handler.count() == 30).await;
        token.cancel();
        task.await.unwrap().unwrap();

        let seen = handler.seen();
        for partition in 0..3 {
            let offsets: Vec<u64> = seen
                .iter()
                .filter(|r| r.partition == partition)
                .map(|r| r.offset)
                .collect();
            assert!(offsets.windows(2).all(|w| w[0] < w[1]), "partition {partition}: {offsets:?}");
            let expected = log.records("demo", partition).len() as u64;
            let committed = log.committed_offset("g1", "demo", partition);
            assert_eq!(committed.unwrap_or(0), expected);
        }
    }

    #[tokio::test]
    async fn test_same_group_loops_share_partitions() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        mgr.publish("demo", &[OutboundMessage::new("once")]).await.unwrap();

        let handler = Arc::new(Recorder::default());
        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
            tasks.push(spawn_consumer(reg, handler.clone(), PipelineConfig::default(), token.clone()));
        }

        wait_until("commit", || log.committed_offset("g1", "demo", 0) == Some(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_stops_loop() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let task = spawn_consumer(
            reg.clone(),
            Arc::new(Recorder::default()),
            PipelineConfig::default(),
            CancellationToken::new(),
        );

        mgr.shutdown_all().await;
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(reg.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_registration_runs_only_once() {
        let log = MemoryLog::new();
        let mgr = setup(&log).await;
        let reg = mgr.register_consumer("g1", &demo()).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        run_consumer(reg.clone(), Arc::new(Recorder::default()), PipelineConfig::default(), token.clone())
            .await
            .unwrap();
        let again = run_consumer(reg, Arc::new(Recorder::default()), PipelineConfig::default(), token).await;
        assert!(matches!(again, Err(PipelineError::ConsumerLoop { .. })));
    }
}
