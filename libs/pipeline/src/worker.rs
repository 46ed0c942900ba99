use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ingest_api::{LogConsumer, Record, ServiceError, TopicPartition};

use crate::{PipelineConfig, PipelineError, RecordHandler};

// ═══════════════════════════════════════════════════════════════
//  Record outcome
// ═══════════════════════════════════════════════════════════════

/// Что стало с offset'ом записи после обработки.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Commit выполнен; значение = новый committed offset (`offset + 1`).
    Committed(u64),
    /// Handler упал, политика fail-stop: commit не делался.
    Uncommitted,
    /// Commit не удался (или истёк таймаут).
    CommitFailed(PipelineError),
    /// Shutdown пришёл во время commit delay; commit не начинался.
    Abandoned,
}

/// Итог обработки одной записи.
#[derive(Debug)]
pub struct RecordReport {
    pub offset: u64,
    pub processing: Result<(), PipelineError>,
    pub outcome: RecordOutcome,
}

/// Счётчики consumer loop'а (суммируются по всем партициям).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub processed: u64,
    pub processing_failures: u64,
    pub committed: u64,
    pub uncommitted: u64,
    pub commit_failures: u64,
    pub abandoned: u64,
    /// Записи с offset меньше уже обработанного; handler не вызывался.
    pub skipped: u64,
}

impl ConsumerSummary {
    fn absorb(&mut self, report: &RecordReport) {
        self.processed += 1;
        if report.processing.is_err() {
            self.processing_failures += 1;
        }
        match report.outcome {
            RecordOutcome::Committed(_) => self.committed += 1,
            RecordOutcome::Uncommitted => self.uncommitted += 1,
            RecordOutcome::CommitFailed(_) => self.commit_failures += 1,
            RecordOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: &ConsumerSummary) {
        self.processed += other.processed;
        self.processing_failures += other.processing_failures;
        self.committed += other.committed;
        self.uncommitted += other.uncommitted;
        self.commit_failures += other.commit_failures;
        self.abandoned += other.abandoned;
        self.skipped += other.skipped;
    }
}

// ═══════════════════════════════════════════════════════════════
//  process → (delay) → commit
// ═══════════════════════════════════════════════════════════════

/// Обработать одну запись: handler → (commit delay) → commit по политике.
pub async fn process_record(
    group_id: &str,
    consumer: &dyn LogConsumer,
    handler: &dyn RecordHandler,
    config: &PipelineConfig,
    record: &Record,
    token: &CancellationToken,
) -> RecordReport {
    let processing = handler
        .handle(&record.topic, record.partition, record)
        .await
        .map_err(|e| PipelineError::processing(record, e));

    if let Err(e) = &processing {
        tracing::error!(
            consumer = %group_id,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            key = ?record.key_str(),
            policy = %config.policy,
            error = %e,
            "record processing failed"
        );
        if !config.policy.commits_after_failure() {
            return RecordReport {
                offset: record.offset,
                processing,
                outcome: RecordOutcome::Uncommitted,
            };
        }
    }

    if !config.commit_delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => {
                tracing::info!(
                    consumer = %group_id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "shutdown during commit delay, commit abandoned"
                );
                return RecordReport {
                    offset: record.offset,
                    processing,
                    outcome: RecordOutcome::Abandoned,
                };
            }
            _ = tokio::time::sleep(config.commit_delay) => {}
        }
    }

    let next_offset = record.next_offset();
    let committed = match tokio::time::timeout(
        config.commit_timeout,
        consumer.commit(&record.topic, record.partition, next_offset),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ServiceError::io(format!(
            "commit timed out after {:?}",
            config.commit_timeout
        ))),
    };

    let outcome = match committed {
        Ok(()) => {
            tracing::debug!(
                consumer = %group_id,
                topic = %record.topic,
                partition = record.partition,
                next_offset,
                "offset committed"
            );
            RecordOutcome::Committed(next_offset)
        }
        Err(source) => {
            let err = PipelineError::commit(record, source);
            tracing::error!(
                consumer = %group_id,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                key = ?record.key_str(),
                error = %err,
                "offset commit failed"
            );
            RecordOutcome::CommitFailed(err)
        }
    };

    RecordReport { offset: record.offset, processing, outcome }
}

// ═══════════════════════════════════════════════════════════════
//  Partition worker
// ═══════════════════════════════════════════════════════════════

/// Очередь и task одной (topic, partition). Записи обрабатываются строго
/// по одной, в порядке поступления.
pub(crate) struct PartitionWorker {
    pub(crate) tx: mpsc::Sender<Record>,
    pub(crate) handle: JoinHandle<ConsumerSummary>,
}

pub(crate) fn spawn_partition_worker(
    group_id: String,
    tp: TopicPartition,
    consumer: Arc<dyn LogConsumer>,
    handler: Arc<dyn RecordHandler>,
    config: PipelineConfig,
    token: CancellationToken,
) -> PartitionWorker {
    let (tx, mut rx) = mpsc::channel::<Record>(config.partition_buffer.max(1));

    let handle = tokio::spawn(async move {
        tracing::debug!(consumer = %group_id, partition = %tp, "partition worker started");
        let mut summary = ConsumerSummary::default();
        let mut last_offset: Option<u64> = None;

        loop {
            // Shutdown проверяется только между записями: начатая запись
            // доходит до конца (или до прерванного commit delay).
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            if last_offset.is_some_and(|last| record.offset < last) {
                // At-most-once: commit'ы этой партиции уже ушли дальше этой записи.
                tracing::error!(
                    consumer = %group_id,
                    partition = %tp,
                    offset = record.offset,
                    last_offset = ?last_offset,
                    key = ?record.key_str(),
                    "offset went backwards, record skipped without processing"
                );
                summary.skipped += 1;
                continue;
            }
            last_offset = Some(record.offset);

            let report =
                process_record(&group_id, &*consumer, &*handler, &config, &record, &token).await;
            summary.absorb(&report);
        }

        tracing::debug!(consumer = %group_id, partition = %tp, processed = summary.processed, "partition worker stopped");
        summary
    });

    PartitionWorker { tx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    use broker::MemoryLog;
    use ingest_api::LogClient;

    use crate::CommitPolicy;

    struct Flaky {
        fail: bool,
    }

    impl RecordHandler for Flaky {
        fn handle<'a>(
            &'a self,
            _topic: &'a str,
            _partition: i32,
            _record: &'a Record,
        ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    Err(ServiceError::new("handler exploded"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn record(offset: u64) -> Record {
        Record {
            topic: "demo".into(),
            partition: 0,
            offset,
            key: Some(b"k1".to_vec()),
            value: br#"{"n":1}"#.to_vec(),
            headers: HashMap::new(),
        }
    }

    async fn consumer(log: &MemoryLog) -> Box<dyn LogConsumer> {
        let consumer = log.consumer("g1").unwrap();
        consumer.connect().await.unwrap();
        consumer
    }

    fn config(policy: CommitPolicy) -> PipelineConfig {
        PipelineConfig { policy, ..PipelineConfig::default() }
    }

    #[tokio::test]
    async fn test_success_commits_next_offset() {
        let log = MemoryLog::new();
        let consumer = consumer(&log).await;
        let token = CancellationToken::new();

        let report = process_record(
            "g1",
            &*consumer,
            &Flaky { fail: false },
            &config(CommitPolicy::FailStop),
            &record(4),
            &token,
        )
        .await;

        assert!(report.processing.is_ok());
        assert!(matches!(report.outcome, RecordOutcome::Committed(5)));
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(5));
    }

    #[tokio::test]
    async fn test_fail_stop_does_not_commit() {
        let log = MemoryLog::new();
        let consumer = consumer(&log).await;

        let report = process_record(
            "g1",
            &*consumer,
            &Flaky { fail: true },
            &config(CommitPolicy::FailStop),
            &record(0),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(report.processing, Err(PipelineError::Processing { .. })));
        assert!(matches!(report.outcome, RecordOutcome::Uncommitted));
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
    }

    #[tokio::test]
    async fn test_isolation_commits_despite_failure() {
        let log = MemoryLog::new();
        let consumer = consumer(&log).await;

        let report = process_record(
            "g1",
            &*consumer,
            &Flaky { fail: true },
            &config(CommitPolicy::CommitAfterIsolation),
            &record(0),
            &CancellationToken::new(),
        )
        .await;

        assert!(report.processing.is_err());
        assert!(matches!(report.outcome, RecordOutcome::Committed(1)));
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(1));
    }

    #[tokio::test]
    async fn test_commit_failure_is_distinct_from_processing() {
        let log = MemoryLog::new();
        log.fail_commits(true);
        let consumer = consumer(&log).await;

        let report = process_record(
            "g1",
            &*consumer,
            &Flaky { fail: false },
            &config(CommitPolicy::CommitAfterIsolation),
            &record(0),
            &CancellationToken::new(),
        )
        .await;

        assert!(report.processing.is_ok());
        assert!(matches!(
            report.outcome,
            RecordOutcome::CommitFailed(PipelineError::Commit { next_offset: 1, .. })
        ));
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
    }

    #[tokio::test]
    async fn test_worker_skips_offsets_behind_last_processed() {
        let log = MemoryLog::new();
        let consumer: Arc<dyn LogConsumer> = Arc::from(consumer(&log).await);
        let worker = spawn_partition_worker(
            "g1".into(),
            TopicPartition::new("demo", 0),
            consumer,
            Arc::new(Flaky { fail: false }),
            config(CommitPolicy::FailStop),
            CancellationToken::new(),
        );

        for offset in [5, 3, 6] {
            worker.tx.send(record(offset)).await.unwrap();
        }
        drop(worker.tx);
        let summary = worker.handle.await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(log.committed_offset("g1", "demo", 0), Some(7));
    }

    #[tokio::test]
    async fn test_cancel_during_delay_abandons_commit() {
        let log = MemoryLog::new();
        let consumer = consumer(&log).await;
        let token = CancellationToken::new();
        let cfg = PipelineConfig {
            commit_delay: Duration::from_secs(60),
            ..PipelineConfig::default()
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            process_record("g1", &*consumer, &Flaky { fail: false }, &cfg, &record(0), &token),
        )
        .await
        .expect("delay must be preempted by shutdown");

        assert!(matches!(report.outcome, RecordOutcome::Abandoned));
        assert_eq!(log.committed_offset("g1", "demo", 0), None);
    }
}
