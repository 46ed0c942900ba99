use ingest_api::{Record, ServiceError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Configuration(String),

    /// Handler не смог обработать запись.
    #[error("processing {topic}[{partition}]@{offset}: {source}")]
    Processing {
        topic: String,
        partition: i32,
        offset: u64,
        source: ServiceError,
    },

    /// Запись обработана, но прогресс не зафиксирован.
    #[error("commit {topic}[{partition}] -> {next_offset}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        next_offset: u64,
        source: ServiceError,
    },

    /// Сам receive loop упал; registration переходит в Failed.
    #[error("consumer loop ({group_id}): {source}")]
    ConsumerLoop { group_id: String, source: ServiceError },
}

impl PipelineError {
    pub(crate) fn processing(record: &Record, source: ServiceError) -> Self {
        PipelineError::Processing {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            source,
        }
    }

    pub(crate) fn commit(record: &Record, source: ServiceError) -> Self {
        PipelineError::Commit {
            topic: record.topic.clone(),
            partition: record.partition,
            next_offset: record.next_offset(),
            source,
        }
    }

    pub(crate) fn consumer_loop(group_id: &str, source: ServiceError) -> Self {
        PipelineError::ConsumerLoop { group_id: group_id.to_string(), source }
    }
}
