use std::time::Duration;

use serde::Deserialize;

use crate::PipelineError;

// ═══════════════════════════════════════════════════════════════
//  Commit policy
// ═══════════════════════════════════════════════════════════════

/// Когда продвигать committed offset после обработки записи.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Ошибка handler'а → commit не делается, loop идёт дальше.
    /// In-memory cursor уже продвинут, поэтому запись будет перечитана
    /// только после рестарта с последнего committed offset
    /// (at-most-once-after-restart, best effort).
    #[default]
    FailStop,
    /// Обработка и commit изолированы: ошибка handler'а логируется,
    /// commit всё равно выполняется. Подходит для telemetry-потоков.
    #[serde(alias = "isolation")]
    CommitAfterIsolation,
}

impl CommitPolicy {
    pub fn commits_after_failure(self) -> bool {
        matches!(self, CommitPolicy::CommitAfterIsolation)
    }
}

impl std::fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitPolicy::FailStop => f.write_str("fail_stop"),
            CommitPolicy::CommitAfterIsolation => f.write_str("commit_after_isolation"),
        }
    }
}

impl std::str::FromStr for CommitPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_stop" => Ok(CommitPolicy::FailStop),
            "commit_after_isolation" | "isolation" => Ok(CommitPolicy::CommitAfterIsolation),
            other => Err(PipelineError::Configuration(format!(
                "unknown commit policy '{other}' (expected 'fail_stop' or 'commit_after_isolation')"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Runtime config
// ═══════════════════════════════════════════════════════════════

/// Параметры одного consumer loop.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub policy: CommitPolicy,
    /// Пауза между обработкой и commit. Прерывается shutdown'ом.
    pub commit_delay: Duration,
    /// Таймаут одного commit'а; истечение = CommitError.
    pub commit_timeout: Duration,
    /// Ёмкость очереди partition worker'а.
    pub partition_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: CommitPolicy::default(),
            commit_delay: Duration::ZERO,
            commit_timeout: Duration::from_secs(10),
            partition_buffer: default_partition_buffer(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Consumer Config (TOML [[consumers]])
// ═══════════════════════════════════════════════════════════════

/// Объявление consumer'а: группа, topic'и и политика commit'а.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub policy: CommitPolicy,
    #[serde(default)]
    pub commit_delay_ms: u64,
    #[serde(default = "default_partition_buffer")]
    pub partition_buffer: usize,
}

fn default_partition_buffer() -> usize {
    256
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            policy: CommitPolicy::default(),
            commit_delay_ms: 0,
            partition_buffer: default_partition_buffer(),
        }
    }

    pub fn pipeline_config(&self, commit_timeout: Duration) -> PipelineConfig {
        PipelineConfig {
            policy: self.policy,
            commit_delay: Duration::from_millis(self.commit_delay_ms),
            commit_timeout,
            partition_buffer: self.partition_buffer.max(1),
        }
    }
}
