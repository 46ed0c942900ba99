use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use broker::{BrokerSettings, BrokerTimeouts, TransportKind};
use pipeline::{CommitPolicy, ConsumerConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "ingest-server", about = "Приём и публикация сообщений распределённого лога")]
pub struct Cli {
    #[command(flatten)]
    pub logging: LogArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить consumers и держать соединения до сигнала остановки
    Serve(ServeArgs),
    /// Отправить одно сообщение и выйти
    Publish(PublishArgs),
}

#[derive(Args, Clone, Debug)]
pub struct LogArgs {
    /// Уровень логирования, если RUST_LOG не задан
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
    /// Дублировать логи в файл (без ANSI)
    #[arg(long, env = "LOG_FILE_PATH", global = true)]
    pub log_file: Option<PathBuf>,
    #[arg(long, env = "SERVICE_NAME", default_value = "ingest-server", global = true)]
    pub service_name: String,
}

#[derive(Args, Clone, Debug)]
pub struct BrokerArgs {
    /// host:port через запятую
    #[arg(long, env = "BROKER_ADDRESSES")]
    pub broker_addresses: Option<String>,
    #[arg(long, env = "BROKER_USERNAME")]
    pub broker_username: Option<String>,
    #[arg(long, env = "BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,
    #[arg(long, env = "BROKER_TLS")]
    pub broker_tls: bool,
    /// kafka | memory
    #[arg(long, env = "BROKER_TRANSPORT", default_value = "kafka")]
    pub broker_transport: String,
}

#[derive(Args, Clone, Debug)]
pub struct CacheArgs {
    #[arg(long, env = "CACHE_CONNECTION_URI", hide_env_values = true)]
    pub cache_connection_uri: Option<String>,
    /// Открываются базы 0..=N
    #[arg(long, env = "CACHE_DATABASE_COUNT", default_value_t = 6)]
    pub cache_database_count: u8,
}

#[derive(Args, Clone, Debug)]
pub struct ConsumerArgs {
    #[arg(long, env = "CONSUMER_GROUP_ID")]
    pub consumer_group_id: Option<String>,
    /// Topic'и через запятую
    #[arg(long, env = "CONSUMER_TOPICS")]
    pub consumer_topics: Option<String>,
    /// fail_stop | commit_after_isolation
    #[arg(long, env = "COMMIT_POLICY")]
    pub commit_policy: Option<String>,
    #[arg(long, env = "COMMIT_DELAY_MS", default_value_t = 0)]
    pub commit_delay_ms: u64,
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу (необязательный)
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,
    #[command(flatten)]
    pub broker: BrokerArgs,
    #[command(flatten)]
    pub cache: CacheArgs,
    #[command(flatten)]
    pub consumer: ConsumerArgs,
}

#[derive(Args, Clone, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,
    #[arg(long)]
    pub topic: String,
    #[arg(long)]
    pub key: Option<String>,
    #[arg(long)]
    pub value: String,
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_publish_timeout_ms() -> u64 {
    30_000
}
fn default_commit_timeout_ms() -> u64 {
    10_000
}

impl BrokerSection {
    pub fn timeouts(&self) -> BrokerTimeouts {
        BrokerTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            publish: Duration::from_millis(self.publish_timeout_ms),
            commit: Duration::from_millis(self.commit_timeout_ms),
            ..BrokerTimeouts::default()
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::config("read", format!("'{}': {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| ServerError::config("parse", format!("'{}': {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Файл, если указан; иначе значения по умолчанию.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ServerError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

// ---- Resolution ----

impl BrokerArgs {
    pub fn settings(&self, timeouts: BrokerTimeouts) -> Result<BrokerSettings, ServerError> {
        let transport: TransportKind = self.broker_transport.parse()?;
        Ok(BrokerSettings::from_env_values(
            self.broker_addresses.as_deref(),
            self.broker_username.as_deref(),
            self.broker_password.as_deref(),
        )
        .with_tls(self.broker_tls)
        .with_transport(transport)
        .with_timeouts(timeouts))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConsumerArgs {
    /// Consumer из env/CLI (`CONSUMER_GROUP_ID` + `CONSUMER_TOPICS`), если задан.
    pub fn consumer(&self) -> Result<Option<ConsumerConfig>, ServerError> {
        let group = self.consumer_group_id.as_deref().map(str::trim).filter(|g| !g.is_empty());
        let topics = self.consumer_topics.as_deref().map(split_list).unwrap_or_default();

        match (group, topics.is_empty()) {
            (None, true) => Ok(None),
            (Some(group), false) => {
                let policy: CommitPolicy = match &self.commit_policy {
                    Some(p) => p.parse()?,
                    None => CommitPolicy::default(),
                };
                let mut consumer = ConsumerConfig::new(group, topics);
                consumer.policy = policy;
                consumer.commit_delay_ms = self.commit_delay_ms;
                Ok(Some(consumer))
            }
            (None, false) => Err(ServerError::config(
                "consumer",
                "CONSUMER_TOPICS is set but CONSUMER_GROUP_ID is not",
            )),
            (Some(group), true) => Err(ServerError::config(
                "consumer",
                format!("consumer group '{group}' has no CONSUMER_TOPICS"),
            )),
        }
    }
}

/// Consumers из файла + consumer из env в конце списка.
pub fn resolve_consumers(
    file: &ServerConfig,
    args: &ConsumerArgs,
) -> Result<Vec<ConsumerConfig>, ServerError> {
    let mut consumers = file.consumers.clone();
    if let Some(env_consumer) = args.consumer()? {
        consumers.push(env_consumer);
    }
    Ok(consumers)
}
