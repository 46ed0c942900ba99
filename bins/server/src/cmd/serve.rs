use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use broker::BrokerManager;
use cache_pool::{connector_for, CacheError, CachePool};
use ingest_api::ShutdownReport;
use pipeline::{spawn_consumer, ConsumerSummary, LogHandler, PipelineError};

use crate::config::{resolve_consumers, ServeArgs, ServerConfig};
use crate::error::ServerError;

type ConsumerTask = (String, JoinHandle<Result<ConsumerSummary, PipelineError>>);

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    run_until(args, shutdown_signal()).await
}

/// Старт → ожидание `shutdown` → остановка consumers → закрытие соединений.
pub async fn run_until(
    args: ServeArgs,
    shutdown: impl Future<Output = Result<(), ServerError>>,
) -> Result<(), ServerError> {
    tracing::info!("ingest-server starting");

    // --- Config: все ошибки конфигурации до первого соединения ---
    let file = ServerConfig::load_optional(args.config.as_deref())?;
    if let Some(path) = &args.config {
        tracing::info!(config = %path.display(), "loaded config");
    }
    let settings = args.broker.settings(file.broker.timeouts())?;
    settings.validate()?;
    let consumers = resolve_consumers(&file, &args.consumer)?;
    let commit_timeout = settings.timeouts.commit;

    let cache_uri = args
        .cache
        .cache_connection_uri
        .as_deref()
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| CacheError::Configuration("CACHE_CONNECTION_URI is not defined".into()))?;
    let cache_connector = connector_for(cache_uri)?;

    // --- Broker ---
    let broker = Arc::new(BrokerManager::initialize(settings)?);
    broker.connect_publisher().await?;

    // --- Cache ---
    let cache = match CachePool::initialize_with(
        cache_uri,
        args.cache.cache_database_count,
        cache_connector.as_ref(),
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            broker.shutdown_all().await;
            return Err(e.into());
        }
    };

    // --- Consumers ---
    let token = CancellationToken::new();
    let mut tasks: Vec<ConsumerTask> = Vec::new();

    if consumers.is_empty() {
        tracing::warn!("no consumers configured, running publisher only");
    }
    for consumer_cfg in &consumers {
        let registration = match broker
            .register_consumer(&consumer_cfg.group_id, &consumer_cfg.topics)
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                token.cancel();
                drain(tasks).await;
                shutdown_resources(&broker, &cache).await;
                return Err(e.into());
            }
        };
        tasks.push((
            consumer_cfg.group_id.clone(),
            spawn_consumer(
                registration,
                Arc::new(LogHandler::new(consumer_cfg.group_id.clone())),
                consumer_cfg.pipeline_config(commit_timeout),
                token.clone(),
            ),
        ));
        tracing::info!(
            consumer = %consumer_cfg.group_id,
            topics = ?consumer_cfg.topics,
            policy = %consumer_cfg.policy,
            "spawned consumer"
        );
    }

    tracing::info!("server ready");

    // --- Ожидание сигнала ---
    let waited = shutdown.await;
    tracing::info!("shutting down...");

    token.cancel();
    drain(tasks).await;
    let report = shutdown_resources(&broker, &cache).await;

    tracing::info!(
        closed = report.closed.len(),
        failed = report.failed.len(),
        "shutdown complete"
    );
    waited
}

/// Дождаться завершения consumer loop'ов (они уже получили cancel).
async fn drain(tasks: Vec<ConsumerTask>) {
    for (group, handle) in tasks {
        match handle.await {
            Ok(Ok(summary)) => tracing::info!(consumer = %group, ?summary, "consumer finished"),
            Ok(Err(e)) => tracing::error!(consumer = %group, error = %e, "consumer failed"),
            Err(e) => tracing::error!(consumer = %group, error = %e, "consumer task panicked"),
        }
    }
}

async fn shutdown_resources(broker: &BrokerManager, cache: &CachePool) -> ShutdownReport {
    let mut report = broker.shutdown_all().await;
    report.merge(cache.shutdown().await);
    for (resource, error) in &report.failed {
        tracing::warn!(%resource, %error, "resource did not close cleanly");
    }
    report
}

async fn shutdown_signal() -> Result<(), ServerError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
