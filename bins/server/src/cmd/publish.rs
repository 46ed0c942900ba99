use broker::BrokerManager;
use ingest_api::OutboundMessage;

use crate::config::PublishArgs;
use crate::error::ServerError;

/// Initialize → connect → один batch → shutdown.
pub async fn run(args: PublishArgs) -> Result<(), ServerError> {
    let settings = args.broker.settings(Default::default())?;
    let broker = BrokerManager::initialize(settings)?;
    broker.connect_publisher().await?;

    let message = OutboundMessage {
        key: args.key.clone(),
        value: args.value.clone(),
    };
    let result = broker.publish(&args.topic, std::slice::from_ref(&message)).await;
    match &result {
        Ok(()) => tracing::info!(topic = %args.topic, key = ?args.key, "message published"),
        Err(e) => tracing::error!(topic = %args.topic, error = %e, "publish failed"),
    }

    broker.shutdown_all().await;
    result.map_err(ServerError::from)
}
