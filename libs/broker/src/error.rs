use ingest_api::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Missing or malformed setting: fatal at startup.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Transport could not be established (connect / subscribe / timeout).
    #[error("connection ({target}): {source}")]
    Connection { target: String, source: ServiceError },

    /// Publish failed after the publisher was connected.
    #[error("publish to '{topic}': {source}")]
    Publish { topic: String, source: ServiceError },
}

impl BrokerError {
    pub fn connection(target: impl Into<String>, source: ServiceError) -> Self {
        BrokerError::Connection { target: target.into(), source }
    }

    pub fn publish(topic: impl Into<String>, source: ServiceError) -> Self {
        BrokerError::Publish { topic: topic.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Configuration("BROKER_ADDRESSES is empty".into());
        assert_eq!(err.to_string(), "configuration: BROKER_ADDRESSES is empty");

        let err = BrokerError::connection("publisher", ServiceError::connection("refused"));
        assert_eq!(err.to_string(), "connection (publisher): refused");

        let err = BrokerError::publish("demo", ServiceError::io("timed out"));
        assert_eq!(err.to_string(), "publish to 'demo': timed out");
    }

    #[test]
    fn test_broker_error_keeps_source() {
        use std::error::Error;
        let err = BrokerError::publish("demo", ServiceError::io("queue full"));
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("queue full"));
    }
}
