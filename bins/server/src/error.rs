#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("broker: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("pipeline: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("cache: {0}")]
    Cache(#[from] cache_pool::CacheError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}

impl ServerError {
    pub fn config(context: &'static str, detail: impl Into<String>) -> Self {
        ServerError::Config { context, detail: detail.into() }
    }
}
