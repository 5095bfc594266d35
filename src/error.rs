use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("creating AWS client for {account_id}: {message}")]
    ClientInit { account_id: String, message: String },

    #[error("account {account_id}, metric {metric}: {message}")]
    Fetch {
        account_id: String,
        metric: String,
        message: String,
    },

    #[error("metric {metric}, account {account_id}: {detail}")]
    PublishInconsistency {
        metric: String,
        account_id: String,
        detail: String,
    },

    #[error("{failed} of {total} accounts failed to fetch")]
    Refresh { failed: usize, total: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Config(err.to_string())
    }
}
