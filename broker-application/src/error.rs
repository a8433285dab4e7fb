use broker_runtime::BrokerError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("config: {key}: {reason}")]
    Config { key: &'static str, reason: String },

    #[error("handler already registered: queue={queue}")]
    AlreadyRegistered { queue: String },

    #[error("subscriber failed: queue={queue}, reason={reason}")]
    Subscriber { queue: String, reason: String },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// 需要进程退出的错误
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::Broker(e) => e.is_fatal(),
            AppError::Config { .. } | AppError::Subscriber { .. } => true,
            _ => false,
        }
    }
}
