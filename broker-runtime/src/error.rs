//! 运行时统一错误定义
//!
//! 覆盖连接、通道、拓扑、发布、序列化与订阅处理等最小必要集合，
//! 便于在应用层统一转换与分类（可重试 / 致命）。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    // --- 连接/通道 ---
    #[error("connection failed after {attempts} attempt(s): {reason}")]
    Connection { attempts: u32, reason: String },
    #[error("channel unavailable: {reason}")]
    Channel { reason: String },
    #[error("channel invalidated: {reason}")]
    ChannelInvalidated { reason: String },

    // --- 拓扑 ---
    #[error("topology conflict: {entity}={name}, reason={reason}")]
    TopologyConflict {
        entity: &'static str,
        name: String,
        reason: String,
    },
    #[error("invalid routing pattern: {pattern}, reason={reason}")]
    InvalidPattern { pattern: String, reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("deserialization error: {reason}")]
    Deserialization { reason: String },

    // --- 发布/消费 ---
    #[error("publish failed: routing_key={routing_key}, reason={reason}")]
    Publish { routing_key: String, reason: String },
    #[error("publish timed out after {timeout_ms}ms: routing_key={routing_key}")]
    PublishTimeout { routing_key: String, timeout_ms: u128 },
    #[error("event handler error: handler={handler}, reason={reason}")]
    Handler { handler: String, reason: String },

    // --- 传输层 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl BrokerError {
    pub fn channel_invalidated(reason: impl Into<String>) -> Self {
        Self::ChannelInvalidated {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// 可通过重新获取通道 / 重连恢复的错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChannelInvalidated { .. }
                | Self::Channel { .. }
                | Self::Publish { .. }
                | Self::Transport { .. }
        )
    }

    /// 不可恢复，应上抛给进程监督者
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::TopologyConflict { .. }
                | Self::InvalidPattern { .. }
                | Self::InvalidConfig { .. }
        )
    }
}

/// 统一 Result 类型别名
pub type BrokerResult<T> = Result<T, BrokerError>;
