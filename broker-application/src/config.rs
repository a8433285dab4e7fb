//! 应用配置
//!
//! 从环境变量加载 broker 连接与订阅参数；`from_lookup` 接受任意键值来源，便于测试。
//!
use crate::error::{AppError, AppResult};
use broker_runtime::{BrokerConfig, ExchangeKind, RedeliveryPolicy, RetryPolicy};
use std::str::FromStr;
use std::time::Duration;

pub const RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USERNAME: &str = "RABBITMQ_USERNAME";
pub const RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VIRTUAL_HOST: &str = "RABBITMQ_VIRTUAL_HOST";
pub const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_EXCHANGE_TYPE: &str = "RABBITMQ_EXCHANGE_TYPE";
pub const RABBITMQ_MAX_REDELIVERIES: &str = "RABBITMQ_MAX_REDELIVERIES";
pub const RABBITMQ_CONNECT_ATTEMPTS: &str = "RABBITMQ_CONNECT_ATTEMPTS";
pub const RABBITMQ_PUBLISH_TIMEOUT_MS: &str = "RABBITMQ_PUBLISH_TIMEOUT_MS";
pub const RABBITMQ_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    /// 未设置或为 0 时无上限重新入队
    pub redelivery: RedeliveryPolicy,
    pub publish_timeout: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            redelivery: RedeliveryPolicy::Unbounded,
            publish_timeout: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = BrokerConfig::default();

        let port = parse(RABBITMQ_PORT, get(RABBITMQ_PORT))?.unwrap_or(defaults.port);
        let exchange_kind = match get(RABBITMQ_EXCHANGE_TYPE) {
            Some(raw) => ExchangeKind::from_str(&raw).map_err(|e| AppError::Config {
                key: RABBITMQ_EXCHANGE_TYPE,
                reason: e.to_string(),
            })?,
            None => defaults.exchange_kind,
        };
        let max_attempts = parse::<u32>(RABBITMQ_CONNECT_ATTEMPTS, get(RABBITMQ_CONNECT_ATTEMPTS))?
            .unwrap_or(defaults.retry.max_attempts);
        if max_attempts == 0 {
            return Err(AppError::Config {
                key: RABBITMQ_CONNECT_ATTEMPTS,
                reason: "must be at least 1".into(),
            });
        }

        let broker = BrokerConfig::builder()
            .host(get(RABBITMQ_HOST).unwrap_or(defaults.host))
            .port(port)
            .username(get(RABBITMQ_USERNAME).unwrap_or(defaults.username))
            .password(get(RABBITMQ_PASSWORD).unwrap_or(defaults.password))
            .virtual_host(get(RABBITMQ_VIRTUAL_HOST).unwrap_or(defaults.virtual_host))
            .exchange(get(RABBITMQ_EXCHANGE).unwrap_or(defaults.exchange))
            .exchange_kind(exchange_kind)
            .retry(RetryPolicy::builder().max_attempts(max_attempts).build())
            .maybe_connection_name(get(RABBITMQ_CONNECTION_NAME))
            .build();

        let redelivery = match parse::<u32>(RABBITMQ_MAX_REDELIVERIES, get(RABBITMQ_MAX_REDELIVERIES))? {
            None | Some(0) => RedeliveryPolicy::Unbounded,
            Some(max_attempts) => RedeliveryPolicy::DeadLetter { max_attempts },
        };
        let publish_timeout =
            parse::<u64>(RABBITMQ_PUBLISH_TIMEOUT_MS, get(RABBITMQ_PUBLISH_TIMEOUT_MS))?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);

        Ok(Self {
            broker,
            redelivery,
            publish_timeout,
        })
    }
}

fn parse<T>(key: &'static str, raw: Option<String>) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| {
        v.trim().parse::<T>().map_err(|e| AppError::Config {
            key,
            reason: format!("invalid value {v:?}: {e}"),
        })
    })
    .transpose()
}
