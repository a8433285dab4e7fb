//! 拓扑声明（TopologyDeclarer）
//!
//! 幂等地声明交换机、队列与绑定。启动时与每次重连后都会重新执行，
//! 因此所有声明必须可重复调用且结果一致。
//!
use crate::config::ExchangeKind;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Channel, QueueOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// 死信交换机名称后缀
pub const DEAD_LETTER_EXCHANGE_SUFFIX: &str = ".dlx";
/// 死信队列名称后缀
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dead_letter";

/// 经过校验的 topic 绑定模式
///
/// 以 `.` 分词，词不可为空；通配符 `*` / `#` 只能独占一个词。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingPattern(String);

impl RoutingPattern {
    pub fn new(pattern: impl Into<String>) -> BrokerResult<Self> {
        let pattern = pattern.into();
        let invalid = |reason: &str| BrokerError::InvalidPattern {
            pattern: pattern.clone(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        for word in pattern.split('.') {
            if word.is_empty() {
                return Err(invalid("empty word"));
            }
            if word.len() > 1 && word.contains(['*', '#']) {
                return Err(invalid("wildcard must occupy a whole word"));
            }
        }

        Ok(Self(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.split('.').any(|w| w == "*" || w == "#")
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoutingPattern {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoutingPattern {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoutingPattern> for String {
    fn from(value: RoutingPattern) -> Self {
        value.0
    }
}

/// 交换机 → 队列的绑定
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub pattern: RoutingPattern,
    pub durable: bool,
    /// 启用后队列声明 `x-dead-letter-exchange`，并附带死信队列
    pub dead_letter: bool,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> BrokerResult<Self> {
        Ok(Self {
            exchange: exchange.into(),
            queue: queue.into(),
            pattern: RoutingPattern::new(pattern)?,
            durable: true,
            dead_letter: false,
        })
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}{DEAD_LETTER_EXCHANGE_SUFFIX}", self.exchange)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}{DEAD_LETTER_QUEUE_SUFFIX}", self.queue)
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            dead_letter_exchange: self.dead_letter.then(|| self.dead_letter_exchange()),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.exchange, self.pattern, self.queue)
    }
}

/// 拓扑声明器
#[derive(Clone, Copy, Debug, Default)]
pub struct TopologyDeclarer {
    exchange_kind: ExchangeKind,
}

impl TopologyDeclarer {
    pub fn new(exchange_kind: ExchangeKind) -> Self {
        Self { exchange_kind }
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    /// 声明持久化交换机；同名不同类型时返回 `TopologyConflict`
    pub async fn declare_exchange(&self, channel: &dyn Channel, name: &str) -> BrokerResult<()> {
        channel.declare_exchange(name, self.exchange_kind, true).await?;
        debug!(exchange = name, kind = %self.exchange_kind, "exchange declared");
        Ok(())
    }

    /// 声明队列并绑定到交换机（启用死信时一并声明死信拓扑）
    pub async fn declare_binding(&self, channel: &dyn Channel, binding: &Binding) -> BrokerResult<()> {
        if binding.dead_letter {
            self.declare_dead_letter(channel, binding).await?;
        }

        channel
            .declare_queue(&binding.queue, &binding.queue_options())
            .await?;
        channel
            .bind_queue(&binding.queue, &binding.exchange, binding.pattern.as_str())
            .await?;

        debug!(
            exchange = %binding.exchange,
            queue = %binding.queue,
            pattern = %binding.pattern,
            "binding declared"
        );
        Ok(())
    }

    /// 订阅启动时的完整声明：交换机 + 队列 + 绑定
    pub async fn declare_all(&self, channel: &dyn Channel, binding: &Binding) -> BrokerResult<()> {
        self.declare_exchange(channel, &binding.exchange).await?;
        self.declare_binding(channel, binding).await
    }

    async fn declare_dead_letter(&self, channel: &dyn Channel, binding: &Binding) -> BrokerResult<()> {
        let exchange = binding.dead_letter_exchange();
        let queue = binding.dead_letter_queue();

        // 死信按原路由键转投，使用 topic + `#` 接收全部
        channel
            .declare_exchange(&exchange, ExchangeKind::Topic, true)
            .await?;
        channel.declare_queue(&queue, &QueueOptions::default()).await?;
        channel.bind_queue(&queue, &exchange, "#").await?;

        debug!(%exchange, %queue, "dead-letter topology declared");
        Ok(())
    }
}
