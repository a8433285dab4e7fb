//! 连接管理（ConnectionManager）
//!
//! 维护进程内唯一的逻辑连接：
//! - 按 `RetryPolicy` 指数退避建立连接，耗尽后返回致命错误；
//! - 为发布与订阅方打开新通道；
//! - 监听连接丢失并在后台任务中自动恢复，恢复失败时触发致命信号；
//! - 通过 `watch` 通道与 `health()` 对外暴露状态。
//!
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{Channel, Transport, TransportConnection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 连接状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

/// 连接健康快照
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    /// 最近一次建立连接的时间
    pub established_at: Option<DateTime<Utc>>,
    /// 当前（或最近一轮）连接过程中的失败次数
    pub retry_count: u32,
    /// 自动恢复成功的次数
    pub recoveries: u64,
}

#[derive(Default)]
struct ConnState {
    connection: Option<Arc<dyn TransportConnection>>,
    established_at: Option<DateTime<Utc>>,
    retry_count: u32,
    recoveries: u64,
    /// 每次建立连接递增，用于忽略过期连接的丢失通知
    generation: u64,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    state: Mutex<ConnState>,
    status: watch::Sender<ConnectionStatus>,
    /// 串行化建连/恢复过程
    establishing: tokio::sync::Mutex<()>,
    /// 主动关闭信号
    closed: CancellationToken,
    /// 恢复失败的致命信号，由进程监督者监听
    fatal: CancellationToken,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        Arc::new(Self {
            transport,
            config,
            state: Mutex::new(ConnState::default()),
            status,
            establishing: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
            fatal: CancellationToken::new(),
        })
    }

    /// 使用 lapin AMQP 传输
    #[cfg(feature = "amqp")]
    pub fn amqp(config: BrokerConfig) -> Arc<Self> {
        Self::new(Arc::new(crate::transport::amqp::AmqpTransport::new()), config)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn exchange(&self) -> &str {
        &self.config.exchange
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn health(&self) -> ConnectionHealth {
        let state = self.lock();
        ConnectionHealth {
            status: self.status(),
            established_at: state.established_at,
            retry_count: state.retry_count,
            recoveries: state.recoveries,
        }
    }

    /// 恢复耗尽后被取消的令牌
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 建立连接；已连接时直接返回
    pub async fn connect(self: &Arc<Self>) -> BrokerResult<()> {
        let _guard = self.establishing.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if self.is_closed() {
            return Err(BrokerError::Connection {
                attempts: 0,
                reason: "connection manager is closed".into(),
            });
        }

        self.set_status(ConnectionStatus::Connecting);
        self.establish().await
    }

    /// 在当前连接上打开新通道
    pub async fn open_channel(&self) -> BrokerResult<Box<dyn Channel>> {
        let connection = self.current().ok_or_else(|| BrokerError::Channel {
            reason: format!("no open connection (status={})", self.status()),
        })?;

        let channel = connection.open_channel().await?;
        debug!(endpoint = %self.config.endpoint(), "channel opened");
        Ok(channel)
    }

    /// 等待连接可用；关闭或恢复失败时返回错误
    pub async fn wait_until_connected(&self) -> BrokerResult<()> {
        let mut rx = self.status.subscribe();

        tokio::select! {
            res = rx.wait_for(|s| *s == ConnectionStatus::Connected) => {
                res.map(|_| ()).map_err(|_| BrokerError::Connection {
                    attempts: 0,
                    reason: "connection manager dropped".into(),
                })
            }
            _ = self.fatal.cancelled() => Err(BrokerError::Connection {
                attempts: self.config.retry.max_attempts,
                reason: "connection recovery exhausted".into(),
            }),
            _ = self.closed.cancelled() => Err(BrokerError::Connection {
                attempts: 0,
                reason: "connection manager is closed".into(),
            }),
        }
    }

    /// 主动关闭连接（不会触发恢复）
    pub async fn close(&self) -> BrokerResult<()> {
        self.closed.cancel();
        let connection = self.lock().connection.take();
        self.set_status(ConnectionStatus::Disconnected);

        if let Some(connection) = connection {
            connection.close().await?;
            info!(endpoint = %self.config.endpoint(), "broker connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_connected())
    }

    fn current(&self) -> Option<Arc<dyn TransportConnection>> {
        self.lock().connection.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "connection status changed");
        }
    }

    /// 按退避序列尝试连接；调用方需持有 `establishing`
    async fn establish(self: &Arc<Self>) -> BrokerResult<()> {
        let policy = self.config.retry;
        let endpoint = self.config.endpoint();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            if self.is_closed() {
                break;
            }

            debug!(%endpoint, attempt, "connecting to broker");
            match self.transport.connect(&self.config).await {
                Ok(connection) => {
                    self.install(connection);
                    info!(%endpoint, attempt, "broker connection established");
                    return Ok(());
                }
                Err(e) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        %endpoint,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connection attempt failed"
                    );
                    self.lock().retry_count = attempt;
                    last_error = e.to_string();

                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        let attempts = self.lock().retry_count;
        self.set_status(ConnectionStatus::Disconnected);
        error!(%endpoint, attempts, reason = %last_error, "giving up on broker connection");

        Err(BrokerError::Connection {
            attempts,
            reason: if last_error.is_empty() {
                "connection manager is closed".into()
            } else {
                last_error
            },
        })
    }

    fn install(self: &Arc<Self>, connection: Arc<dyn TransportConnection>) {
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.connection = Some(connection.clone());
            state.established_at = Some(Utc::now());
            state.retry_count = 0;
            state.generation
        };
        self.set_status(ConnectionStatus::Connected);

        // 回调可能在传输层自己的线程上触发，需要显式持有运行时句柄
        let manager: Weak<Self> = Arc::downgrade(self);
        let runtime = Handle::current();
        connection.on_lost(Box::new(move |reason| {
            if let Some(manager) = manager.upgrade() {
                manager.handle_lost(&runtime, generation, reason);
            }
        }));
    }

    fn handle_lost(self: Arc<Self>, runtime: &Handle, generation: u64, reason: String) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.lock();
            if state.generation != generation || state.connection.is_none() {
                return;
            }
            state.connection = None;
        }

        warn!(endpoint = %self.config.endpoint(), %reason, "broker connection lost, recovering");
        self.set_status(ConnectionStatus::Recovering);

        runtime.spawn(async move {
            self.recover().await;
        });
    }

    async fn recover(self: Arc<Self>) {
        let _guard = self.establishing.lock().await;
        if self.is_connected() || self.is_closed() {
            return;
        }

        match self.establish().await {
            Ok(()) => {
                let recoveries = {
                    let mut state = self.lock();
                    state.recoveries += 1;
                    state.recoveries
                };
                info!(endpoint = %self.config.endpoint(), recoveries, "broker connection recovered");
            }
            Err(e) => {
                if !self.is_closed() {
                    error!(endpoint = %self.config.endpoint(), error = %e, "connection recovery exhausted");
                    self.fatal.cancel();
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.config.endpoint())
            .field("status", &self.status())
            .finish()
    }
}
