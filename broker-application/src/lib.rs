//! 订单事件服务（broker-application）
//!
//! 在 broker-runtime 之上装配订单系统：环境配置、日志、订阅者注册表、
//! 四个订单领域处理器，以及统一启停的 `BrokerService`。
//!
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod registry;
pub mod service;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use handlers::OrderHandlers;
pub use registry::SubscriberRegistry;
pub use service::BrokerService;
