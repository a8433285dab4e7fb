//! 日志初始化（tracing-subscriber）
//!
//! `RUST_LOG` 优先；未设置时使用传入的默认级别，并压低 AMQP 客户端内部的噪音。
//!
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const NOISY: &[(&str, &str)] = &[("lapin", "warn"), ("amq_protocol", "warn"), ("pinky_swear", "warn")];

fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];
    for (target, lvl) in NOISY {
        directives.push(format!("{target}={lvl}"));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("invalid tracing filter '{filter_str}': {e}"))
}

pub fn init(level: &str) -> anyhow::Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(build_env_filter(level)?);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
