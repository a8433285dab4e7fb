use anyhow::Context;
use broker_application::{AppConfig, BrokerService, OrderHandlers, logging};
use broker_runtime::transport::amqp::AmqpTransport;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info")?;

    let config = AppConfig::from_env().context("load broker configuration")?;
    let service = BrokerService::start(config, Arc::new(AmqpTransport::new()), OrderHandlers::default())
        .await
        .context("start broker service")?;
    let fatal = service.fatal_signal();
    let subscriber_failed = service.subscriber_failure_signal();

    let failure = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("interrupt received");
            None
        }
        _ = fatal.cancelled() => {
            error!(health = ?service.health(), "broker connection could not be recovered");
            Some("broker connection lost".to_string())
        }
        _ = subscriber_failed.cancelled() => {
            let failures: Vec<String> = service.failures().iter().map(|e| e.to_string()).collect();
            for reason in &failures {
                error!(%reason, "subscriber stopped");
            }
            Some(failures.join("; "))
        }
    };

    service.shutdown().await?;
    if let Some(reason) = failure {
        anyhow::bail!(reason);
    }
    Ok(())
}
