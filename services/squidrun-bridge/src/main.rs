use squidrun_bridge::config::BridgeConfig;
use squidrun_bridge::BridgeClient;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = BridgeConfig::from_env();

    if !config.cross_device {
        info!("SQUIDRUN_CROSS_DEVICE is off, bridge is a no-op");
        shutdown_signal().await;
        return;
    }

    let device_id = config.device_id.clone();
    let (client, mut deliveries) = BridgeClient::start(config);
    info!(device_id = %device_id, "bridge started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                match delivery {
                    Some(delivery) => {
                        info!(
                            message_id = %delivery.message_id,
                            from = %delivery.from_device,
                            "delivery received"
                        );
                        delivery.ack(true, None, None);
                    }
                    None => {
                        info!("bridge task stopped delivering, exiting");
                        break;
                    }
                }
            }
            () = &mut shutdown => {
                info!("shutting down bridge");
                break;
            }
        }
    }

    let _ = client;
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
