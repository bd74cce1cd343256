/// Inbox poller - main entry point
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wa_inbox_core::inbox::log_events;
use wa_inbox_core::{view_bridge, ApiClient, Config, Inbox, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let session = Session::load(config.session_file.as_deref())
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;

    info!("Starting WhatsApp inbox");
    info!("   Tenant: {}", session.tenant_id);
    info!("   Presentation: {:?}", config.presentation);

    let client = ApiClient::new(&config, session)?;
    let inbox = Inbox::new(config.clone(), Arc::new(client));

    if let Some(addr) = config.bridge_addr {
        let bridge_inbox = inbox.clone();
        tokio::spawn(async move {
            if let Err(e) = view_bridge::start_view_bridge(bridge_inbox, addr).await {
                error!("View bridge stopped: {}", e);
            }
        });
    }

    tokio::spawn(log_events(inbox.subscribe()));

    inbox.start().await;
    wait_for_shutdown().await;
    inbox.shutdown().await;

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
