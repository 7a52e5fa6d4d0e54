use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_common::core::relay::Relay;
use lib_common::ingestors::transport::WsTransport;

mod coinbase_logic;
use coinbase_logic::{config, downstream, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    let log_path = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Logging to {}", log_path.display());
    log::info!(
        "Upstream {} for {:?}",
        settings.relay.feed.url,
        settings.relay.feed.products
    );

    let (relay, handle) = Relay::new(settings.relay.clone(), Arc::new(WsTransport::default()));
    let relay_task = tokio::spawn(relay.run());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;
    let server_shutdown = CancellationToken::new();
    let server_task = tokio::spawn(downstream::serve(
        listener,
        handle.clone(),
        server_shutdown.clone(),
    ));

    shutdown_signal().await?;

    handle.close();
    server_shutdown.cancel();

    let (relay_result, server_result) = tokio::join!(relay_task, server_task);
    relay_result?;
    server_result??;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                term_signal.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }
    Ok(())
}
