use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tssd::api;
use tssd::config::Settings;
use tssd::coordinator::Coordinator;
use tssd::network::{HttpTransport, Transport};
use tssd::party::simulated::SimulatedFactory;
use tssd::storage::FileKeyStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let peer_home = settings.peer_home()?;
    std::fs::create_dir_all(peer_home.join("logs"))?;

    let file_appender = tracing_appender::rolling::daily(peer_home.join("logs"), "tssd.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let filter =
        EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let transport: Arc<HttpTransport> = Arc::new(HttpTransport::new(&settings.p2p_url));
    let keystore = Arc::new(FileKeyStore::new(peer_home));
    // the simulated rounds are the only backend compiled into this binary;
    // deployments with a real MPC library pass their own factory here
    let factory = Arc::new(SimulatedFactory::new());

    let port = settings.port;
    let coordinator = Coordinator::new(settings, transport.clone(), keystore, factory).await?;

    transport
        .subscribe(&format!("http://localhost:{port}"))
        .await?;

    let app = api::router(coordinator);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(%port, "tssd listening");
    axum::serve(listener, app).await?;

    Ok(())
}
