use std::net::SocketAddr;

use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use pairspeed_relay::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairspeed=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("PAIRSPEED_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PAIRSPEED_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()?;
    let static_dir = std::env::var("PAIRSPEED_STATIC_DIR").unwrap_or_else(|_| ".".into());

    let app = pairspeed_relay::router(Dispatcher::new())
        .fallback_service(ServeDir::new(&static_dir))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("pairspeed relay listening on {} (static files from {})", addr, static_dir);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
