//! Pair with another peer from the terminal.
//!
//! Prints our identifier words, reads the peer's words one line at a time
//! and reports the role we ended up with.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use pairspeed_client::SessionConfig;
use pairspeed_client::pairing::Pairing;
use pairspeed_client::relay_link;
use pairspeed_client::signal::SignalChannel;
use pairspeed_client::sink::TracingSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairspeed=info".into()),
        )
        .init();

    let config = SessionConfig::from_env()?;
    info!("connecting to relay at {}", config.relay_url);

    let channel = SignalChannel::open(relay_link::connect(&config.relay_url)).await?;
    let pairing = Pairing::register(channel, config.relay_timeout).await?;
    println!("Your identifier: {}", pairing.own_words());
    println!("Enter your peer's identifier:");

    let lines = async_stream::stream! {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            yield line;
        }
    };
    futures_util::pin_mut!(lines);

    let paired = pairing.pair(lines, &TracingSink).await?;
    println!("Paired with {} as {} ({})", paired.peer, paired.role, paired.signed());
    Ok(())
}
