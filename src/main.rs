use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use broadcast_relay::{
    config::RelayConfig, ConnectionState, Dictionary, RelayClientBuilder, RelayError,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broadcast_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = RelayConfig::from_env();

    // Labels fall back to English until the dictionary arrives
    let dictionary = Dictionary::new();
    if let Some(url) = &config.i18n_url {
        dictionary.spawn_load(url.clone());
    }

    let builder = match RelayClientBuilder::from_config(&config) {
        Ok(builder) => builder,
        Err(e) => {
            tracing::error!("Invalid RELAY_ENDPOINT {:?}: {}", config.endpoint, e);
            return ExitCode::FAILURE;
        }
    };
    let mut client = builder
        .on_error(|e: RelayError| tracing::error!("Relay session lost: {}", e))
        .build();

    let connected = client
        .connect(
            |info| tracing::info!(version = %info.version, "Session established"),
            |e| tracing::error!("Could not connect: {}", e),
        )
        .await;
    if connected.is_err() {
        return ExitCode::FAILURE;
    }

    let (handle, mut messages) = match client.subscribe_channel(&config.topic) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!("Subscribe to {} failed: {}", config.topic, e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{}",
        dictionary.lookup_or(
            "relay.prompt",
            "Connected. Type a message and press enter to send it."
        )
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = client.state_changes();
    let mut exit = ExitCode::SUCCESS;

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(Ok(message)) => {
                    // Printed as received; sanitizing is up to the reader's terminal
                    println!(
                        "{}: {}  {}",
                        dictionary.lookup_or("relay.received", "Received"),
                        message.received_at.to_rfc3339(),
                        message.payload
                    );
                }
                Some(Err(e)) => tracing::warn!("Skipping message: {}", e),
                None => break,
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = client.publish(&config.destination, text) {
                        tracing::error!("Publish failed: {}", e);
                        exit = ExitCode::FAILURE;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            },

            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Disconnected {
                    exit = ExitCode::FAILURE;
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    client.unsubscribe(&handle);
    client.close().await;
    exit
}
