//! # weft
//!
//! Command-line harness for the weft session client: dials an endpoint,
//! issues one request, and prints the response envelope.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use weft_client::Client;
use weft_core::{CallOptions, Credentials, SessionConfig};

/// Weft session client.
#[derive(Parser, Debug)]
#[command(name = "weft", about = "Duplex session client for the weft protocol")]
struct Cli {
    /// Endpoint URL (`ws`/`wss` for a duplex session, `http`/`https` for
    /// one-shot exchanges).
    #[arg(long)]
    url: String,

    /// Request kind, e.g. `searchSymptom`.
    kind: String,

    /// Request payload as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,

    /// API key (falls back to `WEFT_API_KEY`).
    #[arg(long)]
    api_key: Option<String>,

    /// API secret (falls back to `WEFT_API_SECRET`).
    #[arg(long)]
    api_secret: Option<String>,

    /// Per-request deadline override in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Cancel pending requests of the same kind before sending this one.
    #[arg(long)]
    cancel_pending: bool,

    /// Print session events as JSON lines while the call runs.
    #[arg(long)]
    watch_events: bool,

    /// Fail instead of redialing when the connection drops.
    #[arg(long)]
    no_reconnect: bool,
}

impl Cli {
    fn credentials(&self) -> Result<Credentials> {
        let api_key = resolve(self.api_key.clone(), "WEFT_API_KEY")
            .context("missing API key (use --api-key or WEFT_API_KEY)")?;
        let api_secret = resolve(self.api_secret.clone(), "WEFT_API_SECRET")
            .context("missing API secret (use --api-secret or WEFT_API_SECRET)")?;
        Ok(Credentials::new(api_key, api_secret))
    }
}

fn resolve(flag: Option<String>, env: &str) -> Option<String> {
    flag.or_else(|| std::env::var(env).ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let credentials = args.credentials()?;
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params must be valid JSON")?;

    let config = SessionConfig {
        reconnect: !args.no_reconnect,
        ..SessionConfig::default()
    };
    let client = Client::connect(&args.url, credentials, config)
        .await
        .with_context(|| format!("could not establish a session with {}", args.url))?;
    info!(url = %args.url, "session established");

    let watcher = args.watch_events.then(|| {
        let mut events = client.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "event not serializable"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let options = CallOptions {
        timeout: args.timeout_ms.map(Duration::from_millis),
        cancel_pending: args.cancel_pending,
    };
    let response = match client.call(&args.kind, params, options).await {
        Ok(response) => response,
        Err(e) => {
            let _ = client.close().await;
            return Err(e).with_context(|| format!("request {} failed", args.kind));
        }
    };
    println!("{}", serde_json::to_string_pretty(&response)?);

    client.close().await?;
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    info!("session closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_requires_url_and_kind() {
        assert!(Cli::try_parse_from(["weft"]).is_err());
        let cli = Cli::parse_from(["weft", "--url", "ws://localhost:9870", "searchSymptom"]);
        assert_eq!(cli.url, "ws://localhost:9870");
        assert_eq!(cli.kind, "searchSymptom");
        assert_eq!(cli.params, "{}");
        assert!(!cli.cancel_pending);
        assert!(!cli.no_reconnect);
    }

    #[test]
    fn cli_full_flag_set() {
        let cli = Cli::parse_from([
            "weft",
            "--url",
            "https://api.example.com/v1",
            "--params",
            r#"{"term":"fever"}"#,
            "--timeout-ms",
            "2500",
            "--cancel-pending",
            "--watch-events",
            "analyzeAnswers",
        ]);
        assert_eq!(cli.kind, "analyzeAnswers");
        assert_eq!(cli.timeout_ms, Some(2500));
        assert!(cli.cancel_pending);
        assert!(cli.watch_events);
    }

    #[test]
    fn flag_beats_environment() {
        assert_eq!(
            resolve(Some("from-flag".into()), "WEFT_TEST_UNSET_VAR"),
            Some("from-flag".into())
        );
        assert_eq!(resolve(None, "WEFT_TEST_UNSET_VAR"), None);
    }
}
