//! WeChat Official Account webhook - Main Entry Point
//!
//! ```text
//! weixin-mp                 # configuration from WEIXIN_* environment variables
//! weixin-mp <config.xml>    # configuration from an XML file
//! weixin-mp init <path>     # write a config template and exit
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weixin_mp::api::ApiClient;
use weixin_mp::config::WeixinConfig;
use weixin_mp::webhook::{self, EchoHandler, WebhookState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,weixin_mp=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = match args.as_slice() {
        [cmd, path] if cmd == "init" => {
            WeixinConfig::write_template(path)?;
            info!("📝 Config template written to {}", path);
            return Ok(());
        }
        [path] => WeixinConfig::from_file(path)?,
        [] => WeixinConfig::from_env()?,
        _ => anyhow::bail!("usage: weixin-mp [init <path> | <config.xml>]"),
    };

    info!("🚀 WeChat webhook starting for {}", config.app_id);

    if let Some(secret) = &config.app_secret {
        check_credentials(&config.host, &config.app_id, secret).await;
    }

    let addr: SocketAddr = config
        .webhook_addr
        .parse()
        .with_context(|| format!("Invalid webhook address: {}", config.webhook_addr))?;
    let path = config.webhook_path.clone();

    let state = WebhookState::new(config, Arc::new(EchoHandler))?;

    let server = tokio::spawn(async move {
        if let Err(e) = webhook::run_server(addr, state).await {
            error!("Webhook server error: {}", e);
        }
    });

    info!("🌐 Webhook listening on {}{}", addr, path);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("📢 Shutdown signal received"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    server.abort();

    info!("✅ WeChat webhook stopped");
    Ok(())
}

/// Fetch a token and the callback IP list once, so bad credentials show up at startup
async fn check_credentials(host: &str, app_id: &str, secret: &str) {
    let client = match ApiClient::new(host, app_id, secret) {
        Ok(client) => client,
        Err(e) => {
            warn!("API client unavailable: {}", e);
            return;
        }
    };

    match client.fetch_access_token().await {
        Ok(token) => match client.callback_ips(&token).await {
            Ok(ips) => info!("📋 Platform callback addresses: {}", ips.join(", ")),
            Err(e) => warn!("Failed to fetch callback IPs: {}", e),
        },
        Err(e) => warn!("Credential check failed: {}", e),
    }
}
