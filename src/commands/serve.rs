use colored::Colorize;

use crate::cli::{Cli, ServeArgs};
use crate::config::Config;
use crate::error::Result;
use crate::relay::admission;
use crate::relay::RelayServer;

pub async fn run(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(token) = &args.token {
        config.auth.bearer_token = Some(token.clone());
    }
    if args.generate_token {
        config.auth.bearer_token = Some(admission::generate_token());
    }
    if !args.allow_origins.is_empty() {
        config.auth.extension_origins = args.allow_origins.clone();
    }

    let token = config.auth.bearer_token.clone();
    let origins = config.auth.extension_origins.clone();

    let server = RelayServer::bind(config).await?;
    let addr = server.local_addr()?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "status": "listening",
                "addr": addr.to_string(),
                "cdp_url": format!("ws://{}/cdp", addr),
                "extension_url": format!("ws://{}/extension", addr),
                "version": env!("CARGO_PKG_VERSION"),
            })
        );
    } else {
        println!();
        println!("  {}", "CDP Relay".bold());
        println!("  {}", "─".repeat(40).dimmed());
        println!();
        println!("  {}  Listening on http://{}", "◆".cyan(), addr);
        println!("  {}  CDP endpoint:       ws://{}/cdp", "◆".cyan(), addr);
        println!(
            "  {}  Extension endpoint: ws://{}/extension",
            "◆".cyan(),
            addr
        );
        println!();
        match &token {
            Some(token) => println!("  \u{1f511}  Bearer token: {}", token.bold()),
            None => println!(
                "  {}  No bearer token - loopback clients only",
                "ℹ".dimmed()
            ),
        }
        if origins.is_empty() {
            println!(
                "  {}  Extension origins: any chrome-extension://",
                "◆".cyan()
            );
        } else {
            println!(
                "  {}  Extension origins: {}",
                "◆".cyan(),
                origins.join(", ").dimmed()
            );
        }
        println!();
        println!("  {}  Press Ctrl+C to stop", "ℹ".dimmed());
        println!();
    }

    server.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
