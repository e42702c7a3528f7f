use std::time::Duration;

use colored::Colorize;
use serde_json::Value;

use crate::cli::{Cli, StatusArgs};
use crate::config::Config;
use crate::error::Result;

pub async fn run(cli: &Cli, args: &StatusArgs) -> Result<()> {
    let config = Config::load(None)?;
    let host = args.host.clone().unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    let base = format!("http://{}:{}", host, port);

    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let version = match client.get(format!("{}/version", base)).send().await {
        Ok(resp) => resp
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("version").and_then(Value::as_str).map(str::to_owned)),
        Err(_) => {
            if cli.json {
                println!("{}", serde_json::json!({ "running": false, "addr": base }));
            } else {
                println!("  {} Relay is not running at {}", "✗".red(), base);
                println!(
                    "  {}  Start with: {}",
                    "ℹ".dimmed(),
                    "cdp-relay serve".dimmed()
                );
            }
            return Ok(());
        }
    };

    let status: Value = client
        .get(format!("{}/extension/status", base))
        .send()
        .await?
        .json()
        .await?;

    let connected = status
        .get("connected")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let targets = status
        .get("targets")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "running": true,
                "addr": base,
                "version": version,
                "connected": connected,
                "targets": targets,
            })
        );
        return Ok(());
    }

    println!(
        "  {} Relay v{} running at {}",
        "✓".green(),
        version.unwrap_or_else(|| "?".to_string()),
        base
    );
    if connected {
        println!(
            "  {} Extension connected ({} targets)",
            "✓".green(),
            targets.len()
        );
        for target in &targets {
            let id = target.get("targetId").and_then(Value::as_str).unwrap_or("?");
            let url = target.get("url").and_then(Value::as_str).unwrap_or("");
            println!("    {} {}  {}", "·".dimmed(), id, url.dimmed());
        }
    } else {
        println!("  {} Extension not connected", "✗".red());
    }

    Ok(())
}
