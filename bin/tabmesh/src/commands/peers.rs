use serde_json::Value;
use tabmesh_core::{Config, Paths};

use super::{base_url, locate_listener};

pub async fn run(port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let port = locate_listener(&config, port).await?;

    let url = format!("{}/v1/peers", base_url(&config, port));
    let peers: Vec<Value> = reqwest::get(&url).await?.error_for_status()?.json().await?;

    if peers.is_empty() {
        println!("No peers connected to port {}.", port);
        return Ok(());
    }

    println!("{:<24} {:<20} {:<10} {:>5}  {}", "PEER", "NAME", "VERSION", "TABS", "CONNECTED");
    for peer in &peers {
        let field = |key: &str| peer.get(key).and_then(|v| v.as_str()).unwrap_or("-").to_string();
        let tabs = peer.get("tabCount").and_then(|v| v.as_u64()).unwrap_or(0);
        println!(
            "{:<24} {:<20} {:<10} {:>5}  {}",
            field("peerId"),
            field("name"),
            field("version"),
            tabs,
            field("connectedAt")
        );
    }
    Ok(())
}
