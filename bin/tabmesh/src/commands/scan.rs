use tabmesh_channels::PortDiscoverer;
use tabmesh_core::message::ProbeResponse;
use tabmesh_core::{Config, Paths};

use super::base_url;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let discoverer = PortDiscoverer::from_config(&config.discovery)?;

    println!(
        "Scanning {} ports {}-{}...",
        config.discovery.host, config.discovery.port_range_start, config.discovery.port_range_end
    );
    discoverer.scan_once().await;
    let ports = discoverer.known_ports();
    if ports.is_empty() {
        println!("No listeners found.");
        return Ok(());
    }

    let http = reqwest::Client::builder()
        .timeout(config.discovery.probe_timeout())
        .build()?;
    for port in ports {
        let probe = match http.get(base_url(&config, port)).send().await {
            Ok(resp) => resp.json::<ProbeResponse>().await.ok(),
            Err(_) => None,
        };
        match probe {
            Some(p) => println!("  {:<6} {} {}", port, p.service, p.version),
            None => println!("  {:<6} (unknown service)", port),
        }
    }
    Ok(())
}
