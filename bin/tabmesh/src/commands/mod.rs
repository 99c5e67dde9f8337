pub mod call;
pub mod config_cmd;
pub mod inventory;
pub mod peer;
pub mod peers;
pub mod scan;
pub mod serve;

use tabmesh_channels::PortDiscoverer;
use tabmesh_core::Config;

/// Explicit port, or the first listener found in the discovery range.
pub async fn locate_listener(config: &Config, port: Option<u16>) -> anyhow::Result<u16> {
    if let Some(port) = port {
        return Ok(port);
    }
    let discoverer = PortDiscoverer::from_config(&config.discovery)?;
    discoverer.scan_once().await;
    match discoverer.known_ports().first() {
        Some(port) => Ok(*port),
        None => anyhow::bail!(
            "no listener found on {} ports {}-{}; start one with `tabmesh serve`",
            config.discovery.host,
            config.discovery.port_range_start,
            config.discovery.port_range_end
        ),
    }
}

pub fn base_url(config: &Config, port: u16) -> String {
    format!("http://{}:{}", config.discovery.host, port)
}
