//! Discover miIO devices on the local network and print them as they
//! appear and disappear.

use miio_protocol::discovery::{DeviceBrowser, DiscoveryEvent, DiscoverySource};
use miio_protocol::network::NetworkManager;

#[tokio::main]
async fn main() -> miio_protocol::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let network = NetworkManager::with_defaults();
    let browser = DeviceBrowser::with_defaults(network);
    let mut events = browser.subscribe();
    browser.start().await?;

    println!("Searching for devices, ctrl-c to stop");
    while let Ok(event) = events.recv().await {
        match event {
            DiscoveryEvent::Available(service) => {
                println!(
                    "+ {} at {}:{} (model {})",
                    service.id,
                    service.address,
                    service.port,
                    service.model.as_deref().unwrap_or("unknown"),
                );
            }
            DiscoveryEvent::Unavailable(service) => {
                println!("- {} went away", service.id);
            }
            DiscoveryEvent::Updated(_) => {}
        }
    }
    Ok(())
}
