#[cfg(feature = "demos")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
    use wiremidi::sessions::mdns::DiscoveryBridge;
    use wiremidi::sessions::server::RtpMidiServer;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let server = RtpMidiServer::bind("Wire Session", 5004).await?;

    let bridge = DiscoveryBridge::new()?;
    bridge.announce_rtpmidi("Wire Session", server.port())?;

    let _on_connected = server.on_connected(|info| {
        println!("{} connected from {}", info.name, info.remote_addr);
    });
    let _on_midi = server.on_midi(|data| {
        println!("midi in: {:02x?}", &data[..]);
    });

    tokio::signal::ctrl_c().await?;
    bridge.unannounce_rtpmidi("Wire Session", server.port())?;
    server.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "demos"))]
fn main() {
    println!("This demo requires the 'demos' feature to be enabled.");
}
