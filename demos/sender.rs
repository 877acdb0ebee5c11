#[cfg(feature = "demos")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::time::Duration;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
    use wiremidi::sessions::client::{ClientParams, RtpMidiClient};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let client = RtpMidiClient::new("Wire Sender", ClientParams::default());
    let _on_status = client.on_status_change(|status| {
        println!("session status: {status}");
    });
    let _on_clock_sync = client.on_clock_sync(|latency_ms| {
        println!("latency: {latency_ms:.1} ms");
    });

    client.add_server_address("127.0.0.1", "5004");

    // Middle C, once a second, until interrupted.
    let mut beat = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = beat.tick() => {
                if client.status().is_connected() {
                    client.send_midi(&[0x90, 60, 100]);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    client.send_midi(&[0x80, 60, 0]);
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}

#[cfg(not(feature = "demos"))]
fn main() {
    println!("This demo requires the 'demos' feature to be enabled.");
}
