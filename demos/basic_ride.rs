use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use fitlink::{FileDeviceCache, FtmsClient, FtmsEvent, Result, ScanOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Fitlink Basic Ride Example");

    let cache = Arc::new(FileDeviceCache::new(".fitlink")?);
    let (client, mut events) = FtmsClient::new(cache).await?;

    // Try the cached device first, then fall back to a fresh scan
    let connected = match client.reconnect_silently().await? {
        Some(name) => {
            info!("✅ Reconnected to cached device: {name}");
            true
        }
        None => {
            info!("Searching for fitness machines...");
            client.scan_and_connect().await? == ScanOutcome::Connected
        }
    };

    if !connected {
        error!("❌ No fitness machine found");
        return Ok(());
    }

    if let Some(capabilities) = client.capabilities().await {
        info!("📋 Machine capabilities:");
        info!("  Power measurement: {}", capabilities.machine.power_measurement);
        info!("  Cadence: {}", capabilities.machine.cadence);
        info!("  Power target: {}", capabilities.targets.power);
        info!("  Simulation: {}", capabilities.targets.indoor_bike_simulation);
    }

    if let Some(range) = client.power_range().await {
        info!(
            "⚡ Power range: {}..{} W in {} W steps",
            range.minimum, range.maximum, range.increment
        );
    }

    // Ride a short ERG interval
    info!("🎯 Setting target power to 150 W...");
    client.set_target_power(150).await?;

    let ride = Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + ride;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, events.recv()).await {
            Ok(Some(FtmsEvent::Telemetry(sample))) => {
                info!(
                    "📊 speed {:?} km/h, cadence {:?} rpm, power {:?} W, hr {:?} bpm",
                    sample.speed_kmh,
                    sample.cadence_rpm,
                    sample.power_watts,
                    sample.heart_rate_bpm
                );
            }
            Ok(Some(FtmsEvent::Status(status))) => {
                info!("🔔 machine status: {status:?}");
            }
            Ok(Some(FtmsEvent::Error(message))) => {
                warn!("⚠️ {message}");
            }
            Ok(Some(FtmsEvent::Disconnected)) => {
                error!("❌ Device disconnected");
                return Ok(());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    // Back off the target and stop the session
    info!("📉 Switching to simulation mode at 2% grade...");
    client.set_indoor_bike_simulation(0.0, 2.0, 0.004, 0.51).await?;
    sleep(Duration::from_secs(5)).await;

    info!("🛑 Stopping...");
    client.stop(false).await?;

    info!("🔌 Disconnecting...");
    client.disconnect().await?;
    info!("✅ Disconnected successfully");

    Ok(())
}
