use std::sync::Arc;
use tracing::{error, info, warn};
use fitlink::{FileDeviceCache, HeartRateEvent, HeartRateMonitor, Result, ScanOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("❤️ Fitlink Heart Rate Monitor Example");

    let cache = Arc::new(FileDeviceCache::new(".fitlink")?);
    let (monitor, mut events) = HeartRateMonitor::new(cache).await?;

    info!("Searching for heart rate monitors...");
    if monitor.scan_and_connect().await? == ScanOutcome::NoneFound {
        error!("❌ No heart rate monitor found");
        return Ok(());
    }

    info!("🔍 Streaming measurements, press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(HeartRateEvent::Connected { name, sensor_location }) => {
                    info!("✅ Connected to: {name}");
                    if let Some(location) = sensor_location {
                        info!("📍 Sensor location code: {location}");
                    }
                }
                Some(HeartRateEvent::Measurement(measurement)) => {
                    let contact = match measurement.sensor_contact {
                        Some(true) => "contact",
                        Some(false) => "no contact",
                        None => "contact unknown",
                    };
                    info!("💓 {} bpm ({contact})", measurement.heart_rate_bpm);
                    if !measurement.rr_intervals_ms.is_empty() {
                        info!("   RR intervals: {:?} ms", measurement.rr_intervals_ms);
                    }
                }
                Some(HeartRateEvent::StateChanged(state)) => {
                    info!("🔄 State: {state}");
                }
                Some(HeartRateEvent::Error(message)) => {
                    warn!("⚠️ {message}");
                }
                Some(HeartRateEvent::Disconnected) => {
                    error!("❌ Monitor disconnected");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Interrupted");
                break;
            }
        }
    }

    info!("🔌 Disconnecting...");
    monitor.disconnect().await?;
    info!("✅ Disconnected successfully");

    Ok(())
}
