use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use strapkit::{
    ble::BleTransport,
    mock::{MockStrapConfig, MockTransport},
    storage::MemoryStorage,
    transport::Transport,
    HistoricalDataPacket, Result, Sdk,
};

/// Three hours of synthetic 1 Hz history, split into half-hour pages
fn synthetic_history() -> Vec<Vec<HistoricalDataPacket>> {
    let start_ms = 1_700_000_000_000u64;
    (0..6u64)
        .map(|page| {
            (0..1800u64)
                .map(|i| {
                    let second = page * 1800 + i;
                    HistoricalDataPacket {
                        timestamp_ms: start_ms + second * 1000,
                        heart_rate: u8::try_from(55 + (second / 60) % 30).unwrap_or(60),
                        rr: vec![1000],
                        unknown: 0,
                    }
                })
                .collect()
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("⌚ Strapkit Sync Example");

    let transport: Arc<dyn Transport> = if std::env::args().any(|arg| arg == "--ble") {
        info!("Using the Bluetooth adapter");
        Arc::new(BleTransport::new().await?)
    } else {
        info!("Using a simulated strap (pass --ble for real hardware)");
        Arc::new(
            MockTransport::new(MockStrapConfig {
                history_pages: synthetic_history(),
                ..MockStrapConfig::default()
            })
            .device("mock-strap", "WHOOP 4C0000000"),
        )
    };

    let sdk = Sdk::new(transport, Arc::new(MemoryStorage::new()));

    let devices = sdk.get_devices().await?;
    let Some(strap) = devices.first() else {
        warn!("No strap in range");
        return Ok(());
    };
    info!("Found {} ({})", strap.name, strap.id);

    let session = match sdk
        .connect_to_device(&strap.id, || warn!("Strap disconnected"))
        .await
    {
        Ok(session) => {
            info!("✅ Connected to: {}", session.name());
            session
        }
        Err(e) => {
            error!("❌ Failed to connect: {}", e);
            return Err(e);
        }
    };

    // Status
    info!("🔋 Battery: {:.1}%", session.battery_level().await?);
    info!("🕒 Strap clock: {}", session.clock().await?);
    let hello = session.hello_harvard().await?;
    info!("  Worn: {}  Charging: {}", hello.is_worn, hello.charging);
    info!("  Firmware: {}", session.version_info().await?);

    // A few seconds of real-time heart rate
    if session.toggle_realtime_hr().await? {
        sleep(Duration::from_secs(3)).await;
        session.toggle_realtime_hr().await?;
    }
    let readings = session.heart_rate_events().borrow().clone();
    info!("💓 {} real-time readings", readings.len());

    // History
    info!("📥 Downloading history...");
    let dumps = sdk.download_historical_data(&strap.id, 3600).await?;
    let samples: usize = dumps.iter().map(|dump| dump.data_dump.len()).sum();
    info!("✅ Saved {} dumps holding {} samples", dumps.len(), samples);

    let analysis = sdk
        .analyse_device_data(session.name(), None, None, true)
        .await?;
    info!("📊 Analysis:");
    info!("  1-min averages: {}", analysis.hr_avg_1min.len());
    info!("  5-min averages: {}", analysis.hr_avg_5min.len());
    if let Some(last) = analysis.hr_avg_5min.last() {
        info!("  Latest 5-min average: {:.1} bpm", last.heart_rate);
    }
    info!("  24h RHR points: {}", analysis.rhr_24h.len());

    sdk.destroy().await;
    info!("👋 Done");
    Ok(())
}
