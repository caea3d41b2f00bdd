#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Fitlink
//!
//! A Rust client for Bluetooth Low Energy fitness machines speaking the
//! standard Fitness Machine Service (FTMS), with a companion client for
//! heart rate straps.
//!
//! The library covers the full lifecycle of a trainer session:
//!
//! - **Discovery and connection**: scan for FTMS devices, connect with a
//!   phased state machine, and remember the device for silent reconnects on
//!   the next launch
//! - **Telemetry**: flag-driven decoding of Indoor Bike Data frames
//!   (speed, cadence, power, heart rate, energy, timers), debounced for
//!   consumers
//! - **Control**: a priority command queue that serializes control point
//!   writes, correlates each indication back to its command, and adapts its
//!   timeouts to the device's observed latency
//! - **Resilience**: automatic reconnection with exponential backoff after
//!   unsolicited disconnects
//!
//! Everything observable arrives on an event channel, so applications stay
//! free of callback plumbing.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fitlink::{FtmsClient, FtmsEvent, MemoryDeviceCache, ScanOutcome};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Arc::new(MemoryDeviceCache::default());
//!     let (client, mut events) = FtmsClient::new(cache).await?;
//!
//!     match client.scan_and_connect().await? {
//!         ScanOutcome::NoneFound => println!("no trainer in range"),
//!         ScanOutcome::Connected => {
//!             client.set_target_resistance(40.0).await?;
//!
//!             while let Some(event) = events.recv().await {
//!                 match event {
//!                     FtmsEvent::Telemetry(sample) => {
//!                         println!("{:?} W at {:?} rpm", sample.power_watts, sample.cadence_rpm);
//!                     }
//!                     FtmsEvent::Disconnected => break,
//!                     _ => {}
//!                 }
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport: scanning, characteristic resolution,
/// notification routing
pub mod ble;
/// Remembered-device storage for silent reconnects
pub mod cache;
/// Fitness machine coordinator and connection state machine
pub mod device;
/// Error types and classification
pub mod error;
/// Heart rate monitor coordinator
pub mod heart_rate;
/// FTMS wire codec: telemetry, commands, responses, status events
pub mod protocol;
/// Priority command queue with response correlation
pub mod queue;
/// Shared data types and events
pub mod types;

pub use cache::{CachedDeviceRef, DeviceCache, FileDeviceCache, MemoryDeviceCache, PeripheralKind};
pub use device::FtmsClient;
pub use error::{FitlinkError, Result, TransportKind};
pub use heart_rate::HeartRateMonitor;
pub use protocol::{
    Command, ControlPointResponse, HeartRateMeasurement, OpCode, ResultCode, StatusEvent,
};
pub use queue::{CommandPriority, CommandQueue, ControlChannel, QueueConfig, QueueStats};
pub use types::{
    ConnectionParams, ConnectionState, DeviceCapabilities, DiscoveredDevice, FtmsEvent,
    HeartRateEvent, MachineFeatures, PowerRange, ReconnectPolicy, ResistanceRange, ScanOutcome,
    TargetFeatures, TelemetrySample,
};

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service (0x1826)
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid = uuid_from_u16(0x1826);

/// Fitness Machine Feature characteristic (0x2ACC), read
pub const FITNESS_MACHINE_FEATURE_UUID: Uuid = uuid_from_u16(0x2ACC);

/// Indoor Bike Data characteristic (0x2AD2), notify
pub const INDOOR_BIKE_DATA_UUID: Uuid = uuid_from_u16(0x2AD2);

/// Training Status characteristic (0x2AD3), read and notify
pub const TRAINING_STATUS_UUID: Uuid = uuid_from_u16(0x2AD3);

/// Supported Resistance Level Range characteristic (0x2AD6), read
pub const SUPPORTED_RESISTANCE_RANGE_UUID: Uuid = uuid_from_u16(0x2AD6);

/// Supported Power Range characteristic (0x2AD8), read
pub const SUPPORTED_POWER_RANGE_UUID: Uuid = uuid_from_u16(0x2AD8);

/// Fitness Machine Control Point characteristic (0x2AD9), write and
/// indicate
pub const CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2AD9);

/// Fitness Machine Status characteristic (0x2ADA), notify
pub const MACHINE_STATUS_UUID: Uuid = uuid_from_u16(0x2ADA);

/// Heart Rate Service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);

/// Heart Rate Measurement characteristic (0x2A37), notify
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);

/// Body Sensor Location characteristic (0x2A38), read
pub const BODY_SENSOR_LOCATION_UUID: Uuid = uuid_from_u16(0x2A38);
