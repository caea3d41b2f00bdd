use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};

use crate::protocol::{HeartRateMeasurement, StatusEvent};

/// Connection lifecycle state of a coordinator.
///
/// Exactly one coordinator owns its current state; transitions are the only
/// mutation path. The heart rate coordinator uses the subset without the
/// discovery/subscription sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, no activity
    #[default]
    Disconnected,
    /// Scanning for a matching peripheral
    Scanning,
    /// Connection requested
    Connecting,
    /// Opening the transport link
    ConnectingTransport,
    /// Resolving the primary service and its characteristics
    DiscoveringServices,
    /// Subscribing to notifications
    Subscribing,
    /// Fully connected and subscribed
    Connected,
    /// Automatic reconnection in progress after an unsolicited disconnect
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ConnectingTransport => write!(f, "Connecting (transport)"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// One Indoor Bike Data notification, decoded.
///
/// Field presence is driven by the frame's flag word, not fixed per message:
/// a field is `None` when its flag bit was clear, never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// When the frame was decoded
    pub timestamp: SystemTime,
    /// Instantaneous speed in km/h
    pub speed_kmh: Option<f64>,
    /// Average speed in km/h
    pub avg_speed_kmh: Option<f64>,
    /// Instantaneous cadence in rpm
    pub cadence_rpm: Option<f64>,
    /// Average cadence in rpm
    pub avg_cadence_rpm: Option<f64>,
    /// Total distance in meters (24-bit on the wire)
    pub total_distance_m: Option<u32>,
    /// Resistance level, unitless signed value
    pub resistance_level: Option<i16>,
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Average power in watts
    pub avg_power_watts: Option<i16>,
    /// Total expended energy in kcal
    pub total_energy_kcal: Option<u16>,
    /// Energy rate in kcal per hour
    pub energy_per_hour_kcal: Option<u16>,
    /// Energy rate in kcal per minute
    pub energy_per_minute_kcal: Option<u8>,
    /// Heart rate in bpm
    pub heart_rate_bpm: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed session time in seconds
    pub elapsed_time_s: Option<u16>,
    /// Remaining session time in seconds
    pub remaining_time_s: Option<u16>,
}

impl TelemetrySample {
    /// Create an empty sample stamped now
    #[must_use]
    pub fn empty() -> Self {
        Self {
            timestamp: SystemTime::now(),
            speed_kmh: None,
            avg_speed_kmh: None,
            cadence_rpm: None,
            avg_cadence_rpm: None,
            total_distance_m: None,
            resistance_level: None,
            power_watts: None,
            avg_power_watts: None,
            total_energy_kcal: None,
            energy_per_hour_kcal: None,
            energy_per_minute_kcal: None,
            heart_rate_bpm: None,
            metabolic_equivalent: None,
            elapsed_time_s: None,
            remaining_time_s: None,
        }
    }
}

/// Fitness Machine Feature booleans (first 32-bit word of 0x2ACC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct MachineFeatures {
    /// Average speed measurement supported
    pub avg_speed: bool,
    /// Cadence measurement supported
    pub cadence: bool,
    /// Total distance measurement supported
    pub total_distance: bool,
    /// Inclination measurement supported
    pub inclination: bool,
    /// Elevation gain measurement supported
    pub elevation_gain: bool,
    /// Pace measurement supported
    pub pace: bool,
    /// Step count measurement supported
    pub step_count: bool,
    /// Resistance level measurement supported
    pub resistance_level: bool,
    /// Stride count measurement supported
    pub stride_count: bool,
    /// Expended energy measurement supported
    pub expended_energy: bool,
    /// Heart rate measurement supported
    pub heart_rate_measurement: bool,
    /// Metabolic equivalent measurement supported
    pub metabolic_equivalent: bool,
    /// Elapsed time measurement supported
    pub elapsed_time: bool,
    /// Remaining time measurement supported
    pub remaining_time: bool,
    /// Power measurement supported
    pub power_measurement: bool,
    /// Force on belt and power output measurement supported
    pub force_on_belt_and_power_output: bool,
    /// User data retention supported
    pub user_data_retention: bool,
}

/// Target Setting Feature booleans (second 32-bit word of 0x2ACC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct TargetFeatures {
    /// Speed target setting supported
    pub speed: bool,
    /// Inclination target setting supported
    pub inclination: bool,
    /// Resistance target setting supported
    pub resistance: bool,
    /// Power target setting supported
    pub power: bool,
    /// Heart rate target setting supported
    pub heart_rate: bool,
    /// Targeted expended energy configuration supported
    pub expended_energy: bool,
    /// Targeted step number configuration supported
    pub step_number: bool,
    /// Targeted stride number configuration supported
    pub stride_number: bool,
    /// Targeted distance configuration supported
    pub distance: bool,
    /// Targeted training time configuration supported
    pub training_time: bool,
    /// Targeted time in two heart rate zones supported
    pub time_in_two_hr_zones: bool,
    /// Targeted time in three heart rate zones supported
    pub time_in_three_hr_zones: bool,
    /// Targeted time in five heart rate zones supported
    pub time_in_five_hr_zones: bool,
    /// Indoor bike simulation parameters supported
    pub indoor_bike_simulation: bool,
    /// Wheel circumference configuration supported
    pub wheel_circumference: bool,
    /// Spin down control supported
    pub spin_down_control: bool,
    /// Targeted cadence configuration supported
    pub cadence: bool,
}

/// Capability record read once from the Fitness Machine Feature
/// characteristic at connection time. Immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Measurement capabilities
    pub machine: MachineFeatures,
    /// Target-setting capabilities
    pub targets: TargetFeatures,
}

/// Supported resistance level range (0x2AD6), fixed-point decoded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResistanceRange {
    /// Minimum resistance level
    pub minimum: f64,
    /// Maximum resistance level
    pub maximum: f64,
    /// Smallest settable increment
    pub increment: f64,
}

impl ResistanceRange {
    /// Clamp a requested level into this range
    #[must_use]
    pub fn clamp(&self, level: f64) -> f64 {
        level.clamp(self.minimum, self.maximum)
    }
}

/// Supported power range (0x2AD8) in watts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRange {
    /// Minimum target power in watts
    pub minimum: i16,
    /// Maximum target power in watts
    pub maximum: i16,
    /// Smallest settable increment in watts
    pub increment: u16,
}

/// Exponential backoff state for automatic reconnection.
///
/// Mutated only by the owning coordinator; reset to baseline on every
/// successful connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts made since the last successful connection
    pub attempt_count: u32,
    /// Delay to apply before the next attempt
    pub current_delay: Duration,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    backoff_multiplier: f64,
}

impl ReconnectPolicy {
    /// Create a policy with explicit parameters
    #[must_use]
    pub const fn new(
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            attempt_count: 0,
            current_delay: base_delay,
            base_delay,
            max_delay,
            max_attempts,
            backoff_multiplier,
        }
    }

    /// Maximum number of attempts before giving up
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once the attempt budget is spent
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Record an attempt and return the delay to wait before it.
    ///
    /// delay = min(base × multiplier^(attempt − 1), max)
    pub fn next_delay(&mut self) -> Duration {
        self.attempt_count += 1;
        let exponent = self.attempt_count.saturating_sub(1);
        let factor = self.backoff_multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let delay = self.base_delay.mul_f64(factor);
        self.current_delay = delay.min(self.max_delay);
        self.current_delay
    }

    /// Reset to baseline after a successful connection
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.current_delay = self.base_delay;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5, 2.0)
    }
}

/// Events emitted by the fitness machine coordinator.
///
/// Consumers receive these over an unbounded channel; this is the
/// callback surface of the client.
#[derive(Debug, Clone)]
pub enum FtmsEvent {
    /// The connection state machine transitioned
    StateChanged(ConnectionState),
    /// A device finished the full connect sequence
    Connected {
        /// Advertised device name
        name: String,
        /// Capability record, when the feature characteristic is present
        capabilities: Option<DeviceCapabilities>,
    },
    /// The device disconnected and no further reconnection will happen
    Disconnected,
    /// A decoded Indoor Bike Data frame
    Telemetry(TelemetrySample),
    /// A decoded Fitness Machine Status event
    Status(StatusEvent),
    /// A decoded Training Status byte
    TrainingStatus(u8),
    /// A fault the consumer should surface
    Error(String),
}

/// Events emitted by the heart rate coordinator
#[derive(Debug, Clone)]
pub enum HeartRateEvent {
    /// The connection state machine transitioned
    StateChanged(ConnectionState),
    /// A monitor finished connecting
    Connected {
        /// Advertised device name
        name: String,
        /// Body sensor location byte, when the characteristic is present
        sensor_location: Option<u8>,
    },
    /// The monitor disconnected and no further reconnection will happen
    Disconnected,
    /// A decoded heart rate measurement
    Measurement(HeartRateMeasurement),
    /// A fault the consumer should surface
    Error(String),
}

/// Outcome of a scan-and-connect request.
///
/// An empty scan is an expected outcome, not a fault, so callers can
/// distinguish "nothing to report" from real failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A device was found and connected
    Connected,
    /// The scan window elapsed without a matching device
    NoneFound,
}

/// A device discovered during scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Platform peripheral identifier, stable across sessions
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Signal strength at discovery time
    pub rssi: i16,
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
    /// Transport connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Minimum interval between telemetry events in milliseconds
    pub telemetry_debounce_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            telemetry_debounce_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let mut policy =
            ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(500), 5, 2.0);

        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        assert_eq!(policy.next_delay(), Duration::from_millis(200));
        assert_eq!(policy.next_delay(), Duration::from_millis(400));
        // capped at max_delay from here on
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
        assert_eq!(policy.next_delay(), Duration::from_millis(500));
        assert!(policy.exhausted());
    }

    #[test]
    fn test_backoff_reset() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempt_count, 2);

        policy.reset();
        assert_eq!(policy.attempt_count, 0);
        assert!(!policy.exhausted());
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_resistance_clamp() {
        let range = ResistanceRange {
            minimum: 0.0,
            maximum: 100.0,
            increment: 1.0,
        };
        assert_eq!(range.clamp(150.0), 100.0);
        assert_eq!(range.clamp(-5.0), 0.0);
        assert_eq!(range.clamp(42.5), 42.5);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(format!("{}", ConnectionState::Reconnecting), "Reconnecting");
    }

    #[test]
    fn test_empty_sample_has_no_fields() {
        let sample = TelemetrySample::empty();
        assert!(sample.speed_kmh.is_none());
        assert!(sample.power_watts.is_none());
        assert!(sample.heart_rate_bpm.is_none());
    }
}
