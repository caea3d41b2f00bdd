use crate::{
    error::{FitlinkError, Result},
    types::{
        DeviceCapabilities, MachineFeatures, PowerRange, ResistanceRange, TargetFeatures,
        TelemetrySample,
    },
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Marker byte prefixing every control point response
pub const RESPONSE_MARKER: u8 = 0x80;

/// Maximum target power accepted before encoding, in watts
pub const MAX_TARGET_POWER_WATTS: i16 = 4000;

/// Control point opcodes (FTMS v1.0, Table 4.15)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Request control of the machine before any other command
    RequestControl = 0x00,
    /// Reset machine fields to defaults
    Reset = 0x01,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Set target inclination
    SetTargetInclination = 0x03,
    /// Set target resistance level
    SetTargetResistance = 0x04,
    /// Set target power
    SetTargetPower = 0x05,
    /// Set target heart rate
    SetTargetHeartRate = 0x06,
    /// Start or resume a session
    StartOrResume = 0x07,
    /// Stop or pause a session
    StopOrPause = 0x08,
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulation = 0x11,
    /// Start or ignore a spin down calibration
    SpinDownControl = 0x13,
    /// Set target cadence
    SetTargetCadence = 0x14,
}

impl OpCode {
    /// Convert from the wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x03 => Some(Self::SetTargetInclination),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x06 => Some(Self::SetTargetHeartRate),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            0x13 => Some(Self::SpinDownControl),
            0x14 => Some(Self::SetTargetCadence),
            _ => None,
        }
    }
}

/// Result codes carried inside a control point response (FTMS Table 4.24)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    /// The command was accepted
    Success = 0x01,
    /// The machine does not implement this opcode
    OpCodeNotSupported = 0x02,
    /// A parameter was out of the machine's accepted range
    InvalidParameter = 0x03,
    /// The machine failed to execute the command
    OperationFailed = 0x04,
    /// Control was not requested or was revoked
    ControlNotPermitted = 0x05,
}

impl ResultCode {
    /// Convert from the wire byte; reserved values collapse to
    /// `OperationFailed`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::OpCodeNotSupported,
            0x03 => Self::InvalidParameter,
            0x05 => Self::ControlNotPermitted,
            _ => Self::OperationFailed,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::OpCodeNotSupported => write!(f, "op code not supported"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::OperationFailed => write!(f, "operation failed"),
            Self::ControlNotPermitted => write!(f, "control not permitted"),
        }
    }
}

/// A decoded control point response: which request it answers and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Echoed opcode of the request being answered
    pub request_opcode: u8,
    /// Device verdict
    pub result: ResultCode,
}

/// Bounds-checked sequential reader over a notification frame.
///
/// The flag-driven formats make read order a correctness contract: each
/// flagged field consumes its fixed width at the running offset.
struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offset + n;
        if end > self.data.len() {
            return Err(FitlinkError::MalformedFrame {
                needed: end,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16_le(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u24_le(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    const fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Indoor Bike Data flag bits (FTMS 4.9.1)
mod bike_flags {
    /// Bit 0: "more data". Instantaneous speed is present when this is CLEAR
    pub const MORE_DATA: u16 = 1 << 0;
    pub const AVG_SPEED: u16 = 1 << 1;
    pub const CADENCE: u16 = 1 << 2;
    pub const AVG_CADENCE: u16 = 1 << 3;
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    pub const RESISTANCE: u16 = 1 << 5;
    pub const POWER: u16 = 1 << 6;
    pub const AVG_POWER: u16 = 1 << 7;
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    pub const HEART_RATE: u16 = 1 << 9;
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    pub const ELAPSED_TIME: u16 = 1 << 11;
    pub const REMAINING_TIME: u16 = 1 << 12;
}

/// Decode an Indoor Bike Data notification (0x2AD2).
///
/// Field presence is driven by the 16-bit flag word; fields are consumed in
/// the fixed order below with a running offset. A buffer shorter than its
/// flags declare fails with [`FitlinkError::MalformedFrame`] and yields no
/// partial sample.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] when the buffer is shorter than
/// the flagged fields require.
pub fn decode_indoor_bike_data(data: &[u8]) -> Result<TelemetrySample> {
    let mut reader = FrameReader::new(data);
    let flags = reader.u16_le()?;
    let mut sample = TelemetrySample::empty();

    if flags & bike_flags::MORE_DATA == 0 {
        sample.speed_kmh = Some(f64::from(reader.u16_le()?) / 100.0);
    }
    if flags & bike_flags::AVG_SPEED != 0 {
        sample.avg_speed_kmh = Some(f64::from(reader.u16_le()?) / 100.0);
    }
    if flags & bike_flags::CADENCE != 0 {
        sample.cadence_rpm = Some(f64::from(reader.u16_le()?) / 2.0);
    }
    if flags & bike_flags::AVG_CADENCE != 0 {
        sample.avg_cadence_rpm = Some(f64::from(reader.u16_le()?) / 2.0);
    }
    if flags & bike_flags::TOTAL_DISTANCE != 0 {
        sample.total_distance_m = Some(reader.u24_le()?);
    }
    if flags & bike_flags::RESISTANCE != 0 {
        sample.resistance_level = Some(reader.i16_le()?);
    }
    if flags & bike_flags::POWER != 0 {
        sample.power_watts = Some(reader.i16_le()?);
    }
    if flags & bike_flags::AVG_POWER != 0 {
        sample.avg_power_watts = Some(reader.i16_le()?);
    }
    if flags & bike_flags::EXPENDED_ENERGY != 0 {
        sample.total_energy_kcal = Some(reader.u16_le()?);
        sample.energy_per_hour_kcal = Some(reader.u16_le()?);
        sample.energy_per_minute_kcal = Some(reader.u8()?);
    }
    if flags & bike_flags::HEART_RATE != 0 {
        sample.heart_rate_bpm = Some(reader.u8()?);
    }
    if flags & bike_flags::METABOLIC_EQUIVALENT != 0 {
        sample.metabolic_equivalent = Some(f64::from(reader.u8()?) / 10.0);
    }
    if flags & bike_flags::ELAPSED_TIME != 0 {
        sample.elapsed_time_s = Some(reader.u16_le()?);
    }
    if flags & bike_flags::REMAINING_TIME != 0 {
        sample.remaining_time_s = Some(reader.u16_le()?);
    }

    Ok(sample)
}

/// Decode the Fitness Machine Feature characteristic (0x2ACC): two 32-bit
/// little-endian flag words expanded into named booleans.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] when fewer than 8 bytes are
/// available.
pub fn decode_capabilities(data: &[u8]) -> Result<DeviceCapabilities> {
    let mut reader = FrameReader::new(data);
    let machine = reader.u32_le()?;
    let targets = reader.u32_le()?;

    let bit = |word: u32, n: u32| word & (1 << n) != 0;

    Ok(DeviceCapabilities {
        machine: MachineFeatures {
            avg_speed: bit(machine, 0),
            cadence: bit(machine, 1),
            total_distance: bit(machine, 2),
            inclination: bit(machine, 3),
            elevation_gain: bit(machine, 4),
            pace: bit(machine, 5),
            step_count: bit(machine, 6),
            resistance_level: bit(machine, 7),
            stride_count: bit(machine, 8),
            expended_energy: bit(machine, 9),
            heart_rate_measurement: bit(machine, 10),
            metabolic_equivalent: bit(machine, 11),
            elapsed_time: bit(machine, 12),
            remaining_time: bit(machine, 13),
            power_measurement: bit(machine, 14),
            force_on_belt_and_power_output: bit(machine, 15),
            user_data_retention: bit(machine, 16),
        },
        targets: TargetFeatures {
            speed: bit(targets, 0),
            inclination: bit(targets, 1),
            resistance: bit(targets, 2),
            power: bit(targets, 3),
            heart_rate: bit(targets, 4),
            expended_energy: bit(targets, 5),
            step_number: bit(targets, 6),
            stride_number: bit(targets, 7),
            distance: bit(targets, 8),
            training_time: bit(targets, 9),
            time_in_two_hr_zones: bit(targets, 10),
            time_in_three_hr_zones: bit(targets, 11),
            time_in_five_hr_zones: bit(targets, 12),
            indoor_bike_simulation: bit(targets, 13),
            wheel_circumference: bit(targets, 14),
            spin_down_control: bit(targets, 15),
            cadence: bit(targets, 16),
        },
    })
}

/// Decode the Supported Resistance Level Range characteristic (0x2AD6):
/// signed 16-bit minimum/maximum and unsigned 16-bit increment, all ×0.1.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] on a buffer shorter than 6 bytes.
pub fn decode_resistance_range(data: &[u8]) -> Result<ResistanceRange> {
    let mut reader = FrameReader::new(data);
    Ok(ResistanceRange {
        minimum: f64::from(reader.i16_le()?) / 10.0,
        maximum: f64::from(reader.i16_le()?) / 10.0,
        increment: f64::from(reader.u16_le()?) / 10.0,
    })
}

/// Decode the Supported Power Range characteristic (0x2AD8): signed 16-bit
/// minimum/maximum and unsigned 16-bit increment, unscaled watts.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] on a buffer shorter than 6 bytes.
pub fn decode_power_range(data: &[u8]) -> Result<PowerRange> {
    let mut reader = FrameReader::new(data);
    Ok(PowerRange {
        minimum: reader.i16_le()?,
        maximum: reader.i16_le()?,
        increment: reader.u16_le()?,
    })
}

/// Machine status events (0x2ADA). Three of them carry a scaled numeric
/// payload; unknown opcodes survive as `Unknown` so a newer machine cannot
/// break the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    /// The machine reset itself
    Reset,
    /// Stopped or paused by the user
    StoppedOrPausedByUser,
    /// Stopped by the safety key
    StoppedBySafetyKey,
    /// Started or resumed by the user
    StartedOrResumedByUser,
    /// The target speed changed
    TargetSpeedChanged {
        /// New target speed in km/h
        speed_kmh: f64,
    },
    /// The target inclination changed
    TargetInclinationChanged,
    /// The target resistance level changed
    TargetResistanceChanged {
        /// New target resistance level
        level: f64,
    },
    /// The target power changed
    TargetPowerChanged {
        /// New target power in watts
        watts: i16,
    },
    /// The target heart rate changed
    TargetHeartRateChanged,
    /// The targeted expended energy changed
    TargetedExpendedEnergyChanged,
    /// The targeted number of steps changed
    TargetedStepsChanged,
    /// The targeted number of strides changed
    TargetedStridesChanged,
    /// The targeted distance changed
    TargetedDistanceChanged,
    /// The targeted training time changed
    TargetedTrainingTimeChanged,
    /// The targeted time in two heart rate zones changed
    TargetedTimeInTwoHrZonesChanged,
    /// The targeted time in three heart rate zones changed
    TargetedTimeInThreeHrZonesChanged,
    /// The targeted time in five heart rate zones changed
    TargetedTimeInFiveHrZonesChanged,
    /// Indoor bike simulation parameters changed
    IndoorBikeSimulationChanged,
    /// The wheel circumference changed
    WheelCircumferenceChanged,
    /// Spin down calibration status changed
    SpinDownStatus,
    /// The machine revoked control
    ControlPermissionLost,
    /// An opcode this client does not know
    Unknown(u8),
}

/// Decode a Fitness Machine Status notification (0x2ADA).
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] on an empty buffer or when a
/// payload-carrying event is shorter than its payload.
pub fn decode_status(data: &[u8]) -> Result<StatusEvent> {
    let mut reader = FrameReader::new(data);
    let event = match reader.u8()? {
        0x01 => StatusEvent::Reset,
        0x02 => StatusEvent::StoppedOrPausedByUser,
        0x03 => StatusEvent::StoppedBySafetyKey,
        0x04 => StatusEvent::StartedOrResumedByUser,
        0x05 => StatusEvent::TargetSpeedChanged {
            speed_kmh: f64::from(reader.u16_le()?) / 100.0,
        },
        0x06 => StatusEvent::TargetInclinationChanged,
        0x07 => StatusEvent::TargetResistanceChanged {
            level: f64::from(reader.i16_le()?) / 10.0,
        },
        0x08 => StatusEvent::TargetPowerChanged {
            watts: reader.i16_le()?,
        },
        0x09 => StatusEvent::TargetHeartRateChanged,
        0x0A => StatusEvent::TargetedExpendedEnergyChanged,
        0x0B => StatusEvent::TargetedStepsChanged,
        0x0C => StatusEvent::TargetedStridesChanged,
        0x0D => StatusEvent::TargetedDistanceChanged,
        0x0E => StatusEvent::TargetedTrainingTimeChanged,
        0x0F => StatusEvent::TargetedTimeInTwoHrZonesChanged,
        0x10 => StatusEvent::TargetedTimeInThreeHrZonesChanged,
        0x11 => StatusEvent::TargetedTimeInFiveHrZonesChanged,
        0x12 => StatusEvent::IndoorBikeSimulationChanged,
        0x13 => StatusEvent::WheelCircumferenceChanged,
        0x14 => StatusEvent::SpinDownStatus,
        0xFF => StatusEvent::ControlPermissionLost,
        other => StatusEvent::Unknown(other),
    };
    Ok(event)
}

/// Decode a control point indication.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] when fewer than 3 bytes arrive,
/// or [`FitlinkError::UnexpectedResponse`] when the first byte is not the
/// `0x80` response marker.
pub fn decode_control_point_response(data: &[u8]) -> Result<ControlPointResponse> {
    if data.len() < 3 {
        return Err(FitlinkError::MalformedFrame {
            needed: 3,
            got: data.len(),
        });
    }
    if data[0] != RESPONSE_MARKER {
        return Err(FitlinkError::UnexpectedResponse {
            expected: RESPONSE_MARKER,
            actual: data[0],
        });
    }
    Ok(ControlPointResponse {
        request_opcode: data[1],
        result: ResultCode::from_u8(data[2]),
    })
}

/// A control point command with its physical-unit parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Request control of the machine
    RequestControl,
    /// Reset the machine to defaults
    Reset,
    /// Set target speed in km/h
    SetTargetSpeed {
        /// Target speed in km/h
        kmh: f64,
    },
    /// Set target inclination in percent
    SetTargetInclination {
        /// Target grade in percent
        percent: f64,
    },
    /// Set target resistance level
    SetTargetResistance {
        /// Target resistance level, clamped to the device range
        level: f64,
    },
    /// Set target power in watts
    SetTargetPower {
        /// Target power in watts
        watts: i16,
    },
    /// Set target heart rate in bpm
    SetTargetHeartRate {
        /// Target heart rate in bpm
        bpm: u8,
    },
    /// Start or resume the session
    StartOrResume,
    /// Stop or pause the session
    StopOrPause {
        /// True to pause (resumable), false to stop
        pause: bool,
    },
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulation {
        /// Headwind speed in m/s (negative is tailwind)
        wind_speed_mps: f64,
        /// Grade in percent
        grade_percent: f64,
        /// Rolling resistance coefficient
        crr: f64,
        /// Wind resistance coefficient in kg/m
        cw: f64,
    },
    /// Start or ignore a spin down calibration
    SpinDownControl {
        /// True to start, false to ignore the machine's request
        start: bool,
    },
    /// Set target cadence in rpm
    SetTargetCadence {
        /// Target cadence in rpm
        rpm: f64,
    },
}

impl Command {
    /// Wire opcode for this command
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        match self {
            Self::RequestControl => OpCode::RequestControl,
            Self::Reset => OpCode::Reset,
            Self::SetTargetSpeed { .. } => OpCode::SetTargetSpeed,
            Self::SetTargetInclination { .. } => OpCode::SetTargetInclination,
            Self::SetTargetResistance { .. } => OpCode::SetTargetResistance,
            Self::SetTargetPower { .. } => OpCode::SetTargetPower,
            Self::SetTargetHeartRate { .. } => OpCode::SetTargetHeartRate,
            Self::StartOrResume => OpCode::StartOrResume,
            Self::StopOrPause { .. } => OpCode::StopOrPause,
            Self::SetIndoorBikeSimulation { .. } => OpCode::SetIndoorBikeSimulation,
            Self::SpinDownControl { .. } => OpCode::SpinDownControl,
            Self::SetTargetCadence { .. } => OpCode::SetTargetCadence,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn scaled_i16(value: f64, scale: f64, min: f64, max: f64) -> i16 {
    (value.clamp(min, max) * scale).round() as i16
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_u16(value: f64, scale: f64, min: f64, max: f64) -> u16 {
    (value.clamp(min, max) * scale).round() as u16
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_u8(value: f64, scale: f64, min: f64, max: f64) -> u8 {
    (value.clamp(min, max) * scale).round() as u8
}

/// Encode a command for the control point (0x2AD9).
///
/// Every numeric parameter is clamped to its physical range before
/// fixed-point scaling. Resistance is clamped to the device's advertised
/// range when one was read, otherwise to 0–100; power is clamped to
/// 0–[`MAX_TARGET_POWER_WATTS`].
#[must_use]
pub fn encode_command(command: &Command, resistance_range: Option<&ResistanceRange>) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(command.opcode() as u8);

    match *command {
        Command::RequestControl | Command::Reset | Command::StartOrResume => {}
        Command::SetTargetSpeed { kmh } => {
            // 0.01 km/h resolution
            buf.put_u16_le(scaled_u16(kmh, 100.0, 0.0, 655.35));
        }
        Command::SetTargetInclination { percent } => {
            // 0.1 % resolution
            buf.put_i16_le(scaled_i16(percent, 10.0, -100.0, 100.0));
        }
        Command::SetTargetResistance { level } => {
            let clamped = resistance_range
                .map_or_else(|| level.clamp(0.0, 100.0), |range| range.clamp(level));
            // 0.1 resolution
            buf.put_i16_le(scaled_i16(clamped, 10.0, f64::from(i16::MIN), f64::from(i16::MAX)));
        }
        Command::SetTargetPower { watts } => {
            buf.put_i16_le(watts.clamp(0, MAX_TARGET_POWER_WATTS));
        }
        Command::SetTargetHeartRate { bpm } => {
            buf.put_u8(bpm);
        }
        Command::StopOrPause { pause } => {
            buf.put_u8(if pause { 0x02 } else { 0x01 });
        }
        Command::SetIndoorBikeSimulation {
            wind_speed_mps,
            grade_percent,
            crr,
            cw,
        } => {
            buf.put_i16_le(scaled_i16(wind_speed_mps, 1000.0, -32.0, 32.0));
            buf.put_i16_le(scaled_i16(grade_percent, 100.0, -100.0, 100.0));
            buf.put_u8(scaled_u8(crr, 10_000.0, 0.0, 0.0255));
            buf.put_u8(scaled_u8(cw, 100.0, 0.0, 2.55));
        }
        Command::SpinDownControl { start } => {
            buf.put_u8(if start { 0x01 } else { 0x02 });
        }
        Command::SetTargetCadence { rpm } => {
            // 0.5 rpm resolution
            buf.put_u16_le(scaled_u16(rpm, 2.0, 0.0, 300.0));
        }
    }

    buf.freeze()
}

/// Heart Rate Measurement flag bits (HRS 3.1)
mod hr_flags {
    pub const HR_16_BIT: u8 = 1 << 0;
    pub const CONTACT_DETECTED: u8 = 1 << 1;
    pub const CONTACT_SUPPORTED: u8 = 1 << 2;
    pub const ENERGY_EXPENDED: u8 = 1 << 3;
    pub const RR_INTERVALS: u8 = 1 << 4;
}

/// One decoded Heart Rate Measurement notification (0x2A37)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    /// When the frame was decoded
    pub timestamp: SystemTime,
    /// Heart rate in bpm
    pub heart_rate_bpm: u16,
    /// Skin contact detection, when the sensor reports the feature
    pub sensor_contact: Option<bool>,
    /// Accumulated energy expended in kJ
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in milliseconds, oldest first
    pub rr_intervals_ms: Vec<f64>,
}

/// Decode a Heart Rate Measurement notification.
///
/// The leading flag byte selects an 8- or 16-bit heart rate value, an
/// optional sensor contact pair, an optional energy expended field, and a
/// trailing list of RR intervals consuming the remainder of the buffer.
///
/// # Errors
///
/// Returns [`FitlinkError::MalformedFrame`] when the buffer is shorter than
/// its flags declare.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement> {
    let mut reader = FrameReader::new(data);
    let flags = reader.u8()?;

    let heart_rate_bpm = if flags & hr_flags::HR_16_BIT != 0 {
        reader.u16_le()?
    } else {
        u16::from(reader.u8()?)
    };

    let sensor_contact = if flags & hr_flags::CONTACT_SUPPORTED != 0 {
        Some(flags & hr_flags::CONTACT_DETECTED != 0)
    } else {
        None
    };

    let energy_expended_kj = if flags & hr_flags::ENERGY_EXPENDED != 0 {
        Some(reader.u16_le()?)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    if flags & hr_flags::RR_INTERVALS != 0 {
        while reader.remaining() >= 2 {
            // 1/1024 s units
            rr_intervals_ms.push(f64::from(reader.u16_le()?) * 1000.0 / 1024.0);
        }
    }

    Ok(HeartRateMeasurement {
        timestamp: SystemTime::now(),
        heart_rate_bpm,
        sensor_contact,
        energy_expended_kj,
        rr_intervals_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bike_data_offsets_and_scales() {
        // flags 0x0044: bit 0 clear (speed present), bits 2 and 6 set
        let frame = [0x44, 0x00, 0xC8, 0x00, 0x64, 0x00, 0x2C, 0x01];
        let sample = decode_indoor_bike_data(&frame).unwrap();

        assert_eq!(sample.speed_kmh, Some(2.00));
        assert_eq!(sample.cadence_rpm, Some(50.0));
        assert_eq!(sample.power_watts, Some(300));
        assert!(sample.avg_speed_kmh.is_none());
        assert!(sample.heart_rate_bpm.is_none());
    }

    #[test]
    fn test_bike_data_short_buffer_is_malformed() {
        // same flags, but the power field is missing
        let frame = [0x44, 0x00, 0xC8, 0x00, 0x2C, 0x01];
        let err = decode_indoor_bike_data(&frame).unwrap_err();
        assert!(matches!(err, FitlinkError::MalformedFrame { needed: 8, got: 6 }));
    }

    #[test]
    fn test_bike_data_speed_suppressed_by_more_data() {
        // bit 0 set: no speed field, only heart rate (bit 9)
        let frame = [0x01, 0x02, 0x9B];
        let sample = decode_indoor_bike_data(&frame).unwrap();
        assert!(sample.speed_kmh.is_none());
        assert_eq!(sample.heart_rate_bpm, Some(155));
    }

    #[test]
    fn test_bike_data_round_trip_of_flagged_fields() {
        // hand-built frame exercising distance, energy triple and times
        let frame = [
            0x11, 0x19, // flags: more-data, distance, energy, elapsed, remaining
            0x10, 0x27, 0x00, // distance 10000 m
            0xE8, 0x03, // total energy 1000 kcal
            0x2C, 0x01, // per hour 300
            0x05, // per minute 5
            0x58, 0x02, // elapsed 600 s
            0x2C, 0x01, // remaining 300 s
        ];
        let sample = decode_indoor_bike_data(&frame).unwrap();
        assert!(sample.speed_kmh.is_none());
        assert_eq!(sample.total_distance_m, Some(10_000));
        assert_eq!(sample.total_energy_kcal, Some(1000));
        assert_eq!(sample.energy_per_hour_kcal, Some(300));
        assert_eq!(sample.energy_per_minute_kcal, Some(5));
        assert_eq!(sample.elapsed_time_s, Some(600));
        assert_eq!(sample.remaining_time_s, Some(300));
    }

    /// Append one deterministic value per flagged field, mirroring the
    /// characteristic's field order.
    fn build_bike_frame(flags: u16) -> Vec<u8> {
        let mut frame = flags.to_le_bytes().to_vec();
        if flags & bike_flags::MORE_DATA == 0 {
            frame.extend_from_slice(&1234u16.to_le_bytes()); // 12.34 km/h
        }
        if flags & bike_flags::AVG_SPEED != 0 {
            frame.extend_from_slice(&1100u16.to_le_bytes()); // 11.00 km/h
        }
        if flags & bike_flags::CADENCE != 0 {
            frame.extend_from_slice(&180u16.to_le_bytes()); // 90.0 rpm
        }
        if flags & bike_flags::AVG_CADENCE != 0 {
            frame.extend_from_slice(&170u16.to_le_bytes()); // 85.0 rpm
        }
        if flags & bike_flags::TOTAL_DISTANCE != 0 {
            frame.extend_from_slice(&[0x10, 0x27, 0x00]); // 10000 m
        }
        if flags & bike_flags::RESISTANCE != 0 {
            frame.extend_from_slice(&(-3i16).to_le_bytes());
        }
        if flags & bike_flags::POWER != 0 {
            frame.extend_from_slice(&250i16.to_le_bytes());
        }
        if flags & bike_flags::AVG_POWER != 0 {
            frame.extend_from_slice(&240i16.to_le_bytes());
        }
        if flags & bike_flags::EXPENDED_ENERGY != 0 {
            frame.extend_from_slice(&300u16.to_le_bytes());
            frame.extend_from_slice(&600u16.to_le_bytes());
            frame.push(10);
        }
        if flags & bike_flags::HEART_RATE != 0 {
            frame.push(150);
        }
        if flags & bike_flags::METABOLIC_EQUIVALENT != 0 {
            frame.push(85); // 8.5
        }
        if flags & bike_flags::ELAPSED_TIME != 0 {
            frame.extend_from_slice(&3600u16.to_le_bytes());
        }
        if flags & bike_flags::REMAINING_TIME != 0 {
            frame.extend_from_slice(&1800u16.to_le_bytes());
        }
        frame
    }

    #[test]
    fn test_bike_data_each_flag_bit_alone() {
        for bit in 1..=12u16 {
            let flag = 1u16 << bit;
            let frame = build_bike_frame(bike_flags::MORE_DATA | flag);
            let sample = decode_indoor_bike_data(&frame).unwrap();
            assert!(sample.speed_kmh.is_none(), "bit {bit}");
            match flag {
                bike_flags::AVG_SPEED => assert_eq!(sample.avg_speed_kmh, Some(11.0)),
                bike_flags::CADENCE => assert_eq!(sample.cadence_rpm, Some(90.0)),
                bike_flags::AVG_CADENCE => assert_eq!(sample.avg_cadence_rpm, Some(85.0)),
                bike_flags::TOTAL_DISTANCE => assert_eq!(sample.total_distance_m, Some(10_000)),
                bike_flags::RESISTANCE => assert_eq!(sample.resistance_level, Some(-3)),
                bike_flags::POWER => assert_eq!(sample.power_watts, Some(250)),
                bike_flags::AVG_POWER => assert_eq!(sample.avg_power_watts, Some(240)),
                bike_flags::EXPENDED_ENERGY => {
                    assert_eq!(sample.total_energy_kcal, Some(300));
                    assert_eq!(sample.energy_per_hour_kcal, Some(600));
                    assert_eq!(sample.energy_per_minute_kcal, Some(10));
                }
                bike_flags::HEART_RATE => assert_eq!(sample.heart_rate_bpm, Some(150)),
                bike_flags::METABOLIC_EQUIVALENT => {
                    assert_eq!(sample.metabolic_equivalent, Some(8.5));
                }
                bike_flags::ELAPSED_TIME => assert_eq!(sample.elapsed_time_s, Some(3600)),
                bike_flags::REMAINING_TIME => assert_eq!(sample.remaining_time_s, Some(1800)),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_bike_data_all_fields_at_once() {
        // bits 1..=12 set, bit 0 clear so speed is present too
        let flags = 0b0001_1111_1111_1110;
        let frame = build_bike_frame(flags);
        let sample = decode_indoor_bike_data(&frame).unwrap();

        assert_eq!(sample.speed_kmh, Some(12.34));
        assert_eq!(sample.avg_speed_kmh, Some(11.0));
        assert_eq!(sample.cadence_rpm, Some(90.0));
        assert_eq!(sample.avg_cadence_rpm, Some(85.0));
        assert_eq!(sample.total_distance_m, Some(10_000));
        assert_eq!(sample.resistance_level, Some(-3));
        assert_eq!(sample.power_watts, Some(250));
        assert_eq!(sample.avg_power_watts, Some(240));
        assert_eq!(sample.total_energy_kcal, Some(300));
        assert_eq!(sample.energy_per_hour_kcal, Some(600));
        assert_eq!(sample.energy_per_minute_kcal, Some(10));
        assert_eq!(sample.heart_rate_bpm, Some(150));
        assert_eq!(sample.metabolic_equivalent, Some(8.5));
        assert_eq!(sample.elapsed_time_s, Some(3600));
        assert_eq!(sample.remaining_time_s, Some(1800));

        // one byte short of what the flags declare: rejected whole
        let err = decode_indoor_bike_data(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, FitlinkError::MalformedFrame { .. }));
    }

    #[test]
    fn test_capabilities_decode() {
        // machine: cadence (bit 1) + power (bit 14); targets: resistance (2),
        // power (3), simulation (13)
        let machine: u32 = (1 << 1) | (1 << 14);
        let targets: u32 = (1 << 2) | (1 << 3) | (1 << 13);
        let mut data = machine.to_le_bytes().to_vec();
        data.extend_from_slice(&targets.to_le_bytes());

        let caps = decode_capabilities(&data).unwrap();
        assert!(caps.machine.cadence);
        assert!(caps.machine.power_measurement);
        assert!(!caps.machine.total_distance);
        assert!(caps.targets.resistance);
        assert!(caps.targets.power);
        assert!(caps.targets.indoor_bike_simulation);
        assert!(!caps.targets.heart_rate);
    }

    #[test]
    fn test_capabilities_short_buffer() {
        assert!(decode_capabilities(&[0x00; 7]).is_err());
    }

    #[test]
    fn test_resistance_range_decode() {
        // min 0.0, max 100.0, step 0.5
        let data = [0x00, 0x00, 0xE8, 0x03, 0x05, 0x00];
        let range = decode_resistance_range(&data).unwrap();
        assert_eq!(range.minimum, 0.0);
        assert_eq!(range.maximum, 100.0);
        assert_eq!(range.increment, 0.5);
    }

    #[test]
    fn test_power_range_decode() {
        // min 0 W, max 2000 W, step 1 W
        let data = [0x00, 0x00, 0xD0, 0x07, 0x01, 0x00];
        let range = decode_power_range(&data).unwrap();
        assert_eq!(range.minimum, 0);
        assert_eq!(range.maximum, 2000);
        assert_eq!(range.increment, 1);
    }

    #[test]
    fn test_status_events() {
        assert_eq!(decode_status(&[0x04]).unwrap(), StatusEvent::StartedOrResumedByUser);
        assert_eq!(
            decode_status(&[0x08, 0x2C, 0x01]).unwrap(),
            StatusEvent::TargetPowerChanged { watts: 300 }
        );
        assert_eq!(
            decode_status(&[0x05, 0xD0, 0x07]).unwrap(),
            StatusEvent::TargetSpeedChanged { speed_kmh: 20.0 }
        );
        assert_eq!(
            decode_status(&[0x07, 0xF4, 0x01]).unwrap(),
            StatusEvent::TargetResistanceChanged { level: 50.0 }
        );
        assert_eq!(decode_status(&[0xFF]).unwrap(), StatusEvent::ControlPermissionLost);
        assert_eq!(decode_status(&[0x42]).unwrap(), StatusEvent::Unknown(0x42));
        assert!(decode_status(&[]).is_err());
        // payload-carrying event without its payload
        assert!(decode_status(&[0x08]).is_err());
    }

    #[test]
    fn test_control_point_response_decode() {
        let response = decode_control_point_response(&[0x80, 0x04, 0x01]).unwrap();
        assert_eq!(response.request_opcode, 0x04);
        assert_eq!(response.result, ResultCode::Success);

        assert!(decode_control_point_response(&[0x80, 0x04]).is_err());
        // first byte is not the response marker
        assert!(decode_control_point_response(&[0x04, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_encode_resistance_clamps_to_device_range() {
        let range = ResistanceRange {
            minimum: 0.0,
            maximum: 100.0,
            increment: 1.0,
        };
        let bytes = encode_command(
            &Command::SetTargetResistance { level: 150.0 },
            Some(&range),
        );
        // clamped to 100, encoded x10 = 1000
        assert_eq!(&bytes[..], &[0x04, 0xE8, 0x03]);
    }

    #[test]
    fn test_encode_resistance_without_range_clamps_to_percent() {
        let bytes = encode_command(&Command::SetTargetResistance { level: 150.0 }, None);
        assert_eq!(&bytes[..], &[0x04, 0xE8, 0x03]);
    }

    #[test]
    fn test_encode_power_clamp() {
        let bytes = encode_command(&Command::SetTargetPower { watts: 5000 }, None);
        assert_eq!(&bytes[..], &[0x05, 0xA0, 0x0F]); // 4000

        let bytes = encode_command(&Command::SetTargetPower { watts: -50 }, None);
        assert_eq!(&bytes[..], &[0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_stop_and_pause_parameters() {
        assert_eq!(
            &encode_command(&Command::StopOrPause { pause: false }, None)[..],
            &[0x08, 0x01]
        );
        assert_eq!(
            &encode_command(&Command::StopOrPause { pause: true }, None)[..],
            &[0x08, 0x02]
        );
    }

    #[test]
    fn test_encode_simulation_scaling() {
        let bytes = encode_command(
            &Command::SetIndoorBikeSimulation {
                wind_speed_mps: 2.5,
                grade_percent: 4.5,
                crr: 0.004,
                cw: 0.51,
            },
            None,
        );
        assert_eq!(bytes[0], 0x11);
        assert_eq!(&bytes[1..3], &2500i16.to_le_bytes()); // x1000
        assert_eq!(&bytes[3..5], &450i16.to_le_bytes()); // x100
        assert_eq!(bytes[5], 40); // x10000
        assert_eq!(bytes[6], 51); // x100
    }

    #[test]
    fn test_encode_parameterless_commands() {
        assert_eq!(&encode_command(&Command::RequestControl, None)[..], &[0x00]);
        assert_eq!(&encode_command(&Command::Reset, None)[..], &[0x01]);
        assert_eq!(&encode_command(&Command::StartOrResume, None)[..], &[0x07]);
    }

    #[test]
    fn test_heart_rate_8_bit() {
        // flags 0x10: RR bit set but no RR data follows, 8-bit value
        let measurement = decode_heart_rate(&[0x10, 0x4B]).unwrap();
        assert_eq!(measurement.heart_rate_bpm, 75);
        assert!(measurement.sensor_contact.is_none());
        assert!(measurement.energy_expended_kj.is_none());
        assert!(measurement.rr_intervals_ms.is_empty());
    }

    #[test]
    fn test_heart_rate_16_bit_with_rr() {
        // 16-bit HR, contact supported + detected, energy, two RR intervals
        let data = [
            0x1F, // flags
            0xB4, 0x00, // HR 180
            0x64, 0x00, // energy 100
            0x00, 0x04, // RR 1024 -> 1000 ms
            0x00, 0x02, // RR 512 -> 500 ms
        ];
        let measurement = decode_heart_rate(&data).unwrap();
        assert_eq!(measurement.heart_rate_bpm, 180);
        assert_eq!(measurement.sensor_contact, Some(true));
        assert_eq!(measurement.energy_expended_kj, Some(100));
        assert_eq!(measurement.rr_intervals_ms, vec![1000.0, 500.0]);
    }

    #[test]
    fn test_heart_rate_contact_supported_not_detected() {
        let measurement = decode_heart_rate(&[0x04, 0x48]).unwrap();
        assert_eq!(measurement.heart_rate_bpm, 72);
        assert_eq!(measurement.sensor_contact, Some(false));
    }

    #[test]
    fn test_heart_rate_short_buffer() {
        // 16-bit flag but only one value byte
        assert!(decode_heart_rate(&[0x01, 0x4B]).is_err());
        assert!(decode_heart_rate(&[]).is_err());
    }

    #[test]
    fn test_opcode_round_trip() {
        for byte in [0x00, 0x01, 0x04, 0x05, 0x07, 0x08, 0x11, 0x13, 0x14] {
            let opcode = OpCode::from_u8(byte).unwrap();
            assert_eq!(opcode as u8, byte);
        }
        assert!(OpCode::from_u8(0x80).is_none());
        assert!(OpCode::from_u8(0x42).is_none());
    }
}
