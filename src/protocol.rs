//! Wire encoders and decoders for the fitness characteristics.
//!
//! All multi-byte fields are little-endian. The decoders parse payloads the
//! way a receiving app does and exist for tests and monitoring tools.

use crate::{
    counter::{event_time, CRANK_TICKS_PER_SECOND},
    error::{Result, ZwackError},
    types::{ControlOpcode, DomainEvent, PowerRange, ResultCode, SensorReading, SimulationParameters},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use uuid::Uuid;

/// Build a full UUID from a 16-bit Bluetooth SIG alias
///
/// The alias is placed over the Bluetooth base UUID
/// `00000000-0000-1000-8000-00805F9B34FB`.
#[must_use]
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb_u128)
}

/// Control point response marker, first byte of every indicated response
pub const RESPONSE_CODE: u8 = 0x80;

/// Size of a control point response
pub const RESPONSE_SIZE: usize = 3;

/// Cycling Power Measurement flag: wheel revolution data present
pub const CPM_WHEEL_REVOLUTION_DATA_PRESENT: u16 = 1 << 4;

/// Cycling Power Measurement flag: crank revolution data present
pub const CPM_CRANK_REVOLUTION_DATA_PRESENT: u16 = 1 << 5;

/// Indoor Bike Data flag: more data follows in another notification
///
/// When clear, the instantaneous speed field is present.
pub const IBD_MORE_DATA: u16 = 1 << 0;

/// Indoor Bike Data flag: instantaneous cadence present
pub const IBD_INSTANTANEOUS_CADENCE_PRESENT: u16 = 1 << 2;

/// Indoor Bike Data flag: instantaneous power present
pub const IBD_INSTANTANEOUS_POWER_PRESENT: u16 = 1 << 6;

/// Fitness machine feature: cadence supported
pub const FEATURE_CADENCE_SUPPORTED: u32 = 1 << 1;

/// Fitness machine feature: power measurement supported
pub const FEATURE_POWER_MEASUREMENT_SUPPORTED: u32 = 1 << 14;

/// Target setting feature: power target setting supported
pub const TARGET_POWER_SUPPORTED: u32 = 1 << 3;

/// Target setting feature: indoor bike simulation parameters supported
pub const TARGET_INDOOR_BIKE_SIMULATION_SUPPORTED: u32 = 1 << 13;

/// Cycling power feature: wheel revolution data supported
pub const CP_FEATURE_WHEEL_REVOLUTION_DATA: u32 = 1 << 2;

/// Cycling power feature: crank revolution data supported
pub const CP_FEATURE_CRANK_REVOLUTION_DATA: u32 = 1 << 3;

/// Fitness Machine Status opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MachineStatusCode {
    /// The controlling client reset the machine
    Reset = 0x01,
    /// Stopped or paused by the user
    StoppedOrPaused = 0x02,
    /// Started or resumed by the user
    StartedOrResumed = 0x04,
    /// Target power changed
    TargetPowerChanged = 0x08,
    /// Indoor bike simulation parameters changed
    IndoorBikeSimulationChanged = 0x12,
}

/// Stop/pause parameter: stopped
pub const STATUS_PARAM_STOP: u8 = 0x01;

/// Body sensor locations reported by the sensor location characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorLocation {
    /// Unspecified location
    Other = 0,
    /// In the shoe, used for foot pods
    InShoe = 2,
    /// Rear hub, used for power meters
    RearHub = 13,
}

/// A decoded control point write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlRequest {
    /// Take control
    RequestControl,
    /// Release control
    Reset,
    /// Target power in watts
    SetTargetPower(i16),
    /// Start or resume
    StartOrResume,
    /// Stop or pause
    StopOrPause,
    /// New indoor bike simulation parameters
    SetIndoorBikeSimulation(SimulationParameters),
}

fn saturating_i16(value: f64) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let value = value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    value
}

fn saturating_u16(value: f64) -> u16 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = value.clamp(0.0, f64::from(u16::MAX)) as u16;
    value
}

fn saturating_u8(value: f64) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let value = value.round().clamp(0.0, f64::from(u8::MAX)) as u8;
    value
}

// the crank revolution field is 16 bits and wraps
const fn wrapped_rev_count(rev_count: u32) -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let wrapped = rev_count as u16;
    wrapped
}

/// Encode a Cycling Power Measurement (0x2A63)
///
/// Layout (little-endian):
/// - Flags (u16): bit 4 wheel revolution data, bit 5 crank revolution data
/// - Instantaneous power (s16, W)
/// - Cumulative wheel revolutions (u32) and last wheel event time (u16, 1/2048 s), if bit 4
/// - Cumulative crank revolutions (u16) and last crank event time (u16, 1/1024 s), if bit 5
///
/// A [`SensorReading::PowerCadence`] reading carries no event time of its own; its
/// crank revolution is stamped with `elapsed`, the time since the peripheral started.
///
/// # Errors
///
/// Returns [`ZwackError::UnsupportedReading`] for running or indoor bike readings.
pub fn encode_cycling_power_measurement(
    reading: &SensorReading,
    elapsed: Duration,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(14);

    match *reading {
        SensorReading::Power { watts } => {
            buf.put_u16_le(0);
            buf.put_i16_le(watts);
        }
        SensorReading::PowerCadence { watts, rev_count } => {
            buf.put_u16_le(CPM_CRANK_REVOLUTION_DATA_PRESENT);
            buf.put_i16_le(watts);
            buf.put_u16_le(wrapped_rev_count(rev_count));
            buf.put_u16_le(event_time(elapsed, CRANK_TICKS_PER_SECOND));
        }
        SensorReading::PowerCadenceSpeed {
            watts,
            rev_count,
            wheel_count,
            speed_event_time,
            cadence_event_time,
        } => {
            buf.put_u16_le(CPM_WHEEL_REVOLUTION_DATA_PRESENT | CPM_CRANK_REVOLUTION_DATA_PRESENT);
            buf.put_i16_le(watts);
            buf.put_u32_le(wheel_count);
            buf.put_u16_le(speed_event_time);
            buf.put_u16_le(wrapped_rev_count(rev_count));
            buf.put_u16_le(cadence_event_time);
        }
        SensorReading::IndoorBike { .. } | SensorReading::RunningDynamics { .. } => {
            return Err(ZwackError::UnsupportedReading {
                characteristic: "Cycling Power Measurement",
                reading: reading.kind(),
            })
        }
    }

    Ok(buf.freeze())
}

/// Cycling Power Measurement as seen by a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclingPowerSample {
    /// Instantaneous power in watts
    pub watts: i16,
    /// Cumulative wheel revolutions and last wheel event time
    pub wheel: Option<(u32, u16)>,
    /// Cumulative crank revolutions and last crank event time
    pub crank: Option<(u16, u16)>,
}

/// Parse a Cycling Power Measurement the way a receiver does: flags first,
/// then each optional field only if its flag is set
///
/// # Errors
///
/// Returns [`ZwackError::Protocol`] if the payload is shorter than its flags announce.
pub fn decode_cycling_power_measurement(data: &[u8]) -> Result<CyclingPowerSample> {
    let mut buf = data;
    ensure_remaining(buf, 4, "Cycling Power Measurement")?;
    let flags = buf.get_u16_le();
    let watts = buf.get_i16_le();

    let wheel = if flags & CPM_WHEEL_REVOLUTION_DATA_PRESENT == 0 {
        None
    } else {
        ensure_remaining(buf, 6, "wheel revolution data")?;
        Some((buf.get_u32_le(), buf.get_u16_le()))
    };

    let crank = if flags & CPM_CRANK_REVOLUTION_DATA_PRESENT == 0 {
        None
    } else {
        ensure_remaining(buf, 4, "crank revolution data")?;
        Some((buf.get_u16_le(), buf.get_u16_le()))
    };

    Ok(CyclingPowerSample {
        watts,
        wheel,
        crank,
    })
}

/// Encode an RSC Measurement (0x2A53)
///
/// Layout: flags (u8, always 0), instantaneous speed (u16, 1/256 m/s),
/// instantaneous cadence (u8, steps/min).
///
/// # Errors
///
/// Returns [`ZwackError::UnsupportedReading`] for anything but running dynamics.
pub fn encode_rsc_measurement(reading: &SensorReading) -> Result<Bytes> {
    let SensorReading::RunningDynamics {
        speed_mps,
        cadence_spm,
    } = *reading
    else {
        return Err(ZwackError::UnsupportedReading {
            characteristic: "RSC Measurement",
            reading: reading.kind(),
        });
    };

    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(0);
    buf.put_u16_le(saturating_u16((speed_mps * 256.0).floor()));
    buf.put_u8(cadence_spm);
    Ok(buf.freeze())
}

/// Encode FTMS Indoor Bike Data (0x2AD2)
///
/// Layout (little-endian):
/// - Flags (u16): bit 0 clear so instantaneous speed is present, bit 2 cadence, bit 6 power
/// - Instantaneous speed (u16, 0.01 km/h)
/// - Instantaneous cadence (u16, 0.5 rpm), if bit 2
/// - Instantaneous power (s16, W), if bit 6
///
/// # Errors
///
/// Returns [`ZwackError::UnsupportedReading`] for readings without an indoor bike layout.
pub fn encode_indoor_bike_data(reading: &SensorReading) -> Result<Bytes> {
    let (watts, cadence_rpm, speed_kmh) = match *reading {
        SensorReading::IndoorBike {
            watts,
            cadence_rpm,
            speed_kmh,
        } => (watts, Some(cadence_rpm), speed_kmh),
        SensorReading::Power { watts } => (watts, None, 0.0),
        _ => {
            return Err(ZwackError::UnsupportedReading {
                characteristic: "Indoor Bike Data",
                reading: reading.kind(),
            })
        }
    };

    let mut flags = IBD_INSTANTANEOUS_POWER_PRESENT;
    if cadence_rpm.is_some() {
        flags |= IBD_INSTANTANEOUS_CADENCE_PRESENT;
    }

    let mut buf = BytesMut::with_capacity(8);
    buf.put_u16_le(flags);
    buf.put_u16_le(saturating_u16((speed_kmh * 100.0).round()));
    if let Some(cadence) = cadence_rpm {
        buf.put_u16_le(cadence.saturating_mul(2));
    }
    buf.put_i16_le(watts);
    Ok(buf.freeze())
}

/// Indoor Bike Data as seen by a receiver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndoorBikeSample {
    /// Instantaneous speed in km/h, when present
    pub speed_kmh: Option<f64>,
    /// Instantaneous cadence in rpm, when present
    pub cadence_rpm: Option<f64>,
    /// Instantaneous power in watts, when present
    pub watts: Option<i16>,
}

/// Parse the speed, cadence and power fields of an Indoor Bike Data payload
///
/// Only the fields this peripheral produces are understood; a payload
/// announcing average speed or average cadence is rejected.
///
/// # Errors
///
/// Returns [`ZwackError::Protocol`] for truncated or unsupported payloads.
pub fn decode_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeSample> {
    const AVERAGE_FIELDS: u16 = (1 << 1) | (1 << 3) | (1 << 4) | (1 << 5);

    let mut buf = data;
    ensure_remaining(buf, 2, "Indoor Bike Data")?;
    let flags = buf.get_u16_le();
    if flags & AVERAGE_FIELDS != 0 {
        return Err(ZwackError::Protocol(format!(
            "Unsupported Indoor Bike Data flags: {flags:04X}"
        )));
    }

    let speed_kmh = if flags & IBD_MORE_DATA == 0 {
        ensure_remaining(buf, 2, "instantaneous speed")?;
        Some(f64::from(buf.get_u16_le()) / 100.0)
    } else {
        None
    };

    let cadence_rpm = if flags & IBD_INSTANTANEOUS_CADENCE_PRESENT == 0 {
        None
    } else {
        ensure_remaining(buf, 2, "instantaneous cadence")?;
        Some(f64::from(buf.get_u16_le()) / 2.0)
    };

    let watts = if flags & IBD_INSTANTANEOUS_POWER_PRESENT == 0 {
        None
    } else {
        ensure_remaining(buf, 2, "instantaneous power")?;
        Some(buf.get_i16_le())
    };

    Ok(IndoorBikeSample {
        speed_kmh,
        cadence_rpm,
        watts,
    })
}

/// Encode the Fitness Machine Feature characteristic (0x2ACC)
///
/// Two u32 bit masks: machine features (cadence, power measurement) followed by
/// target setting features (power target, indoor bike simulation).
#[must_use]
pub fn encode_fitness_machine_feature() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(FEATURE_CADENCE_SUPPORTED | FEATURE_POWER_MEASUREMENT_SUPPORTED);
    buf.put_u32_le(TARGET_POWER_SUPPORTED | TARGET_INDOOR_BIKE_SIMULATION_SUPPORTED);
    buf.freeze()
}

/// Encode the Supported Power Range characteristic (0x2AD8)
#[must_use]
pub fn encode_supported_power_range(range: &PowerRange) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_i16_le(range.minimum);
    buf.put_i16_le(range.maximum);
    buf.put_u16_le(range.increment);
    buf.freeze()
}

/// Encode the Cycling Power Feature characteristic (0x2A65)
#[must_use]
pub fn encode_cycling_power_feature() -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(CP_FEATURE_WHEEL_REVOLUTION_DATA | CP_FEATURE_CRANK_REVOLUTION_DATA);
    buf.freeze()
}

/// Encode the RSC Feature characteristic (0x2A54)
///
/// No optional RSC features (stride length, total distance, walking status) are offered.
#[must_use]
pub fn encode_rsc_feature() -> Bytes {
    Bytes::from_static(&[0x00, 0x00])
}

/// Encode a Sensor Location characteristic (0x2A5D)
#[must_use]
pub fn encode_sensor_location(location: SensorLocation) -> Bytes {
    Bytes::copy_from_slice(&[location as u8])
}

/// Encode a control point response: `[0x80, request opcode, result code]`
#[must_use]
pub fn encode_control_response(request_opcode: u8, result: ResultCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_SIZE);
    buf.put_u8(RESPONSE_CODE);
    buf.put_u8(request_opcode);
    buf.put_u8(result as u8);
    buf.freeze()
}

/// Decode the parameters of a control point write whose opcode is known
///
/// The opcode byte is included in `data`; parameters start at offset 1.
///
/// # Errors
///
/// Returns [`ZwackError::Protocol`] if the payload is too short for the opcode.
pub fn decode_control_request(opcode: ControlOpcode, data: &[u8]) -> Result<ControlRequest> {
    let mut buf = data.get(1..).unwrap_or_default();

    let request = match opcode {
        ControlOpcode::RequestControl => ControlRequest::RequestControl,
        ControlOpcode::Reset => ControlRequest::Reset,
        ControlOpcode::StartOrResume => ControlRequest::StartOrResume,
        ControlOpcode::StopOrPause => ControlRequest::StopOrPause,
        ControlOpcode::SetTargetPower => {
            ensure_remaining(buf, 2, "target power")?;
            ControlRequest::SetTargetPower(buf.get_i16_le())
        }
        ControlOpcode::SetIndoorBikeSimulation => {
            ensure_remaining(buf, 6, "indoor bike simulation parameters")?;
            let wind_speed = buf.get_i16_le();
            let grade = buf.get_i16_le();
            let crr = buf.get_u8();
            let cw = buf.get_u8();
            ControlRequest::SetIndoorBikeSimulation(SimulationParameters {
                wind_speed_mps: f64::from(wind_speed) / 1000.0,
                grade_percent: f64::from(grade) / 100.0,
                crr: f64::from(crr) / 10_000.0,
                cw_kg_per_m: f64::from(cw) / 100.0,
            })
        }
    };

    Ok(request)
}

/// Encode the Fitness Machine Status (0x2ADA) notification for a domain event
///
/// Returns `None` for events that have no status representation.
#[must_use]
pub fn encode_machine_status(event: &DomainEvent) -> Option<Bytes> {
    let mut buf = BytesMut::with_capacity(7);

    match *event {
        DomainEvent::ControlAcquired => return None,
        DomainEvent::Reset => buf.put_u8(MachineStatusCode::Reset as u8),
        DomainEvent::Stopped => {
            buf.put_u8(MachineStatusCode::StoppedOrPaused as u8);
            buf.put_u8(STATUS_PARAM_STOP);
        }
        DomainEvent::Started => buf.put_u8(MachineStatusCode::StartedOrResumed as u8),
        DomainEvent::TargetPowerSet(watts) => {
            buf.put_u8(MachineStatusCode::TargetPowerChanged as u8);
            buf.put_i16_le(watts);
        }
        DomainEvent::SimulationParamsSet(params) => {
            buf.put_u8(MachineStatusCode::IndoorBikeSimulationChanged as u8);
            buf.put_i16_le(saturating_i16(params.wind_speed_mps * 1000.0));
            buf.put_i16_le(saturating_i16(params.grade_percent * 100.0));
            buf.put_u8(saturating_u8(params.crr * 10_000.0));
            buf.put_u8(saturating_u8(params.cw_kg_per_m * 100.0));
        }
    }

    Some(buf.freeze())
}

fn ensure_remaining(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ZwackError::Protocol(format!(
            "{what} too short: {} bytes, expected {needed}",
            buf.remaining()
        )));
    }
    Ok(())
}
