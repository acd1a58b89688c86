//! Shared domain types and peripheral configuration.

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{Result, ZwackError};

/// One tick's worth of simulated sensor data, consumed by a single encoder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorReading {
    /// Instantaneous power only
    Power {
        /// Instantaneous power in watts
        watts: i16,
    },
    /// Power plus cumulative crank revolutions
    PowerCadence {
        /// Instantaneous power in watts
        watts: i16,
        /// Cumulative crank revolutions
        rev_count: u32,
    },
    /// Power plus crank and wheel revolution data with codec-derived event times
    PowerCadenceSpeed {
        /// Instantaneous power in watts
        watts: i16,
        /// Cumulative crank revolutions
        rev_count: u32,
        /// Cumulative wheel revolutions
        wheel_count: u32,
        /// Last wheel event time in 1/2048 s
        speed_event_time: u16,
        /// Last crank event time in 1/1024 s
        cadence_event_time: u16,
    },
    /// Indoor bike trainer data for the Fitness Machine Service
    IndoorBike {
        /// Instantaneous power in watts
        watts: i16,
        /// Instantaneous cadence in revolutions per minute
        cadence_rpm: u16,
        /// Instantaneous speed in km/h
        speed_kmh: f64,
    },
    /// Running speed and cadence
    RunningDynamics {
        /// Instantaneous speed in meters per second
        speed_mps: f64,
        /// Instantaneous cadence in steps per minute
        cadence_spm: u8,
    },
}

impl SensorReading {
    /// Short name of the variant, used in logs and errors
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Power { .. } => "Power",
            Self::PowerCadence { .. } => "PowerCadence",
            Self::PowerCadenceSpeed { .. } => "PowerCadenceSpeed",
            Self::IndoorBike { .. } => "IndoorBike",
            Self::RunningDynamics { .. } => "RunningDynamics",
        }
    }

    /// Cumulative crank revolutions, if the reading carries any
    #[must_use]
    pub const fn rev_count(&self) -> Option<u32> {
        match self {
            Self::PowerCadence { rev_count, .. } | Self::PowerCadenceSpeed { rev_count, .. } => {
                Some(*rev_count)
            }
            _ => None,
        }
    }
}

/// Control point state
///
/// `Running` always implies control is held, so a session that is running
/// without control cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlState {
    /// No client holds control
    #[default]
    Idle,
    /// A client holds control, machine stopped or paused
    Controlled,
    /// A client holds control, machine started
    Running,
}

impl ControlState {
    /// Flag view of this state
    #[must_use]
    pub const fn session(self) -> ControlSession {
        match self {
            Self::Idle => ControlSession {
                has_control: false,
                is_running: false,
            },
            Self::Controlled => ControlSession {
                has_control: true,
                is_running: false,
            },
            Self::Running => ControlSession {
                has_control: true,
                is_running: true,
            },
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Controlled => write!(f, "Controlled"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Control session flags as seen by readers of the control point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlSession {
    /// A client has successfully requested control
    pub has_control: bool,
    /// The machine has been started or resumed
    pub is_running: bool,
}

/// Fitness Machine Control Point opcodes supported by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Take control of the machine
    RequestControl = 0x00,
    /// Release control and reset the session
    Reset = 0x01,
    /// Set a target power in watts
    SetTargetPower = 0x05,
    /// Start or resume the workout
    StartOrResume = 0x07,
    /// Stop or pause the workout
    StopOrPause = 0x08,
    /// Set wind speed, grade and resistance coefficients
    SetIndoorBikeSimulation = 0x11,
}

impl ControlOpcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x05 => Some(Self::SetTargetPower),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            _ => None,
        }
    }

    /// Whether the opcode is refused until control has been acquired
    #[must_use]
    pub const fn requires_control(self) -> bool {
        !matches!(self, Self::RequestControl)
    }
}

impl fmt::Display for ControlOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestControl => write!(f, "Request Control"),
            Self::Reset => write!(f, "Reset"),
            Self::SetTargetPower => write!(f, "Set Target Power"),
            Self::StartOrResume => write!(f, "Start or Resume"),
            Self::StopOrPause => write!(f, "Stop or Pause"),
            Self::SetIndoorBikeSimulation => write!(f, "Set Indoor Bike Simulation"),
        }
    }
}

/// Control point result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    /// Operation accepted
    Success = 0x01,
    /// Opcode is not implemented
    OpCodeNotSupported = 0x02,
    /// Payload could not be decoded
    InvalidParameter = 0x03,
    /// Opcode not valid in the current run state
    OperationFailed = 0x04,
    /// Control has not been requested
    ControlNotPermitted = 0x05,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::OpCodeNotSupported => write!(f, "Op Code Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
        }
    }
}

/// Indoor bike simulation parameters as decoded from the control point
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// Wind speed in meters per second
    pub wind_speed_mps: f64,
    /// Grade in percent
    pub grade_percent: f64,
    /// Coefficient of rolling resistance
    pub crr: f64,
    /// Wind resistance coefficient in kg/m
    pub cw_kg_per_m: f64,
}

/// Events emitted by the control point after an accepted command
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A client took control
    ControlAcquired,
    /// The controlling client reset the session
    Reset,
    /// A new target power was set, in watts
    TargetPowerSet(i16),
    /// The workout was started or resumed
    Started,
    /// The workout was stopped or paused
    Stopped,
    /// New simulation parameters were set
    SimulationParamsSet(SimulationParameters),
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlAcquired => write!(f, "control acquired"),
            Self::Reset => write!(f, "reset"),
            Self::TargetPowerSet(watts) => write!(f, "target power set to {watts}W"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::SimulationParamsSet(p) => write!(
                f,
                "simulation set (wind {:.3} m/s, grade {:.2}%, crr {:.4}, cw {:.2} kg/m)",
                p.wind_speed_mps, p.grade_percent, p.crr, p.cw_kg_per_m
            ),
        }
    }
}

/// Which fields the cycling power family broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CyclingPowerMode {
    /// Power only, once per notification interval
    #[default]
    PowerOnly,
    /// Power and crank revolutions, once per simulated crank revolution
    PowerCadence,
    /// Power, crank and wheel revolutions, once per notification interval
    PowerCadenceSpeed,
}

impl fmt::Display for CyclingPowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOnly => write!(f, "power"),
            Self::PowerCadence => write!(f, "power+cadence"),
            Self::PowerCadenceSpeed => write!(f, "power+cadence+speed"),
        }
    }
}

/// Services offered by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceSelection {
    /// Fitness Machine Service (indoor bike)
    pub ftms: bool,
    /// Cycling power family; `None` disables the Cycling Power Service
    pub cycling_power: Option<CyclingPowerMode>,
    /// Running Speed and Cadence Service
    pub rsc: bool,
}

impl ServiceSelection {
    /// Build a selection from a comma or space separated list of selectors
    ///
    /// Recognised selectors are `ftms`, `rsc`, `csp`, `power`, `cadence` and
    /// `speed`. The cycling power service is only offered when both `csp` and
    /// `power` are present; `cadence` and `speed` widen its mode.
    ///
    /// # Errors
    ///
    /// Returns [`ZwackError::InvalidParameters`] if a selector is unknown or
    /// nothing would be offered.
    pub fn from_variables(variables: &str) -> Result<Self> {
        let mut ftms = false;
        let mut rsc = false;
        let mut csp = false;
        let mut power = false;
        let mut cadence = false;
        let mut speed = false;

        for selector in variables
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            match selector.to_ascii_lowercase().as_str() {
                "ftms" => ftms = true,
                "rsc" => rsc = true,
                "csp" => csp = true,
                "power" => power = true,
                "cadence" => cadence = true,
                "speed" => speed = true,
                other => {
                    return Err(ZwackError::InvalidParameters(format!(
                        "Unknown service selector: {other}"
                    )))
                }
            }
        }

        let cycling_power = match (csp && power, cadence, speed) {
            (false, _, _) => None,
            (true, false, false) => Some(CyclingPowerMode::PowerOnly),
            (true, true, false) => Some(CyclingPowerMode::PowerCadence),
            (true, true, true) => Some(CyclingPowerMode::PowerCadenceSpeed),
            (true, false, true) => {
                return Err(ZwackError::InvalidParameters(
                    "Speed requires cadence in the cycling power service".to_string(),
                ))
            }
        };

        let selection = Self {
            ftms,
            cycling_power,
            rsc,
        };
        if selection.is_empty() {
            return Err(ZwackError::InvalidParameters(format!(
                "No services selected from '{variables}'"
            )));
        }
        Ok(selection)
    }

    /// True when no service is enabled
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.ftms && self.cycling_power.is_none() && !self.rsc
    }
}

/// Gaussian noise settings for simulated values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Apply noise at all
    pub enabled: bool,
    /// Maximum relative variation of power (3 sigma)
    pub power_percent: f64,
    /// Maximum relative variation of cadence and running speed (3 sigma)
    pub cadence_percent: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            power_percent: 0.10,
            cadence_percent: 0.04,
        }
    }
}

/// Range reported by the Supported Power Range characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerRange {
    /// Minimum power in watts
    pub minimum: i16,
    /// Maximum power in watts
    pub maximum: i16,
    /// Minimum increment in watts
    pub increment: u16,
}

impl Default for PowerRange {
    fn default() -> Self {
        Self {
            minimum: 0,
            maximum: 1000,
            increment: 1,
        }
    }
}

/// Peripheral configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Advertised device name
    pub name: String,
    /// Services to offer
    pub services: ServiceSelection,
    /// Period of fixed-interval notifications in milliseconds
    pub notification_interval_ms: u64,
    /// Wheel circumference in millimeters
    pub wheel_circumference_mm: u32,
    /// Silence after which the cycling power family sends a zero reading, in milliseconds
    pub keepalive_timeout_ms: u64,
    /// Noise settings
    pub noise: NoiseConfig,
    /// Supported power range
    pub power_range: PowerRange,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            name: "Zwack".to_string(),
            services: ServiceSelection {
                ftms: true,
                cycling_power: None,
                rsc: false,
            },
            notification_interval_ms: 1_000,
            wheel_circumference_mm: 2_096,
            keepalive_timeout_ms: 4_000,
            noise: NoiseConfig::default(),
            power_range: PowerRange::default(),
        }
    }
}

impl PeripheralConfig {
    /// Notification interval as a duration
    #[must_use]
    pub const fn notification_interval(&self) -> Duration {
        Duration::from_millis(self.notification_interval_ms)
    }

    /// Keepalive timeout as a duration
    #[must_use]
    pub const fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Check the configuration for values the encoders cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ZwackError::InvalidParameters`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ZwackError::InvalidParameters(
                "Device name must not be empty".to_string(),
            ));
        }
        if self.services.is_empty() {
            return Err(ZwackError::InvalidParameters(
                "At least one service must be enabled".to_string(),
            ));
        }
        if self.notification_interval_ms == 0 {
            return Err(ZwackError::InvalidParameters(
                "Notification interval must be positive".to_string(),
            ));
        }
        if self.wheel_circumference_mm == 0 {
            return Err(ZwackError::InvalidParameters(
                "Wheel circumference must be positive".to_string(),
            ));
        }
        if self.power_range.minimum > self.power_range.maximum {
            return Err(ZwackError::InvalidParameters(format!(
                "Power range minimum {} exceeds maximum {}",
                self.power_range.minimum, self.power_range.maximum
            )));
        }
        Ok(())
    }
}
