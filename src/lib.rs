#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Zwack
//!
//! A simulated Bluetooth Low Energy fitness sensor. Zwack plays the peripheral
//! role and exposes the standard GATT services a training app looks for:
//!
//! - **Fitness Machine Service** (0x1826): indoor bike data, machine status
//!   and a control point that accepts target power and simulation commands
//! - **Cycling Power Service** (0x1818): power, optionally with crank and
//!   wheel revolution data
//! - **Running Speed and Cadence Service** (0x1814)
//!
//! Values come from a [`SimulatorState`] with optional Gaussian noise and are
//! pushed once per notification interval (or once per simulated crank
//! revolution) by the [`NotificationDispatcher`].
//!
//! The radio is abstracted behind the [`BleStack`] trait. [`LoopbackStack`]
//! implements it in memory for tests and for running without hardware.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use zwack::{
//!     ble::AdapterState, ConnectionEvent, FitnessPeripheral, LoopbackStack,
//!     NotificationDispatcher, PeripheralConfig, ServiceSelection, SimulatorState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeripheralConfig {
//!         services: ServiceSelection::from_variables("ftms,csp,power,cadence")?,
//!         ..Default::default()
//!     };
//!     let simulator = Arc::new(RwLock::new(SimulatorState::new(config.noise)));
//!
//!     let stack = Arc::new(LoopbackStack::new());
//!     let peripheral = Arc::new(FitnessPeripheral::new(config, stack)?);
//!     peripheral
//!         .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOn))
//!         .await;
//!
//!     let dispatcher = NotificationDispatcher::start(peripheral, simulator);
//!     tokio::signal::ctrl_c().await?;
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

/// BLE stack abstraction and in-memory loopback implementation
pub mod ble;
/// Fitness Machine Control Point state machine
pub mod control_point;
/// Revolution counters and event times
pub mod counter;
/// Periodic notification tasks
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// GATT characteristics and service definitions
pub mod gatt;
/// Gaussian noise for simulated values
pub mod noise;
/// The peripheral the BLE stack talks to
pub mod peripheral;
/// Characteristic payload encoding and decoding
pub mod protocol;
/// Simulated rider and runner
pub mod simulator;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{AttResult, BleStack, ConnectionEvent, LoopbackStack};
pub use control_point::ControlPoint;
pub use dispatcher::NotificationDispatcher;
pub use error::{Result, ZwackError};
pub use noise::NoiseModel;
pub use peripheral::FitnessPeripheral;
pub use simulator::SimulatorState;
pub use types::{
    ControlSession, ControlState, CyclingPowerMode, DomainEvent, NoiseConfig, PeripheralConfig,
    PowerRange, ResultCode, SensorReading, ServiceSelection, SimulationParameters,
};

use protocol::ble_uuid;
use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid = ble_uuid(0x1826);

/// Cycling Power Service
pub const CYCLING_POWER_SERVICE_UUID: Uuid = ble_uuid(0x1818);

/// Running Speed and Cadence Service
pub const RUNNING_SPEED_CADENCE_SERVICE_UUID: Uuid = ble_uuid(0x1814);

/// Fitness Machine Control Point, write and indicate
pub const FITNESS_MACHINE_CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);

/// Fitness Machine Feature, read
pub const FITNESS_MACHINE_FEATURE_UUID: Uuid = ble_uuid(0x2ACC);

/// Supported Power Range, read
pub const SUPPORTED_POWER_RANGE_UUID: Uuid = ble_uuid(0x2AD8);

/// Indoor Bike Data, notify
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);

/// Fitness Machine Status, notify
pub const FITNESS_MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

/// Cycling Power Measurement, notify
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A63);

/// Cycling Power Feature, read
pub const CYCLING_POWER_FEATURE_UUID: Uuid = ble_uuid(0x2A65);

/// Sensor Location, read
pub const SENSOR_LOCATION_UUID: Uuid = ble_uuid(0x2A5D);

/// RSC Measurement, notify
pub const RSC_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A53);

/// RSC Feature, read
pub const RSC_FEATURE_UUID: Uuid = ble_uuid(0x2A54);
