//! Seam between the protocol core and a BLE peripheral stack.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, ZwackError};

/// ATT result codes returned to the stack for reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttResult {
    /// Request handled
    Success = 0x00,
    /// Characteristic is not readable
    ReadNotPermitted = 0x02,
    /// Characteristic is not writable
    WriteNotPermitted = 0x03,
    /// No characteristic with that UUID is registered
    AttributeNotFound = 0x0A,
    /// Write length is not acceptable
    InvalidAttributeLength = 0x0D,
    /// Request failed for an unexpected reason
    UnlikelyError = 0x0E,
}

impl fmt::Display for AttResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::ReadNotPermitted => write!(f, "Read Not Permitted"),
            Self::WriteNotPermitted => write!(f, "Write Not Permitted"),
            Self::AttributeNotFound => write!(f, "Attribute Not Found"),
            Self::InvalidAttributeLength => write!(f, "Invalid Attribute Length"),
            Self::UnlikelyError => write!(f, "Unlikely Error"),
        }
    }
}

/// GATT characteristic properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    /// Readable
    pub read: bool,
    /// Writable with response
    pub write: bool,
    /// Notifiable
    pub notify: bool,
    /// Indicatable
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Read only
    pub const READ: Self = Self {
        read: true,
        write: false,
        notify: false,
        indicate: false,
    };

    /// Notify only
    pub const NOTIFY: Self = Self {
        read: false,
        write: false,
        notify: true,
        indicate: false,
    };

    /// Write with indicated responses
    pub const WRITE_INDICATE: Self = Self {
        read: false,
        write: true,
        notify: false,
        indicate: true,
    };
}

/// What the stack needs to know to expose a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Properties
    pub properties: CharacteristicProperties,
    /// User description (0x2901 descriptor value)
    pub description: String,
}

/// What the stack needs to know to expose a primary service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in registration order
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// Adapter power state reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    /// Radio is on and can advertise
    PoweredOn,
    /// Radio is off
    PoweredOff,
    /// Adapter is missing or not usable
    Unsupported,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "poweredOn"),
            Self::PoweredOff => write!(f, "poweredOff"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Lifecycle callbacks delivered by the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Adapter power state changed
    StateChange(AdapterState),
    /// Advertising started, or failed with the given reason
    AdvertisingStart(Option<String>),
    /// Advertising stopped
    AdvertisingStop,
    /// A central connected
    Accept(String),
    /// A central disconnected
    Disconnect(String),
}

/// The BLE peripheral stack the protocol core runs on
///
/// Inbound traffic (writes, reads, subscriptions and connection events) is
/// delivered by the stack to [`crate::FitnessPeripheral`]; this trait covers the
/// outbound side.
#[async_trait]
pub trait BleStack: Send + Sync {
    /// Start advertising the given service UUIDs under `name`
    async fn start_advertising(&self, name: &str, service_uuids: &[Uuid]) -> Result<()>;

    /// Stop advertising
    async fn stop_advertising(&self) -> Result<()>;

    /// Register the GATT services
    async fn register_services(&self, services: &[ServiceDescriptor]) -> Result<()>;

    /// Send an acknowledged value push to subscribed centrals
    async fn send_indication(&self, characteristic: Uuid, value: Bytes) -> Result<()>;

    /// Send an unacknowledged value push to subscribed centrals
    async fn send_notification(&self, characteristic: Uuid, value: Bytes) -> Result<()>;
}

/// How an outbound value was pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    /// Notification
    Notify,
    /// Indication
    Indicate,
}

/// A value the peripheral pushed through the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Characteristic UUID
    pub characteristic: Uuid,
    /// Notification or indication
    pub delivery: Delivery,
    /// Payload
    pub value: Bytes,
}

/// Outbound values a [`LoopbackStack`] keeps by default
pub const DEFAULT_OUTBOUND_HISTORY: usize = 1024;

/// In-memory stack that records what the peripheral sends
///
/// Useful for tests and for running the simulator without a radio. Outbound
/// values are broadcast to live watchers and the most recent ones are kept in
/// order; once the history is full the oldest value is dropped.
pub struct LoopbackStack {
    advertising: Mutex<Option<(String, Vec<Uuid>)>>,
    services: Mutex<Vec<ServiceDescriptor>>,
    outbound: Mutex<VecDeque<Outbound>>,
    history: usize,
    watchers: broadcast::Sender<Outbound>,
    fail_transport: AtomicBool,
}

impl Default for LoopbackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackStack {
    /// Create an empty loopback stack
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_OUTBOUND_HISTORY)
    }

    /// Create a loopback stack that keeps at most `history` outbound values
    ///
    /// A history of zero records nothing; watchers still see every value.
    #[must_use]
    pub fn with_history(history: usize) -> Self {
        let (watchers, _) = broadcast::channel(256);
        Self {
            advertising: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            outbound: Mutex::new(VecDeque::with_capacity(history.min(DEFAULT_OUTBOUND_HISTORY))),
            history,
            watchers,
            fail_transport: AtomicBool::new(false),
        }
    }

    /// Make every subsequent indication and notification fail
    pub fn set_transport_failure(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Current advertising name and service list, if advertising
    pub async fn advertising(&self) -> Option<(String, Vec<Uuid>)> {
        self.advertising.lock().await.clone()
    }

    /// Services registered so far
    pub async fn registered_services(&self) -> Vec<ServiceDescriptor> {
        self.services.lock().await.clone()
    }

    /// Drain every recorded outbound value
    pub async fn take_outbound(&self) -> Vec<Outbound> {
        self.outbound.lock().await.drain(..).collect()
    }

    /// Recorded outbound values for one characteristic, without draining
    pub async fn outbound_for(&self, characteristic: Uuid) -> Vec<Outbound> {
        self.outbound
            .lock()
            .await
            .iter()
            .filter(|o| o.characteristic == characteristic)
            .cloned()
            .collect()
    }

    /// Watch outbound values as they are sent
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<Outbound> {
        self.watchers.subscribe()
    }

    async fn record(&self, characteristic: Uuid, delivery: Delivery, value: Bytes) -> Result<()> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(ZwackError::Transport(format!(
                "{delivery:?} to {characteristic} failed"
            )));
        }

        debug!("Loopback {:?} {}: {:02X?}", delivery, characteristic, &value[..]);
        let outbound = Outbound {
            characteristic,
            delivery,
            value,
        };
        // no watchers is fine
        let _ = self.watchers.send(outbound.clone());
        if self.history > 0 {
            let mut recorded = self.outbound.lock().await;
            if recorded.len() == self.history {
                recorded.pop_front();
            }
            recorded.push_back(outbound);
        }
        Ok(())
    }
}

#[async_trait]
impl BleStack for LoopbackStack {
    async fn start_advertising(&self, name: &str, service_uuids: &[Uuid]) -> Result<()> {
        info!("Loopback advertising '{}' with {} service(s)", name, service_uuids.len());
        *self.advertising.lock().await = Some((name.to_string(), service_uuids.to_vec()));
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        *self.advertising.lock().await = None;
        Ok(())
    }

    async fn register_services(&self, services: &[ServiceDescriptor]) -> Result<()> {
        *self.services.lock().await = services.to_vec();
        Ok(())
    }

    async fn send_indication(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
        self.record(characteristic, Delivery::Indicate, value).await
    }

    async fn send_notification(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
        self.record(characteristic, Delivery::Notify, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ble_uuid;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_loopback_records_in_order() {
        let stack = LoopbackStack::new();
        let a = ble_uuid(0x2AD9);
        let b = ble_uuid(0x2AD2);

        assert_ok!(
            stack
                .send_indication(a, Bytes::from_static(&[0x80, 0x00, 0x01]))
                .await
        );
        assert_ok!(
            stack
                .send_notification(b, Bytes::from_static(&[0x44, 0x00]))
                .await
        );

        assert_eq!(stack.outbound_for(a).await.len(), 1);
        let sent = stack.take_outbound().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].delivery, Delivery::Indicate);
        assert_eq!(sent[1].characteristic, b);
        assert!(stack.take_outbound().await.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_history_is_bounded() {
        let stack = LoopbackStack::with_history(3);
        let uuid = ble_uuid(0x2AD2);
        for i in 0..5u8 {
            assert_ok!(stack.send_notification(uuid, Bytes::from(vec![i])).await);
        }

        let kept: Vec<u8> = stack
            .take_outbound()
            .await
            .iter()
            .map(|o| o.value[0])
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);

        let silent = LoopbackStack::with_history(0);
        let mut watcher = silent.watch();
        assert_ok!(silent.send_notification(uuid, Bytes::from_static(&[7])).await);
        assert!(silent.take_outbound().await.is_empty());
        assert_eq!(&watcher.recv().await.unwrap().value[..], &[7]);
    }

    #[tokio::test]
    async fn test_loopback_transport_failure() {
        let stack = LoopbackStack::new();
        stack.set_transport_failure(true);

        let error = assert_err!(
            stack
                .send_notification(ble_uuid(0x2A63), Bytes::from_static(&[0x00]))
                .await
        );
        assert!(matches!(error, ZwackError::Transport(_)));
        assert!(stack.take_outbound().await.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_watchers_see_values() {
        let stack = LoopbackStack::new();
        let mut watcher = stack.watch();

        stack
            .send_notification(ble_uuid(0x2A53), Bytes::from_static(&[0x00, 0x01, 0x02, 0x03]))
            .await
            .unwrap();

        let seen = watcher.recv().await.unwrap();
        assert_eq!(seen.delivery, Delivery::Notify);
        assert_eq!(&seen.value[..], &[0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_property_presets() {
        assert!(CharacteristicProperties::READ.read);
        assert!(!CharacteristicProperties::READ.write);
        assert!(CharacteristicProperties::WRITE_INDICATE.write);
        assert!(CharacteristicProperties::WRITE_INDICATE.indicate);
        assert!(CharacteristicProperties::NOTIFY.notify);
    }
}
