//! The fitness peripheral: inbound GATT handling and outbound pushes.

use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ble::{AdapterState, AttResult, BleStack, ConnectionEvent, ServiceDescriptor},
    control_point::ControlPoint,
    error::{Result, ZwackError},
    gatt::{build_services, Characteristic, ServiceDefinition},
    protocol::encode_machine_status,
    types::{ControlSession, DomainEvent, PeripheralConfig},
    FITNESS_MACHINE_STATUS_UUID,
};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A simulated fitness sensor exposed through a [`BleStack`]
///
/// The stack delivers inbound traffic to the `on_*` methods. Writes are
/// serialized: each one's transition, indication, status notification and
/// published event complete before the next write is handled. Accepted
/// commands are announced on the Fitness Machine Status characteristic and
/// published to [`subscribe_events`](Self::subscribe_events) receivers.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use zwack::{ble::AdapterState, ConnectionEvent, FitnessPeripheral, LoopbackStack, PeripheralConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let stack = Arc::new(LoopbackStack::new());
///     let peripheral = FitnessPeripheral::new(PeripheralConfig::default(), stack)?;
///     peripheral
///         .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOn))
///         .await;
///     Ok(())
/// }
/// ```
pub struct FitnessPeripheral {
    config: PeripheralConfig,
    stack: Arc<dyn BleStack>,
    control: Arc<Mutex<ControlPoint>>,
    writes: Mutex<()>,
    services: Vec<ServiceDefinition>,
    characteristics: HashMap<Uuid, Arc<dyn Characteristic>>,
    subscriptions: RwLock<HashSet<Uuid>>,
    events: broadcast::Sender<DomainEvent>,
    started: Instant,
}

impl FitnessPeripheral {
    /// Build the services for `config` on top of `stack`
    ///
    /// # Errors
    ///
    /// Returns [`ZwackError::InvalidParameters`] if the configuration does not validate.
    pub fn new(config: PeripheralConfig, stack: Arc<dyn BleStack>) -> Result<Self> {
        config.validate()?;

        let control = Arc::new(Mutex::new(ControlPoint::new()));
        let services = build_services(&config.services, &control, &config.power_range);

        // Sensor Location is shared by the cycling power and running services;
        // reads resolve to the first one registered.
        let mut characteristics = HashMap::new();
        for characteristic in services.iter().flat_map(|s| s.characteristics.iter()) {
            characteristics
                .entry(characteristic.uuid())
                .or_insert_with(|| Arc::clone(characteristic));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "Peripheral '{}' offering {} service(s)",
            config.name,
            services.len()
        );

        Ok(Self {
            config,
            stack,
            control,
            writes: Mutex::new(()),
            services,
            characteristics,
            subscriptions: RwLock::new(HashSet::new()),
            events,
            started: Instant::now(),
        })
    }

    /// Configuration the peripheral was built with
    #[must_use]
    pub const fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    /// Services in registration order
    #[must_use]
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    /// UUIDs to advertise
    #[must_use]
    pub fn advertised_services(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    /// Time since the peripheral was created
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current control session flags
    pub async fn control_session(&self) -> ControlSession {
        self.control.lock().await.session()
    }

    /// Receive every domain event published after this call
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Whether a central is subscribed to `characteristic`
    pub async fn is_subscribed(&self, characteristic: Uuid) -> bool {
        self.subscriptions.read().await.contains(&characteristic)
    }

    /// Handle a lifecycle callback from the stack
    pub async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChange(AdapterState::PoweredOn) => {
                info!("Adapter powered on, advertising '{}'", self.config.name);
                if let Err(e) = self.start().await {
                    error!("Failed to start peripheral: {}", e);
                }
            }
            ConnectionEvent::StateChange(state) => {
                info!("Adapter {}, stopping advertising", state);
                if let Err(e) = self.stack.stop_advertising().await {
                    warn!("Failed to stop advertising: {}", e);
                }
            }
            ConnectionEvent::AdvertisingStart(None) => info!("Advertising started"),
            ConnectionEvent::AdvertisingStart(Some(reason)) => {
                error!("Advertising failed to start: {}", reason);
            }
            ConnectionEvent::AdvertisingStop => info!("Advertising stopped"),
            ConnectionEvent::Accept(address) => {
                info!("Client connected: {}", address);
                self.control.lock().await.reset_session();
            }
            ConnectionEvent::Disconnect(address) => {
                info!("Client disconnected: {}", address);
                self.control.lock().await.reset_session();
                self.subscriptions.write().await.clear();
            }
        }
    }

    async fn start(&self) -> Result<()> {
        self.stack
            .start_advertising(&self.config.name, &self.advertised_services())
            .await?;
        let descriptors: Vec<ServiceDescriptor> =
            self.services.iter().map(ServiceDefinition::descriptor).collect();
        self.stack.register_services(&descriptors).await
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Arc<dyn Characteristic>> {
        self.characteristics
            .get(&uuid)
            .ok_or(ZwackError::UnknownCharacteristic(uuid))
    }

    /// Handle a read request
    ///
    /// # Errors
    ///
    /// Returns the ATT error to send back when the read cannot be served.
    pub async fn on_read_request(&self, uuid: Uuid) -> std::result::Result<Bytes, AttResult> {
        let read = match self.characteristic(uuid) {
            Ok(characteristic) => characteristic.on_read().await,
            Err(e) => Err(e),
        };

        match read {
            Ok(value) => {
                debug!("Read {}: {:02X?}", uuid, &value[..]);
                Ok(value)
            }
            Err(e) => {
                warn!("Read refused: {}", e);
                Err(att_result_for(&e))
            }
        }
    }

    /// Handle a write request, returning the ATT acknowledgement
    ///
    /// A control point response is indicated before any resulting status
    /// notification or domain event, and a concurrent write waits until all
    /// three have gone out.
    pub async fn on_write_received(&self, uuid: Uuid, data: &[u8]) -> AttResult {
        let _serialized = self.writes.lock().await;

        let written = match self.characteristic(uuid) {
            Ok(characteristic) => characteristic.on_write(data).await,
            Err(e) => Err(e),
        };
        let outcome = match written {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Write refused: {}", e);
                return att_result_for(&e);
            }
        };

        if let Some(indication) = outcome.indication {
            self.indicate(uuid, indication).await;
        }
        if let Some(event) = outcome.event {
            self.publish(event).await;
        }

        AttResult::Success
    }

    /// A central subscribed to notifications or indications
    pub async fn on_subscribe(&self, uuid: Uuid) -> AttResult {
        if let Err(e) = self.characteristic(uuid) {
            warn!("Subscribe refused: {}", e);
            return att_result_for(&e);
        }
        debug!("Subscribed to {}", uuid);
        self.subscriptions.write().await.insert(uuid);
        AttResult::Success
    }

    /// A central unsubscribed; always succeeds
    pub async fn on_unsubscribe(&self, uuid: Uuid) -> AttResult {
        debug!("Unsubscribed from {}", uuid);
        self.subscriptions.write().await.remove(&uuid);
        AttResult::Success
    }

    /// Notify `value` on `characteristic` if a central is subscribed
    ///
    /// Returns whether the value was handed to the stack. Transport failures
    /// are logged and reported as `false`.
    pub async fn notify(&self, characteristic: Uuid, value: Bytes) -> bool {
        if !self.is_subscribed(characteristic).await {
            debug!("No subscriber for {}, dropping notification", characteristic);
            return false;
        }

        match self.stack.send_notification(characteristic, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Notification on {} failed: {}", characteristic, e);
                false
            }
        }
    }

    async fn indicate(&self, characteristic: Uuid, value: Bytes) {
        if let Err(e) = self.stack.send_indication(characteristic, value).await {
            warn!("Indication on {} failed: {}", characteristic, e);
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Some(status) = encode_machine_status(&event) {
            self.notify(FITNESS_MACHINE_STATUS_UUID, status).await;
        }
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

fn att_result_for(error: &ZwackError) -> AttResult {
    match error {
        ZwackError::NotPermitted {
            operation: "read", ..
        } => AttResult::ReadNotPermitted,
        ZwackError::NotPermitted { .. } => AttResult::WriteNotPermitted,
        ZwackError::UnknownCharacteristic(_) => AttResult::AttributeNotFound,
        ZwackError::Protocol(_) => AttResult::InvalidAttributeLength,
        _ => AttResult::UnlikelyError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::{Delivery, LoopbackStack},
        types::{CyclingPowerMode, ServiceSelection},
        CYCLING_POWER_MEASUREMENT_UUID, FITNESS_MACHINE_CONTROL_POINT_UUID,
        FITNESS_MACHINE_FEATURE_UUID, FITNESS_MACHINE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
        RSC_MEASUREMENT_UUID, SENSOR_LOCATION_UUID,
    };

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    const CP: Uuid = FITNESS_MACHINE_CONTROL_POINT_UUID;

    /// Loopback stack that can hold one indication until released
    #[derive(Default)]
    struct GatedStack {
        inner: LoopbackStack,
        hold_next: AtomicBool,
        held: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BleStack for GatedStack {
        async fn start_advertising(&self, name: &str, service_uuids: &[Uuid]) -> Result<()> {
            self.inner.start_advertising(name, service_uuids).await
        }

        async fn stop_advertising(&self) -> Result<()> {
            self.inner.stop_advertising().await
        }

        async fn register_services(&self, services: &[ServiceDescriptor]) -> Result<()> {
            self.inner.register_services(services).await
        }

        async fn send_indication(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.release.notified().await;
            }
            self.inner.send_indication(characteristic, value).await
        }

        async fn send_notification(&self, characteristic: Uuid, value: Bytes) -> Result<()> {
            self.inner.send_notification(characteristic, value).await
        }
    }

    fn setup(config: PeripheralConfig) -> (Arc<LoopbackStack>, FitnessPeripheral) {
        let stack = Arc::new(LoopbackStack::new());
        let peripheral = FitnessPeripheral::new(config, stack.clone()).unwrap();
        (stack, peripheral)
    }

    #[tokio::test]
    async fn test_power_on_registers_services() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        peripheral
            .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOn))
            .await;

        let (name, uuids) = stack.advertising().await.unwrap();
        assert_eq!(name, "Zwack");
        assert_eq!(uuids, vec![FITNESS_MACHINE_SERVICE_UUID]);
        let services = stack.registered_services().await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].characteristics.len(), 5);

        peripheral
            .on_connection_event(ConnectionEvent::StateChange(AdapterState::PoweredOff))
            .await;
        assert!(stack.advertising().await.is_none());
    }

    #[tokio::test]
    async fn test_control_point_round_trip() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        let mut events = peripheral.subscribe_events();

        assert_eq!(
            peripheral.on_write_received(CP, &[0x00]).await,
            AttResult::Success
        );
        assert_eq!(
            peripheral.on_write_received(CP, &[0x05, 0xC8, 0x00]).await,
            AttResult::Success
        );

        let indications = stack.outbound_for(CP).await;
        assert_eq!(indications.len(), 2);
        assert!(indications.iter().all(|o| o.delivery == Delivery::Indicate));
        assert_eq!(&indications[0].value[..], &[0x80, 0x00, 0x01]);
        assert_eq!(&indications[1].value[..], &[0x80, 0x05, 0x01]);

        assert_eq!(events.recv().await.unwrap(), DomainEvent::ControlAcquired);
        assert_eq!(events.recv().await.unwrap(), DomainEvent::TargetPowerSet(200));
    }

    #[tokio::test]
    async fn test_concurrent_writes_publish_in_transition_order() {
        let stack = Arc::new(GatedStack::default());
        let peripheral =
            Arc::new(FitnessPeripheral::new(PeripheralConfig::default(), stack.clone()).unwrap());
        peripheral.on_write_received(CP, &[0x00]).await;
        let mut events = peripheral.subscribe_events();

        stack.hold_next.store(true, Ordering::SeqCst);
        let start = tokio::spawn({
            let peripheral = Arc::clone(&peripheral);
            async move { peripheral.on_write_received(CP, &[0x07]).await }
        });
        // start has transitioned and is blocked in its indication
        stack.held.notified().await;

        let stop = tokio::spawn({
            let peripheral = Arc::clone(&peripheral);
            async move { peripheral.on_write_received(CP, &[0x08]).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stop.is_finished());

        stack.release.notify_one();
        assert_eq!(start.await.unwrap(), AttResult::Success);
        assert_eq!(stop.await.unwrap(), AttResult::Success);

        assert_eq!(events.recv().await.unwrap(), DomainEvent::Started);
        assert_eq!(events.recv().await.unwrap(), DomainEvent::Stopped);
        let indications: Vec<Bytes> = stack
            .inner
            .outbound_for(CP)
            .await
            .into_iter()
            .map(|o| o.value)
            .collect();
        assert_eq!(
            indications,
            vec![
                Bytes::from_static(&[0x80, 0x00, 0x01]),
                Bytes::from_static(&[0x80, 0x07, 0x01]),
                Bytes::from_static(&[0x80, 0x08, 0x01]),
            ]
        );
        assert_eq!(
            peripheral.control_session().await,
            ControlSession {
                has_control: true,
                is_running: false,
            }
        );
    }

    #[tokio::test]
    async fn test_refused_command_indicates_without_event() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        let mut events = peripheral.subscribe_events();

        assert_eq!(
            peripheral.on_write_received(CP, &[0x07]).await,
            AttResult::Success
        );
        let sent = stack.take_outbound().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].value[..], &[0x80, 0x07, 0x05]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_notification_follows_response() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        peripheral.on_subscribe(FITNESS_MACHINE_STATUS_UUID).await;

        peripheral.on_write_received(CP, &[0x00]).await;
        peripheral.on_write_received(CP, &[0x07]).await;

        let sent = stack.take_outbound().await;
        // control acquired has no status payload
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].characteristic, CP);
        assert_eq!(&sent[1].value[..], &[0x80, 0x07, 0x01]);
        assert_eq!(sent[2].characteristic, FITNESS_MACHINE_STATUS_UUID);
        assert_eq!(sent[2].delivery, Delivery::Notify);
        assert_eq!(&sent[2].value[..], &[0x04]);
    }

    #[tokio::test]
    async fn test_empty_write_rejected_at_att_layer() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        assert_eq!(
            peripheral.on_write_received(CP, &[]).await,
            AttResult::InvalidAttributeLength
        );
        assert!(stack.take_outbound().await.is_empty());
    }

    #[tokio::test]
    async fn test_write_to_read_only_or_unknown() {
        let (_, peripheral) = setup(PeripheralConfig::default());
        assert_eq!(
            peripheral
                .on_write_received(FITNESS_MACHINE_FEATURE_UUID, &[0x00])
                .await,
            AttResult::WriteNotPermitted
        );
        assert_eq!(
            peripheral
                .on_write_received(RSC_MEASUREMENT_UUID, &[0x00])
                .await,
            AttResult::AttributeNotFound
        );
    }

    #[tokio::test]
    async fn test_reads() {
        let config = PeripheralConfig {
            services: ServiceSelection {
                ftms: true,
                cycling_power: Some(CyclingPowerMode::PowerOnly),
                rsc: false,
            },
            ..Default::default()
        };
        let (_, peripheral) = setup(config);

        let feature = peripheral
            .on_read_request(FITNESS_MACHINE_FEATURE_UUID)
            .await
            .unwrap();
        assert_eq!(feature.len(), 8);
        assert_eq!(
            &peripheral
                .on_read_request(SENSOR_LOCATION_UUID)
                .await
                .unwrap()[..],
            &[13]
        );
        assert_eq!(
            peripheral.on_read_request(INDOOR_BIKE_DATA_UUID).await,
            Err(AttResult::ReadNotPermitted)
        );
        assert_eq!(
            peripheral.on_read_request(RSC_MEASUREMENT_UUID).await,
            Err(AttResult::AttributeNotFound)
        );
    }

    #[tokio::test]
    async fn test_notifications_gated_by_subscription() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        let value = Bytes::from_static(&[0x44, 0x00, 0x08, 0x07, 0xB4, 0x00, 0x64, 0x00]);

        assert!(!peripheral.notify(INDOOR_BIKE_DATA_UUID, value.clone()).await);
        assert!(stack.take_outbound().await.is_empty());

        assert_eq!(
            peripheral.on_subscribe(INDOOR_BIKE_DATA_UUID).await,
            AttResult::Success
        );
        assert!(peripheral.notify(INDOOR_BIKE_DATA_UUID, value.clone()).await);
        assert_eq!(stack.take_outbound().await.len(), 1);

        assert_eq!(
            peripheral.on_unsubscribe(INDOOR_BIKE_DATA_UUID).await,
            AttResult::Success
        );
        // unsubscribing twice is still fine
        assert_eq!(
            peripheral.on_unsubscribe(INDOOR_BIKE_DATA_UUID).await,
            AttResult::Success
        );
        assert!(!peripheral.notify(INDOOR_BIKE_DATA_UUID, value).await);
        assert_eq!(
            peripheral.on_subscribe(CYCLING_POWER_MEASUREMENT_UUID).await,
            AttResult::AttributeNotFound
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_absorbed() {
        let (stack, peripheral) = setup(PeripheralConfig::default());
        peripheral.on_subscribe(INDOOR_BIKE_DATA_UUID).await;
        stack.set_transport_failure(true);

        assert!(
            !peripheral
                .notify(INDOOR_BIKE_DATA_UUID, Bytes::from_static(&[0x00]))
                .await
        );
        // the write is still acknowledged and the state still changes
        assert_eq!(
            peripheral.on_write_received(CP, &[0x00]).await,
            AttResult::Success
        );
        assert!(peripheral.control_session().await.has_control);
    }

    #[tokio::test]
    async fn test_reconnect_resets_session() {
        let (_, peripheral) = setup(PeripheralConfig::default());
        peripheral.on_subscribe(INDOOR_BIKE_DATA_UUID).await;
        peripheral.on_write_received(CP, &[0x00]).await;
        peripheral.on_write_received(CP, &[0x07]).await;
        assert!(peripheral.control_session().await.is_running);

        peripheral
            .on_connection_event(ConnectionEvent::Disconnect("AA:BB:CC:DD:EE:FF".into()))
            .await;
        assert_eq!(peripheral.control_session().await, ControlSession::default());
        assert!(!peripheral.is_subscribed(INDOOR_BIKE_DATA_UUID).await);

        peripheral.on_write_received(CP, &[0x00]).await;
        peripheral
            .on_connection_event(ConnectionEvent::Accept("AA:BB:CC:DD:EE:FF".into()))
            .await;
        assert!(!peripheral.control_session().await.has_control);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PeripheralConfig {
            name: String::new(),
            ..Default::default()
        };
        let stack = Arc::new(LoopbackStack::new());
        assert!(FitnessPeripheral::new(config, stack).is_err());
    }
}
