//! GATT characteristics and the services built from them.

use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ble::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor},
    control_point::ControlPoint,
    error::{Result, ZwackError},
    protocol::{
        encode_cycling_power_feature, encode_fitness_machine_feature, encode_rsc_feature,
        encode_sensor_location, encode_supported_power_range, SensorLocation,
    },
    types::{DomainEvent, PowerRange, ServiceSelection},
    CYCLING_POWER_FEATURE_UUID, CYCLING_POWER_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID,
    FITNESS_MACHINE_CONTROL_POINT_UUID, FITNESS_MACHINE_FEATURE_UUID,
    FITNESS_MACHINE_SERVICE_UUID, FITNESS_MACHINE_STATUS_UUID, INDOOR_BIKE_DATA_UUID,
    RSC_FEATURE_UUID, RSC_MEASUREMENT_UUID, RUNNING_SPEED_CADENCE_SERVICE_UUID,
    SENSOR_LOCATION_UUID, SUPPORTED_POWER_RANGE_UUID,
};

/// What a successful characteristic write asks the peripheral to do next
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteOutcome {
    /// Value to indicate back on the written characteristic
    pub indication: Option<Bytes>,
    /// Event to publish once the indication has been sent
    pub event: Option<DomainEvent>,
}

/// A GATT characteristic exposed by the peripheral
///
/// Reads and writes are refused unless the implementation overrides them.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// Characteristic UUID
    fn uuid(&self) -> Uuid;

    /// Human readable description
    fn description(&self) -> &str;

    /// Supported operations
    fn properties(&self) -> CharacteristicProperties;

    /// Handle a read request
    async fn on_read(&self) -> Result<Bytes> {
        Err(ZwackError::NotPermitted {
            uuid: self.uuid(),
            operation: "read",
        })
    }

    /// Handle a write request
    async fn on_write(&self, _data: &[u8]) -> Result<WriteOutcome> {
        Err(ZwackError::NotPermitted {
            uuid: self.uuid(),
            operation: "write",
        })
    }

    /// Descriptor handed to the BLE stack at registration
    fn descriptor(&self) -> CharacteristicDescriptor {
        CharacteristicDescriptor {
            uuid: self.uuid(),
            properties: self.properties(),
            description: self.description().to_string(),
        }
    }
}

/// Read-only characteristic with a fixed value
#[derive(Debug, Clone)]
pub struct StaticCharacteristic {
    uuid: Uuid,
    description: &'static str,
    value: Bytes,
}

impl StaticCharacteristic {
    /// Create a read-only characteristic
    #[must_use]
    pub const fn new(uuid: Uuid, description: &'static str, value: Bytes) -> Self {
        Self {
            uuid,
            description,
            value,
        }
    }
}

#[async_trait]
impl Characteristic for StaticCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn description(&self) -> &str {
        self.description
    }

    fn properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::READ
    }

    async fn on_read(&self) -> Result<Bytes> {
        Ok(self.value.clone())
    }
}

/// Notify-only characteristic whose values are pushed by the dispatcher
#[derive(Debug, Clone)]
pub struct NotifyCharacteristic {
    uuid: Uuid,
    description: &'static str,
}

impl NotifyCharacteristic {
    /// Create a notify-only characteristic
    #[must_use]
    pub const fn new(uuid: Uuid, description: &'static str) -> Self {
        Self { uuid, description }
    }
}

#[async_trait]
impl Characteristic for NotifyCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn description(&self) -> &str {
        self.description
    }

    fn properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::NOTIFY
    }
}

/// Fitness Machine Control Point (0x2AD9)
///
/// Shares its [`ControlPoint`] with the peripheral so connection events can
/// reset the session.
pub struct ControlPointCharacteristic {
    control: Arc<Mutex<ControlPoint>>,
}

impl ControlPointCharacteristic {
    /// Wrap a shared control point
    #[must_use]
    pub const fn new(control: Arc<Mutex<ControlPoint>>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Characteristic for ControlPointCharacteristic {
    fn uuid(&self) -> Uuid {
        FITNESS_MACHINE_CONTROL_POINT_UUID
    }

    fn description(&self) -> &str {
        "Fitness Machine Control Point"
    }

    fn properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::WRITE_INDICATE
    }

    async fn on_write(&self, data: &[u8]) -> Result<WriteOutcome> {
        let outcome = self.control.lock().await.handle_write(data)?;
        Ok(WriteOutcome {
            indication: Some(outcome.response()),
            event: outcome.event,
        })
    }
}

/// A primary service and its characteristics
#[derive(Clone)]
pub struct ServiceDefinition {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in registration order
    pub characteristics: Vec<Arc<dyn Characteristic>>,
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("uuid", &self.uuid)
            .field(
                "characteristics",
                &self
                    .characteristics
                    .iter()
                    .map(|c| c.uuid())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ServiceDefinition {
    /// Descriptor handed to the BLE stack at registration
    #[must_use]
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            uuid: self.uuid,
            characteristics: self.characteristics.iter().map(|c| c.descriptor()).collect(),
        }
    }
}

fn shared<C: Characteristic + 'static>(characteristic: C) -> Arc<dyn Characteristic> {
    Arc::new(characteristic)
}

/// Fitness Machine Service (0x1826)
#[must_use]
pub fn fitness_machine_service(
    control: Arc<Mutex<ControlPoint>>,
    power_range: &PowerRange,
) -> ServiceDefinition {
    ServiceDefinition {
        uuid: FITNESS_MACHINE_SERVICE_UUID,
        characteristics: vec![
            shared(StaticCharacteristic::new(
                FITNESS_MACHINE_FEATURE_UUID,
                "Fitness Machine Feature",
                encode_fitness_machine_feature(),
            )),
            shared(StaticCharacteristic::new(
                SUPPORTED_POWER_RANGE_UUID,
                "Supported Power Range",
                encode_supported_power_range(power_range),
            )),
            shared(NotifyCharacteristic::new(
                INDOOR_BIKE_DATA_UUID,
                "Indoor Bike Data",
            )),
            shared(NotifyCharacteristic::new(
                FITNESS_MACHINE_STATUS_UUID,
                "Fitness Machine Status",
            )),
            shared(ControlPointCharacteristic::new(control)),
        ],
    }
}

/// Cycling Power Service (0x1818)
#[must_use]
pub fn cycling_power_service() -> ServiceDefinition {
    ServiceDefinition {
        uuid: CYCLING_POWER_SERVICE_UUID,
        characteristics: vec![
            shared(NotifyCharacteristic::new(
                CYCLING_POWER_MEASUREMENT_UUID,
                "Cycling Power Measurement",
            )),
            shared(StaticCharacteristic::new(
                CYCLING_POWER_FEATURE_UUID,
                "Cycling Power Feature",
                encode_cycling_power_feature(),
            )),
            shared(StaticCharacteristic::new(
                SENSOR_LOCATION_UUID,
                "Sensor Location",
                encode_sensor_location(SensorLocation::RearHub),
            )),
        ],
    }
}

/// Running Speed and Cadence Service (0x1814)
#[must_use]
pub fn running_speed_cadence_service() -> ServiceDefinition {
    ServiceDefinition {
        uuid: RUNNING_SPEED_CADENCE_SERVICE_UUID,
        characteristics: vec![
            shared(NotifyCharacteristic::new(
                RSC_MEASUREMENT_UUID,
                "RSC Measurement",
            )),
            shared(StaticCharacteristic::new(
                RSC_FEATURE_UUID,
                "RSC Feature",
                encode_rsc_feature(),
            )),
            shared(StaticCharacteristic::new(
                SENSOR_LOCATION_UUID,
                "Sensor Location",
                encode_sensor_location(SensorLocation::InShoe),
            )),
        ],
    }
}

/// Services for the enabled families, in advertising order
#[must_use]
pub fn build_services(
    selection: &ServiceSelection,
    control: &Arc<Mutex<ControlPoint>>,
    power_range: &PowerRange,
) -> Vec<ServiceDefinition> {
    let mut services = Vec::new();
    if selection.ftms {
        services.push(fitness_machine_service(Arc::clone(control), power_range));
    }
    if selection.cycling_power.is_some() {
        services.push(cycling_power_service());
    }
    if selection.rsc {
        services.push(running_speed_cadence_service());
    }
    services
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CyclingPowerMode, ResultCode};

    fn control() -> Arc<Mutex<ControlPoint>> {
        Arc::new(Mutex::new(ControlPoint::new()))
    }

    #[tokio::test]
    async fn test_static_reads() {
        let service = fitness_machine_service(control(), &PowerRange::default());
        let feature = &service.characteristics[0];
        assert_eq!(feature.uuid(), FITNESS_MACHINE_FEATURE_UUID);
        assert_eq!(feature.on_read().await.unwrap().len(), 8);

        let range = &service.characteristics[1];
        assert_eq!(
            &range.on_read().await.unwrap()[..],
            &[0x00, 0x00, 0xE8, 0x03, 0x01, 0x00]
        );
    }

    #[tokio::test]
    async fn test_notify_characteristic_refuses_read_and_write() {
        let data = NotifyCharacteristic::new(INDOOR_BIKE_DATA_UUID, "Indoor Bike Data");
        assert!(matches!(
            data.on_read().await,
            Err(ZwackError::NotPermitted {
                operation: "read",
                ..
            })
        ));
        assert!(matches!(
            data.on_write(&[0x00]).await,
            Err(ZwackError::NotPermitted {
                operation: "write",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_control_point_write_returns_response() {
        let shared = control();
        let cp = ControlPointCharacteristic::new(Arc::clone(&shared));

        let outcome = cp.on_write(&[0x00]).await.unwrap();
        assert_eq!(outcome.indication.as_deref(), Some(&[0x80, 0x00, 0x01][..]));
        assert_eq!(outcome.event, Some(DomainEvent::ControlAcquired));
        assert!(shared.lock().await.session().has_control);

        let outcome = cp.on_write(&[0x08]).await.unwrap();
        assert_eq!(
            outcome.indication.as_deref(),
            Some(&[0x80, 0x08, ResultCode::OperationFailed as u8][..])
        );
        assert_eq!(outcome.event, None);

        assert!(cp.on_write(&[]).await.is_err());
    }

    #[test]
    fn test_build_services_follows_selection() {
        let selection = ServiceSelection {
            ftms: true,
            cycling_power: Some(CyclingPowerMode::PowerCadence),
            rsc: true,
        };
        let services = build_services(&selection, &control(), &PowerRange::default());
        let uuids: Vec<Uuid> = services.iter().map(|s| s.uuid).collect();
        assert_eq!(
            uuids,
            vec![
                FITNESS_MACHINE_SERVICE_UUID,
                CYCLING_POWER_SERVICE_UUID,
                RUNNING_SPEED_CADENCE_SERVICE_UUID
            ]
        );

        let only_rsc = ServiceSelection {
            rsc: true,
            ..Default::default()
        };
        let services = build_services(&only_rsc, &control(), &PowerRange::default());
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].characteristics.len(), 3);
    }

    #[test]
    fn test_descriptors_carry_properties() {
        let descriptor = fitness_machine_service(control(), &PowerRange::default()).descriptor();
        let cp = descriptor
            .characteristics
            .iter()
            .find(|c| c.uuid == FITNESS_MACHINE_CONTROL_POINT_UUID)
            .unwrap();
        assert_eq!(cp.properties, CharacteristicProperties::WRITE_INDICATE);
        assert_eq!(cp.description, "Fitness Machine Control Point");
    }
}
