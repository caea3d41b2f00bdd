use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FitlinkError, Result, TransportKind},
    protocol::{decode_capabilities, decode_power_range, decode_resistance_range},
    queue::ControlChannel,
    types::{ConnectionParams, DeviceCapabilities, DiscoveredDevice, PowerRange, ResistanceRange},
    BODY_SENSOR_LOCATION_UUID, CONTROL_POINT_UUID, FITNESS_MACHINE_FEATURE_UUID,
    FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
    INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID, SUPPORTED_POWER_RANGE_UUID,
    SUPPORTED_RESISTANCE_RANGE_UUID, TRAINING_STATUS_UUID,
};

/// A notification routed off the shared BLE stream, tagged by the
/// characteristic it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Indoor Bike Data telemetry frame
    IndoorBikeData(Vec<u8>),
    /// Fitness Machine Status event
    MachineStatus(Vec<u8>),
    /// Control point indication
    ControlPoint(Vec<u8>),
    /// Training Status update
    TrainingStatus(Vec<u8>),
}

/// Route a raw notification to its tagged variant. Returns `None` for
/// characteristics this crate does not consume.
fn route_notification(uuid: Uuid, value: Vec<u8>) -> Option<Notification> {
    if uuid == INDOOR_BIKE_DATA_UUID {
        Some(Notification::IndoorBikeData(value))
    } else if uuid == MACHINE_STATUS_UUID {
        Some(Notification::MachineStatus(value))
    } else if uuid == CONTROL_POINT_UUID {
        Some(Notification::ControlPoint(value))
    } else if uuid == TRAINING_STATUS_UUID {
        Some(Notification::TrainingStatus(value))
    } else {
        None
    }
}

/// BLE adapter access and scan cache.
///
/// Peripherals seen during the last scan stay cached by platform id so a
/// later connect (or a cached-device reconnect) can resolve them without
/// rescanning.
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleManager {
    /// Create a manager bound to the platform Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns a transport error when the Bluetooth stack cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;
        adapters.into_iter().next().ok_or(FitlinkError::Transport {
            kind: TransportKind::Radio,
            message: "no bluetooth adapters available".to_string(),
        })
    }

    /// Scan for peripherals advertising the given service.
    ///
    /// Blocks for the configured scan window, then returns the matches
    /// sorted by descending signal strength.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the adapter cannot scan.
    pub async fn scan(
        &self,
        service: Uuid,
        params: &ConnectionParams,
    ) -> Result<Vec<DiscoveredDevice>> {
        info!(%service, "starting scan");
        let central = self.adapter().await?;

        central
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            // the platform filter is advisory on some backends, so check
            // the advertised services again
            if !properties.services.contains(&service) {
                continue;
            }
            let device = DiscoveredDevice {
                id: peripheral.id().to_string(),
                name: properties
                    .local_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                rssi: properties.rssi.unwrap_or(0),
            };
            debug!(name = %device.name, rssi = device.rssi, "found device");
            self.peripherals
                .lock()
                .await
                .insert(device.id.clone(), peripheral);
            devices.push(device);
        }

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!("scan complete, {} device(s) found", devices.len());
        Ok(devices)
    }

    /// Connect to a previously scanned peripheral by its platform id and
    /// discover its services.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::DeviceNotFound`] when the id was not seen in
    /// the last scan, [`FitlinkError::Timeout`] when the transport connect
    /// exceeds the configured window, or a transport error from the stack.
    pub async fn connect(&self, id: &str, params: &ConnectionParams) -> Result<Peripheral> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(FitlinkError::DeviceNotFound)?;

        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| FitlinkError::Timeout {
            timeout_ms: params.connect_timeout_ms,
        })??;

        peripheral.discover_services().await?;
        Ok(peripheral)
    }

    /// Adapter event stream, used to observe unsolicited disconnects
    ///
    /// # Errors
    ///
    /// Returns a transport error when the adapter cannot be opened.
    pub async fn events(&self) -> Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>> {
        Ok(self.adapter().await?.events().await?)
    }
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
    peripheral
        .services()
        .iter()
        .find(|s| s.uuid == service)?
        .characteristics
        .iter()
        .find(|c| c.uuid == characteristic)
        .cloned()
}

/// Resolved Fitness Machine Service characteristics on a connected
/// peripheral.
///
/// Indoor Bike Data and the control point are mandatory; everything else
/// degrades gracefully when absent.
pub struct FtmsConnection {
    peripheral: Peripheral,
    indoor_bike_data: Characteristic,
    control_point: Characteristic,
    feature: Option<Characteristic>,
    training_status: Option<Characteristic>,
    resistance_range: Option<Characteristic>,
    power_range: Option<Characteristic>,
    machine_status: Option<Characteristic>,
}

impl FtmsConnection {
    /// Resolve the service table on an already connected peripheral
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::MissingCharacteristic`] when Indoor Bike
    /// Data or the control point is absent.
    pub fn resolve(peripheral: Peripheral) -> Result<Self> {
        let service = FITNESS_MACHINE_SERVICE_UUID;
        let required = |uuid: Uuid| {
            find_characteristic(&peripheral, service, uuid)
                .ok_or(FitlinkError::MissingCharacteristic(uuid))
        };
        let optional = |uuid: Uuid| {
            let found = find_characteristic(&peripheral, service, uuid);
            if found.is_none() {
                debug!(%uuid, "optional characteristic not present");
            }
            found
        };

        Ok(Self {
            indoor_bike_data: required(INDOOR_BIKE_DATA_UUID)?,
            control_point: required(CONTROL_POINT_UUID)?,
            feature: optional(FITNESS_MACHINE_FEATURE_UUID),
            training_status: optional(TRAINING_STATUS_UUID),
            resistance_range: optional(SUPPORTED_RESISTANCE_RANGE_UUID),
            power_range: optional(SUPPORTED_POWER_RANGE_UUID),
            machine_status: optional(MACHINE_STATUS_UUID),
            peripheral,
        })
    }

    /// Subscribe to every notifying characteristic the device exposes
    ///
    /// # Errors
    ///
    /// Returns a transport error when a mandatory subscription fails.
    /// Optional subscriptions only log.
    pub async fn subscribe_all(&self) -> Result<()> {
        self.peripheral.subscribe(&self.indoor_bike_data).await?;
        self.peripheral.subscribe(&self.control_point).await?;
        for characteristic in [&self.training_status, &self.machine_status]
            .into_iter()
            .flatten()
        {
            if let Err(error) = self.peripheral.subscribe(characteristic).await {
                warn!(uuid = %characteristic.uuid, "optional subscription failed: {error}");
            }
        }
        Ok(())
    }

    /// Pump BLE notifications into the given channel until the stream ends
    /// or the receiver goes away.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the notification stream cannot be
    /// opened.
    pub async fn spawn_notification_pump(
        &self,
        sender: mpsc::UnboundedSender<Notification>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut stream = self.peripheral.notifications().await?;
        Ok(tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                if let Some(notification) = route_notification(data.uuid, data.value) {
                    if sender.send(notification).is_err() {
                        break;
                    }
                }
            }
        }))
    }

    /// Read and decode the feature characteristic, when present
    ///
    /// # Errors
    ///
    /// Returns a transport error on read failure or a decode error on a
    /// short value.
    pub async fn read_capabilities(&self) -> Result<Option<DeviceCapabilities>> {
        let Some(characteristic) = &self.feature else {
            return Ok(None);
        };
        let value = self.peripheral.read(characteristic).await?;
        Ok(Some(decode_capabilities(&value)?))
    }

    /// Read and decode the supported resistance range, when present
    ///
    /// # Errors
    ///
    /// Returns a transport error on read failure or a decode error on a
    /// short value.
    pub async fn read_resistance_range(&self) -> Result<Option<ResistanceRange>> {
        let Some(characteristic) = &self.resistance_range else {
            return Ok(None);
        };
        let value = self.peripheral.read(characteristic).await?;
        Ok(Some(decode_resistance_range(&value)?))
    }

    /// Read and decode the supported power range, when present
    ///
    /// # Errors
    ///
    /// Returns a transport error on read failure or a decode error on a
    /// short value.
    pub async fn read_power_range(&self) -> Result<Option<PowerRange>> {
        let Some(characteristic) = &self.power_range else {
            return Ok(None);
        };
        let value = self.peripheral.read(characteristic).await?;
        Ok(Some(decode_power_range(&value)?))
    }

    /// Handle for writing encoded commands to the control point
    #[must_use]
    pub fn control_channel(&self) -> BleControlChannel {
        BleControlChannel {
            peripheral: self.peripheral.clone(),
            control_point: self.control_point.clone(),
        }
    }

    /// Whether the transport link is still up
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Platform id of the connected peripheral
    #[must_use]
    pub fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    /// Tear down the transport link
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stack refuses the disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Control point write half handed to the command queue
pub struct BleControlChannel {
    peripheral: Peripheral,
    control_point: Characteristic,
}

#[async_trait::async_trait]
impl ControlChannel for BleControlChannel {
    async fn write(&self, payload: &[u8]) -> Result<()> {
        debug!("control point write: {payload:02X?}");
        self.peripheral
            .write(&self.control_point, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

/// Resolved Heart Rate Service characteristics on a connected peripheral
pub struct HeartRateConnection {
    peripheral: Peripheral,
    measurement: Characteristic,
    sensor_location: Option<Characteristic>,
}

impl HeartRateConnection {
    /// Resolve the service table on an already connected peripheral
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::MissingCharacteristic`] when Heart Rate
    /// Measurement is absent.
    pub fn resolve(peripheral: Peripheral) -> Result<Self> {
        let measurement =
            find_characteristic(&peripheral, HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
                .ok_or(FitlinkError::MissingCharacteristic(
                    HEART_RATE_MEASUREMENT_UUID,
                ))?;
        let sensor_location =
            find_characteristic(&peripheral, HEART_RATE_SERVICE_UUID, BODY_SENSOR_LOCATION_UUID);
        Ok(Self {
            peripheral,
            measurement,
            sensor_location,
        })
    }

    /// Subscribe to heart rate measurements
    ///
    /// # Errors
    ///
    /// Returns a transport error when the subscription fails.
    pub async fn subscribe(&self) -> Result<()> {
        self.peripheral.subscribe(&self.measurement).await?;
        Ok(())
    }

    /// Read the body sensor location byte, when the characteristic exists
    ///
    /// # Errors
    ///
    /// Returns a transport error on read failure.
    pub async fn read_sensor_location(&self) -> Result<Option<u8>> {
        let Some(characteristic) = &self.sensor_location else {
            return Ok(None);
        };
        let value = self.peripheral.read(characteristic).await?;
        Ok(value.first().copied())
    }

    /// Pump raw measurement notifications into the given channel
    ///
    /// # Errors
    ///
    /// Returns a transport error when the notification stream cannot be
    /// opened.
    pub async fn spawn_notification_pump(
        &self,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let measurement_uuid = self.measurement.uuid;
        let mut stream = self.peripheral.notifications().await?;
        Ok(tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                if data.uuid == measurement_uuid && sender.send(data.value).is_err() {
                    break;
                }
            }
        }))
    }

    /// Whether the transport link is still up
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Platform id of the connected peripheral
    #[must_use]
    pub fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    /// Tear down the transport link
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stack refuses the disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_routing_by_uuid() {
        let frame = vec![0x44, 0x00];
        assert_eq!(
            route_notification(INDOOR_BIKE_DATA_UUID, frame.clone()),
            Some(Notification::IndoorBikeData(frame.clone()))
        );
        assert_eq!(
            route_notification(MACHINE_STATUS_UUID, frame.clone()),
            Some(Notification::MachineStatus(frame.clone()))
        );
        assert_eq!(
            route_notification(CONTROL_POINT_UUID, frame.clone()),
            Some(Notification::ControlPoint(frame.clone()))
        );
        assert_eq!(
            route_notification(TRAINING_STATUS_UUID, frame.clone()),
            Some(Notification::TrainingStatus(frame.clone()))
        );
        assert_eq!(route_notification(HEART_RATE_MEASUREMENT_UUID, frame), None);
    }

    #[test]
    fn test_service_uuids_are_distinct() {
        assert_ne!(FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_SERVICE_UUID);
        assert_ne!(INDOOR_BIKE_DATA_UUID, CONTROL_POINT_UUID);
    }
}
