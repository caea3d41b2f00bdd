use crate::{
    ble::{BleManager, HeartRateConnection},
    cache::{CachedDeviceRef, DeviceCache, PeripheralKind},
    device::abort_stored_watcher,
    error::{FitlinkError, Result},
    protocol::{decode_heart_rate, HeartRateMeasurement},
    types::{ConnectionParams, ConnectionState, DiscoveredDevice, HeartRateEvent, ScanOutcome},
    HEART_RATE_SERVICE_UUID,
};
use btleplug::api::CentralEvent;
use futures::{future::Future, stream::StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Reconnect attempts after an unsolicited heart rate monitor disconnect
const RECONNECT_ATTEMPTS: u32 = 3;
/// Constant delay between those attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Client for a BLE heart rate strap.
///
/// A read-only peer of [`FtmsClient`](crate::FtmsClient): no control point
/// and no command queue, so reconnection is a fixed number of constant-delay
/// retries instead of exponential backoff. Measurements arrive as
/// [`HeartRateEvent`]s on the channel returned at construction.
#[derive(Clone)]
pub struct HeartRateMonitor {
    ble: Arc<BleManager>,
    cache: Arc<dyn DeviceCache>,
    params: ConnectionParams,
    events: mpsc::UnboundedSender<HeartRateEvent>,
    state: Arc<RwLock<ConnectionState>>,
    connection: Arc<Mutex<Option<HeartRateConnection>>>,
    latest: Arc<RwLock<Option<HeartRateMeasurement>>>,
    last_device: Arc<RwLock<Option<DiscoveredDevice>>>,
    manual_disconnect: Arc<AtomicBool>,
    stream_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    watcher_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl HeartRateMonitor {
    /// Create a monitor with default parameters
    ///
    /// # Errors
    ///
    /// Returns a transport error when the Bluetooth stack cannot be
    /// initialized.
    pub async fn new(
        cache: Arc<dyn DeviceCache>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HeartRateEvent>)> {
        Self::with_params(cache, ConnectionParams::default()).await
    }

    /// Create a monitor with explicit connection parameters
    ///
    /// # Errors
    ///
    /// Returns a transport error when the Bluetooth stack cannot be
    /// initialized.
    pub async fn with_params(
        cache: Arc<dyn DeviceCache>,
        params: ConnectionParams,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HeartRateEvent>)> {
        let ble = Arc::new(BleManager::new().await?);
        let (events, receiver) = mpsc::unbounded_channel();
        let monitor = Self {
            ble,
            cache,
            params,
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection: Arc::new(Mutex::new(None)),
            latest: Arc::new(RwLock::new(None)),
            last_device: Arc::new(RwLock::new(None)),
            manual_disconnect: Arc::new(AtomicBool::new(false)),
            stream_tasks: Arc::new(StdMutex::new(Vec::new())),
            watcher_task: Arc::new(StdMutex::new(None)),
        };
        Ok((monitor, receiver))
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Most recent decoded measurement
    pub async fn latest_measurement(&self) -> Option<HeartRateMeasurement> {
        self.latest.read().await.clone()
    }

    /// Scan for heart rate straps and connect to the strongest match
    ///
    /// # Errors
    ///
    /// Returns transport errors from scanning, or any error from the
    /// connect sequence once a device was picked.
    pub async fn scan_and_connect(&self) -> Result<ScanOutcome> {
        self.manual_disconnect.store(false, Ordering::SeqCst);
        abort_stored_watcher(&self.watcher_task);
        self.set_state(ConnectionState::Scanning).await;

        let devices = self.ble.scan(HEART_RATE_SERVICE_UUID, &self.params).await?;
        let Some(device) = devices.into_iter().next() else {
            self.set_state(ConnectionState::Disconnected).await;
            return Ok(ScanOutcome::NoneFound);
        };

        self.set_state(ConnectionState::Connecting).await;
        match self.establish(&device).await {
            Ok(()) => Ok(ScanOutcome::Connected),
            Err(error) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(error)
            }
        }
    }

    /// Connect to a specific device from an earlier scan
    ///
    /// # Errors
    ///
    /// Returns any error from the connect sequence.
    pub async fn connect_to(&self, device: &DiscoveredDevice) -> Result<()> {
        self.manual_disconnect.store(false, Ordering::SeqCst);
        abort_stored_watcher(&self.watcher_task);
        self.set_state(ConnectionState::Connecting).await;
        match self.establish(device).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(error)
            }
        }
    }

    /// Try to reconnect to the last cached strap without surfacing
    /// failures. Returns the device name on success.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::CacheFormat`] or an I/O error when the cache
    /// itself cannot be read.
    pub async fn reconnect_silently(&self) -> Result<Option<String>> {
        let Some(cached) = self.cache.load(PeripheralKind::HeartRate)? else {
            debug!("no cached heart rate monitor");
            return Ok(None);
        };
        info!(name = %cached.name, "attempting silent reconnect");

        let device = DiscoveredDevice {
            id: cached.id,
            name: cached.name,
            rssi: 0,
        };
        self.manual_disconnect.store(false, Ordering::SeqCst);
        abort_stored_watcher(&self.watcher_task);
        self.set_state(ConnectionState::Connecting).await;
        match self.establish(&device).await {
            Ok(()) => Ok(Some(device.name)),
            Err(error) => {
                debug!("silent reconnect failed: {error}");
                self.set_state(ConnectionState::Disconnected).await;
                Ok(None)
            }
        }
    }

    /// Disconnect and stop all background tasks
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stack refuses the disconnect; the
    /// local teardown still completes.
    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting heart rate monitor");
        self.manual_disconnect.store(true, Ordering::SeqCst);

        self.abort_stream_tasks();
        abort_stored_watcher(&self.watcher_task);

        let connection = self.connection.lock().await.take();
        self.set_state(ConnectionState::Disconnected).await;
        self.emit(HeartRateEvent::Disconnected);

        if let Some(connection) = connection {
            connection.disconnect().await?;
        }
        Ok(())
    }

    /// Forget the cached strap used by
    /// [`HeartRateMonitor::reconnect_silently`]
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the cache cannot be written.
    pub fn forget_cached_device(&self) -> Result<()> {
        self.cache.clear(PeripheralKind::HeartRate)
    }

    fn emit(&self, event: HeartRateEvent) {
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ConnectionState) {
        debug_assert!(is_monitor_state(state));
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = %*current, to = %state, "state transition");
            *current = state;
            drop(current);
            self.emit(HeartRateEvent::StateChanged(state));
        }
    }

    fn abort_stream_tasks(&self) {
        if let Ok(mut tasks) = self.stream_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    // With a single characteristic to resolve there are no discovery or
    // subscription phases; the state stays Connecting until Connected.
    async fn establish(&self, device: &DiscoveredDevice) -> Result<()> {
        info!(name = %device.name, "connecting heart rate monitor");
        self.set_state(ConnectionState::Connecting).await;

        let peripheral = match self.ble.connect(&device.id, &self.params).await {
            Ok(peripheral) => peripheral,
            Err(FitlinkError::DeviceNotFound) => {
                self.set_state(ConnectionState::Scanning).await;
                self.ble.scan(HEART_RATE_SERVICE_UUID, &self.params).await?;
                self.set_state(ConnectionState::Connecting).await;
                self.ble.connect(&device.id, &self.params).await?
            }
            Err(error) => return Err(error),
        };

        let connection = HeartRateConnection::resolve(peripheral)?;
        connection.subscribe().await?;

        let sensor_location = connection
            .read_sensor_location()
            .await
            .unwrap_or_else(|error| {
                warn!("sensor location read failed: {error}");
                None
            });

        let (measurement_tx, measurement_rx) = mpsc::unbounded_channel();
        let pump = connection.spawn_notification_pump(measurement_tx).await?;
        let dispatch = self.spawn_dispatch(measurement_rx);
        self.abort_stream_tasks();
        if let Ok(mut tasks) = self.stream_tasks.lock() {
            tasks.push(pump);
            tasks.push(dispatch);
        }

        *self.connection.lock().await = Some(connection);
        *self.last_device.write().await = Some(device.clone());

        if let Err(error) = self.cache.store(
            PeripheralKind::HeartRate,
            &CachedDeviceRef {
                id: device.id.clone(),
                name: device.name.clone(),
                cached_at: SystemTime::now(),
            },
        ) {
            warn!("device cache write failed: {error}");
        }

        self.set_state(ConnectionState::Connected).await;
        self.emit(HeartRateEvent::Connected {
            name: device.name.clone(),
            sensor_location,
        });

        let watcher = self.spawn_disconnect_watcher(device.id.clone()).await?;
        if let Ok(mut slot) = self.watcher_task.lock() {
            *slot = Some(watcher);
        }

        info!(name = %device.name, "heart rate monitor connected");
        Ok(())
    }

    fn spawn_dispatch(&self, mut measurements: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            while let Some(data) = measurements.recv().await {
                match decode_heart_rate(&data) {
                    Ok(measurement) => {
                        *monitor.latest.write().await = Some(measurement.clone());
                        monitor.emit(HeartRateEvent::Measurement(measurement));
                    }
                    Err(error) => debug!("dropping malformed measurement: {error}"),
                }
            }
        })
    }

    async fn spawn_disconnect_watcher(&self, device_id: String) -> Result<JoinHandle<()>> {
        let mut events = self.ble.events().await?;
        let monitor = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };
                if id.to_string() != device_id {
                    continue;
                }
                if monitor.manual_disconnect.load(Ordering::SeqCst) {
                    debug!("disconnect event after manual disconnect, ignoring");
                } else {
                    warn!("heart rate monitor disconnected unexpectedly");
                    monitor.run_reconnect_loop().await;
                }
                break;
            }
        }))
    }

    // Returns a boxed future to break the establish -> watcher -> reconnect async recursion cycle.
    fn run_reconnect_loop(&self) -> futures::future::BoxFuture<'_, ()> {
        futures::FutureExt::boxed(async move {
            let Some(device) = self.last_device.read().await.clone() else {
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(HeartRateEvent::Disconnected);
                return;
            };

            self.set_state(ConnectionState::Reconnecting).await;
            let result = retry_fixed(RECONNECT_ATTEMPTS, RECONNECT_DELAY, || {
                let monitor = self.clone();
                let device = device.clone();
                async move { monitor.establish(&device).await }
            })
            .await;

            if let Err(error) = result {
                self.emit(HeartRateEvent::Error(format!("reconnect failed: {error}")));
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(HeartRateEvent::Disconnected);
            }
        })
    }
}

/// The monitor drives a subset of [`ConnectionState`]: no transport,
/// discovery, or subscription sub-states for a single-characteristic
/// profile.
const fn is_monitor_state(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::Disconnected
            | ConnectionState::Scanning
            | ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting
    )
}

/// Retry an operation a fixed number of times with a constant delay before
/// each attempt
async fn retry_fixed<F, Fut, T>(attempts: u32, delay: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for n in 1..=attempts {
        tokio::time::sleep(delay).await;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => warn!(attempt = n, "attempt failed: {error}"),
        }
    }
    Err(FitlinkError::ReconnectExhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_retry_fixed_succeeds_within_budget() {
        let calls = AtomicU32::new(0);
        let result = retry_fixed(3, Duration::from_millis(1), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 2 {
                    Err(FitlinkError::Disconnected)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_monitor_states_exclude_connect_sub_phases() {
        assert!(is_monitor_state(ConnectionState::Disconnected));
        assert!(is_monitor_state(ConnectionState::Scanning));
        assert!(is_monitor_state(ConnectionState::Connecting));
        assert!(is_monitor_state(ConnectionState::Connected));
        assert!(is_monitor_state(ConnectionState::Reconnecting));

        assert!(!is_monitor_state(ConnectionState::ConnectingTransport));
        assert!(!is_monitor_state(ConnectionState::DiscoveringServices));
        assert!(!is_monitor_state(ConnectionState::Subscribing));
    }

    #[tokio::test]
    async fn test_retry_fixed_exhausts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_fixed(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FitlinkError::Disconnected) }
        })
        .await;

        assert!(matches!(
            result,
            Err(FitlinkError::ReconnectExhausted { attempts: 3 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
