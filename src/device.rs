use crate::{
    ble::{BleManager, FtmsConnection, Notification},
    cache::{CachedDeviceRef, DeviceCache, PeripheralKind},
    error::{FitlinkError, Result},
    protocol::{decode_indoor_bike_data, decode_status},
    queue::{CommandQueue, QueueStats},
    types::{
        ConnectionParams, ConnectionState, DeviceCapabilities, DiscoveredDevice, FtmsEvent,
        PowerRange, ReconnectPolicy, ResistanceRange, ScanOutcome, TelemetrySample,
    },
    FITNESS_MACHINE_SERVICE_UUID,
};
use btleplug::api::CentralEvent;
use futures::{future::Future, stream::StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant, SystemTime},
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// High-level client for an FTMS indoor bike.
///
/// Owns the connection state machine: scanning, the connect sequence
/// (transport, service discovery, subscriptions, control handshake), the
/// command queue, and automatic reconnection with exponential backoff.
/// Everything the consumer needs to observe arrives as [`FtmsEvent`]s on
/// the channel returned at construction.
///
/// The client is cheap to clone; clones share the same connection.
///
/// # Examples
///
/// ```no_run
/// use fitlink::{FtmsClient, FtmsEvent, MemoryDeviceCache, ScanOutcome};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (client, mut events) = FtmsClient::new(Arc::new(MemoryDeviceCache::default())).await?;
///
///     if client.scan_and_connect().await? == ScanOutcome::NoneFound {
///         println!("no fitness machine in range");
///         return Ok(());
///     }
///
///     client.set_target_power(180).await?;
///
///     while let Some(event) = events.recv().await {
///         if let FtmsEvent::Telemetry(sample) = event {
///             println!("power: {:?} W", sample.power_watts);
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct FtmsClient {
    ble: Arc<BleManager>,
    cache: Arc<dyn DeviceCache>,
    params: ConnectionParams,
    events: mpsc::UnboundedSender<FtmsEvent>,
    state: Arc<RwLock<ConnectionState>>,
    connection: Arc<Mutex<Option<FtmsConnection>>>,
    queue: Arc<Mutex<Option<CommandQueue>>>,
    capabilities: Arc<RwLock<Option<DeviceCapabilities>>>,
    resistance_range: Arc<RwLock<Option<ResistanceRange>>>,
    power_range: Arc<RwLock<Option<PowerRange>>>,
    latest_sample: Arc<RwLock<Option<TelemetrySample>>>,
    last_device: Arc<RwLock<Option<DiscoveredDevice>>>,
    reconnect_policy: Arc<Mutex<ReconnectPolicy>>,
    manual_disconnect: Arc<AtomicBool>,
    stream_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    watcher_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl FtmsClient {
    /// Create a client with default parameters and reconnect policy.
    ///
    /// Returns the client and the event channel consumers should drain.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the Bluetooth stack cannot be
    /// initialized.
    pub async fn new(
        cache: Arc<dyn DeviceCache>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FtmsEvent>)> {
        Self::with_params(cache, ConnectionParams::default(), ReconnectPolicy::default()).await
    }

    /// Create a client with explicit connection parameters and reconnect
    /// policy
    ///
    /// # Errors
    ///
    /// Returns a transport error when the Bluetooth stack cannot be
    /// initialized.
    pub async fn with_params(
        cache: Arc<dyn DeviceCache>,
        params: ConnectionParams,
        policy: ReconnectPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FtmsEvent>)> {
        let ble = Arc::new(BleManager::new().await?);
        let (events, receiver) = mpsc::unbounded_channel();
        let client = Self {
            ble,
            cache,
            params,
            events,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection: Arc::new(Mutex::new(None)),
            queue: Arc::new(Mutex::new(None)),
            capabilities: Arc::new(RwLock::new(None)),
            resistance_range: Arc::new(RwLock::new(None)),
            power_range: Arc::new(RwLock::new(None)),
            latest_sample: Arc::new(RwLock::new(None)),
            last_device: Arc::new(RwLock::new(None)),
            reconnect_policy: Arc::new(Mutex::new(policy)),
            manual_disconnect: Arc::new(AtomicBool::new(false)),
            stream_tasks: Arc::new(StdMutex::new(Vec::new())),
            watcher_task: Arc::new(StdMutex::new(None)),
        };
        Ok((client, receiver))
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the transport link is up
    pub async fn is_connected(&self) -> bool {
        if let Some(connection) = self.connection.lock().await.as_ref() {
            connection.is_connected().await
        } else {
            false
        }
    }

    /// Capabilities read during connection, when the device exposed them
    pub async fn capabilities(&self) -> Option<DeviceCapabilities> {
        *self.capabilities.read().await
    }

    /// Supported resistance range, when the device exposed it
    pub async fn resistance_range(&self) -> Option<ResistanceRange> {
        *self.resistance_range.read().await
    }

    /// Supported power range, when the device exposed it
    pub async fn power_range(&self) -> Option<PowerRange> {
        *self.power_range.read().await
    }

    /// Most recent telemetry sample, including frames the debounce dropped
    /// from the event stream
    pub async fn latest_sample(&self) -> Option<TelemetrySample> {
        self.latest_sample.read().await.clone()
    }

    /// Command queue counters for the current connection
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Disconnected`] when no device is connected.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.command_queue().await?.stats().await)
    }

    /// Scan for fitness machines and connect to the strongest match.
    ///
    /// An empty scan window is a normal outcome, not an error.
    ///
    /// # Errors
    ///
    /// Returns transport errors from scanning, or any error from the
    /// connect sequence once a device was picked.
    pub async fn scan_and_connect(&self) -> Result<ScanOutcome> {
        self.manual_disconnect.store(false, Ordering::SeqCst);
        abort_stored_watcher(&self.watcher_task);
        self.set_state(ConnectionState::Scanning).await;

        let devices = self
            .ble
            .scan(FITNESS_MACHINE_SERVICE_UUID, &self.params)
            .await?;
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

    /// Try to reconnect to the last cached device without surfacing
    /// failures.
    ///
    /// Returns the device name on success, `None` when there is no cached
    /// device or the attempt did not succeed. Intended for app startup,
    /// where a failed reconnect should fall through to a normal scan.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::CacheFormat`] or an I/O error when the cache
    /// itself cannot be read.
    pub async fn reconnect_silently(&self) -> Result<Option<String>> {
        let Some(cached) = self.cache.load(PeripheralKind::FitnessMachine)? else {
            debug!("no cached fitness machine");
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

    /// Disconnect and stop all background tasks.
    ///
    /// Suppresses the automatic reconnection that an unsolicited disconnect
    /// would otherwise trigger.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the stack refuses the disconnect; the
    /// local teardown still completes.
    pub async fn disconnect(&self) -> Result<()> {
        info!("disconnecting");
        self.manual_disconnect.store(true, Ordering::SeqCst);

        if let Some(queue) = self.queue.lock().await.take() {
            queue.cancel_all().await;
        }
        self.abort_stream_tasks();
        abort_stored_watcher(&self.watcher_task);

        let connection = self.connection.lock().await.take();
        self.set_state(ConnectionState::Disconnected).await;
        self.emit(FtmsEvent::Disconnected);

        if let Some(connection) = connection {
            connection.disconnect().await?;
        }
        Ok(())
    }

    /// Forget the cached device used by [`FtmsClient::reconnect_silently`]
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the cache cannot be written.
    pub fn forget_cached_device(&self) -> Result<()> {
        self.cache.clear(PeripheralKind::FitnessMachine)
    }

    // Command API. Each call resolves against the live queue, so commands
    // issued after a disconnect fail fast instead of queueing forever.

    /// Request control of the machine
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Disconnected`] when no device is connected,
    /// otherwise see [`CommandQueue::submit`](crate::queue::CommandQueue::submit).
    pub async fn request_control(&self) -> Result<()> {
        self.command_queue().await?.request_control().await
    }

    /// Reset the machine to its defaults
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn reset(&self) -> Result<()> {
        self.command_queue().await?.reset().await
    }

    /// Set the target resistance level, clamped to the device range
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_resistance(&self, level: f64) -> Result<()> {
        self.command_queue().await?.set_target_resistance(level).await
    }

    /// Set the target power in watts
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_power(&self, watts: i16) -> Result<()> {
        self.command_queue().await?.set_target_power(watts).await
    }

    /// Set the target heart rate in bpm
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_heart_rate(&self, bpm: u8) -> Result<()> {
        self.command_queue().await?.set_target_heart_rate(bpm).await
    }

    /// Set the target speed in km/h
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_speed(&self, kmh: f64) -> Result<()> {
        self.command_queue().await?.set_target_speed(kmh).await
    }

    /// Set the target inclination in percent
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_inclination(&self, percent: f64) -> Result<()> {
        self.command_queue().await?.set_target_inclination(percent).await
    }

    /// Set the target cadence in rpm
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_target_cadence(&self, rpm: f64) -> Result<()> {
        self.command_queue().await?.set_target_cadence(rpm).await
    }

    /// Set indoor bike simulation parameters
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn set_indoor_bike_simulation(
        &self,
        wind_speed_mps: f64,
        grade_percent: f64,
        crr: f64,
        cw: f64,
    ) -> Result<()> {
        self.command_queue()
            .await?
            .set_indoor_bike_simulation(wind_speed_mps, grade_percent, crr, cw)
            .await
    }

    /// Start or resume the session
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn start(&self) -> Result<()> {
        self.command_queue().await?.start().await
    }

    /// Stop or pause the session
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn stop(&self, pause: bool) -> Result<()> {
        self.command_queue().await?.stop(pause).await
    }

    /// Start or ignore a spin down calibration
    ///
    /// # Errors
    ///
    /// Same as [`FtmsClient::request_control`].
    pub async fn spin_down_control(&self, start: bool) -> Result<()> {
        self.command_queue().await?.spin_down_control(start).await
    }

    async fn command_queue(&self) -> Result<CommandQueue> {
        self.queue
            .lock()
            .await
            .clone()
            .ok_or(FitlinkError::Disconnected)
    }

    fn emit(&self, event: FtmsEvent) {
        // a gone consumer is not an error for the connection itself
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = %*current, to = %state, "state transition");
            *current = state;
            drop(current);
            self.emit(FtmsEvent::StateChanged(state));
        }
    }

    fn abort_stream_tasks(&self) {
        if let Ok(mut tasks) = self.stream_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Run the full connect sequence against a known device.
    ///
    /// Transport connect, service resolution, subscriptions, the control
    /// handshake, and capability reads, emitting a state transition per
    /// phase. The device lands in the cache only after the sequence
    /// completes.
    async fn establish(&self, device: &DiscoveredDevice) -> Result<()> {
        info!(name = %device.name, "connecting");
        self.set_state(ConnectionState::ConnectingTransport).await;

        let peripheral = match self.ble.connect(&device.id, &self.params).await {
            Ok(peripheral) => peripheral,
            Err(FitlinkError::DeviceNotFound) => {
                // the id is not in the scan cache, so find it first
                self.set_state(ConnectionState::Scanning).await;
                self.ble
                    .scan(FITNESS_MACHINE_SERVICE_UUID, &self.params)
                    .await?;
                self.set_state(ConnectionState::ConnectingTransport).await;
                self.ble.connect(&device.id, &self.params).await?
            }
            Err(error) => return Err(error),
        };

        self.set_state(ConnectionState::DiscoveringServices).await;
        let connection = FtmsConnection::resolve(peripheral)?;

        self.set_state(ConnectionState::Subscribing).await;
        connection.subscribe_all().await?;

        let queue = CommandQueue::new(Arc::new(connection.control_channel()));
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let pump = connection.spawn_notification_pump(notification_tx).await?;
        let dispatch = self.spawn_dispatch(notification_rx, queue.clone());
        self.abort_stream_tasks();
        if let Ok(mut tasks) = self.stream_tasks.lock() {
            tasks.push(pump);
            tasks.push(dispatch);
        }

        let capabilities = connection.read_capabilities().await.unwrap_or_else(|error| {
            warn!("feature read failed: {error}");
            None
        });
        let resistance_range = connection
            .read_resistance_range()
            .await
            .unwrap_or_else(|error| {
                warn!("resistance range read failed: {error}");
                None
            });
        let power_range = connection.read_power_range().await.unwrap_or_else(|error| {
            warn!("power range read failed: {error}");
            None
        });
        if let Some(range) = resistance_range {
            queue.set_resistance_range(range).await;
        }

        *self.capabilities.write().await = capabilities;
        *self.resistance_range.write().await = resistance_range;
        *self.power_range.write().await = power_range;
        *self.connection.lock().await = Some(connection);
        *self.queue.lock().await = Some(queue.clone());
        *self.last_device.write().await = Some(device.clone());

        if let Err(error) = self.cache.store(
            PeripheralKind::FitnessMachine,
            &CachedDeviceRef {
                id: device.id.clone(),
                name: device.name.clone(),
                cached_at: SystemTime::now(),
            },
        ) {
            warn!("device cache write failed: {error}");
        }

        queue.request_control().await?;
        // some machines reject Start until the user pedals; not fatal
        if let Err(error) = queue.start().await {
            warn!("start command not accepted: {error}");
        }

        self.set_state(ConnectionState::Connected).await;
        self.emit(FtmsEvent::Connected {
            name: device.name.clone(),
            capabilities,
        });
        self.reconnect_policy.lock().await.reset();

        // replace without aborting: during a reconnect this runs inside the
        // old watcher, which exits on its own
        let watcher = self.spawn_disconnect_watcher(device.id.clone()).await?;
        if let Ok(mut slot) = self.watcher_task.lock() {
            *slot = Some(watcher);
        }

        info!(name = %device.name, "connected");
        Ok(())
    }

    /// Route notifications to the queue and the event channel.
    ///
    /// Telemetry is debounced: every decoded frame updates
    /// `latest_sample`, but at most one event per debounce interval goes
    /// out to the consumer.
    fn spawn_dispatch(
        &self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        queue: CommandQueue,
    ) -> JoinHandle<()> {
        let client = self.clone();
        let debounce = Duration::from_millis(client.params.telemetry_debounce_ms);
        tokio::spawn(async move {
            let mut last_emit: Option<Instant> = None;
            while let Some(notification) = notifications.recv().await {
                match notification {
                    Notification::ControlPoint(data) => queue.handle_response(&data).await,
                    Notification::IndoorBikeData(data) => {
                        match decode_indoor_bike_data(&data) {
                            Ok(sample) => {
                                *client.latest_sample.write().await = Some(sample.clone());
                                if last_emit.is_none_or(|at| at.elapsed() >= debounce) {
                                    last_emit = Some(Instant::now());
                                    client.emit(FtmsEvent::Telemetry(sample));
                                }
                            }
                            Err(error) => debug!("dropping malformed telemetry frame: {error}"),
                        }
                    }
                    Notification::MachineStatus(data) => match decode_status(&data) {
                        Ok(event) => client.emit(FtmsEvent::Status(event)),
                        Err(error) => debug!("dropping malformed status event: {error}"),
                    },
                    Notification::TrainingStatus(data) => {
                        // flags byte, then the status byte
                        if let Some(status) = data.get(1) {
                            client.emit(FtmsEvent::TrainingStatus(*status));
                        }
                    }
                }
            }
        })
    }

    /// Watch adapter events for an unsolicited disconnect of our device
    /// and kick off the reconnect loop when one lands.
    async fn spawn_disconnect_watcher(&self, device_id: String) -> Result<JoinHandle<()>> {
        let mut events = self.ble.events().await?;
        let client = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };
                if id.to_string() != device_id {
                    continue;
                }
                if client.manual_disconnect.load(Ordering::SeqCst) {
                    debug!("disconnect event after manual disconnect, ignoring");
                } else {
                    warn!("device disconnected unexpectedly");
                    client.run_reconnect_loop().await;
                }
                break;
            }
        }))
    }

    /// Reconnect with exponential backoff until success or the attempt
    /// budget is spent. Exhaustion surfaces as a single error event
    /// followed by the terminal disconnect.
    // Returns a boxed future to break the establish -> watcher -> reconnect async recursion cycle.
    fn run_reconnect_loop(&self) -> futures::future::BoxFuture<'_, ()> {
        futures::FutureExt::boxed(async move {
            let Some(device) = self.last_device.read().await.clone() else {
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(FtmsEvent::Disconnected);
                return;
            };

            self.set_state(ConnectionState::Reconnecting).await;
            let terminal = drive_reconnect(&self.reconnect_policy, &self.events, || {
                let client = self.clone();
                let device = device.clone();
                async move { client.establish(&device).await }
            })
            .await;

            if terminal == ConnectionState::Disconnected {
                self.set_state(ConnectionState::Disconnected).await;
            }
        })
    }
}

/// Abort a stored disconnect watcher, leaving the slot empty.
///
/// The connect entry points call this before establishing, so back-to-back
/// connects never leave two watchers following adapter events. The
/// reconnect path must not: it runs inside the old watcher, which exits on
/// its own.
pub(crate) fn abort_stored_watcher(slot: &StdMutex<Option<JoinHandle<()>>>) {
    if let Ok(mut guard) = slot.lock() {
        if let Some(task) = guard.take() {
            task.abort();
        }
    }
}

/// Retry an operation under a reconnect policy.
///
/// Waits the policy delay before each attempt; a success resets the policy,
/// exhaustion returns [`FitlinkError::ReconnectExhausted`].
async fn retry_with_backoff<F, Fut, T>(policy: &mut ReconnectPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        if policy.exhausted() {
            return Err(FitlinkError::ReconnectExhausted {
                attempts: policy.attempt_count,
            });
        }
        let delay = policy.next_delay();
        debug!(
            attempt = policy.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "waiting before reconnect attempt"
        );
        tokio::time::sleep(delay).await;

        match attempt().await {
            Ok(value) => {
                policy.reset();
                return Ok(value);
            }
            Err(error) => warn!(attempt = policy.attempt_count, "attempt failed: {error}"),
        }
    }
}

/// Run the backoff retry against a shared policy.
///
/// Works on a snapshot and writes the outcome back, never holding the
/// policy lock across an attempt: the connect sequence takes the same
/// mutex to reset the policy when it succeeds.
async fn retry_with_shared_policy<F, Fut, T>(
    policy: &Mutex<ReconnectPolicy>,
    attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut snapshot = policy.lock().await.clone();
    let result = retry_with_backoff(&mut snapshot, attempt).await;
    *policy.lock().await = snapshot;
    result
}

/// Drive the reconnect retry and report the terminal state.
///
/// A spent attempt budget surfaces as exactly one `Error` event followed
/// by one `Disconnected` event; a success emits nothing here, the connect
/// sequence already announced it.
async fn drive_reconnect<F, Fut>(
    policy: &Mutex<ReconnectPolicy>,
    events: &mpsc::UnboundedSender<FtmsEvent>,
    attempt: F,
) -> ConnectionState
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match retry_with_shared_policy(policy, attempt).await {
        Ok(()) => ConnectionState::Connected,
        Err(error) => {
            let _ = events.send(FtmsEvent::Error(format!("reconnect failed: {error}")));
            let _ = events.send(FtmsEvent::Disconnected);
            ConnectionState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(4),
            max_attempts,
            2.0,
        )
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let mut policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(&mut policy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(FitlinkError::Disconnected)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // success resets the policy for the next outage
        assert_eq!(policy.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_max_attempts() {
        let mut policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(&mut policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FitlinkError::Disconnected) }
        })
        .await;

        assert!(matches!(
            result,
            Err(FitlinkError::ReconnectExhausted { attempts: 5 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(policy.exhausted());
    }

    #[tokio::test]
    async fn test_shared_policy_retry_lets_attempt_take_the_policy_lock() {
        let policy = Arc::new(Mutex::new(fast_policy(5)));

        // the connect sequence resets the shared policy itself, so an
        // attempt that locks the same mutex must still complete
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            retry_with_shared_policy(&policy, || {
                let policy = Arc::clone(&policy);
                async move {
                    policy.lock().await.reset();
                    Ok(())
                }
            }),
        )
        .await;

        assert!(result.expect("retry must not deadlock").is_ok());
        assert_eq!(policy.lock().await.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_shared_policy_retry_writes_back_exhaustion() {
        let policy = Mutex::new(fast_policy(2));
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_shared_policy(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FitlinkError::Disconnected) }
        })
        .await;

        assert!(matches!(
            result,
            Err(FitlinkError::ReconnectExhausted { attempts: 2 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(policy.lock().await.exhausted());
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_reports_exactly_one_error() {
        let policy = Mutex::new(fast_policy(5));
        let (events, mut receiver) = mpsc::unbounded_channel();
        let calls = AtomicU32::new(0);

        let terminal = drive_reconnect(&policy, &events, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FitlinkError::Disconnected) }
        })
        .await;

        assert_eq!(terminal, ConnectionState::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        drop(events);
        let mut errors = 0;
        let mut disconnects = 0;
        while let Some(event) = receiver.recv().await {
            match event {
                FtmsEvent::Error(message) => {
                    assert!(message.contains("reconnect failed"));
                    errors += 1;
                }
                FtmsEvent::Disconnected => disconnects += 1,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_reconnect_success_emits_no_failure_events() {
        let policy = Mutex::new(fast_policy(5));
        let (events, mut receiver) = mpsc::unbounded_channel();

        let terminal = drive_reconnect(&policy, &events, || async { Ok(()) }).await;

        assert_eq!(terminal, ConnectionState::Connected);
        assert_eq!(policy.lock().await.attempt_count, 0);
        drop(events);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stored_watcher_aborts_before_replacement() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let slot = StdMutex::new(Some(tokio::spawn(async move {
            let _guard = guard;
            futures::future::pending::<()>().await;
        })));

        abort_stored_watcher(&slot);
        assert!(slot.lock().unwrap().is_none());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("aborted watcher must be dropped");

        // an emptied slot tolerates a second call
        abort_stored_watcher(&slot);
    }

    #[tokio::test]
    async fn test_retry_with_zero_budget_never_attempts() {
        let mut policy = fast_policy(0);
        let calls = AtomicU32::new(0);

        let result: Result<()> = retry_with_backoff(&mut policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(matches!(
            result,
            Err(FitlinkError::ReconnectExhausted { attempts: 0 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
