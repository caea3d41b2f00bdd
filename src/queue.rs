use crate::{
    error::{FitlinkError, Result},
    protocol::{decode_control_point_response, encode_command, Command, OpCode, ResultCode},
    types::ResistanceRange,
};
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Write half of the control point characteristic.
///
/// The queue only needs to push encoded bytes at the device; keeping this
/// behind a trait lets tests drive the queue without a radio.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Write one encoded command to the control point
    async fn write(&self, payload: &[u8]) -> Result<()>;
}

/// Dispatch priority of a queued command.
///
/// Higher priorities short-circuit ahead of lower ones; order is stable
/// within equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandPriority {
    /// Background housekeeping
    Low,
    /// Regular target-setting commands
    Normal,
    /// Session control (start/stop, request control)
    High,
    /// Must run before anything else queued
    Critical,
}

/// Timeout tuning for the command queue
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Baseline for the adaptive timeout, in milliseconds
    pub base_timeout_ms: u64,
    /// Fixed timeout for critical commands (request-control, simulation)
    pub critical_timeout_ms: u64,
    /// Fixed timeout for start/stop commands
    pub quick_timeout_ms: u64,
    /// Pause between settling one command and dispatching the next
    pub settle_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 2_000,
            critical_timeout_ms: 5_000,
            quick_timeout_ms: 1_500,
            settle_delay_ms: 50,
        }
    }
}

/// Counters describing queue behavior since connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands resolved with a success result code
    pub completed: u64,
    /// Commands rejected by a device result code
    pub rejections: u64,
    /// Commands that expired without a correlated response
    pub timeouts: u64,
    /// Responses discarded because their echoed opcode did not match
    pub mismatched_responses: u64,
    /// Commands cancelled before dispatch
    pub cancelled: u64,
}

struct QueuedCommand {
    command: Command,
    priority: CommandPriority,
    timeout: Duration,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<()>>,
}

struct InFlight {
    seq: u64,
    opcode: OpCode,
    dispatched_at: Instant,
    responder: oneshot::Sender<Result<()>>,
}

struct QueueInner {
    pending: Vec<QueuedCommand>,
    in_flight: Option<InFlight>,
    next_seq: u64,
    adaptive_timeout_ms: u64,
    resistance_range: Option<ResistanceRange>,
    // no dispatch before this instant; armed when a response settles
    settle_until: Option<Instant>,
    stats: QueueStats,
}

impl QueueInner {
    /// Successful round trip: decay the estimate toward baseline
    fn shrink_timeout(&mut self, base: u64) {
        self.adaptive_timeout_ms = base + self.adaptive_timeout_ms.saturating_sub(base) / 2;
    }

    /// Failed round trip: grow the estimate, capped at 2x baseline
    fn grow_timeout(&mut self, base: u64) {
        self.adaptive_timeout_ms = (self.adaptive_timeout_ms + base / 2).min(base * 2);
    }
}

/// Serializes writes to the control point and correlates each indication
/// back to the command that caused it.
///
/// At most one command is in flight at a time: the control point carries a
/// single logical response stream, so a second `submit` during processing
/// only appends to the queue and never interleaves writes.
#[derive(Clone)]
pub struct CommandQueue {
    channel: Arc<dyn ControlChannel>,
    inner: Arc<Mutex<QueueInner>>,
    config: QueueConfig,
}

impl CommandQueue {
    /// Create a queue bound to a control channel with default timeouts
    #[must_use]
    pub fn new(channel: Arc<dyn ControlChannel>) -> Self {
        Self::with_config(channel, QueueConfig::default())
    }

    /// Create a queue with explicit timeout tuning
    #[must_use]
    pub fn with_config(channel: Arc<dyn ControlChannel>, config: QueueConfig) -> Self {
        Self {
            channel,
            inner: Arc::new(Mutex::new(QueueInner {
                pending: Vec::new(),
                in_flight: None,
                next_seq: 0,
                adaptive_timeout_ms: config.base_timeout_ms,
                resistance_range: None,
                settle_until: None,
                stats: QueueStats::default(),
            })),
            config,
        }
    }

    /// Install the device's advertised resistance range, used to clamp all
    /// subsequent resistance commands
    pub async fn set_resistance_range(&self, range: ResistanceRange) {
        self.inner.lock().await.resistance_range = Some(range);
    }

    /// Snapshot of the queue counters
    pub async fn stats(&self) -> QueueStats {
        self.inner.lock().await.stats
    }

    /// Timeout category for an opcode: critical commands get a longer fixed
    /// window, start/stop a shorter one, everything else the adaptive default
    const fn timeout_for(&self, opcode: OpCode, adaptive_ms: u64) -> Duration {
        match opcode {
            OpCode::RequestControl | OpCode::SetIndoorBikeSimulation => {
                Duration::from_millis(self.config.critical_timeout_ms)
            }
            OpCode::StartOrResume | OpCode::StopOrPause => {
                Duration::from_millis(self.config.quick_timeout_ms)
            }
            _ => Duration::from_millis(adaptive_ms),
        }
    }

    /// Enqueue a command and wait for its correlated response.
    ///
    /// Inserts according to priority (stable within equal priority) and
    /// begins processing immediately when the queue is idle.
    ///
    /// # Errors
    ///
    /// Returns [`FitlinkError::Rejected`] when the device answers with a
    /// non-success result code, [`FitlinkError::Timeout`] when no correlated
    /// response arrives in the armed window, [`FitlinkError::Cancelled`]
    /// when the command is removed before dispatch, or a transport error
    /// when the write itself fails.
    pub async fn submit(
        &self,
        command: Command,
        priority: CommandPriority,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let (responder, settled) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            let timeout = timeout
                .unwrap_or_else(|| self.timeout_for(command.opcode(), inner.adaptive_timeout_ms));
            let position = inner
                .pending
                .iter()
                .position(|queued| queued.priority < priority)
                .unwrap_or(inner.pending.len());
            inner.pending.insert(
                position,
                QueuedCommand {
                    command,
                    priority,
                    timeout,
                    enqueued_at: Instant::now(),
                    responder,
                },
            );
        }
        self.pump().await;

        settled.await.unwrap_or(Err(FitlinkError::Disconnected))
    }

    /// Dispatch the head of the queue if nothing is in flight.
    ///
    /// The settle window armed by [`CommandQueue::handle_response`] is
    /// honored here, so a `submit` racing a just-settled response waits it
    /// out like everything else. Loops only when a write fails, so a dead
    /// head command cannot stall the rest of the queue.
    async fn pump(&self) {
        loop {
            let settle_wait = {
                let inner = self.inner.lock().await;
                if inner.in_flight.is_some() || inner.pending.is_empty() {
                    return;
                }
                inner
                    .settle_until
                    .and_then(|until| until.checked_duration_since(Instant::now()))
            };
            if let Some(wait) = settle_wait {
                tokio::time::sleep(wait).await;
                continue;
            }

            let (bytes, seq, opcode, timeout) = {
                let mut inner = self.inner.lock().await;
                if inner.in_flight.is_some() || inner.pending.is_empty() {
                    return;
                }
                let item = inner.pending.remove(0);
                let seq = inner.next_seq;
                inner.next_seq += 1;
                let bytes = encode_command(&item.command, inner.resistance_range.as_ref());
                let opcode = item.command.opcode();
                debug!(
                    ?opcode,
                    waited_ms = item.enqueued_at.elapsed().as_millis() as u64,
                    "dispatching command"
                );
                inner.in_flight = Some(InFlight {
                    seq,
                    opcode,
                    dispatched_at: Instant::now(),
                    responder: item.responder,
                });
                (bytes, seq, opcode, item.timeout)
            };

            if let Err(error) = self.channel.write(&bytes).await {
                warn!(?opcode, "control point write failed: {error}");
                let mut inner = self.inner.lock().await;
                if inner.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
                    if let Some(in_flight) = inner.in_flight.take() {
                        let _ = in_flight.responder.send(Err(error));
                    }
                }
                continue;
            }

            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                queue.expire(seq, timeout).await;
            });
            return;
        }
    }

    /// Reject the in-flight command if it is still the one this timer was
    /// armed for; a timer whose command already settled does nothing.
    // Returns a boxed future to break the pump -> expire -> pump async recursion cycle.
    fn expire(&self, seq: u64, timeout: Duration) -> futures::future::BoxFuture<'_, ()> {
        futures::FutureExt::boxed(async move {
            let fired = {
                let mut inner = self.inner.lock().await;
                if inner.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
                    let Some(in_flight) = inner.in_flight.take() else {
                        return;
                    };
                    warn!(opcode = ?in_flight.opcode, "command timed out");
                    inner.stats.timeouts += 1;
                    inner.grow_timeout(self.config.base_timeout_ms);
                    let _ = in_flight.responder.send(Err(FitlinkError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }));
                    true
                } else {
                    false
                }
            };
            if fired {
                self.pump().await;
            }
        })
    }

    /// Feed a raw control point indication into the queue.
    ///
    /// A response whose echoed opcode does not match the pending command is
    /// discarded and counted, never treated as the answer to the pending
    /// command. A correlated response settles the caller's future and
    /// the next queued command is dispatched after a short settle delay.
    pub async fn handle_response(&self, data: &[u8]) {
        let response = match decode_control_point_response(data) {
            Ok(response) => response,
            Err(error) => {
                warn!("dropping malformed control point response: {error}");
                return;
            }
        };

        let settled = {
            let mut inner = self.inner.lock().await;
            let pending_opcode = inner.in_flight.as_ref().map(|f| f.opcode as u8);
            match pending_opcode {
                Some(expected) if expected == response.request_opcode => {
                    let Some(in_flight) = inner.in_flight.take() else {
                        return;
                    };
                    debug!(
                        opcode = ?in_flight.opcode,
                        result = %response.result,
                        round_trip_ms = in_flight.dispatched_at.elapsed().as_millis() as u64,
                        "command settled"
                    );
                    let outcome = if response.result == ResultCode::Success {
                        inner.stats.completed += 1;
                        inner.shrink_timeout(self.config.base_timeout_ms);
                        Ok(())
                    } else {
                        inner.stats.rejections += 1;
                        inner.grow_timeout(self.config.base_timeout_ms);
                        Err(FitlinkError::Rejected(response.result))
                    };
                    let _ = in_flight.responder.send(outcome);
                    inner.settle_until = Some(
                        Instant::now() + Duration::from_millis(self.config.settle_delay_ms),
                    );
                    true
                }
                Some(expected) => {
                    inner.stats.mismatched_responses += 1;
                    debug!(
                        expected,
                        actual = response.request_opcode,
                        "discarding response for a different opcode"
                    );
                    false
                }
                None => {
                    debug!("control point response with no command in flight");
                    false
                }
            }
        };

        if settled {
            self.pump().await;
        }
    }

    /// Cancel queued-but-undispatched commands with a matching opcode.
    ///
    /// An in-flight write is never aborted; its outcome is always either a
    /// correlated response or a timeout. Returns the number removed.
    pub async fn cancel(&self, opcode: OpCode) -> usize {
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        let mut index = 0;
        while index < inner.pending.len() {
            if inner.pending[index].command.opcode() == opcode {
                let item = inner.pending.remove(index);
                let _ = item.responder.send(Err(FitlinkError::Cancelled));
                inner.stats.cancelled += 1;
                removed += 1;
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Cancel every queued-but-undispatched command. Returns the number
    /// removed.
    pub async fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let drained: Vec<_> = inner.pending.drain(..).collect();
        let removed = drained.len();
        for item in drained {
            let _ = item.responder.send(Err(FitlinkError::Cancelled));
        }
        inner.stats.cancelled += removed as u64;
        removed
    }

    // High-level wrappers: validate and clamp inputs, pick a priority, and
    // enqueue through the usual path.

    /// Request control of the machine
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn request_control(&self) -> Result<()> {
        self.submit(Command::RequestControl, CommandPriority::High, None)
            .await
    }

    /// Reset the machine to its defaults
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn reset(&self) -> Result<()> {
        self.submit(Command::Reset, CommandPriority::High, None).await
    }

    /// Set the target resistance level; clamped to the device range
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`]; additionally rejects non-finite input.
    pub async fn set_target_resistance(&self, level: f64) -> Result<()> {
        ensure_finite(level, "resistance level")?;
        self.submit(
            Command::SetTargetResistance { level },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Set the target power in watts; clamped to 0–4000 W
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn set_target_power(&self, watts: i16) -> Result<()> {
        self.submit(
            Command::SetTargetPower { watts },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Set the target heart rate in bpm
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn set_target_heart_rate(&self, bpm: u8) -> Result<()> {
        self.submit(
            Command::SetTargetHeartRate { bpm },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Set the target speed in km/h
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`]; additionally rejects non-finite input.
    pub async fn set_target_speed(&self, kmh: f64) -> Result<()> {
        ensure_finite(kmh, "target speed")?;
        self.submit(
            Command::SetTargetSpeed { kmh },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Set the target inclination in percent
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`]; additionally rejects non-finite input.
    pub async fn set_target_inclination(&self, percent: f64) -> Result<()> {
        ensure_finite(percent, "inclination")?;
        self.submit(
            Command::SetTargetInclination { percent },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Set the target cadence in rpm
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`]; additionally rejects non-finite input.
    pub async fn set_target_cadence(&self, rpm: f64) -> Result<()> {
        ensure_finite(rpm, "cadence")?;
        self.submit(
            Command::SetTargetCadence { rpm },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Start or resume the session
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn start(&self) -> Result<()> {
        self.submit(Command::StartOrResume, CommandPriority::High, None)
            .await
    }

    /// Stop or pause the session
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn stop(&self, pause: bool) -> Result<()> {
        self.submit(Command::StopOrPause { pause }, CommandPriority::High, None)
            .await
    }

    /// Set indoor bike simulation parameters
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`]; additionally rejects non-finite input.
    pub async fn set_indoor_bike_simulation(
        &self,
        wind_speed_mps: f64,
        grade_percent: f64,
        crr: f64,
        cw: f64,
    ) -> Result<()> {
        ensure_finite(wind_speed_mps, "wind speed")?;
        ensure_finite(grade_percent, "grade")?;
        ensure_finite(crr, "rolling resistance coefficient")?;
        ensure_finite(cw, "wind resistance coefficient")?;
        self.submit(
            Command::SetIndoorBikeSimulation {
                wind_speed_mps,
                grade_percent,
                crr,
                cw,
            },
            CommandPriority::Normal,
            None,
        )
        .await
    }

    /// Start or ignore a spin down calibration
    ///
    /// # Errors
    ///
    /// See [`CommandQueue::submit`].
    pub async fn spin_down_control(&self, start: bool) -> Result<()> {
        self.submit(
            Command::SpinDownControl { start },
            CommandPriority::Normal,
            None,
        )
        .await
    }
}

fn ensure_finite(value: f64, what: &str) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(FitlinkError::InvalidParameters(format!(
            "{what} must be finite, got {value}"
        )))
    }
}
