//! Per-device session runtime.
//! Owns the sequence counter, the observation window and time-sync timers,
//! and the channel registrations; tears all of it down synchronously.

use crate::channel::{ChannelAdapter, ChannelDiagnostics, ChannelKind, FrameSink, ListenerArbiter};
use crate::dispatch::{
    AttributeSink, BatteryDpConfig, Dispatcher, DpResolver, RawTransport,
};
use crate::error::{Result, TuyaZigError};
use crate::mode::{DEFAULT_WINDOW, ObservationWindow, ProtocolMode, ProtocolModeArbitrator};
use crate::protocol::{self, DataPoint, SequenceCounter};
use crate::retry::{QueryOutcome, RequestRetrier, RetryPolicy};
use crate::timesync::{self, DeviceIdentity};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, watch};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a session needs from the surrounding integration shell.
pub struct SessionBuilder {
    device_id: String,
    identity: DeviceIdentity,
    resolver: Arc<dyn DpResolver>,
    sink: Arc<dyn AttributeSink>,
    transport: Arc<dyn RawTransport>,
    battery: Option<BatteryDpConfig>,
    initial_mode: Option<ProtocolMode>,
    window_duration: Duration,
    retry_policy: RetryPolicy,
    time_sync: bool,
    tz_offset_minutes: i32,
    time_sync_local: bool,
}

impl SessionBuilder {
    pub fn new<I: Into<String>>(
        device_id: I,
        resolver: Arc<dyn DpResolver>,
        sink: Arc<dyn AttributeSink>,
        transport: Arc<dyn RawTransport>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            identity: DeviceIdentity::default(),
            resolver,
            sink,
            transport,
            battery: None,
            initial_mode: None,
            window_duration: DEFAULT_WINDOW,
            retry_policy: RetryPolicy::default(),
            time_sync: true,
            tz_offset_minutes: 0,
            time_sync_local: true,
        }
    }

    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn battery(mut self, config: BatteryDpConfig) -> Self {
        self.battery = Some(config);
        self
    }

    /// Re-supply a frozen mode persisted by the integration shell.
    pub fn initial_mode(mut self, mode: ProtocolMode) -> Self {
        self.initial_mode = Some(mode);
        self
    }

    pub fn window_duration(mut self, duration: Duration) -> Self {
        self.window_duration = duration;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Disable the attach-time and daily time sync.
    pub fn without_time_sync(mut self) -> Self {
        self.time_sync = false;
        self
    }

    pub fn timezone_offset_minutes(mut self, minutes: i32) -> Self {
        self.tz_offset_minutes = minutes;
        self
    }

    /// Encode calendar time-sync forms as UTC instead of device-local.
    pub fn time_sync_utc(mut self) -> Self {
        self.time_sync_local = false;
        self
    }

    /// Build the session and bind every available delivery channel.
    pub fn attach(self, adapters: &[Arc<dyn ChannelAdapter>]) -> DeviceSession {
        let seq = Arc::new(SequenceCounter::new());
        let (broadcast_tx, _) = broadcast::channel(32);
        let cancel = CancellationToken::new();

        let arbitrator = match self.initial_mode {
            Some(mode) => {
                info!(
                    "[{}] Restoring persisted protocol mode {:?}",
                    self.device_id, mode
                );
                Arc::new(ProtocolModeArbitrator::with_frozen(self.window_duration, mode))
            }
            None => Arc::new(ProtocolModeArbitrator::new(self.window_duration)),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            self.device_id.clone(),
            self.resolver,
            self.sink,
            Arc::clone(&self.transport),
            Arc::clone(&seq),
            self.battery,
        ));

        let retrier = RequestRetrier::new(
            self.device_id.clone(),
            self.retry_policy,
            Arc::clone(&self.transport),
            Arc::clone(&seq),
            broadcast_tx.clone(),
            cancel.clone(),
        );

        let torn_down = Arc::new(AtomicBool::new(false));
        let sink = Self::frame_sink(
            Arc::clone(&torn_down),
            Arc::clone(&arbitrator),
            Arc::clone(&dispatcher),
            broadcast_tx.clone(),
        );

        let arbiter = ListenerArbiter::new(self.device_id.clone(), sink);
        let diagnostics = arbiter.attach(adapters);
        info!(
            "[{}] Session attached; {} of {} delivery paths bound",
            self.device_id,
            diagnostics.channels.iter().filter(|(_, ok)| *ok).count(),
            diagnostics.channels.len()
        );

        let session = DeviceSession {
            inner: Arc::new(SessionInner {
                device_id: self.device_id,
                identity: self.identity,
                seq,
                dispatcher,
                arbitrator,
                arbiter,
                retrier,
                transport: self.transport,
                broadcast_tx,
                cancel,
                torn_down,
                tz_offset_minutes: self.tz_offset_minutes,
                time_sync_local: self.time_sync_local,
            }),
        };

        session.spawn_window_timer();
        if self.time_sync {
            session.send_time_sync();
            session.spawn_daily_time_sync();
        }
        session
    }

    /// Fan-in point for every delivery channel: counts the vendor hit,
    /// routes through the dispatcher, and feeds the broadcast stream.
    /// Reentrant and safe after teardown (detected, no-op).
    fn frame_sink(
        torn_down: Arc<AtomicBool>,
        arbitrator: Arc<ProtocolModeArbitrator>,
        dispatcher: Arc<Dispatcher>,
        broadcast_tx: broadcast::Sender<DataPoint>,
    ) -> FrameSink {
        Arc::new(move |dp: DataPoint, kind: ChannelKind| {
            if torn_down.load(Ordering::SeqCst) {
                debug!("DP {} via {} after teardown, ignoring", dp.id, kind.name());
                return;
            }
            arbitrator.record_vendor();
            dispatcher.handle_inbound(&dp);
            let _ = broadcast_tx.send(dp);
        })
    }
}

struct SessionInner {
    device_id: String,
    identity: DeviceIdentity,
    seq: Arc<SequenceCounter>,
    dispatcher: Arc<Dispatcher>,
    arbitrator: Arc<ProtocolModeArbitrator>,
    arbiter: ListenerArbiter,
    retrier: RequestRetrier,
    transport: Arc<dyn RawTransport>,
    broadcast_tx: broadcast::Sender<DataPoint>,
    cancel: CancellationToken,
    torn_down: Arc<AtomicBool>,
    tz_offset_minutes: i32,
    time_sync_local: bool,
}

/// Live session for one Tuya Zigbee device.
///
/// Created at device attach, destroyed at detach; nothing here survives a
/// restart except the frozen protocol mode, which the integration shell
/// persists and re-supplies through [`SessionBuilder::initial_mode`].
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

/// Combined session diagnostics for the integration shell.
#[derive(Debug, Clone)]
pub struct SessionDiagnostics {
    pub channels: ChannelDiagnostics,
    pub mode: ProtocolMode,
    pub window: ObservationWindow,
}

impl DeviceSession {
    pub fn id(&self) -> &str {
        &self.inner.device_id
    }

    /// Decoded inbound DataPoints, delivery at-least-once: the same frame
    /// arriving on two channels appears twice.
    pub fn subscribe(&self) -> broadcast::Receiver<DataPoint> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Returns a Stream of decoded DataPoints from the device.
    pub fn stream(&self) -> impl Stream<Item = DataPoint> + Send + 'static {
        let mut rx = self.inner.broadcast_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(dp) => yield dp,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Watch channel that fires when the protocol mode is decided.
    pub fn mode_watch(&self) -> watch::Receiver<ProtocolMode> {
        self.inner.arbitrator.subscribe()
    }

    pub fn mode(&self) -> ProtocolMode {
        self.inner.arbitrator.mode()
    }

    /// Called by the integration shell whenever a standard Zigbee cluster
    /// produces traffic for this device; feeds the observation window.
    pub fn observe_standard_traffic(&self) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.inner.arbitrator.record_standard();
    }

    /// Query the given DP ids with the session retry policy. `NoData` is
    /// a normal outcome for devices that only talk when they wake.
    pub async fn query(&self, dp_ids: &[u8]) -> Result<QueryOutcome> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(TuyaZigError::SessionClosed);
        }
        self.inner.retrier.query(dp_ids).await
    }

    /// Fire-and-forget outbound DP write.
    pub fn write_datapoint(&self, dp_id: u8, value: &protocol::DpValue) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        self.inner.dispatcher.send_datapoint(dp_id, value);
    }

    /// Outbound DP write with a catalog-supplied numeric type tag.
    pub fn write_datapoint_tagged(&self, dp_id: u8, tag: u8, payload: &[u8]) -> Result<()> {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return Err(TuyaZigError::SessionClosed);
        }
        self.inner.dispatcher.send_datapoint_tagged(dp_id, tag, payload)
    }

    /// Re-detect the time-sync format from the identity strings and send
    /// a sync frame now. Failure is logged, never surfaced: clock sync is
    /// best-effort by design of the devices themselves.
    pub fn send_time_sync(&self) {
        self.inner.send_time_sync();
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            channels: self.inner.arbiter.diagnostics(),
            mode: self.inner.arbitrator.mode(),
            window: self.inner.arbitrator.window_snapshot(),
        }
    }

    /// DPs seen this session that no catalog entry claims.
    pub fn unmapped_datapoints(&self) -> std::collections::HashMap<u8, protocol::DpValue> {
        self.inner.dispatcher.unmapped_snapshot()
    }

    /// Synchronously cancel all timers and unregister every channel. A
    /// callback re-entered after this returns is detected and becomes a
    /// no-op; calling teardown twice is harmless.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Tearing down session", self.inner.device_id);
        self.inner.cancel.cancel();
        self.inner.arbiter.teardown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    /// One-shot decision timer: when the observation window elapses the
    /// mode is committed from whatever traffic was seen. It never fires
    /// again this session, even if device behavior later changes.
    ///
    /// Timer tasks hold only a Weak reference so a session dropped
    /// without an explicit teardown still stops its timers.
    fn spawn_window_timer(&self) {
        if self.inner.arbitrator.window_snapshot().decided {
            debug!(
                "[{}] Mode already frozen, skipping observation window",
                self.inner.device_id
            );
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let duration = self.inner.arbitrator.window_duration();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(duration) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            let mode = inner.arbitrator.decide();
            match mode {
                ProtocolMode::VendorOnly => {
                    info!(
                        "[{}] Vendor-only decided; standard listeners may be torn down",
                        inner.device_id
                    );
                }
                ProtocolMode::Undecided => {
                    debug!(
                        "[{}] Window expired silent; keeping every path open",
                        inner.device_id
                    );
                }
                other => info!("[{}] Protocol mode {:?}", inner.device_id, other),
            }
        });
    }

    /// Daily clock sync at 03:00 device-local time.
    fn spawn_daily_time_sync(&self) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let tz_offset_minutes = self.inner.tz_offset_minutes;
        tokio::spawn(async move {
            loop {
                let secs =
                    timesync::seconds_until_daily_sync(chrono::Utc::now(), tz_offset_minutes);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                inner.send_time_sync();
            }
        });
    }
}

impl SessionInner {
    fn send_time_sync(&self) {
        if self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let (format, payload) = timesync::build_for_device(
            &self.identity,
            chrono::Utc::now(),
            self.tz_offset_minutes,
            self.time_sync_local,
        );
        let seq = self.seq.next();
        let frame = protocol::encode_time_sync(seq, &payload);
        debug!(
            "[{}] Time sync {:?} (seq={}): {}",
            self.device_id,
            format,
            seq,
            hex::encode(&frame)
        );
        if let Err(e) = self.transport.send(&frame) {
            warn!("[{}] Time sync send failed: {}", self.device_id, e);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Last handle gone: make sure background timers stop.
        self.cancel.cancel();
    }
}
