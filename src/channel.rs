//! Inbound delivery-path arbitration.
//! Depending on stack and firmware quirks, the same vendor-protocol bytes
//! may arrive through up to five independent channels; all available ones
//! are bound and forwarded, duplicates included.

use crate::error::Result;
use crate::protocol::{self, DataPoint};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The known delivery paths, in registration priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Low-level frame hook that fires even for clusters the stack never
    /// routed after interview
    LowLevelHook,
    /// Bound-cluster command callback
    BoundCluster,
    /// Cluster-level event subscription
    ClusterEvent,
    /// Raw-frame fallback
    RawFallback,
    /// Legacy compatibility path
    LegacyCompat,
}

impl ChannelKind {
    /// Registration priority order; lower index binds first.
    pub const PRIORITY: [ChannelKind; 5] = [
        ChannelKind::LowLevelHook,
        ChannelKind::BoundCluster,
        ChannelKind::ClusterEvent,
        ChannelKind::RawFallback,
        ChannelKind::LegacyCompat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::LowLevelHook => "low_level_hook",
            ChannelKind::BoundCluster => "bound_cluster",
            ChannelKind::ClusterEvent => "cluster_event",
            ChannelKind::RawFallback => "raw_fallback",
            ChannelKind::LegacyCompat => "legacy_compat",
        }
    }

    fn priority(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|k| k == self)
            .unwrap_or(Self::PRIORITY.len())
    }
}

/// Callback a channel adapter invokes with the raw cluster payload.
pub type DispatchFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Consumer of decoded DataPoints, tagged with the channel that carried
/// them. Delivery is at-least-once: the same frame arriving on two
/// channels produces two invocations.
pub type FrameSink = Arc<dyn Fn(DataPoint, ChannelKind) + Send + Sync>;

/// One inbound delivery path offered by the surrounding stack.
///
/// `subscribe` must hand every received cluster payload to `dispatch` and
/// return a handle whose drop unregisters the underlying callback.
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;
    fn subscribe(&self, dispatch: DispatchFn) -> Result<ChannelHandle>;
}

/// Registration handle for one channel; dropping it unregisters.
pub struct ChannelHandle {
    kind: ChannelKind,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelHandle {
    pub fn new(kind: ChannelKind, unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self { kind, unsubscribe: Some(Box::new(unsubscribe)) }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Per-channel registration outcome plus the observed traffic source.
#[derive(Debug, Clone)]
pub struct ChannelDiagnostics {
    /// (channel, registered) for every known kind, in priority order
    pub channels: Vec<(ChannelKind, bool)>,
    /// First channel that delivered real traffic this session
    pub authoritative: Option<ChannelKind>,
}

/// Registers against every available delivery path and funnels decoded
/// DataPoints into a single sink.
pub struct ListenerArbiter {
    inner: Arc<ArbiterInner>,
}

struct ArbiterInner {
    device_id: String,
    registered: Mutex<Vec<(ChannelKind, bool)>>,
    authoritative: Mutex<Option<ChannelKind>>,
    handles: Mutex<Vec<ChannelHandle>>,
    torn_down: AtomicBool,
    sink: FrameSink,
}

impl ListenerArbiter {
    pub fn new<I: Into<String>>(device_id: I, sink: FrameSink) -> Self {
        let registered = ChannelKind::PRIORITY.iter().map(|k| (*k, false)).collect();
        Self {
            inner: Arc::new(ArbiterInner {
                device_id: device_id.into(),
                registered: Mutex::new(registered),
                authoritative: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
                torn_down: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Attempt registration on every adapter, in priority order. Each
    /// attempt is independently guarded: a failing channel is logged and
    /// skipped, and zero successful registrations is still a valid
    /// (diagnostic-visible) outcome.
    pub fn attach(&self, adapters: &[Arc<dyn ChannelAdapter>]) -> ChannelDiagnostics {
        let mut ordered: Vec<&Arc<dyn ChannelAdapter>> = adapters.iter().collect();
        ordered.sort_by_key(|a| a.kind().priority());

        for adapter in ordered {
            let kind = adapter.kind();
            let dispatch = self.dispatch_fn(kind);
            match adapter.subscribe(dispatch) {
                Ok(handle) => {
                    debug!("[{}] Channel {} registered", self.inner.device_id, kind.name());
                    self.mark_registered(kind);
                    self.inner.handles.lock().push(handle);
                }
                Err(e) => {
                    warn!(
                        "[{}] Channel {} unavailable, skipping: {}",
                        self.inner.device_id,
                        kind.name(),
                        e
                    );
                }
            }
        }

        let diag = self.diagnostics();
        if diag.channels.iter().all(|(_, ok)| !ok) {
            warn!(
                "[{}] No inbound delivery path could be registered",
                self.inner.device_id
            );
        }
        diag
    }

    fn dispatch_fn(&self, kind: ChannelKind) -> DispatchFn {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |payload: &[u8]| inner.handle_payload(kind, payload))
    }

    fn mark_registered(&self, kind: ChannelKind) {
        let mut registered = self.inner.registered.lock();
        if let Some(entry) = registered.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = true;
        }
    }

    pub fn diagnostics(&self) -> ChannelDiagnostics {
        ChannelDiagnostics {
            channels: self.inner.registered.lock().clone(),
            authoritative: *self.inner.authoritative.lock(),
        }
    }

    /// Unregister every bound channel. Callbacks re-entered after this
    /// point are detected and become no-ops.
    pub fn teardown(&self) {
        self.inner.torn_down.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        debug!(
            "[{}] Releasing {} channel registrations",
            self.inner.device_id,
            handles.len()
        );
        drop(handles);
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }
}

impl ArbiterInner {
    fn handle_payload(&self, kind: ChannelKind, payload: &[u8]) {
        if self.torn_down.load(Ordering::SeqCst) {
            debug!(
                "[{}] Frame on {} after teardown, ignoring",
                self.device_id,
                kind.name()
            );
            return;
        }

        let datapoints = protocol::decode_datapoints(payload);
        if datapoints.is_empty() {
            debug!(
                "[{}] {} delivered {} bytes with no decodable DPs",
                self.device_id,
                kind.name(),
                payload.len()
            );
            return;
        }

        {
            let mut authoritative = self.authoritative.lock();
            if authoritative.is_none() {
                info!(
                    "[{}] First traffic arrived via {}, marking authoritative",
                    self.device_id,
                    kind.name()
                );
                *authoritative = Some(kind);
            }
        }

        for dp in datapoints {
            (self.sink)(dp, kind);
        }
    }
}
