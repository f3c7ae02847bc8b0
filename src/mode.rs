//! Per-device protocol mode arbitration.
//! Observes traffic over a fixed window and commits, once, to trusting
//! the vendor protocol, the standard protocol, or both.

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Default length of the traffic observation window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Which protocol families stay active for a device session.
///
/// Frozen once decided; the integration shell persists the frozen value
/// and re-supplies it on the next session attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    #[default]
    Undecided,
    VendorOnly,
    StandardOnly,
    Hybrid,
}

impl ProtocolMode {
    /// Whether vendor-protocol listeners should remain bound.
    pub fn vendor_active(&self) -> bool {
        !matches!(self, ProtocolMode::StandardOnly)
    }

    /// Whether standard-cluster listeners should remain bound.
    pub fn standard_active(&self) -> bool {
        !matches!(self, ProtocolMode::VendorOnly)
    }
}

/// Traffic evidence gathered before the decision fires.
#[derive(Debug, Clone)]
pub struct ObservationWindow {
    pub vendor_hits: u32,
    pub standard_hits: u32,
    pub started_at: Instant,
    pub decided: bool,
}

/// One-shot traffic-based mode decision, one instance per device session.
pub struct ProtocolModeArbitrator {
    window: Mutex<ObservationWindow>,
    duration: Duration,
    mode_tx: watch::Sender<ProtocolMode>,
}

impl ProtocolModeArbitrator {
    pub fn new(duration: Duration) -> Self {
        let (mode_tx, _) = watch::channel(ProtocolMode::Undecided);
        Self {
            window: Mutex::new(ObservationWindow {
                vendor_hits: 0,
                standard_hits: 0,
                started_at: Instant::now(),
                decided: false,
            }),
            duration,
            mode_tx,
        }
    }

    /// Restore a previously persisted decision. The window is marked
    /// decided immediately; no traffic will be counted this session.
    pub fn with_frozen(duration: Duration, mode: ProtocolMode) -> Self {
        let arbitrator = Self::new(duration);
        if mode != ProtocolMode::Undecided {
            arbitrator.window.lock().decided = true;
            let _ = arbitrator.mode_tx.send(mode);
        }
        arbitrator
    }

    pub fn window_duration(&self) -> Duration {
        self.duration
    }

    /// Count an inbound vendor-protocol frame. Battery and time-sync
    /// frames arrive through the vendor cluster and count here too.
    pub fn record_vendor(&self) {
        let mut window = self.window.lock();
        if !window.decided {
            window.vendor_hits = window.vendor_hits.saturating_add(1);
        }
    }

    /// Count an inbound standard-cluster report.
    pub fn record_standard(&self) {
        let mut window = self.window.lock();
        if !window.decided {
            window.standard_hits = window.standard_hits.saturating_add(1);
        }
    }

    /// Commit the decision from the evidence gathered so far. Intended to
    /// be called once, at window expiry; calling again after a decision
    /// just returns the frozen mode.
    ///
    /// Silence (no traffic at all) is NOT a decision: the mode stays
    /// `Undecided` and every delivery path remains open.
    pub fn decide(&self) -> ProtocolMode {
        let mut window = self.window.lock();
        if window.decided {
            return *self.mode_tx.borrow();
        }

        let mode = Self::classify(window.vendor_hits, window.standard_hits);
        if mode == ProtocolMode::Undecided {
            debug!(
                "No traffic observed in {:?} window, keeping all paths open",
                self.duration
            );
            return mode;
        }

        window.decided = true;
        info!(
            "Protocol mode decided: {:?} (vendor={}, standard={})",
            mode, window.vendor_hits, window.standard_hits
        );
        let _ = self.mode_tx.send(mode);
        mode
    }

    /// Pure classification: identical hit counts always map to the same
    /// mode.
    fn classify(vendor_hits: u32, standard_hits: u32) -> ProtocolMode {
        match (vendor_hits > 0, standard_hits > 0) {
            (true, false) => ProtocolMode::VendorOnly,
            (false, true) => ProtocolMode::StandardOnly,
            (true, true) => ProtocolMode::Hybrid,
            (false, false) => ProtocolMode::Undecided,
        }
    }

    pub fn mode(&self) -> ProtocolMode {
        *self.mode_tx.borrow()
    }

    /// Watch channel delivering the decision to external consumers.
    pub fn subscribe(&self) -> watch::Receiver<ProtocolMode> {
        self.mode_tx.subscribe()
    }

    pub fn window_snapshot(&self) -> ObservationWindow {
        self.window.lock().clone()
    }
}
