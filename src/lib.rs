//! # Tuyazig
//!
//! Protocol and runtime engine for Tuya Zigbee devices that tunnel the
//! vendor data-point protocol inside a manufacturer-specific cluster,
//! alongside (or instead of) standard Zigbee clusters.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tuyazig::{DeviceIdentity, SessionBuilder};
//! # use tuyazig::{AttributeSink, DpResolver, RawTransport, Result};
//! # struct Catalog; struct Device; struct Radio;
//! # impl DpResolver for Catalog { fn lookup(&self, _: u8) -> Option<tuyazig::DpMapping> { None } }
//! # impl AttributeSink for Device {
//! #     fn set_attribute(&self, _: &str, _: serde_json::Value) -> Result<()> { Ok(()) }
//! #     fn has_attribute(&self, _: &str) -> bool { false }
//! # }
//! # impl RawTransport for Radio { fn send(&self, _: &[u8]) -> Result<()> { Ok(()) } }
//!
//! let session = SessionBuilder::new("DEVICE_ID", Arc::new(Catalog), Arc::new(Device), Arc::new(Radio))
//!     .identity(DeviceIdentity::new("TS0601", "_TZE200_cwbvmsar", "Radiator valve"))
//!     .attach(&[]);
//! ```
//!
pub mod battery;
pub mod channel;
pub mod dispatch;
pub mod error;
pub mod mode;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod timesync;

pub use battery::{BatteryAlgorithm, BatteryCalcOptions, BatteryChemistry};
pub use channel::{ChannelAdapter, ChannelDiagnostics, ChannelHandle, ChannelKind, DispatchFn};
pub use dispatch::{AttributeSink, BatteryDpConfig, DpMapping, DpResolver, RawTransport};
pub use error::{Result, TuyaZigError};
pub use mode::ProtocolMode;
pub use protocol::{DataPoint, DpType, DpValue};
pub use retry::{QueryOutcome, RetryPolicy};
pub use session::{DeviceSession, SessionBuilder, SessionDiagnostics};
pub use timesync::{DeviceIdentity, TimeSyncFormat};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
