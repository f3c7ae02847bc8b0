//! Routing of decoded DataPoints to their consumers.
//! Classifies inbound DPs as battery, catalog-mapped, or unmapped, and
//! pushes outbound attribute changes through the wire codec.

use crate::battery::{self, BatteryAlgorithm, BatteryCalcOptions};
use crate::error::Result;
use crate::protocol::{self, DataPoint, DpValue, SequenceCounter};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Attribute name battery percentages are written under.
pub const BATTERY_ATTRIBUTE: &str = "measure_battery";

/// Unmapped DPs kept around for diagnostics; oldest entries are evicted
/// past this count.
const UNMAPPED_CACHE_LIMIT: usize = 64;

/// Transformation from a decoded DP payload to an attribute value.
pub type Transform = Arc<dyn Fn(&DpValue) -> serde_json::Value + Send + Sync>;

/// Catalog entry resolving a DP id to a device attribute.
#[derive(Clone)]
pub struct DpMapping {
    pub attribute: String,
    pub transform: Transform,
}

impl DpMapping {
    /// Mapping that forwards the decoded value unchanged.
    pub fn passthrough<A: Into<String>>(attribute: A) -> Self {
        Self {
            attribute: attribute.into(),
            transform: Arc::new(|value| value.to_json()),
        }
    }

    pub fn new<A: Into<String>>(attribute: A, transform: Transform) -> Self {
        Self { attribute: attribute.into(), transform }
    }
}

/// Device/catalog-specific DP-to-attribute resolver, supplied externally.
pub trait DpResolver: Send + Sync {
    fn lookup(&self, dp_id: u8) -> Option<DpMapping>;
}

/// External device object receiving normalized attribute values.
pub trait AttributeSink: Send + Sync {
    fn set_attribute(&self, name: &str, value: serde_json::Value) -> Result<()>;
    fn has_attribute(&self, name: &str) -> bool;
}

/// External radio stack accepting raw cluster payloads.
pub trait RawTransport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<()>;
}

/// How this device reports battery, and through which DP ids.
#[derive(Clone)]
pub struct BatteryDpConfig {
    /// DP ids carrying battery telemetry (15 is the most common, 4 and 14
    /// appear on older firmware)
    pub dp_ids: Vec<u8>,
    pub algorithm: BatteryAlgorithm,
    pub options: BatteryCalcOptions,
}

impl Default for BatteryDpConfig {
    fn default() -> Self {
        Self {
            dp_ids: vec![4, 14, 15],
            algorithm: BatteryAlgorithm::Direct,
            options: BatteryCalcOptions::default(),
        }
    }
}

/// Routes decoded DataPoints and encodes outbound writes.
///
/// Safe to call from several delivery-channel callbacks at once: all
/// interior state is lock-guarded and nothing here blocks.
pub struct Dispatcher {
    device_id: String,
    resolver: Arc<dyn DpResolver>,
    sink: Arc<dyn AttributeSink>,
    transport: Arc<dyn RawTransport>,
    seq: Arc<SequenceCounter>,
    battery: Option<BatteryDpConfig>,
    unmapped: Mutex<HashMap<u8, DpValue>>,
}

impl Dispatcher {
    pub fn new(
        device_id: String,
        resolver: Arc<dyn DpResolver>,
        sink: Arc<dyn AttributeSink>,
        transport: Arc<dyn RawTransport>,
        seq: Arc<SequenceCounter>,
        battery: Option<BatteryDpConfig>,
    ) -> Self {
        Self {
            device_id,
            resolver,
            sink,
            transport,
            seq,
            battery,
            unmapped: Mutex::new(HashMap::new()),
        }
    }

    /// Classify and route one inbound DataPoint. Never panics and never
    /// blocks; every failure path is logged and swallowed here.
    pub fn handle_inbound(&self, dp: &DataPoint) {
        if self.try_battery(dp) {
            return;
        }

        match self.resolver.lookup(dp.id) {
            Some(mapping) => {
                let value = (mapping.transform)(&dp.value);
                self.write_attribute(&mapping.attribute, value);
            }
            None => {
                debug!(
                    "[{}] Unmapped DP {} ({:?}), caching for diagnostics",
                    self.device_id, dp.id, dp.dp_type
                );
                let mut unmapped = self.unmapped.lock();
                if unmapped.len() >= UNMAPPED_CACHE_LIMIT && !unmapped.contains_key(&dp.id) {
                    return;
                }
                unmapped.insert(dp.id, dp.value.clone());
            }
        }
    }

    /// Battery DPs bypass the catalog and go through the curve engine.
    /// Returns true when the DP was consumed as battery telemetry.
    fn try_battery(&self, dp: &DataPoint) -> bool {
        let Some(config) = &self.battery else {
            return false;
        };
        if !config.dp_ids.contains(&dp.id) {
            return false;
        }

        let Some(raw) = dp.value.as_f64() else {
            debug!(
                "[{}] Battery DP {} carried non-numeric payload, skipping",
                self.device_id, dp.id
            );
            return true;
        };

        match battery::calculate(raw, config.algorithm, &config.options) {
            Some(pct) => {
                debug!(
                    "[{}] Battery {}% from DP {} (raw={}, status={})",
                    self.device_id,
                    pct,
                    dp.id,
                    raw,
                    battery::battery_status(pct)
                );
                self.write_attribute(BATTERY_ATTRIBUTE, serde_json::json!(pct));
            }
            None => {
                debug!(
                    "[{}] Battery DP {} yielded no percentage (raw={}), skipping",
                    self.device_id, dp.id, raw
                );
            }
        }
        true
    }

    /// Push one attribute value to the external sink, fire-and-forget.
    /// Attribute propagation is never retried; only DP queries are.
    fn write_attribute(&self, name: &str, value: serde_json::Value) {
        if !self.sink.has_attribute(name) {
            debug!(
                "[{}] Sink has no attribute '{}', dropping value",
                self.device_id, name
            );
            return;
        }
        if let Err(e) = self.sink.set_attribute(name, value) {
            warn!("[{}] Failed to set attribute '{}': {}", self.device_id, name, e);
        }
    }

    /// Encode and send one outbound DP write, fire-and-forget with a
    /// logged failure.
    pub fn send_datapoint(&self, dp_id: u8, value: &DpValue) {
        let seq = self.seq.next();
        let frame = protocol::encode_command(seq, dp_id, value);
        debug!(
            "[{}] Sending DP {} (seq={}): {}",
            self.device_id,
            dp_id,
            seq,
            hex::encode(&frame)
        );
        if let Err(e) = self.transport.send(&frame) {
            warn!("[{}] Send failed for DP {}: {}", self.device_id, dp_id, e);
        }
    }

    /// Outbound write with a catalog-supplied numeric type tag. The only
    /// error surfaced is an unrecognized tag; transport failure is logged.
    pub fn send_datapoint_tagged(&self, dp_id: u8, tag: u8, payload: &[u8]) -> Result<()> {
        let seq = self.seq.next();
        let frame = protocol::encode_command_tagged(seq, dp_id, tag, payload)?;
        if let Err(e) = self.transport.send(&frame) {
            warn!("[{}] Send failed for DP {}: {}", self.device_id, dp_id, e);
        }
        Ok(())
    }

    /// DPs seen this session that no catalog entry claims.
    pub fn unmapped_snapshot(&self) -> HashMap<u8, DpValue> {
        self.unmapped.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::BatteryChemistry;
    use crate::error::TuyaZigError;
    use crate::protocol::DpType;
    use parking_lot::Mutex as PlMutex;

    struct MapResolver {
        map: HashMap<u8, DpMapping>,
    }

    impl DpResolver for MapResolver {
        fn lookup(&self, dp_id: u8) -> Option<DpMapping> {
            self.map.get(&dp_id).cloned()
        }
    }

    #[derive(Default)]
    struct MockSink {
        attributes: PlMutex<HashMap<String, serde_json::Value>>,
        known: Vec<String>,
    }

    impl AttributeSink for MockSink {
        fn set_attribute(&self, name: &str, value: serde_json::Value) -> Result<()> {
            self.attributes.lock().insert(name.to_string(), value);
            Ok(())
        }

        fn has_attribute(&self, name: &str) -> bool {
            self.known.iter().any(|k| k == name)
        }
    }

    #[derive(Default)]
    struct NullTransport {
        frames: PlMutex<Vec<Vec<u8>>>,
    }

    impl RawTransport for NullTransport {
        fn send(&self, frame: &[u8]) -> Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn dp(id: u8, value: DpValue) -> DataPoint {
        let dp_type = value.dp_type();
        DataPoint { id, dp_type, value }
    }

    fn dispatcher(
        resolver_map: HashMap<u8, DpMapping>,
        known: Vec<String>,
        battery: Option<BatteryDpConfig>,
    ) -> (Dispatcher, Arc<MockSink>, Arc<NullTransport>) {
        let sink = Arc::new(MockSink { attributes: PlMutex::new(HashMap::new()), known });
        let transport = Arc::new(NullTransport::default());
        let dispatcher = Dispatcher::new(
            "dev1".into(),
            Arc::new(MapResolver { map: resolver_map }),
            sink.clone(),
            transport.clone(),
            Arc::new(SequenceCounter::new()),
            battery,
        );
        (dispatcher, sink, transport)
    }

    #[test]
    fn mapped_dp_reaches_the_sink_transformed() {
        let mut map = HashMap::new();
        map.insert(
            1,
            DpMapping::new(
                "measure_temperature",
                Arc::new(|v: &DpValue| match v {
                    DpValue::Value(raw) => serde_json::json!(f64::from(*raw) / 10.0),
                    other => other.to_json(),
                }),
            ),
        );
        let (dispatcher, sink, _) =
            dispatcher(map, vec!["measure_temperature".into()], None);

        dispatcher.handle_inbound(&dp(1, DpValue::Value(215)));
        assert_eq!(
            sink.attributes.lock().get("measure_temperature"),
            Some(&serde_json::json!(21.5))
        );
    }

    #[test]
    fn missing_sink_attribute_drops_the_value() {
        let mut map = HashMap::new();
        map.insert(2, DpMapping::passthrough("measure_humidity"));
        let (dispatcher, sink, _) = dispatcher(map, vec![], None);

        dispatcher.handle_inbound(&dp(2, DpValue::Value(55)));
        assert!(sink.attributes.lock().is_empty());
    }

    #[test]
    fn unmapped_dp_is_cached_not_errored() {
        let (dispatcher, sink, _) = dispatcher(HashMap::new(), vec![], None);
        dispatcher.handle_inbound(&dp(101, DpValue::Enum(2)));

        assert!(sink.attributes.lock().is_empty());
        let cached = dispatcher.unmapped_snapshot();
        assert_eq!(cached.get(&101), Some(&DpValue::Enum(2)));
    }

    #[test]
    fn battery_dp_goes_through_the_curve_engine() {
        let battery = BatteryDpConfig {
            dp_ids: vec![15],
            algorithm: BatteryAlgorithm::VoltageCurve,
            options: BatteryCalcOptions {
                chemistry: BatteryChemistry::Cr2032,
                ..Default::default()
            },
        };
        let (dispatcher, sink, _) =
            dispatcher(HashMap::new(), vec![BATTERY_ATTRIBUTE.into()], Some(battery));

        // 3.00 V on the CR2032 curve is 95%.
        dispatcher.handle_inbound(&dp(15, DpValue::Value(3)));
        assert_eq!(
            sink.attributes.lock().get(BATTERY_ATTRIBUTE),
            Some(&serde_json::json!(95))
        );
    }

    #[test]
    fn non_numeric_battery_payload_writes_nothing() {
        let (dispatcher, sink, _) = dispatcher(
            HashMap::new(),
            vec![BATTERY_ATTRIBUTE.into()],
            Some(BatteryDpConfig::default()),
        );
        dispatcher.handle_inbound(&dp(15, DpValue::Raw(vec![1, 2, 3])));
        assert!(sink.attributes.lock().is_empty());
    }

    #[test]
    fn outbound_write_hits_the_transport_once() {
        let (dispatcher, _, transport) = dispatcher(HashMap::new(), vec![], None);
        dispatcher.send_datapoint(1, &DpValue::Bool(true));

        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..3], &[0x00, 0x00, 0x00]);
        assert_eq!(&frames[0][3..], &[0x01, 0x01, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn tagged_write_rejects_unknown_tag() {
        let (dispatcher, _, transport) = dispatcher(HashMap::new(), vec![], None);
        let err = dispatcher.send_datapoint_tagged(1, 0x66, &[0]).unwrap_err();
        assert_eq!(err, TuyaZigError::UnsupportedType(0x66));
        assert!(transport.frames.lock().is_empty());

        dispatcher.send_datapoint_tagged(1, 0x04, &[2]).unwrap();
        assert_eq!(transport.frames.lock().len(), 1);
    }

    #[test]
    fn unmapped_cache_is_bounded() {
        let (dispatcher, _, _) = dispatcher(HashMap::new(), vec![], None);
        for id in 0..=u8::MAX {
            dispatcher.handle_inbound(&dp(id, DpValue::Enum(0)));
        }
        assert_eq!(dispatcher.unmapped_snapshot().len(), UNMAPPED_CACHE_LIMIT);
    }
}
