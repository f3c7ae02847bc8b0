//! Drive a full device session against in-memory collaborators and print
//! what the engine does with the traffic.
//!
//! Run with: cargo run --example session_demo

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Duration;
use tuyazig::{
    AttributeSink, BatteryAlgorithm, BatteryCalcOptions, BatteryChemistry, BatteryDpConfig,
    ChannelAdapter, ChannelHandle, ChannelKind, DeviceIdentity, DispatchFn, DpMapping, DpResolver,
    DpValue, RawTransport, Result, SessionBuilder, protocol::encode_datapoint,
};

struct DemoChannel {
    kind: ChannelKind,
    dispatch: Mutex<Option<DispatchFn>>,
}

impl DemoChannel {
    fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self { kind, dispatch: Mutex::new(None) })
    }

    fn inject(&self, payload: &[u8]) {
        if let Some(dispatch) = self.dispatch.lock().clone() {
            dispatch(payload);
        }
    }
}

impl ChannelAdapter for DemoChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn subscribe(&self, dispatch: DispatchFn) -> Result<ChannelHandle> {
        *self.dispatch.lock() = Some(dispatch);
        Ok(ChannelHandle::new(self.kind, || {}))
    }
}

struct DemoCatalog;

impl DpResolver for DemoCatalog {
    fn lookup(&self, dp_id: u8) -> Option<DpMapping> {
        match dp_id {
            1 => Some(DpMapping::new(
                "measure_temperature",
                Arc::new(|v: &DpValue| match v {
                    DpValue::Value(raw) => serde_json::json!(f64::from(*raw) / 10.0),
                    other => other.to_json(),
                }),
            )),
            _ => None,
        }
    }
}

struct DemoDevice;

impl AttributeSink for DemoDevice {
    fn set_attribute(&self, name: &str, value: serde_json::Value) -> Result<()> {
        println!("  sink <- {name} = {value}");
        Ok(())
    }

    fn has_attribute(&self, _name: &str) -> bool {
        true
    }
}

struct DemoRadio;

impl RawTransport for DemoRadio {
    fn send(&self, frame: &[u8]) -> Result<()> {
        println!("  radio -> {}", hex::encode(frame));
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let hook = DemoChannel::new(ChannelKind::LowLevelHook);
    let bound = DemoChannel::new(ChannelKind::BoundCluster);

    let session = SessionBuilder::new(
        "demo-device",
        Arc::new(DemoCatalog),
        Arc::new(DemoDevice),
        Arc::new(DemoRadio),
    )
    .identity(DeviceIdentity::new("TS0601", "_TZE200_demo", "Soil sensor"))
    .battery(BatteryDpConfig {
        dp_ids: vec![15],
        algorithm: BatteryAlgorithm::Millivolt,
        options: BatteryCalcOptions {
            chemistry: BatteryChemistry::Cr2032,
            ..Default::default()
        },
    })
    .window_duration(Duration::from_secs(2))
    .attach(&[
        hook.clone() as Arc<dyn ChannelAdapter>,
        bound.clone() as Arc<dyn ChannelAdapter>,
    ]);

    println!("Injecting a temperature report (21.5 C):");
    hook.inject(&encode_datapoint(1, &DpValue::Value(215)));

    println!("Injecting a battery report (2850 mV) on two channels at once:");
    let battery = encode_datapoint(15, &DpValue::Value(2850));
    hook.inject(&battery);
    bound.inject(&battery);

    println!("Waiting for the observation window to close...");
    let mut mode_rx = session.mode_watch();
    let _ = mode_rx.changed().await;
    println!("Protocol mode decided: {:?}", session.mode());

    let diag = session.diagnostics();
    println!("Authoritative channel: {:?}", diag.channels.authoritative);
    session.teardown();
}
