//! Tuya data-point wire protocol implementation.
//! Handles DP framing, header parsing, and type-specific payload codecs
//! for the manufacturer-specific cluster payload.

use crate::error::{Result, TuyaZigError};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use std::sync::atomic::{AtomicU16, Ordering};

/// Manufacturer-specific cluster carrying the vendor DP protocol.
pub const TUYA_CLUSTER_ID: u16 = 0xEF00;

/// Data-point id conventionally used for time synchronization.
pub const TIME_SYNC_DP: u8 = 0x24;

/// Outbound request status byte (always zero for host-originated frames).
pub const STATUS_REQUEST: u8 = 0x00;

/// Size of the per-DP header: id(1) + type(1) + length(2).
const DP_HEADER_LEN: usize = 4;

/// Wire type tag of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DpType {
    Raw = 0x00,
    Bool = 0x01,
    Value = 0x02,
    String = 0x03,
    Enum = 0x04,
    Bitmap = 0x05,
}

impl DpType {
    /// Parse a wire tag. Unknown tags are an encode-side error; the
    /// decoder skips them instead (see [`decode_datapoints`]).
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x00 => Ok(DpType::Raw),
            0x01 => Ok(DpType::Bool),
            0x02 => Ok(DpType::Value),
            0x03 => Ok(DpType::String),
            0x04 => Ok(DpType::Enum),
            0x05 => Ok(DpType::Bitmap),
            other => Err(TuyaZigError::UnsupportedType(other)),
        }
    }
}

/// Decoded payload of a data point.
#[derive(Debug, Clone, PartialEq)]
pub enum DpValue {
    /// Opaque byte sequence, interpretation left to the caller
    Raw(Vec<u8>),
    Bool(bool),
    /// 4-byte big-endian signed integer
    Value(i32),
    String(String),
    /// Single-byte ordinal
    Enum(u8),
    /// Opaque bit field, interpretation left to the caller
    Bitmap(Vec<u8>),
}

impl DpValue {
    pub fn dp_type(&self) -> DpType {
        match self {
            DpValue::Raw(_) => DpType::Raw,
            DpValue::Bool(_) => DpType::Bool,
            DpValue::Value(_) => DpType::Value,
            DpValue::String(_) => DpType::String,
            DpValue::Enum(_) => DpType::Enum,
            DpValue::Bitmap(_) => DpType::Bitmap,
        }
    }

    /// Serialize to the type-specific wire payload.
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            DpValue::Raw(b) | DpValue::Bitmap(b) => b.clone(),
            DpValue::Bool(v) => vec![u8::from(*v)],
            DpValue::Value(v) => v.to_be_bytes().to_vec(),
            DpValue::String(s) => s.as_bytes().to_vec(),
            DpValue::Enum(v) => vec![*v],
        }
    }

    /// Numeric view of the payload, when one exists.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DpValue::Value(v) => Some(f64::from(*v)),
            DpValue::Enum(v) => Some(f64::from(*v)),
            DpValue::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    /// JSON view crossing the attribute-sink boundary.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DpValue::Raw(b) | DpValue::Bitmap(b) => serde_json::json!(hex::encode(b)),
            DpValue::Bool(v) => serde_json::json!(v),
            DpValue::Value(v) => serde_json::json!(v),
            DpValue::String(s) => serde_json::json!(s),
            DpValue::Enum(v) => serde_json::json!(v),
        }
    }
}

/// A single typed value addressed by a small integer id.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Data-point id (0-255)
    pub id: u8,
    /// Wire type tag
    pub dp_type: DpType,
    /// Decoded payload
    pub value: DpValue,
}

/// Decode every well-formed data point out of a cluster payload.
///
/// The buffer may carry zero or more DPs back to back. A declared length
/// that would read past the buffer end stops the loop; everything decoded
/// before the truncation point is kept. This function never fails on
/// malformed input.
pub fn decode_datapoints(buf: &[u8]) -> Vec<DataPoint> {
    let mut out = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= DP_HEADER_LEN {
        let id = buf[offset];
        let tag = buf[offset + 1];
        let declared = BigEndian::read_u16(&buf[offset + 2..offset + 4]) as usize;
        let payload_start = offset + DP_HEADER_LEN;

        if declared > buf.len() - payload_start {
            warn!(
                "Truncated DP frame: dp={} declares {} bytes, {} remain; dropping tail",
                id,
                declared,
                buf.len() - payload_start
            );
            break;
        }

        let payload = &buf[payload_start..payload_start + declared];
        offset = payload_start + declared;

        let dp_type = match DpType::from_tag(tag) {
            Ok(t) => t,
            Err(_) => {
                debug!("Skipping DP {} with unrecognized type tag 0x{:02X}", id, tag);
                continue;
            }
        };

        match decode_payload(dp_type, payload) {
            Some(value) => out.push(DataPoint { id, dp_type, value }),
            None => {
                debug!(
                    "Skipping DP {}: payload of {} bytes too short for {:?}",
                    id,
                    payload.len(),
                    dp_type
                );
            }
        }
    }

    if offset < buf.len() && buf.len() - offset < DP_HEADER_LEN && offset > 0 {
        debug!("{} trailing bytes after last DP, ignored", buf.len() - offset);
    }

    out
}

fn decode_payload(dp_type: DpType, payload: &[u8]) -> Option<DpValue> {
    match dp_type {
        DpType::Raw => Some(DpValue::Raw(payload.to_vec())),
        DpType::Bitmap => Some(DpValue::Bitmap(payload.to_vec())),
        DpType::Bool => payload.first().map(|b| DpValue::Bool(*b != 0)),
        DpType::Enum => payload.first().map(|b| DpValue::Enum(*b)),
        DpType::Value => {
            if payload.len() < 4 {
                return None;
            }
            Some(DpValue::Value(BigEndian::read_i32(&payload[..4])))
        }
        DpType::String => Some(DpValue::String(
            String::from_utf8_lossy(payload).into_owned(),
        )),
    }
}

/// Serialize one DP into its header + payload framing (no command prefix).
pub fn encode_datapoint(id: u8, value: &DpValue) -> Vec<u8> {
    let payload = value.to_payload();
    let mut data = Vec::with_capacity(DP_HEADER_LEN + payload.len());
    data.push(id);
    data.push(value.dp_type() as u8);
    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    data.extend_from_slice(&payload);
    data
}

/// Build an outbound command frame: `seq:u16 | status:u8 | DP framing`.
pub fn encode_command(seq: u16, id: u8, value: &DpValue) -> Vec<u8> {
    let mut data = command_prefix(seq);
    data.extend_from_slice(&encode_datapoint(id, value));
    data
}

/// Build an outbound command frame from a catalog-supplied numeric type
/// tag and a pre-serialized payload. The only failure is an unknown tag.
pub fn encode_command_tagged(seq: u16, id: u8, tag: u8, payload: &[u8]) -> Result<Vec<u8>> {
    DpType::from_tag(tag)?;
    let mut data = command_prefix(seq);
    data.push(id);
    data.push(tag);
    data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Build a DP query frame: one zero-length RAW entry per queried id.
/// Devices that answer will report the current value of each DP.
pub fn encode_query(seq: u16, dp_ids: &[u8]) -> Vec<u8> {
    let mut data = command_prefix(seq);
    for id in dp_ids {
        data.push(*id);
        data.push(DpType::Raw as u8);
        data.extend_from_slice(&0u16.to_be_bytes());
    }
    data
}

/// Wrap a time-sync payload in a command frame addressed to the
/// conventional time-sync DP.
pub fn encode_time_sync(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut data = command_prefix(seq);
    data.extend_from_slice(&encode_datapoint(TIME_SYNC_DP, &DpValue::Raw(payload.to_vec())));
    data
}

fn command_prefix(seq: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(3 + DP_HEADER_LEN);
    data.extend_from_slice(&seq.to_be_bytes());
    data.push(STATUS_REQUEST);
    data
}

/// Monotonically incrementing outbound sequence counter, modulo 65536.
/// One counter per device session; atomic because the dispatcher may be
/// entered from several delivery-channel callbacks at once.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next sequence number, wrapping at 65536.
    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bool_datapoint() {
        // dpId=1, type=BOOL, length=1, value=1
        let dps = decode_datapoints(&[0x01, 0x01, 0x00, 0x01, 0x01]);
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0].id, 1);
        assert_eq!(dps[0].dp_type, DpType::Bool);
        assert_eq!(dps[0].value, DpValue::Bool(true));
    }

    #[test]
    fn decodes_value_as_signed_big_endian() {
        let dps = decode_datapoints(&[0x02, 0x02, 0x00, 0x04, 0xFF, 0xFF, 0xFF, 0xF6]);
        assert_eq!(dps[0].value, DpValue::Value(-10));
    }

    #[test]
    fn decodes_multiple_datapoints_back_to_back() {
        let mut buf = encode_datapoint(4, &DpValue::Value(87));
        buf.extend_from_slice(&encode_datapoint(5, &DpValue::Enum(2)));
        buf.extend_from_slice(&encode_datapoint(6, &DpValue::String("ok".into())));
        let dps = decode_datapoints(&buf);
        assert_eq!(dps.len(), 3);
        assert_eq!(dps[1].value, DpValue::Enum(2));
        assert_eq!(dps[2].value, DpValue::String("ok".into()));
    }

    #[test]
    fn truncated_frame_keeps_earlier_datapoints() {
        let mut buf = encode_datapoint(1, &DpValue::Bool(false));
        // Second DP declares 8 payload bytes but only 2 follow.
        buf.extend_from_slice(&[0x02, 0x02, 0x00, 0x08, 0xAA, 0xBB]);
        let dps = decode_datapoints(&buf);
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0].value, DpValue::Bool(false));
    }

    #[test]
    fn unknown_type_tag_is_skipped_not_fatal() {
        let mut buf = vec![0x07, 0x17, 0x00, 0x01, 0xFF];
        buf.extend_from_slice(&encode_datapoint(8, &DpValue::Enum(1)));
        let dps = decode_datapoints(&buf);
        assert_eq!(dps.len(), 1);
        assert_eq!(dps[0].id, 8);
    }

    #[test]
    fn empty_and_garbage_buffers_decode_to_nothing() {
        assert!(decode_datapoints(&[]).is_empty());
        assert!(decode_datapoints(&[0x01, 0x01]).is_empty());
    }

    #[test]
    fn invalid_utf8_string_decodes_lossily() {
        let dps = decode_datapoints(&[0x09, 0x03, 0x00, 0x02, 0xFF, 0xFE]);
        assert_eq!(dps.len(), 1);
        assert!(matches!(dps[0].value, DpValue::String(_)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let originals = vec![
            DataPoint { id: 1, dp_type: DpType::Bool, value: DpValue::Bool(true) },
            DataPoint { id: 2, dp_type: DpType::Value, value: DpValue::Value(-2500) },
            DataPoint { id: 3, dp_type: DpType::Enum, value: DpValue::Enum(3) },
            DataPoint { id: 4, dp_type: DpType::String, value: DpValue::String("abc".into()) },
            DataPoint { id: 5, dp_type: DpType::Raw, value: DpValue::Raw(vec![1, 2, 3]) },
            DataPoint { id: 6, dp_type: DpType::Bitmap, value: DpValue::Bitmap(vec![0b101]) },
        ];
        let mut buf = Vec::new();
        for dp in &originals {
            buf.extend_from_slice(&encode_datapoint(dp.id, &dp.value));
        }
        assert_eq!(decode_datapoints(&buf), originals);
    }

    #[test]
    fn command_frame_prepends_sequence_and_status() {
        let frame = encode_command(0x1234, 1, &DpValue::Bool(true));
        assert_eq!(&frame[..3], &[0x12, 0x34, 0x00]);
        assert_eq!(&frame[3..], &[0x01, 0x01, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn tagged_encode_rejects_unknown_type() {
        let err = encode_command_tagged(0, 1, 0x42, &[]).unwrap_err();
        assert_eq!(err, TuyaZigError::UnsupportedType(0x42));
        assert!(encode_command_tagged(0, 1, 0x02, &[0, 0, 0, 9]).is_ok());
    }

    #[test]
    fn query_frame_has_zero_length_entries() {
        let frame = encode_query(7, &[4, 15]);
        assert_eq!(&frame[..3], &[0x00, 0x07, 0x00]);
        assert_eq!(&frame[3..], &[0x04, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn sequence_counter_wraps_modulo_65536() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        counter.next.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }
}
