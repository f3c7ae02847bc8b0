//! Time synchronization payload builder.
//! Device firmware disagrees wildly on how a clock should be encoded; the
//! format is re-detected from identity strings at every sync, never stored.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use log::debug;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z.
const EPOCH_2000_OFFSET: i64 = 946_684_800;

/// Header bytes of the 9-byte calendar form: pad + time-valid flag,
/// matching the serial MCU time-sync convention.
const CALENDAR_HEADER: [u8; 2] = [0x00, 0x01];

/// The six supported time-sync payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncFormat {
    /// u32 BE seconds since 2000-01-01 (4 bytes)
    Epoch2000,
    /// u32 BE seconds since 1970-01-01 (4 bytes)
    Epoch1970,
    /// `[yy-2000, mm, dd, hh, mi, ss, weekday]` (7 bytes)
    Calendar7,
    /// 2-byte header then the 7-byte calendar (9 bytes)
    CalendarHeader9,
    /// 7-byte calendar then i16 BE UTC offset in minutes (9 bytes)
    CalendarTz9,
    /// u32 BE UTC seconds then u32 BE local seconds, both since 1970 (8 bytes)
    DualEpoch8,
}

impl TimeSyncFormat {
    /// Exact payload size in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            TimeSyncFormat::Epoch2000 | TimeSyncFormat::Epoch1970 => 4,
            TimeSyncFormat::Calendar7 => 7,
            TimeSyncFormat::CalendarHeader9 | TimeSyncFormat::CalendarTz9 => 9,
            TimeSyncFormat::DualEpoch8 => 8,
        }
    }
}

/// Identity strings the detection heuristic inspects. All fields optional;
/// absent strings simply contribute nothing.
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    /// Zigbee model identifier (e.g. "TS0601")
    pub model_id: String,
    /// Manufacturer name (e.g. "_TZE200_cwbvmsar")
    pub manufacturer: String,
    /// Free-form driver or product hint supplied by the integration shell
    pub product_hint: String,
}

impl DeviceIdentity {
    pub fn new<M, F, P>(model_id: M, manufacturer: F, product_hint: P) -> Self
    where
        M: Into<String>,
        F: Into<String>,
        P: Into<String>,
    {
        Self {
            model_id: model_id.into(),
            manufacturer: manufacturer.into(),
            product_hint: product_hint.into(),
        }
    }

    fn haystack(&self) -> String {
        format!("{} {} {}", self.model_id, self.manufacturer, self.product_hint).to_lowercase()
    }
}

const DISPLAY_KEYWORDS: &[&str] = &["lcd", "display", "climate monitor"];
const THERMOSTAT_KEYWORDS: &[&str] = &["thermostat", "trv", "valve", "radiator"];
const VENDOR_KEYWORDS: &[&str] = &["ts0601", "_tze", "_tyst", "tuya"];

/// Pick the payload shape a device most likely expects.
///
/// Display/LCD climate hardware wants the dual-timestamp form, thermostat
/// and valve firmware the headered calendar, anything else speaking the
/// vendor protocol the bare calendar, and non-vendor identities the
/// 4-byte epoch-2000 form.
pub fn detect_format(identity: &DeviceIdentity) -> TimeSyncFormat {
    let haystack = identity.haystack();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| haystack.contains(k));

    let format = if contains_any(DISPLAY_KEYWORDS) {
        TimeSyncFormat::DualEpoch8
    } else if contains_any(THERMOSTAT_KEYWORDS) {
        TimeSyncFormat::CalendarHeader9
    } else if contains_any(VENDOR_KEYWORDS) {
        TimeSyncFormat::Calendar7
    } else {
        TimeSyncFormat::Epoch2000
    };
    debug!("Time sync format for '{}': {:?}", identity.model_id, format);
    format
}

/// Build a time-sync payload for a known format.
///
/// `tz_offset_minutes` is the device's UTC offset; calendar forms encode
/// device-local wall time when `local` is set, UTC otherwise. Epoch forms
/// always carry their epoch's seconds and ignore `local`.
pub fn build_payload(
    format: TimeSyncFormat,
    now: DateTime<Utc>,
    tz_offset_minutes: i32,
    local: bool,
) -> Vec<u8> {
    let unix = now.timestamp();
    let offset_secs = i64::from(tz_offset_minutes) * 60;

    match format {
        TimeSyncFormat::Epoch2000 => {
            let secs = (unix - EPOCH_2000_OFFSET).max(0) as u32;
            secs.to_be_bytes().to_vec()
        }
        TimeSyncFormat::Epoch1970 => (unix.max(0) as u32).to_be_bytes().to_vec(),
        TimeSyncFormat::Calendar7 => calendar_bytes(now, offset_secs, local).to_vec(),
        TimeSyncFormat::CalendarHeader9 => {
            let mut payload = CALENDAR_HEADER.to_vec();
            payload.extend_from_slice(&calendar_bytes(now, offset_secs, local));
            payload
        }
        TimeSyncFormat::CalendarTz9 => {
            let mut payload = calendar_bytes(now, offset_secs, local).to_vec();
            payload.extend_from_slice(&(tz_offset_minutes as i16).to_be_bytes());
            payload
        }
        TimeSyncFormat::DualEpoch8 => {
            let mut payload = (unix.max(0) as u32).to_be_bytes().to_vec();
            payload.extend_from_slice(&((unix + offset_secs).max(0) as u32).to_be_bytes());
            payload
        }
    }
}

/// Detect the format and build the payload in one step; this is what the
/// session's daily sync timer calls.
pub fn build_for_device(
    identity: &DeviceIdentity,
    now: DateTime<Utc>,
    tz_offset_minutes: i32,
    local: bool,
) -> (TimeSyncFormat, Vec<u8>) {
    let format = detect_format(identity);
    (format, build_payload(format, now, tz_offset_minutes, local))
}

/// `[yy-2000, mm, dd, hh, mi, ss, weekday]` with weekday 1=Monday..7=Sunday.
fn calendar_bytes(now: DateTime<Utc>, offset_secs: i64, local: bool) -> [u8; 7] {
    let stamp = if local { now + Duration::seconds(offset_secs) } else { now };
    [
        stamp.year().saturating_sub(2000).clamp(0, 255) as u8,
        stamp.month() as u8,
        stamp.day() as u8,
        stamp.hour() as u8,
        stamp.minute() as u8,
        stamp.second() as u8,
        stamp.weekday().number_from_monday() as u8,
    ]
}

/// Seconds until the next daily sync slot (03:00 device-local wall time).
pub fn seconds_until_daily_sync(now: DateTime<Utc>, tz_offset_minutes: i32) -> u64 {
    let offset = Duration::minutes(i64::from(tz_offset_minutes));
    let local_now = now + offset;
    let today_3am = Utc
        .with_ymd_and_hms(local_now.year(), local_now.month(), local_now.day(), 3, 0, 0)
        .single()
        .unwrap_or(local_now);
    let next = if local_now < today_3am {
        today_3am
    } else {
        today_3am + Duration::days(1)
    };
    (next - local_now).num_seconds().max(1) as u64
}
