//! Journey data model: in-memory route state, persisted records, and the
//! distance filter that turns a jittery fix stream into travelled meters.

use crate::domain::types::{CardId, PositionSample, RouteId, TIMESTAMP_FORMAT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Mean Earth radius used for great-circle distance
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default movement threshold: segments at or below this are GPS jitter
pub const DEFAULT_MOVEMENT_THRESHOLD_M: f64 = 1.0;

/// Sliding window of the most recent fixes (never more than two)
pub type SampleBuffer = SmallVec<[PositionSample; 2]>;

/// Great-circle (haversine) distance between two points in meters
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[inline]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Evaluate a full two-sample buffer against the movement threshold.
///
/// Movement (`d > threshold`) drops the older fix and adds `d` to the total;
/// jitter drops the newer fix and leaves the total alone. Either way the
/// buffer ends with exactly one fix. Buffers with fewer than two fixes are
/// left untouched.
///
/// Returns the updated total and the accepted segment length, if any.
pub fn accumulate_distance(
    buffer: &mut SampleBuffer,
    total_distance: f64,
    threshold_m: f64,
) -> (f64, Option<f64>) {
    if buffer.len() != 2 {
        return (total_distance, None);
    }

    let (a, b) = (buffer[0], buffer[1]);
    let d = haversine_distance_m(a.latitude, a.longitude, b.latitude, b.longitude);

    if d > threshold_m {
        buffer.remove(0);
        (round2(total_distance + d), Some(d))
    } else {
        buffer.truncate(1);
        (total_distance, None)
    }
}

/// State of a journey rebuilt from an orphaned path log
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredRoute {
    pub route_id: RouteId,
    pub user_id: CardId,
    pub start: PositionSample,
    pub last: PositionSample,
    pub total_distance: f64,
    pub rows: usize,
}

/// In-memory state of the single active journey
#[derive(Debug, Clone, Default)]
pub struct JourneyState {
    route_id: Option<RouteId>,
    user_id: Option<CardId>,
    total_distance: f64,
    buffer: SampleBuffer,
    start: Option<PositionSample>,
}

impl JourneyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a fresh journey at `start`
    pub fn begin(&mut self, route_id: RouteId, user_id: CardId, start: PositionSample) {
        self.route_id = Some(route_id);
        self.user_id = Some(user_id);
        self.total_distance = 0.0;
        self.buffer.clear();
        self.buffer.push(start);
        self.start = Some(start);
    }

    /// Continue a journey interrupted by an unclean shutdown.
    ///
    /// The persisted total is already the output of the distance filter, so
    /// history is not replayed; the buffer is seeded with the last known fix.
    pub fn resume(&mut self, recovered: &RecoveredRoute) {
        self.route_id = Some(recovered.route_id);
        self.user_id = Some(recovered.user_id.clone());
        self.total_distance = recovered.total_distance;
        self.buffer.clear();
        self.buffer.push(recovered.last);
        self.start = Some(recovered.start);
    }

    /// Slide a new fix into the buffer and run the distance filter.
    ///
    /// Returns the accepted segment length when the fix counted as movement.
    pub fn push_sample(&mut self, sample: PositionSample, threshold_m: f64) -> Option<f64> {
        self.buffer.push(sample);
        if self.buffer.len() > 2 {
            self.buffer.remove(0);
        }
        let (total, segment) = accumulate_distance(&mut self.buffer, self.total_distance, threshold_m);
        self.total_distance = total;
        segment
    }

    /// Build the ledger record for this journey ending at `stop`
    pub fn finish(&self, stop: PositionSample) -> Option<RouteRecord> {
        let (route_id, user_id, start) = match (self.route_id, &self.user_id, self.start) {
            (Some(r), Some(u), Some(s)) => (r, u.clone(), s),
            _ => return None,
        };
        Some(RouteRecord {
            route_id,
            user_id,
            timestamp_start: start.timestamp,
            lat_start: start.latitude,
            lon_start: start.longitude,
            timestamp_stop: stop.timestamp,
            lat_stop: stop.latitude,
            lon_stop: stop.longitude,
            distance: self.total_distance,
        })
    }

    /// Drop everything; called once the route record is durable
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        self.route_id.is_some()
    }

    pub fn route_id(&self) -> Option<RouteId> {
        self.route_id
    }

    pub fn user_id(&self) -> Option<&CardId> {
        self.user_id.as_ref()
    }

    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    pub fn buffer(&self) -> &[PositionSample] {
        &self.buffer
    }

    pub fn start(&self) -> Option<&PositionSample> {
        self.start.as_ref()
    }
}

/// One completed journey, persisted as a JSON line in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub route_id: RouteId,
    pub user_id: CardId,
    #[serde(with = "iso_seconds")]
    pub timestamp_start: DateTime<Utc>,
    pub lat_start: f64,
    pub lon_start: f64,
    #[serde(with = "iso_seconds")]
    pub timestamp_stop: DateTime<Utc>,
    pub lat_stop: f64,
    pub lon_stop: f64,
    /// Meters
    pub distance: f64,
}

/// One row of a route's path log
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLogEntry {
    pub sample: PositionSample,
    pub total_distance: f64,
}

impl PathLogEntry {
    pub const HEADER: &'static str = "Timestamp,Latitude,Longitude,Total_Distance";

    pub fn new(sample: PositionSample, total_distance: f64) -> Self {
        Self { sample, total_distance }
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{}",
            self.sample.timestamp_str(),
            self.sample.latitude,
            self.sample.longitude,
            self.total_distance
        )
    }

    /// Parse a data row; `Err` carries a human-readable reason
    pub fn parse_csv_row(row: &str) -> Result<Self, String> {
        let fields: Vec<&str> = row.trim_end_matches('\r').split(',').collect();
        if fields.len() != 4 {
            return Err(format!("expected 4 fields, found {}", fields.len()));
        }
        let timestamp = chrono::NaiveDateTime::parse_from_str(fields[0], TIMESTAMP_FORMAT)
            .map_err(|e| format!("timestamp `{}`: {e}", fields[0]))?
            .and_utc();
        let latitude = parse_float(fields[1], "latitude")?;
        let longitude = parse_float(fields[2], "longitude")?;
        let total_distance = parse_float(fields[3], "total_distance")?;
        Ok(Self { sample: PositionSample::new(timestamp, latitude, longitude), total_distance })
    }
}

fn parse_float(field: &str, name: &str) -> Result<f64, String> {
    field.trim().parse::<f64>().map_err(|e| format!("{name} `{field}`: {e}"))
}

mod iso_seconds {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use smallvec::smallvec;

    fn sample(secs: u32, lat: f64, lon: f64) -> PositionSample {
        PositionSample::new(Utc.with_ymd_and_hms(2021, 3, 4, 12, 0, secs).unwrap(), lat, lon)
    }

    fn card(id: &str) -> CardId {
        CardId::parse(id).unwrap()
    }

    #[test]
    fn test_haversine_known_distance() {
        // 0.0001 deg of latitude is ~11.12 m
        let d = haversine_distance_m(45.0, 25.0, 45.0001, 25.0);
        assert!((d - 11.12).abs() < 0.05, "got {d}");
        assert_eq!(haversine_distance_m(45.0, 25.0, 45.0, 25.0), 0.0);
    }

    #[test]
    fn test_movement_keeps_newer_sample() {
        let a = sample(0, 45.0, 25.0);
        let b = sample(1, 45.0001, 25.0);
        let mut buffer: SampleBuffer = smallvec![a, b];

        let (total, segment) = accumulate_distance(&mut buffer, 10.0, 1.0);

        assert!(segment.is_some());
        assert_eq!(buffer.as_slice(), &[b]);
        assert!((total - 21.12).abs() < 0.05);
        assert_eq!(total, round2(total));
    }

    #[test]
    fn test_jitter_keeps_older_sample() {
        let a = sample(0, 45.0, 25.0);
        // ~0.56 m north
        let b = sample(1, 45.000005, 25.0);
        let mut buffer: SampleBuffer = smallvec![a, b];

        let (total, segment) = accumulate_distance(&mut buffer, 3.5, 1.0);

        assert_eq!(segment, None);
        assert_eq!(total, 3.5);
        assert_eq!(buffer.as_slice(), &[a]);
    }

    #[test]
    fn test_single_sample_untouched() {
        let a = sample(0, 45.0, 25.0);
        let mut buffer: SampleBuffer = smallvec![a];
        assert_eq!(accumulate_distance(&mut buffer, 2.0, 1.0), (2.0, None));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_total_is_monotonic_over_noisy_track() {
        let mut state = JourneyState::new();
        state.begin(RouteId(1), card("A1"), sample(0, 45.0, 25.0));

        let track = [
            (45.000002, 25.000001),
            (45.0001, 25.0),
            (45.000101, 25.000002),
            (45.0003, 25.0001),
            (45.000299, 25.0001),
            (45.0002, 25.0),
        ];
        let mut previous = state.total_distance();
        for (i, (lat, lon)) in track.iter().enumerate() {
            state.push_sample(sample(i as u32 + 1, *lat, *lon), 1.0);
            assert!(state.total_distance() >= previous);
            assert_eq!(state.buffer().len(), 1);
            previous = state.total_distance();
        }
        assert!(previous > 30.0);
    }

    #[test]
    fn test_stationary_jitter_never_accumulates() {
        let mut state = JourneyState::new();
        let origin = sample(0, 45.0, 25.0);
        state.begin(RouteId(1), card("A1"), origin);

        for i in 1..20 {
            let wobble = if i % 2 == 0 { 0.000004 } else { -0.000004 };
            state.push_sample(sample(i, 45.0 + wobble, 25.0), 1.0);
        }

        assert_eq!(state.total_distance(), 0.0);
        assert_eq!(state.buffer(), &[origin]);
    }

    #[test]
    fn test_resume_seeds_buffer_from_last_fix() {
        let recovered = RecoveredRoute {
            route_id: RouteId(7),
            user_id: card("780870559455"),
            start: sample(0, 45.0, 25.0),
            last: sample(30, 45.001, 25.0),
            total_distance: 111.19,
            rows: 12,
        };
        let mut state = JourneyState::new();
        state.resume(&recovered);

        assert!(state.is_active());
        assert_eq!(state.route_id(), Some(RouteId(7)));
        assert_eq!(state.total_distance(), 111.19);
        assert_eq!(state.buffer(), &[recovered.last]);
        assert_eq!(state.start(), Some(&recovered.start));

        // Same input, same state
        let mut again = JourneyState::new();
        again.resume(&recovered);
        assert_eq!(again.buffer(), state.buffer());
        assert_eq!(again.total_distance(), state.total_distance());
    }

    #[test]
    fn test_finish_and_reset() {
        let mut state = JourneyState::new();
        assert!(state.finish(sample(5, 45.0, 25.0)).is_none());

        state.begin(RouteId(3), card("A1"), sample(0, 45.0, 25.0));
        state.push_sample(sample(1, 45.0001, 25.0), 1.0);
        let record = state.finish(sample(2, 45.0001, 25.0)).unwrap();

        assert_eq!(record.route_id, RouteId(3));
        assert_eq!(record.user_id.as_str(), "A1");
        assert_eq!(record.lat_start, 45.0);
        assert_eq!(record.lat_stop, 45.0001);
        assert_eq!(record.distance, state.total_distance());

        state.reset();
        assert!(!state.is_active());
        assert_eq!(state.total_distance(), 0.0);
        assert!(state.buffer().is_empty());
    }

    #[test]
    fn test_route_record_json() {
        let record = RouteRecord {
            route_id: RouteId(12),
            user_id: card("142189814135"),
            timestamp_start: Utc.with_ymd_and_hms(2021, 3, 4, 12, 0, 0).unwrap(),
            lat_start: 45.0,
            lon_start: 25.0,
            timestamp_stop: Utc.with_ymd_and_hms(2021, 3, 4, 12, 30, 0).unwrap(),
            lat_stop: 45.01,
            lon_stop: 25.02,
            distance: 1834.27,
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["route_id"], 12);
        assert_eq!(parsed["user_id"], "142189814135");
        assert_eq!(parsed["timestamp_start"], "2021-03-04T12:00:00Z");
        assert_eq!(parsed["timestamp_stop"], "2021-03-04T12:30:00Z");
        assert_eq!(parsed["distance"], 1834.27);

        let back: RouteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_path_log_row() {
        let entry = PathLogEntry::new(sample(7, 45.123456, 25.654321), 12.5);
        assert_eq!(entry.to_csv_row(), "2021-03-04T12:00:07Z,45.123456,25.654321,12.5");
        assert_eq!(PathLogEntry::parse_csv_row(&entry.to_csv_row()).unwrap(), entry);

        assert!(PathLogEntry::parse_csv_row("2021-03-04T12:00:07Z,45.1,25.6").is_err());
        assert!(PathLogEntry::parse_csv_row("2021-03-04T12:00:07Z,45.1,25.6,").is_err());
        assert!(PathLogEntry::parse_csv_row("yesterday,45.1,25.6,0").is_err());
    }
}
