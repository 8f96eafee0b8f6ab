//! Shared types for the route tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp format used in path logs and the ledger (whole-second UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Newtype wrapper for route IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RouteId(pub u64);

impl RouteId {
    pub const FIRST: RouteId = RouteId(1);

    pub fn next(self) -> RouteId {
        RouteId(self.0 + 1)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier read from an RFID card.
///
/// Always non-empty ASCII alphanumeric, so it can be embedded in a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// Validate raw reader output, trimming surrounding whitespace
    pub fn parse(raw: &str) -> Option<CardId> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(CardId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One GPS fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionSample {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self { timestamp, latitude, longitude }
    }

    pub fn timestamp_str(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// Result of processing one card read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardOutcome {
    Start(CardId),
    InvalidCard(CardId),
    WrongCard(CardId),
    Stop,
}

impl CardOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardOutcome::Start(_) => "start",
            CardOutcome::InvalidCard(_) => "invalid_card",
            CardOutcome::WrongCard(_) => "wrong_card",
            CardOutcome::Stop => "stop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_card_id_parse() {
        assert_eq!(CardId::parse(" 780870559455\r\n").unwrap().as_str(), "780870559455");
        assert_eq!(CardId::parse("04A1B2C3").unwrap().as_str(), "04A1B2C3");
        assert!(CardId::parse("").is_none());
        assert!(CardId::parse("   ").is_none());
        assert!(CardId::parse("12_34").is_none());
        assert!(CardId::parse("../etc").is_none());
    }

    #[test]
    fn test_route_id_next() {
        assert_eq!(RouteId::FIRST.next(), RouteId(2));
        assert_eq!(RouteId(41).to_string(), "41");
    }

    #[test]
    fn test_timestamp_str() {
        let ts = Utc.with_ymd_and_hms(2021, 3, 4, 12, 34, 56).unwrap();
        let sample = PositionSample::new(ts, 45.0, 25.0);
        assert_eq!(sample.timestamp_str(), "2021-03-04T12:34:56Z");
    }

    #[test]
    fn test_card_outcome_as_str() {
        let id = CardId::parse("A1").unwrap();
        assert_eq!(CardOutcome::Start(id.clone()).as_str(), "start");
        assert_eq!(CardOutcome::InvalidCard(id.clone()).as_str(), "invalid_card");
        assert_eq!(CardOutcome::WrongCard(id).as_str(), "wrong_card");
        assert_eq!(CardOutcome::Stop.as_str(), "stop");
    }
}
