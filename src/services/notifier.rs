//! Notifications for the display/buzzer side of the device
//!
//! The tracker core only emits notices; rendering them (LCD text, beeps,
//! translations) lives outside. Delivery is fire-and-forget: an observer must
//! never block the task that notifies it.

use crate::domain::types::{CardId, RouteId};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

/// Something the user-facing side may want to show
#[derive(Debug, Clone, PartialEq)]
pub enum JourneyNotice {
    /// System clock was set from a GPS fix (emitted by the time-sync side)
    GpsTimeSet(DateTime<Utc>),
    WeakGps,
    NotFoundGps,
    /// Idle, waiting for a card to start a route
    NotEnroute,
    StartRoute { route_id: RouteId, user_id: CardId },
    Enroute { distance_m: f64 },
    StopRoute { route_id: RouteId, distance_m: f64 },
    InvalidCard(CardId),
    WrongCard(CardId),
    /// A route interrupted by power loss is being resumed
    UnexpectedShutdown { route_id: RouteId, user_id: CardId },
}

impl JourneyNotice {
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyNotice::GpsTimeSet(_) => "gps_time_set",
            JourneyNotice::WeakGps => "weak_gps",
            JourneyNotice::NotFoundGps => "not_found_gps",
            JourneyNotice::NotEnroute => "not_enroute",
            JourneyNotice::StartRoute { .. } => "start_route",
            JourneyNotice::Enroute { .. } => "enroute",
            JourneyNotice::StopRoute { .. } => "stop_route",
            JourneyNotice::InvalidCard(_) => "invalid_card",
            JourneyNotice::WrongCard(_) => "wrong_card",
            JourneyNotice::UnexpectedShutdown { .. } => "unexpected_shutdown",
        }
    }
}

/// Receiver of journey notices
pub trait JourneyObserver: Send + Sync {
    fn notify(&self, notice: JourneyNotice);
}

/// Writes every notice to the trace log; used when no display is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl JourneyObserver for LogObserver {
    fn notify(&self, notice: JourneyNotice) {
        debug!(notice = %notice.as_str(), detail = ?notice, "ui_notice");
    }
}

/// Forwards notices over an unbounded channel to whatever drives the display
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JourneyNotice>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JourneyNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JourneyObserver for ChannelObserver {
    fn notify(&self, notice: JourneyNotice) {
        // Nobody listening is fine
        let _ = self.tx.send(notice);
    }
}
