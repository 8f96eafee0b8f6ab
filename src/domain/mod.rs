//! Domain models - core journey types
//!
//! This module contains the canonical data types used throughout the system:
//! - `PositionSample` - one GPS fix
//! - `CardId` / `RouteId` - identifiers for card holders and routes
//! - `JourneyState` - the single active journey and its distance filter
//! - `RouteRecord` / `PathLogEntry` - persisted ledger and path-log rows

pub mod journey;
pub mod types;

// Re-export commonly used types at module level
pub use journey::{JourneyState, PathLogEntry, RecoveredRoute, RouteRecord};
pub use types::{CardId, CardOutcome, PositionSample, RouteId};
