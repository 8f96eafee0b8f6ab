//! Services - the three journey tasks and what they share
//!
//! - `context` - position queue, recovering flag, card signal channels
//! - `card_signal` - card reads to Start/Stop signals
//! - `controller` - journey state machine, sole writer of persisted state
//! - `notifier` - notices for the display side

pub mod card_signal;
pub mod context;
pub mod controller;
pub mod notifier;

pub use card_signal::CardSignal;
pub use context::{signal_channel, JourneyContext, SignalReceiver, SignalSender};
pub use controller::JourneyController;
pub use notifier::{ChannelObserver, JourneyNotice, JourneyObserver, LogObserver};
