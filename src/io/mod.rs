//! IO modules - hardware and files
//!
//! - `gps` - GPS receiver feed and RMC sentence parser
//! - `card_reader` - card reader backends
//! - `ledger` - append-only JSONL ledger of completed routes
//! - `path_log` - per-route CSV logs and crash recovery reads

pub mod card_reader;
pub mod gps;
pub mod ledger;
pub mod path_log;

pub use card_reader::{CardReader, ChannelCardReader, SerialCardReader, StdinCardReader};
pub use gps::GpsFeed;
pub use ledger::Ledger;
pub use path_log::PathLogStore;
