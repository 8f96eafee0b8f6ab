//! Card signal - turns raw card reads into Start/Stop signals
//!
//! Keeps a two-slot window of the most recent ids. The first read of a
//! journey raises Start, a second read of the same card raises Stop. Reads
//! of unknown cards, or of a different card while a journey is open, are
//! reported and dropped from the window without touching the journey.
//!
//! While the controller resumes an interrupted route, the first read ends
//! that route instead of starting a new one.

use crate::domain::types::{CardId, CardOutcome};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::card_reader::CardReader;
use crate::services::context::{shutdown_requested, JourneyContext, SignalSender};
use crate::services::notifier::{JourneyNotice, JourneyObserver};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delay after a reader failure before trying again
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Window capacity: a journey is opened and closed by two reads
const WINDOW_SIZE: usize = 2;

pub type Outcomes = SmallVec<[CardOutcome; 3]>;

pub struct CardSignal {
    window: SmallVec<[CardId; WINDOW_SIZE]>,
    allow_list: Vec<CardId>,
    debounce: Duration,
    last_accepted: Option<Instant>,
    ctx: Arc<JourneyContext>,
    sender: SignalSender,
    observer: Arc<dyn JourneyObserver>,
    metrics: Arc<Metrics>,
}

impl CardSignal {
    pub fn new(
        config: &Config,
        ctx: Arc<JourneyContext>,
        sender: SignalSender,
        observer: Arc<dyn JourneyObserver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            window: SmallVec::new(),
            allow_list: config.allow_list().to_vec(),
            debounce: Duration::from_millis(config.debounce_ms()),
            last_accepted: None,
            ctx,
            sender,
            observer,
            metrics,
        }
    }

    /// Ids currently held, oldest first
    pub fn window(&self) -> &[CardId] {
        &self.window
    }

    fn is_allowed(&self, id: &CardId) -> bool {
        self.allow_list.contains(id)
    }

    /// Apply one read to the window and return what it means, in order.
    pub fn process_read(&mut self, id: CardId) -> Outcomes {
        let mut outcomes = Outcomes::new();

        if self.window.len() == WINDOW_SIZE {
            self.window.remove(0);
        }
        self.window.push(id.clone());

        if self.window.len() == 1 && !self.ctx.is_recovering() {
            outcomes.push(CardOutcome::Start(id));
        }

        if !self.window.iter().all(|w| self.is_allowed(w)) {
            if let Some(evicted) = self.window.pop() {
                outcomes.push(CardOutcome::InvalidCard(evicted));
            }
        }

        if self.window.len() == WINDOW_SIZE && self.window[0] != self.window[1] {
            if let Some(evicted) = self.window.pop() {
                outcomes.push(CardOutcome::WrongCard(evicted));
            }
        }

        // Cleared whenever Stop goes out, even if the window alone raised it
        let recovering = self.ctx.take_recovering();
        if self.window.len() == WINDOW_SIZE || recovering {
            self.window.clear();
            outcomes.push(CardOutcome::Stop);
        }

        outcomes
    }

    /// Forward outcomes to the controller and the observer
    fn dispatch(&self, outcomes: &[CardOutcome]) {
        for outcome in outcomes {
            match outcome {
                CardOutcome::Start(id) => {
                    info!(card_id = %id, "card_start");
                    if !self.sender.start(id.clone()) {
                        warn!(card_id = %id, "card_start_undelivered");
                    }
                }
                CardOutcome::InvalidCard(id) => {
                    warn!(card_id = %id, "card_invalid");
                    self.metrics.record_invalid_card();
                    self.observer.notify(JourneyNotice::InvalidCard(id.clone()));
                }
                CardOutcome::WrongCard(id) => {
                    warn!(card_id = %id, "card_wrong");
                    self.metrics.record_wrong_card();
                    self.observer.notify(JourneyNotice::WrongCard(id.clone()));
                }
                CardOutcome::Stop => {
                    info!("card_stop");
                    if !self.sender.stop() {
                        warn!("card_stop_undelivered");
                    }
                }
            }
        }
    }

    /// Whether a read at `now` falls inside the debounce interval
    fn debounced(&self, now: Instant) -> bool {
        self.last_accepted.is_some_and(|last| now.duration_since(last) < self.debounce)
    }

    /// Process one read end to end, honoring the debounce interval.
    /// Returns `None` if the read was debounced.
    pub fn handle_read(&mut self, id: CardId) -> Option<Outcomes> {
        let now = Instant::now();
        if self.debounced(now) {
            debug!(card_id = %id, "card_read_debounced");
            return None;
        }
        self.last_accepted = Some(now);
        self.metrics.record_card_read();
        info!(card_id = %id, "card_read");

        let outcomes = self.process_read(id);
        self.dispatch(&outcomes);
        Some(outcomes)
    }

    /// Run the card signal task until shutdown
    pub async fn run(mut self, mut reader: Box<dyn CardReader>, mut shutdown: watch::Receiver<bool>) {
        info!(
            reader = %reader.name(),
            allow_list = %self.allow_list.len(),
            debounce_ms = %self.debounce.as_millis(),
            "card_signal_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                read = reader.read_id() => read,
            };

            match read {
                Ok(Some(id)) => {
                    self.handle_read(id);
                }
                Ok(None) => {
                    // Keep the signal channel open so the controller stays up
                    info!(reader = %reader.name(), "card_reader_closed");
                    shutdown_requested(&mut shutdown).await;
                    break;
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "card_read_failed");
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("card_signal_shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::card_reader::ChannelCardReader;
    use crate::services::context::{signal_channel, SignalReceiver};
    use crate::services::notifier::ChannelObserver;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct TestSignal {
        signal: CardSignal,
        ctx: Arc<JourneyContext>,
        signals: SignalReceiver,
        notices: UnboundedReceiver<JourneyNotice>,
    }

    fn card(raw: &str) -> CardId {
        CardId::parse(raw).unwrap()
    }

    fn test_signal(debounce_ms: u64) -> TestSignal {
        let config = Config::default().with_allow_list(&["A", "B"]).with_debounce_ms(debounce_ms);
        let ctx = Arc::new(JourneyContext::new(2));
        let (sender, signals) = signal_channel();
        let (observer, notices) = ChannelObserver::new();
        let signal = CardSignal::new(&config, ctx.clone(), sender, Arc::new(observer), Arc::new(Metrics::new()));
        TestSignal { signal, ctx, signals, notices }
    }

    #[test]
    fn test_single_read_starts() {
        let mut t = test_signal(0);
        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Start(card("A"))]);
        assert_eq!(t.signal.window(), &[card("A")]);
    }

    #[test]
    fn test_same_card_twice_stops() {
        let mut t = test_signal(0);
        t.signal.process_read(card("A"));
        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Stop]);
        assert!(t.signal.window().is_empty());
    }

    #[test]
    fn test_invalid_card_keeps_journey() {
        let mut t = test_signal(0);
        t.signal.process_read(card("A"));
        let out = t.signal.process_read(card("X"));
        assert_eq!(out.as_slice(), &[CardOutcome::InvalidCard(card("X"))]);
        assert_eq!(t.signal.window(), &[card("A")]);
    }

    #[test]
    fn test_wrong_card_keeps_journey() {
        let mut t = test_signal(0);
        t.signal.process_read(card("A"));
        let out = t.signal.process_read(card("B"));
        assert_eq!(out.as_slice(), &[CardOutcome::WrongCard(card("B"))]);
        assert_eq!(t.signal.window(), &[card("A")]);

        // The right card still ends it
        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Stop]);
    }

    #[test]
    fn test_invalid_first_read_is_not_retracted() {
        let mut t = test_signal(0);
        let out = t.signal.process_read(card("X"));
        assert_eq!(out.as_slice(), &[CardOutcome::Start(card("X")), CardOutcome::InvalidCard(card("X"))]);
        assert!(t.signal.window().is_empty());
    }

    #[test]
    fn test_recovering_read_stops() {
        let mut t = test_signal(0);
        t.ctx.set_recovering();

        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Stop]);
        assert!(t.signal.window().is_empty());
        assert!(!t.ctx.is_recovering());

        // Back to normal afterwards
        let out = t.signal.process_read(card("B"));
        assert_eq!(out.as_slice(), &[CardOutcome::Start(card("B"))]);
    }

    #[test]
    fn test_stop_from_full_window_clears_recovering() {
        let mut t = test_signal(0);
        t.signal.process_read(card("A"));
        // Controller resumes a route while a journey window is open
        t.ctx.set_recovering();

        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Stop]);
        assert!(!t.ctx.is_recovering());

        let out = t.signal.process_read(card("A"));
        assert_eq!(out.as_slice(), &[CardOutcome::Start(card("A"))]);
    }

    #[tokio::test]
    async fn test_dispatch_sends_signals_and_notices() {
        let mut t = test_signal(0);
        t.signal.handle_read(card("A"));
        t.signal.handle_read(card("B"));
        t.signal.handle_read(card("A"));

        assert_eq!(t.signals.wait_start().await, Some(card("A")));
        assert_eq!(t.signals.wait_stop().await, Some(()));
        assert_eq!(t.notices.try_recv().unwrap(), JourneyNotice::WrongCard(card("B")));
        assert!(t.notices.try_recv().is_err());
        assert_eq!(t.signal.metrics.wrong_cards(), 1);
    }

    #[test]
    fn test_debounce_drops_quick_reads() {
        let mut t = test_signal(60_000);
        assert!(t.signal.handle_read(card("A")).is_some());
        assert!(t.signal.handle_read(card("A")).is_none());
        assert_eq!(t.signal.window(), &[card("A")]);
    }

    #[tokio::test]
    async fn test_run_survives_bad_reads() {
        let t = test_signal(0);
        let TestSignal { signal, mut signals, .. } = t;
        let (tx, reader) = ChannelCardReader::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(signal.run(Box::new(reader), shutdown_rx));

        tx.send("A".to_string()).unwrap();
        tx.send("not a card".to_string()).unwrap();
        tx.send("A".to_string()).unwrap();

        let started = tokio::time::timeout(Duration::from_secs(5), signals.wait_start()).await.unwrap();
        assert_eq!(started, Some(card("A")));
        let stopped = tokio::time::timeout(Duration::from_secs(5), signals.wait_stop()).await.unwrap();
        assert_eq!(stopped, Some(()));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
