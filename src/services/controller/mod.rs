//! Journey controller - the single consumer of fixes and card signals
//!
//! ```text
//! INIT ──orphaned path log──> RECOVERING ──┐
//!   │                                      v
//!   └──────> WAITING_FOR_START ──Start──> ACTIVE ──Stop──> INIT
//! ```
//!
//! The controller owns the journey state and is the only writer of the
//! ledger and the path logs. Every path-log row and ledger line is fsynced
//! before the next step, and any persistence failure ends the run with an
//! error instead of guessing.


use crate::domain::journey::{JourneyState, PathLogEntry, RecoveredRoute, RouteRecord};
use crate::domain::types::{CardId, PositionSample, RouteId};
use crate::error::{JourneyError, Result};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::ledger::Ledger;
use crate::io::path_log::PathLogStore;
use crate::services::context::{shutdown_requested, JourneyContext, SignalReceiver};
use crate::services::notifier::{JourneyNotice, JourneyObserver};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where INIT leads
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// A path log for the next route exists with no ledger entry
    Recovering { route_id: RouteId, path: PathBuf },
    WaitingForStart { route_id: RouteId },
}

pub struct JourneyController {
    pub(crate) ledger: Ledger,
    pub(crate) path_logs: PathLogStore,
    pub(crate) threshold_m: f64,
    pub(crate) state: JourneyState,
    pub(crate) ctx: Arc<JourneyContext>,
    pub(crate) signals: SignalReceiver,
    pub(crate) observer: Arc<dyn JourneyObserver>,
    pub(crate) metrics: Arc<Metrics>,
}

impl JourneyController {
    pub fn new(
        config: &Config,
        ctx: Arc<JourneyContext>,
        signals: SignalReceiver,
        observer: Arc<dyn JourneyObserver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger: Ledger::new(config.ledger_path()),
            path_logs: PathLogStore::new(config.routes_dir()),
            threshold_m: config.movement_threshold_m(),
            state: JourneyState::new(),
            ctx,
            signals,
            observer,
            metrics,
        }
    }

    pub fn state(&self) -> &JourneyState {
        &self.state
    }

    /// Decide the next route id and whether a previous run died mid-route
    pub fn init(&self) -> Result<Phase> {
        let route_id = self.ledger.next_route_id()?;
        match self.path_logs.find(route_id)? {
            Some(path) if !self.ledger.contains(route_id)? => Ok(Phase::Recovering { route_id, path }),
            Some(path) => {
                // The final line is not the highest id; reusing it would repeat a route id
                warn!(route_id = %route_id, file = %path.display(), "path_log_already_recorded");
                Err(JourneyError::CorruptLedger {
                    path: self.ledger.path().to_path_buf(),
                    reason: format!("route {route_id} is already recorded but is not the last entry"),
                })
            }
            None => Ok(Phase::WaitingForStart { route_id }),
        }
    }

    /// Resume an interrupted route from its path log.
    ///
    /// The next card read stops this route rather than starting another.
    pub fn recover(&mut self, path: &std::path::Path) -> Result<RecoveredRoute> {
        let recovered = self.path_logs.load_recovery(path)?;
        self.state.resume(&recovered);
        self.ctx.set_recovering();
        self.metrics.record_route_recovered();

        warn!(
            route_id = %recovered.route_id,
            user_id = %recovered.user_id,
            rows = %recovered.rows,
            distance_m = %recovered.total_distance,
            last_fix = %recovered.last.timestamp_str(),
            "route_recovered"
        );
        self.observer.notify(JourneyNotice::UnexpectedShutdown {
            route_id: recovered.route_id,
            user_id: recovered.user_id.clone(),
        });
        Ok(recovered)
    }

    /// Open a new route at `start` and log the start fix as its first row
    pub fn begin(&mut self, route_id: RouteId, user_id: CardId, start: PositionSample) -> Result<()> {
        self.state.begin(route_id, user_id.clone(), start);
        self.append_row(route_id, &user_id, PathLogEntry::new(start, 0.0))?;
        self.metrics.record_route_started();

        info!(
            route_id = %route_id,
            user_id = %user_id,
            timestamp = %start.timestamp_str(),
            lat = %start.latitude,
            lon = %start.longitude,
            "route_started"
        );
        self.observer.notify(JourneyNotice::StartRoute { route_id, user_id });
        Ok(())
    }

    /// Feed one fix into the active route: filter, accumulate, then persist
    /// the row with the updated total.
    pub fn record_sample(&mut self, sample: PositionSample) -> Result<()> {
        let (route_id, user_id) = self.active_route()?;

        let segment = self.state.push_sample(sample, self.threshold_m);
        let total = self.state.total_distance();
        self.append_row(route_id, &user_id, PathLogEntry::new(sample, total))?;

        debug!(
            route_id = %route_id,
            timestamp = %sample.timestamp_str(),
            segment_m = ?segment,
            distance_m = %total,
            "route_sample"
        );
        self.observer.notify(JourneyNotice::Enroute { distance_m: total });
        Ok(())
    }

    /// Close the active route at `stop` and make it durable in the ledger.
    /// The in-memory journey is dropped only after the ledger write succeeds.
    pub fn complete(&mut self, stop: PositionSample) -> Result<RouteRecord> {
        let record = self.state.finish(stop).ok_or(JourneyError::NoActiveRoute)?;
        self.ledger.append(&record)?;
        self.metrics.record_route_completed();

        info!(
            route_id = %record.route_id,
            user_id = %record.user_id,
            timestamp_stop = %stop.timestamp_str(),
            distance_m = %record.distance,
            "route_completed"
        );
        self.observer.notify(JourneyNotice::StopRoute { route_id: record.route_id, distance_m: record.distance });
        self.state.reset();
        Ok(record)
    }

    fn active_route(&self) -> Result<(RouteId, CardId)> {
        match (self.state.route_id(), self.state.user_id()) {
            (Some(route_id), Some(user_id)) => Ok((route_id, user_id.clone())),
            _ => Err(JourneyError::NoActiveRoute),
        }
    }

    fn append_row(&self, route_id: RouteId, user_id: &CardId, entry: PathLogEntry) -> Result<()> {
        self.path_logs.append(route_id, user_id, &entry)?;
        self.metrics.record_path_row();
        Ok(())
    }

    /// Next fix, or `None` on shutdown
    async fn next_sample(ctx: &JourneyContext, shutdown: &mut watch::Receiver<bool>) -> Option<PositionSample> {
        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => None,
            sample = ctx.positions().pop() => Some(sample),
        }
    }

    /// WAITING_FOR_START: block for Start and its user id, then take the next
    /// fix as the start position. `false` on shutdown.
    async fn wait_for_start(&mut self, route_id: RouteId, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        info!(route_id = %route_id, "waiting_for_start");
        self.observer.notify(JourneyNotice::NotEnroute);

        let user_id = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => return Ok(false),
            user_id = self.signals.wait_start() => user_id.ok_or(JourneyError::SignalChannelClosed)?,
        };

        let Some(start) = Self::next_sample(&self.ctx, shutdown).await else {
            return Ok(false);
        };
        self.begin(route_id, user_id, start)?;
        Ok(true)
    }

    /// ACTIVE: record fixes until Stop, then close the route with one more fix.
    /// `false` on shutdown; the route stays open on disk and is recovered on
    /// the next start.
    async fn run_active(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(false),
                stop = self.signals.wait_stop() => {
                    stop.ok_or(JourneyError::SignalChannelClosed)?;
                    break;
                }
                sample = self.ctx.positions().pop() => self.record_sample(sample)?,
            }
        }

        let Some(stop) = Self::next_sample(&self.ctx, shutdown).await else {
            return Ok(false);
        };
        self.complete(stop)?;
        Ok(true)
    }

    /// Run journeys until shutdown. Returns an error only when persisted
    /// state can no longer be trusted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            ledger = %self.ledger.path().display(),
            routes_dir = %self.path_logs.dir().display(),
            threshold_m = %self.threshold_m,
            "journey_controller_started"
        );

        let result = self.run_inner(&mut shutdown).await;
        match &result {
            Ok(()) => {
                if let Some(route_id) = self.state.route_id() {
                    info!(route_id = %route_id, distance_m = %self.state.total_distance(), "route_left_open");
                }
                info!("journey_controller_shutdown");
            }
            Err(e) => error!(error = %e, "journey_controller_failed"),
        }
        result
    }

    async fn run_inner(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let proceed = match self.init()? {
                Phase::Recovering { path, .. } => {
                    self.recover(&path)?;
                    true
                }
                Phase::WaitingForStart { route_id } => self.wait_for_start(route_id, shutdown).await?,
            };
            if !proceed || !self.run_active(shutdown).await? {
                return Ok(());
            }
        }
    }
}
