//! Crash recovery: a path log without a ledger entry resumes its route

use chrono::{TimeZone, Utc};
use route_tracker::domain::{CardId, PositionSample, RouteId};
use route_tracker::error::JourneyError;
use route_tracker::infra::{Config, Metrics};
use route_tracker::io::{ChannelCardReader, Ledger};
use route_tracker::services::controller::Phase;
use route_tracker::services::{
    signal_channel, CardSignal, ChannelObserver, JourneyContext, JourneyController, JourneyNotice,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

const INTERRUPTED_LOG: &str = "Timestamp,Latitude,Longitude,Total_Distance\n\
    2021-03-04T12:00:00Z,45,25,0\n\
    2021-03-04T12:00:05Z,45.0001,25,11.12\n\
    2021-03-04T12:00:06Z,45.0001,25.0000001,11.12\n";

fn config(dir: &Path) -> Config {
    Config::default().with_log_dir(dir).with_allow_list(&["780870559455"]).with_debounce_ms(0)
}

fn controller(config: &Config) -> (JourneyController, Arc<JourneyContext>) {
    let ctx = Arc::new(JourneyContext::new(config.position_queue_capacity()));
    let (_signal_tx, signal_rx) = signal_channel();
    let (observer, _notices) = ChannelObserver::new();
    let controller = JourneyController::new(config, ctx.clone(), signal_rx, Arc::new(observer), Arc::new(Metrics::new()));
    (controller, ctx)
}

fn write_interrupted_log(dir: &Path, name: &str) -> std::path::PathBuf {
    let routes = dir.join("routes");
    fs::create_dir_all(&routes).unwrap();
    let path = routes.join(name);
    fs::write(&path, INTERRUPTED_LOG).unwrap();
    path
}

fn fix(secs: u32, lat: f64, lon: f64) -> PositionSample {
    PositionSample::new(Utc.with_ymd_and_hms(2021, 3, 4, 12, 0, secs).unwrap(), lat, lon)
}

#[test]
fn test_recovery_is_idempotent_across_restarts() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let path = write_interrupted_log(dir.path(), "route_1_780870559455.csv");

    let mut resumed = Vec::new();
    for _ in 0..2 {
        let (mut controller, ctx) = controller(&config);
        let phase = controller.init().unwrap();
        assert_eq!(phase, Phase::Recovering { route_id: RouteId(1), path: path.clone() });

        let recovered = controller.recover(&path).unwrap();
        assert!(ctx.is_recovering());
        assert_eq!(controller.state().total_distance(), 11.12);
        assert_eq!(controller.state().buffer(), &[fix(6, 45.0001, 25.0000001)]);
        resumed.push(recovered);
    }

    assert_eq!(resumed[0], resumed[1]);
    assert_eq!(resumed[0].user_id, CardId::parse("780870559455").unwrap());
    assert_eq!(resumed[0].start, fix(0, 45.0, 25.0));
    assert_eq!(resumed[0].rows, 3);
}

#[test]
fn test_next_route_follows_ledger_not_orphan() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    // Route 1 completed, route 2 interrupted
    let (mut first, _) = controller(&config);
    first.begin(RouteId(1), CardId::parse("780870559455").unwrap(), fix(0, 45.0, 25.0)).unwrap();
    first.complete(fix(1, 45.0, 25.0)).unwrap();
    let orphan = write_interrupted_log(dir.path(), "route_2_780870559455.csv");

    let (second, _) = controller(&config);
    assert_eq!(second.init().unwrap(), Phase::Recovering { route_id: RouteId(2), path: orphan });
}

#[test]
fn test_duplicate_path_logs_are_fatal() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    write_interrupted_log(dir.path(), "route_1_780870559455.csv");
    write_interrupted_log(dir.path(), "route_1_142189814135.csv");

    let (controller, _) = controller(&config);
    assert!(matches!(controller.init(), Err(JourneyError::DuplicatePathLog { .. })));
}

#[tokio::test]
async fn test_first_read_after_restart_stops_recovered_route() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    write_interrupted_log(dir.path(), "route_1_780870559455.csv");

    let ctx = Arc::new(JourneyContext::new(config.position_queue_capacity()));
    let metrics = Arc::new(Metrics::new());
    let (observer, mut notices) = ChannelObserver::new();
    let observer = Arc::new(observer);
    let (signal_tx, signal_rx) = signal_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (cards, reader) = ChannelCardReader::new();
    let card_signal = CardSignal::new(&config, ctx.clone(), signal_tx, observer.clone(), metrics.clone());
    let card_task = tokio::spawn(card_signal.run(Box::new(reader), shutdown_rx.clone()));
    let controller = JourneyController::new(&config, ctx.clone(), signal_rx, observer, metrics.clone());
    let controller_task = tokio::spawn(controller.run(shutdown_rx));

    let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await.unwrap().unwrap();
    assert_eq!(
        notice,
        JourneyNotice::UnexpectedShutdown {
            route_id: RouteId(1),
            user_id: CardId::parse("780870559455").unwrap()
        }
    );

    // One more fix while resumed
    ctx.positions().push(fix(20, 45.0003, 25.0000001));
    loop {
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await.unwrap().unwrap();
        if matches!(notice, JourneyNotice::Enroute { .. }) {
            assert_eq!(notice, JourneyNotice::Enroute { distance_m: 33.36 });
            break;
        }
    }

    // A single read ends the resumed route; no new route is started
    cards.send("780870559455".to_string()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while metrics.card_reads() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!ctx.is_recovering());
    ctx.positions().push(fix(30, 45.0003, 25.0000001));

    loop {
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv()).await.unwrap().unwrap();
        match notice {
            JourneyNotice::StopRoute { route_id, distance_m } => {
                assert_eq!(route_id, RouteId(1));
                assert_eq!(distance_m, 33.36);
                break;
            }
            JourneyNotice::StartRoute { .. } => panic!("recovered read must not start a route"),
            _ => {}
        }
    }

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller_task).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(5), card_task).await.unwrap().unwrap();

    let ledger = Ledger::new(dir.path().join("routes.log"));
    let records = ledger.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp_start, fix(0, 45.0, 25.0).timestamp);
    assert_eq!(records[0].timestamp_stop, fix(30, 45.0003, 25.0000001).timestamp);
    assert_eq!(ledger.next_route_id().unwrap(), RouteId(2));
}
