//! End-to-end sessions over real TCP: profiler on one side, capture on the other

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use zonetrace::capture::{Capture, CaptureEnd, CollectorConnection};
use zonetrace::domain::Epoch;
use zonetrace::dispatcher::WorkerState;
use zonetrace::wire::Record;
use zonetrace::{Config, Profiler, SourceLocation};

static WORK: SourceLocation =
    SourceLocation { name: Some("work"), function: "test_session::work", file: file!(), line: line!(), color: 0 };

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(config: Config) -> Arc<Profiler> {
    let profiler = Profiler::start(config).expect("Failed to start profiler");
    assert!(profiler.local_addr().is_some());
    profiler
}

fn addr(profiler: &Profiler) -> SocketAddr {
    profiler.local_addr().unwrap()
}

fn wait_for_epoch(profiler: &Profiler, epoch: Epoch) {
    let deadline = Instant::now() + TIMEOUT;
    while profiler.epoch() != epoch {
        assert!(Instant::now() < deadline, "epoch stuck at {}", profiler.epoch());
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Run a capture on its own thread, shut the profiler down, return what arrived
fn capture_until_shutdown(profiler: &Profiler, mut conn: CollectorConnection) -> (Capture, CaptureEnd) {
    let collector = std::thread::spawn(move || {
        let mut capture = Capture::new();
        let stop = AtomicBool::new(false);
        let end = capture.run(&mut conn, &stop).expect("capture failed");
        (capture, end)
    });
    profiler.shutdown();
    collector.join().unwrap()
}

#[test]
fn test_two_threads_thousand_zones_each() {
    const ZONES: usize = 1000;

    let profiler = start(Config::local_ephemeral());
    let conn = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();
    assert!(conn.on_demand().is_none());

    let workers: Vec<_> = ["worker-a", "worker-b"]
        .into_iter()
        .map(|name| {
            let profiler = Arc::clone(&profiler);
            std::thread::spawn(move || {
                profiler.set_thread_name(name);
                for _ in 0..ZONES {
                    let _zone = profiler.zone(&WORK);
                }
                zonetrace::domain::ThreadId::current().0
            })
        })
        .collect();
    let tids: Vec<u32> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let (capture, end) = capture_until_shutdown(&profiler, conn);
    assert_eq!(end, CaptureEnd::Terminated);
    assert_eq!(capture.unanswered(), 0);

    let mut per_thread: HashMap<u32, Vec<i64>> = HashMap::new();
    for zone in capture.zones() {
        assert_eq!(zone.name, "work");
        assert!(zone.end >= zone.begin);
        per_thread.entry(zone.thread).or_default().push(zone.begin);
    }
    for (tid, name) in tids.iter().zip(["worker-a", "worker-b"]) {
        let begins = &per_thread[tid];
        assert_eq!(begins.len(), ZONES);
        assert!(begins.windows(2).all(|w| w[0] <= w[1]), "zone times went backwards on {tid}");
        assert_eq!(capture.thread_name(*tid), Some(name));
    }

    let site = capture.site(WORK.handle()).unwrap();
    assert_eq!(site.function, "test_session::work");
    assert_eq!(site.line, WORK.line);
}

#[test]
fn test_serial_times_match_what_was_reported() {
    let profiler = start(Config::local_ephemeral());
    let conn = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();

    // Times chosen by the caller, interleaved from two threads, including a step backwards
    let reported: Vec<(i64, u32)> = (0..500).map(|i| (1_000 + i * 7 - (i % 3) * 9, 100 + u32::from(i % 2 == 0))).collect();
    let halves: Vec<Vec<(i64, u32)>> = vec![reported[..250].to_vec(), reported[250..].to_vec()];
    for half in halves {
        let profiler = Arc::clone(&profiler);
        std::thread::spawn(move || {
            for (time, thread) in half {
                profiler.thread_wakeup(time, thread);
            }
        })
        .join()
        .unwrap();
    }

    let (capture, _) = capture_until_shutdown(&profiler, conn);
    let received: Vec<(i64, u32)> = capture
        .records()
        .iter()
        .filter_map(|r| match r.record {
            Record::ThreadWakeup { time, thread } => Some((time, thread)),
            _ => None,
        })
        .collect();
    assert_eq!(received, reported);
}

#[test]
fn test_reconnect_gets_fresh_welcome_and_clean_stream() {
    let profiler = start(Config::local_ephemeral());

    let first = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();
    wait_for_epoch(&profiler, Epoch(1));
    for _ in 0..100 {
        let _zone = profiler.zone(&WORK);
    }
    // Hang up mid-stream without reading anything
    drop(first);
    wait_for_epoch(&profiler, Epoch(2));
    assert_eq!(profiler.worker_state(), WorkerState::WaitingForHandshake);

    let second = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();
    wait_for_epoch(&profiler, Epoch(3));
    profiler.message("after reconnect");
    {
        let _zone = profiler.zone(&WORK);
    }

    let (capture, end) = capture_until_shutdown(&profiler, second);
    assert_eq!(end, CaptureEnd::Terminated);
    // A stale fragment would have failed decoding inside `run`
    assert!(capture.messages().iter().any(|m| m.text == "after reconnect"));
    assert!(!capture.zones().is_empty());
}

#[test]
fn test_on_demand_replays_app_info_and_drops_stale_zone_ends() {
    let profiler = start(Config { on_demand: true, ..Config::local_ephemeral() });
    profiler.app_info("build 1234");
    profiler.frame_mark();
    profiler.frame_mark();
    assert!(!profiler.zone(&WORK).is_active());

    // First collector: a zone opens while it is attached and outlives it
    let first = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();
    assert_eq!(first.on_demand().map(|p| p.frames), Some(2));
    wait_for_epoch(&profiler, Epoch(1));
    let stale = profiler.zone(&WORK);
    assert!(stale.is_active());
    drop(first);
    wait_for_epoch(&profiler, Epoch(2));
    drop(stale);

    let second = CollectorConnection::connect(addr(&profiler), TIMEOUT).unwrap();
    wait_for_epoch(&profiler, Epoch(3));
    {
        let _zone = profiler.zone(&WORK);
    }

    let (capture, _) = capture_until_shutdown(&profiler, second);
    let records = capture.records();
    assert!(matches!(&records[0].record, Record::MessageAppInfo { text, .. } if text == "build 1234"));
    let ends = records.iter().filter(|r| matches!(r.record, Record::ZoneEnd { .. })).count();
    assert_eq!(ends, 1);
    assert_eq!(capture.zones().len(), 1);
}

#[test]
fn test_late_collector_is_turned_away_after_shutdown() {
    let profiler = start(Config::local_ephemeral());
    let address = addr(&profiler);
    profiler.shutdown();
    assert_eq!(profiler.worker_state(), WorkerState::Terminated);
    assert!(CollectorConnection::connect(address, Duration::from_millis(200)).is_err());
}
