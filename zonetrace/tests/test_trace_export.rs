use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use zonetrace::capture::{Capture, CollectorConnection};
use zonetrace::export::ChromeTraceExporter;
use zonetrace::{Config, Profiler, SourceLocation};

static LOAD: SourceLocation =
    SourceLocation { name: Some("load"), function: "test_trace_export", file: file!(), line: line!(), color: 0 };
static PARSE: SourceLocation =
    SourceLocation { name: None, function: "test_trace_export::parse", file: file!(), line: line!(), color: 0 };

fn record_session() -> (Capture, u64) {
    let profiler = Profiler::start(Config::local_ephemeral()).expect("Failed to start profiler");
    let mut conn =
        CollectorConnection::connect(profiler.local_addr().unwrap(), Duration::from_secs(5)).expect("Failed to connect");
    let pid = conn.welcome().pid;

    profiler.set_thread_name("loader");
    {
        let outer = profiler.zone(&LOAD);
        outer.text("assets.pak");
        {
            let _inner = profiler.zone(&PARSE);
        }
        profiler.message("loaded 12 assets");
    }
    profiler.frame_mark();

    let collector = std::thread::spawn(move || {
        let mut capture = Capture::new();
        capture.run(&mut conn, &AtomicBool::new(false)).expect("capture failed");
        capture
    });
    profiler.shutdown();
    (collector.join().unwrap(), pid)
}

#[test]
fn test_export_creates_valid_json() {
    let (capture, pid) = record_session();
    let exporter = ChromeTraceExporter::new(&capture, pid);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.json");
    let file = File::create(&path).expect("Failed to create trace file");
    exporter.export(BufWriter::new(file)).expect("Failed to export trace");

    // Verify the output is valid JSON
    let json_str = std::fs::read_to_string(&path).expect("Invalid UTF-8");
    let parsed: serde_json::Value = serde_json::from_str(&json_str).expect("Invalid JSON");

    // Verify it has the expected structure
    assert!(parsed.get("traceEvents").is_some());
    assert_eq!(parsed["displayTimeUnit"], "ms");

    let events = parsed["traceEvents"].as_array().unwrap();
    assert_eq!(events.len(), exporter.event_count());
    assert!(events.iter().all(|e| e["pid"] == pid));

    let zones: Vec<_> = events.iter().filter(|e| e["ph"] == "X").collect();
    assert_eq!(zones.len(), 2);
    let load = zones.iter().find(|e| e["name"] == "load").expect("named zone");
    assert_eq!(load["args"]["text"], "assets.pak");
    // unnamed sites are shown by function
    assert!(zones.iter().any(|e| e["name"] == "test_trace_export::parse"));

    let inner = zones.iter().find(|e| e["name"] != "load").unwrap();
    assert!(inner["ts"].as_f64().unwrap() >= load["ts"].as_f64().unwrap());
    assert!(inner["dur"].as_f64().unwrap() <= load["dur"].as_f64().unwrap());

    assert!(events.iter().any(|e| e["ph"] == "i" && e["name"] == "loaded 12 assets"));
    assert!(events.iter().any(|e| e["cat"] == "frame"));
    assert!(events.iter().any(|e| e["ph"] == "M" && e["args"]["name"] == "loader"));
}

#[test]
fn test_empty_capture_exports_no_events() {
    let exporter = ChromeTraceExporter::new(&Capture::new(), 1);
    assert_eq!(exporter.event_count(), 0);

    let mut buffer = Vec::new();
    exporter.export(&mut buffer).expect("Failed to export trace");
    let parsed: serde_json::Value = serde_json::from_slice(&buffer).expect("Invalid JSON");
    assert_eq!(parsed["traceEvents"].as_array().map(Vec::len), Some(0));
}
