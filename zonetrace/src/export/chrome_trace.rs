use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io::Write;

use crate::capture::Capture;

/// Chrome Trace Event format
/// Format reference: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChromeTraceEvent {
    /// Zone, message or frame set name
    name: String,
    /// Category for filtering/coloring
    cat: String,
    /// Phase: "X" = complete, "i" = instant, "M" = metadata
    ph: String,
    /// Timestamp in microseconds
    ts: f64,
    /// Duration in microseconds, complete events only
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: u64,
    tid: u32,
    /// Instant event scope: "t" thread, "g" global
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

/// Converts a finished [`Capture`] into a trace for chrome://tracing or Perfetto
pub struct ChromeTraceExporter {
    events: Vec<ChromeTraceEvent>,
    pid: u64,
}

#[allow(clippy::cast_precision_loss)] // microsecond display precision is plenty
fn micros(ns: i64, origin: i64) -> f64 {
    (ns - origin).max(0) as f64 / 1000.0
}

impl ChromeTraceExporter {
    /// Build the trace events; `pid` is the client's, from its welcome
    #[must_use]
    pub fn new(capture: &Capture, pid: u64) -> Self {
        let zones = capture.zones();
        let messages = capture.messages();
        let frames = capture.frame_marks();

        let origin = zones
            .iter()
            .map(|z| z.begin)
            .chain(messages.iter().map(|m| m.time))
            .chain(frames.iter().map(|(t, _)| *t))
            .min()
            .unwrap_or(0);

        let mut events = Vec::with_capacity(zones.len() + messages.len() + frames.len());

        for zone in zones {
            let mut args = HashMap::new();
            if let Some(text) = zone.text {
                args.insert("text".to_string(), serde_json::json!(text));
            }
            if let Some(value) = zone.value {
                args.insert("value".to_string(), serde_json::json!(value));
            }
            events.push(ChromeTraceEvent {
                name: zone.name,
                cat: "zone".to_string(),
                ph: "X".to_string(),
                ts: micros(zone.begin, origin),
                dur: Some(micros(zone.end, zone.begin)),
                pid,
                tid: zone.thread,
                s: None,
                args: (!args.is_empty()).then_some(args),
            });
        }

        for message in messages {
            events.push(ChromeTraceEvent {
                name: message.text,
                cat: "message".to_string(),
                ph: "i".to_string(),
                ts: micros(message.time, origin),
                dur: None,
                pid,
                tid: message.thread,
                s: Some("t".to_string()),
                args: None,
            });
        }

        for (time, name) in frames {
            events.push(ChromeTraceEvent {
                name: name.unwrap_or_else(|| "frame".to_string()),
                cat: "frame".to_string(),
                ph: "i".to_string(),
                ts: micros(time, origin),
                dur: None,
                pid,
                tid: 0,
                s: Some("g".to_string()),
                args: None,
            });
        }

        // Thread name metadata
        for tid in capture.threads() {
            let name = capture.thread_name(tid).map_or_else(|| format!("thread {tid}"), str::to_string);
            let mut args = HashMap::new();
            args.insert("name".to_string(), serde_json::json!(name));
            events.push(ChromeTraceEvent {
                name: "thread_name".to_string(),
                cat: String::new(),
                ph: "M".to_string(),
                ts: 0.0,
                dur: None,
                pid,
                tid,
                s: None,
                args: Some(args),
            });
        }

        Self { events, pid }
    }

    /// Export the trace to any writer (file, stdout, buffer, etc.)
    ///
    /// # Errors
    /// Serialization or I/O failures on `writer`.
    pub fn export<W: Write>(&self, writer: W) -> Result<()> {
        let trace = ChromeTrace { trace_events: self.events.clone(), display_time_unit: "ms".to_string() };

        serde_json::to_writer_pretty(writer, &trace).context("Failed to write trace JSON")?;

        Ok(())
    }

    /// Get the number of events collected
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Payload, SourceLocation};
    use crate::wire::RecordEncoder;

    static WORK: SourceLocation =
        SourceLocation { name: Some("work"), function: "export::tests", file: "chrome_trace.rs", line: 1, color: 0 };

    fn sample_capture() -> Capture {
        let mut encoder = RecordEncoder::new();
        let mut frame = Vec::new();
        encoder.thread_context(4, &mut frame);
        encoder.encode(&Event::ZoneBegin { time: 1_000, srcloc: &WORK }, &mut frame);
        encoder.encode(&Event::Message { time: 1_500, text: Payload::from("halfway") }, &mut frame);
        encoder.encode(&Event::ZoneEnd { time: 3_000 }, &mut frame);
        encoder.encode(&Event::FrameMark { time: 3_500, name: None }, &mut frame);
        let mut capture = Capture::new();
        capture.ingest(&frame).unwrap();
        capture
    }

    #[test]
    fn test_export_structure() {
        let exporter = ChromeTraceExporter::new(&sample_capture(), 77);
        // zone, message, frame, thread name
        assert_eq!(exporter.event_count(), 4);

        let mut buffer = Vec::new();
        exporter.export(&mut buffer).unwrap();
        let json: JsonValue = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(json["displayTimeUnit"], "ms");

        let events = json["traceEvents"].as_array().unwrap();
        let zone = events.iter().find(|e| e["ph"] == "X").unwrap();
        assert_eq!(zone["ts"], 0.0);
        assert_eq!(zone["dur"], 2.0);
        assert_eq!(zone["tid"], 4);
        assert_eq!(zone["pid"], 77);
        // unresolved site falls back to its handle
        assert!(zone["name"].as_str().unwrap().starts_with("0x"));

        let message = events.iter().find(|e| e["cat"] == "message").unwrap();
        assert_eq!(message["name"], "halfway");
        assert_eq!(message["ts"], 0.5);

        let meta = events.iter().find(|e| e["ph"] == "M").unwrap();
        assert_eq!(meta["args"]["name"], "thread 4");
    }
}
