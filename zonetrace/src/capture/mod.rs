//! Collector side of the protocol
//!
//! [`CollectorConnection`] speaks the handshake and reads frames,
//! [`StreamDecoder`] turns frames into thread-attributed records, and
//! [`Capture`] accumulates them while asking the client for every string,
//! thread name and source location it has only seen as a handle.

pub mod connection;
pub mod decoder;

pub use connection::CollectorConnection;
pub use decoder::{DecodedRecord, StreamDecoder};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info};
use zonetrace_common::{QueryKind, ServerQuery};

use crate::domain::{CaptureError, ProtocolError, TransportError};
use crate::wire::Record;

/// How long one `read_frame` call waits before the loop checks `stop`
const READ_SLICE: Duration = Duration::from_millis(50);

/// Source location as announced by a `SourceLocation` response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteHandles {
    /// 0 when the site has no name
    pub name: u64,
    pub function: u64,
    pub file: u64,
    pub line: u32,
    pub color: u32,
}

/// A source location with its strings resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: Option<String>,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub color: u32,
}

/// A completed zone
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSpan {
    pub thread: u32,
    pub begin: i64,
    pub end: i64,
    /// Nesting level on its thread, 0 for outermost
    pub depth: usize,
    pub name: String,
    pub text: Option<String>,
    pub value: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub thread: u32,
    pub time: i64,
    pub text: String,
}

/// Why [`Capture::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// The client sent `Terminate` and every query was answered
    Terminated,
    /// `stop` was raised; the client was told to disconnect
    Stopped,
    /// The connection closed without a `Terminate`
    Disconnected,
}

/// Everything received from one client
#[derive(Debug, Default)]
pub struct Capture {
    decoder: StreamDecoder,
    records: Vec<DecodedRecord>,
    strings: HashMap<u64, String>,
    thread_names: HashMap<u32, String>,
    sites: HashMap<u64, SiteHandles>,
    asked: HashSet<(u8, u64)>,
    pending: VecDeque<ServerQuery>,
    outstanding: usize,
    terminated: bool,
}

impl Capture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame and queue queries for handles not seen before
    ///
    /// # Errors
    /// Malformed frames.
    pub fn ingest(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        for decoded in self.decoder.decode(frame)? {
            self.absorb(decoded);
        }
        Ok(())
    }

    fn ask(&mut self, kind: QueryKind, handle: u64) {
        if handle == 0 && kind != QueryKind::ThreadString {
            return;
        }
        if self.asked.insert((kind as u8, handle)) {
            self.pending.push_back(ServerQuery::new(kind, handle, 0));
        }
    }

    fn answered(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn absorb(&mut self, decoded: DecodedRecord) {
        let DecodedRecord { thread, record } = decoded;
        match record {
            Record::StringData { handle, text } | Record::PlotName { handle, text } | Record::FrameName { handle, text } => {
                self.answered();
                self.strings.insert(handle, text);
            }
            Record::ThreadName { thread, name } => {
                self.answered();
                if let Ok(thread) = u32::try_from(thread) {
                    self.thread_names.insert(thread, name);
                }
            }
            Record::SourceLocation { handle, name, function, file, line, color } => {
                self.answered();
                self.ask(QueryKind::String, name);
                self.ask(QueryKind::String, function);
                self.ask(QueryKind::String, file);
                self.sites.insert(handle, SiteHandles { name, function, file, line, color });
            }
            Record::CallstackFrame { .. }
            | Record::SourceCode { .. }
            | Record::SourceCodeNotAvailable { .. }
            | Record::QueryNoop => self.answered(),
            Record::KeepAlive => {}
            Record::Terminate => {
                debug!("Client terminated with {} queries outstanding", self.outstanding + self.pending.len());
                self.terminated = true;
            }
            record => {
                self.ask(QueryKind::ThreadString, u64::from(thread));
                self.ask_for(&record);
                self.records.push(DecodedRecord { thread, record });
            }
        }
    }

    fn ask_for(&mut self, record: &Record) {
        match *record {
            Record::ZoneBegin { srcloc, .. }
            | Record::ZoneBeginCallstack { srcloc, .. }
            | Record::LockAnnounce { srcloc, .. }
            | Record::LockMark { srcloc, .. }
            | Record::GpuZoneBegin { srcloc, .. } => self.ask(QueryKind::SourceLocation, srcloc),
            Record::MessageLiteral { text, .. } => self.ask(QueryKind::String, text),
            Record::FrameMark { name, .. } => self.ask(QueryKind::FrameName, name),
            Record::Plot { name, .. } | Record::PlotConfig { name, .. } => self.ask(QueryKind::PlotName, name),
            Record::ParamSetup { name, .. } => self.ask(QueryKind::String, name),
            Record::MemAlloc { name: Some(name), .. } | Record::MemFree { name: Some(name), .. } => {
                self.ask(QueryKind::String, name);
            }
            _ => {}
        }
    }

    /// Queries to send now; each counts as outstanding until answered
    pub fn take_queries(&mut self) -> Vec<ServerQuery> {
        self.outstanding += self.pending.len();
        self.pending.drain(..).collect()
    }

    /// Whether the client has sent `Terminate`
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Queries sent or queued that have no response yet
    #[must_use]
    pub fn unanswered(&self) -> usize {
        self.outstanding + self.pending.len()
    }

    #[must_use]
    pub fn records(&self) -> &[DecodedRecord] {
        &self.records
    }

    #[must_use]
    pub fn string(&self, handle: u64) -> Option<&str> {
        self.strings.get(&handle).map(String::as_str)
    }

    #[must_use]
    pub fn thread_name(&self, thread: u32) -> Option<&str> {
        self.thread_names.get(&thread).map(String::as_str)
    }

    /// Threads that produced records, in first-seen order
    #[must_use]
    pub fn threads(&self) -> Vec<u32> {
        let mut seen = HashSet::new();
        self.records.iter().map(|r| r.thread).filter(|t| seen.insert(*t)).collect()
    }

    #[must_use]
    pub fn site(&self, handle: u64) -> Option<Site> {
        let handles = self.sites.get(&handle)?;
        let text = |h: u64| self.string(h).unwrap_or("???").to_string();
        Some(Site {
            name: (handles.name != 0).then(|| text(handles.name)),
            function: text(handles.function),
            file: text(handles.file),
            line: handles.line,
            color: handles.color,
        })
    }

    fn site_label(&self, srcloc: u64) -> String {
        match self.site(srcloc) {
            Some(Site { name: Some(name), .. }) => name,
            Some(site) => site.function,
            None => format!("0x{srcloc:x}"),
        }
    }

    /// Pair zone begins with their ends, per thread
    ///
    /// Zones still open when the capture ended are left out.
    #[must_use]
    pub fn zones(&self) -> Vec<ZoneSpan> {
        let mut stacks: HashMap<u32, Vec<ZoneSpan>> = HashMap::new();
        let mut done = Vec::new();
        for DecodedRecord { thread, record } in &self.records {
            let stack = stacks.entry(*thread).or_default();
            let open = |time: i64, name: String, depth: usize| ZoneSpan {
                thread: *thread,
                begin: time,
                end: time,
                depth,
                name,
                text: None,
                value: None,
            };
            match record {
                Record::ZoneBegin { time, srcloc } | Record::ZoneBeginCallstack { time, srcloc, .. } => {
                    let zone = open(*time, self.site_label(*srcloc), stack.len());
                    stack.push(zone);
                }
                Record::ZoneBeginAllocSrcLoc { time, srcloc } => {
                    let name = srcloc.name.clone().unwrap_or_else(|| srcloc.function.clone());
                    let zone = open(*time, name, stack.len());
                    stack.push(zone);
                }
                Record::ZoneEnd { time } => {
                    if let Some(mut zone) = stack.pop() {
                        zone.end = *time;
                        done.push(zone);
                    }
                }
                Record::ZoneName { text } => {
                    if let Some(zone) = stack.last_mut() {
                        zone.name.clone_from(text);
                    }
                }
                Record::ZoneText { text } => {
                    if let Some(zone) = stack.last_mut() {
                        zone.text.get_or_insert_with(String::new).push_str(text);
                    }
                }
                Record::ZoneValue { value } => {
                    if let Some(zone) = stack.last_mut() {
                        zone.value = Some(*value);
                    }
                }
                _ => {}
            }
        }
        done.sort_by_key(|z| (z.thread, z.begin, z.depth));
        done
    }

    #[must_use]
    pub fn messages(&self) -> Vec<MessageEntry> {
        self.records
            .iter()
            .filter_map(|DecodedRecord { thread, record }| {
                let (time, text) = match record {
                    Record::Message { time, text, .. } | Record::MessageAppInfo { time, text } => (*time, text.clone()),
                    Record::MessageLiteral { time, text, .. } => (*time, self.string(*text).unwrap_or("???").to_string()),
                    _ => return None,
                };
                Some(MessageEntry { thread: *thread, time, text })
            })
            .collect()
    }

    /// Frame marks as `(time, frame set name)`; `None` is the main set
    #[must_use]
    pub fn frame_marks(&self) -> Vec<(i64, Option<String>)> {
        self.records
            .iter()
            .filter_map(|r| match r.record {
                Record::FrameMark { time, name, .. } => {
                    Some((time, (name != 0).then(|| self.string(name).unwrap_or("???").to_string())))
                }
                _ => None,
            })
            .collect()
    }

    /// Read from `conn` until the client terminates, `stop` is raised or
    /// the connection drops
    ///
    /// After the client's `Terminate` the loop keeps reading until every
    /// query has been answered, then releases the client with a
    /// `Terminate` query.
    ///
    /// # Errors
    /// Protocol errors and transport failures other than the peer closing.
    pub fn run(&mut self, conn: &mut CollectorConnection, stop: &AtomicBool) -> Result<CaptureEnd, CaptureError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                info!("Capture stopped, disconnecting");
                ignore_closed(conn.send_query(ServerQuery::new(QueryKind::Disconnect, 0, 0)))?;
                return Ok(CaptureEnd::Stopped);
            }

            match conn.read_frame(READ_SLICE) {
                Ok(Some(frame)) => self.ingest(&frame)?,
                Ok(None) => {}
                Err(CaptureError::Transport(TransportError::Closed)) => {
                    info!("Client closed the connection");
                    return Ok(if self.terminated { CaptureEnd::Terminated } else { CaptureEnd::Disconnected });
                }
                Err(e) => return Err(e),
            }

            for query in self.take_queries() {
                conn.send_query(query)?;
            }

            if self.terminated && self.outstanding == 0 {
                info!("Capture complete: {} records", self.records.len());
                ignore_closed(conn.send_query(ServerQuery::new(QueryKind::Terminate, 0, 0)))?;
                return Ok(CaptureEnd::Terminated);
            }
        }
    }
}

fn ignore_closed(result: Result<(), CaptureError>) -> Result<(), CaptureError> {
    match result {
        Err(CaptureError::Transport(TransportError::Closed)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{str_handle, Event, Payload, SourceLocation};
    use crate::wire::RecordEncoder;
    use zonetrace_common::RecordType;

    static PARSE: SourceLocation =
        SourceLocation { name: Some("parse"), function: "capture::tests", file: "mod.rs", line: 3, color: 0 };
    static LOADED: &str = "loaded";

    fn frame(build: impl FnOnce(&mut RecordEncoder, &mut Vec<u8>)) -> Vec<u8> {
        let mut encoder = RecordEncoder::new();
        let mut out = Vec::new();
        build(&mut encoder, &mut out);
        out
    }

    #[test]
    fn test_unknown_handles_are_queried_once() {
        let mut capture = Capture::new();
        capture
            .ingest(&frame(|enc, out| {
                enc.thread_context(5, out);
                enc.encode(&Event::ZoneBegin { time: 10, srcloc: &PARSE }, out);
                enc.encode(&Event::ZoneEnd { time: 20 }, out);
                enc.encode(&Event::ZoneBegin { time: 30, srcloc: &PARSE }, out);
                enc.encode(&Event::MessageLiteral { time: 35, text: LOADED }, out);
                enc.encode(&Event::ZoneEnd { time: 40 }, out);
            }))
            .unwrap();

        let queries = capture.take_queries();
        let kinds: Vec<_> = queries.iter().map(|q| QueryKind::from_u8(q.kind)).collect();
        assert_eq!(
            kinds,
            vec![Some(QueryKind::ThreadString), Some(QueryKind::SourceLocation), Some(QueryKind::String)]
        );
        assert_eq!(queries[0].handle, 5);
        assert_eq!(queries[1].handle, PARSE.handle());
        assert_eq!(capture.unanswered(), 3);
        assert!(capture.take_queries().is_empty());
    }

    #[test]
    fn test_responses_resolve_zone_names() {
        let mut capture = Capture::new();
        capture
            .ingest(&frame(|enc, out| {
                enc.thread_context(1, out);
                enc.encode(&Event::ZoneBegin { time: 100, srcloc: &PARSE }, out);
                enc.encode(&Event::ZoneBegin { time: 110, srcloc: &PARSE }, out);
                enc.encode(&Event::ZoneText { text: Payload::from("inner") }, out);
                enc.encode(&Event::ZoneEnd { time: 120 }, out);
                enc.encode(&Event::ZoneEnd { time: 200 }, out);
            }))
            .unwrap();
        assert_eq!(capture.take_queries().len(), 2);

        capture
            .ingest(&frame(|enc, out| {
                enc.string_response(RecordType::ThreadName, 1, "main", out);
                enc.source_location(&PARSE, out);
            }))
            .unwrap();
        assert_eq!(capture.unanswered(), 3);
        assert_eq!(capture.take_queries().len(), 3);
        capture
            .ingest(&frame(|enc, out| {
                for s in [PARSE.function, PARSE.file, PARSE.name.unwrap()] {
                    enc.string_response(RecordType::StringData, str_handle(s), s, out);
                }
            }))
            .unwrap();
        assert_eq!(capture.unanswered(), 0);

        assert_eq!(capture.thread_name(1), Some("main"));
        let site = capture.site(PARSE.handle()).unwrap();
        assert_eq!(site.function, "capture::tests");
        assert_eq!(site.line, 3);
        assert_eq!(site.name.as_deref(), Some("parse"));

        let zones = capture.zones();
        assert_eq!(zones.len(), 2);
        assert_eq!((zones[0].begin, zones[0].end, zones[0].depth), (100, 200, 0));
        assert_eq!((zones[1].begin, zones[1].end, zones[1].depth), (110, 120, 1));
        assert_eq!(zones[1].text.as_deref(), Some("inner"));
    }

    #[test]
    fn test_terminate_and_open_zones() {
        let mut capture = Capture::new();
        capture
            .ingest(&frame(|enc, out| {
                enc.thread_context(2, out);
                enc.encode(&Event::ZoneBegin { time: 1, srcloc: &PARSE }, out);
                enc.encode(&Event::Message { time: 2, text: Payload::from("still running") }, out);
                enc.keep_alive(out);
                enc.terminate(out);
            }))
            .unwrap();
        assert!(capture.is_terminated());
        assert!(capture.zones().is_empty());
        assert_eq!(
            capture.messages(),
            vec![MessageEntry { thread: 2, time: 2, text: "still running".to_string() }]
        );
        assert_eq!(capture.threads(), vec![2]);
    }
}
