//! Record serialization
//!
//! Every record is `{u8 tag}{fixed LE fields}`. Timestamps are written as
//! deltas against their [`Timeline`]; static strings and source locations
//! travel as their address. An owned [`Payload`] is written as a correlation
//! id in the referencing record, followed immediately by a blob record:
//!
//! ```text
//!  ┌──────────┬──────────────┬──────────┐ ┌─────────────┬──────────┬─────────┬───────┐
//!  │ ZoneText │ u64 id = 17  │          │ │ PayloadStr  │ u64 17   │ u32 len │ bytes │
//!  └──────────┴──────────────┴──────────┘ └─────────────┴──────────┴─────────┴───────┘
//! ```
//!
//! Both records go into the same frame, so the decoder can pair them without
//! keeping state across frames.

use zonetrace_common::RecordType;

use crate::domain::ProtocolError;
use crate::event::{str_handle, DynamicSourceLocation, Event, Payload, SourceLocation};
use crate::timeline::{Timeline, Timelines};

// ============================================================================
// Encoding
// ============================================================================

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn tag(&mut self, tag: RecordType) -> &mut Self {
        self.0.push(tag as u8);
        self
    }
    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }
    fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(u8::from(v))
    }
    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u64(&mut self, v: u64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn i64(&mut self, v: i64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn f32(&mut self, v: f32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn f64(&mut self, v: f64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    /// `{u32 len}{bytes}`
    fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(u32::try_from(v.len()).unwrap_or(u32::MAX));
        self.0.extend_from_slice(v);
        self
    }
}

fn opt_str_handle(name: Option<&'static str>) -> u64 {
    name.map_or(0, str_handle)
}

/// One symbol for a code address, innermost inline frame first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFrame {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Client-side serializer holding the reference times of one session
#[derive(Debug, Default)]
pub struct RecordEncoder {
    timelines: Timelines,
    next_payload_id: u64,
}

impl RecordEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget reference times, as at the start of a session
    pub fn reset(&mut self) {
        self.timelines.reset();
        self.next_payload_id = 0;
    }

    fn blob(out: &mut Vec<u8>, tag: RecordType, id: u64, payload: &Payload) {
        Writer(out).tag(tag).u64(id).bytes(payload.as_bytes());
    }

    /// Serialize one event, with its payload blob if it has one
    #[allow(clippy::too_many_lines)] // one arm per record kind
    pub fn encode(&mut self, event: &Event, out: &mut Vec<u8>) {
        let tag = event.kind();
        let mut attached: Option<(RecordType, u64, &Payload)> = None;
        {
            let t = &mut self.timelines;
            let next_id = &mut self.next_payload_id;
            let mut id_for = || {
                *next_id += 1;
                *next_id
            };
            let mut w = Writer(out);
            w.tag(tag);
            match event {
                Event::ZoneBegin { time, srcloc } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(srcloc.handle());
                }
                Event::ZoneBeginCallstack { time, srcloc, callstack } => {
                    let id = id_for();
                    w.i64(t.encode(Timeline::Thread, *time)).u64(srcloc.handle()).u64(id);
                    attached = Some((RecordType::PayloadCallstack, id, callstack));
                }
                Event::ZoneBeginAllocSrcLoc { time, srcloc } => {
                    let id = id_for();
                    w.i64(t.encode(Timeline::Thread, *time)).u64(id);
                    attached = Some((RecordType::PayloadSourceLocation, id, srcloc));
                }
                Event::ZoneEnd { time } => {
                    w.i64(t.encode(Timeline::Thread, *time));
                }
                Event::ZoneText { text } | Event::ZoneName { text } => {
                    let id = id_for();
                    w.u64(id);
                    attached = Some((RecordType::PayloadString, id, text));
                }
                Event::ZoneColor { color } => {
                    w.u32(*color);
                }
                Event::ZoneValue { value } => {
                    w.u64(*value);
                }
                Event::Message { time, text } | Event::MessageAppInfo { time, text } => {
                    let id = id_for();
                    w.i64(t.encode(Timeline::Thread, *time)).u64(id);
                    attached = Some((RecordType::PayloadString, id, text));
                }
                Event::MessageColor { time, text, color } => {
                    let id = id_for();
                    w.i64(t.encode(Timeline::Thread, *time)).u32(*color).u64(id);
                    attached = Some((RecordType::PayloadString, id, text));
                }
                Event::MessageLiteral { time, text } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*text));
                }
                Event::MessageLiteralColor { time, text, color } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*text)).u32(*color);
                }
                Event::FrameMark { time, name } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(opt_str_handle(*name));
                }
                Event::FrameMarkStart { time, name } | Event::FrameMarkEnd { time, name } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*name));
                }
                Event::PlotInt { time, name, value } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*name)).i64(*value);
                }
                Event::PlotFloat { time, name, value } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*name)).f32(*value);
                }
                Event::PlotDouble { time, name, value } => {
                    w.i64(t.encode(Timeline::Thread, *time)).u64(str_handle(*name)).f64(*value);
                }
                Event::PlotConfig { name, format, step, fill, color } => {
                    w.u64(str_handle(*name)).u8(*format as u8).bool(*step).bool(*fill).u32(*color);
                }
                Event::ParamSetup { idx, name, is_bool, value } => {
                    w.u32(*idx).u64(str_handle(*name)).bool(*is_bool).i32(*value);
                }
                Event::Callstack { callstack } | Event::CallstackSerial { callstack } => {
                    let id = id_for();
                    w.u64(id);
                    attached = Some((RecordType::PayloadCallstack, id, callstack));
                }
                Event::ContextSwitch { time, old_thread, new_thread, cpu, reason, state } => {
                    w.i64(t.encode(Timeline::Context, *time))
                        .u32(*old_thread)
                        .u32(*new_thread)
                        .u8(*cpu)
                        .u8(*reason)
                        .u8(*state);
                }
                Event::ThreadWakeup { time, thread } => {
                    w.i64(t.encode(Timeline::Context, *time)).u32(*thread);
                }
                Event::LockAnnounce { id, time, srcloc, shared } => {
                    w.u32(*id).i64(t.encode(Timeline::Serial, *time)).u64(srcloc.handle()).bool(*shared);
                }
                Event::LockTerminate { id, time } => {
                    w.u32(*id).i64(t.encode(Timeline::Serial, *time));
                }
                Event::LockWait { thread, id, time }
                | Event::LockObtain { thread, id, time }
                | Event::LockRelease { thread, id, time }
                | Event::LockSharedWait { thread, id, time }
                | Event::LockSharedObtain { thread, id, time }
                | Event::LockSharedRelease { thread, id, time } => {
                    w.u32(*thread).u32(*id).i64(t.encode(Timeline::Serial, *time));
                }
                Event::LockMark { thread, id, srcloc } => {
                    w.u32(*thread).u32(*id).u64(srcloc.handle());
                }
                Event::LockName { id, name } => {
                    let payload_id = id_for();
                    w.u32(*id).u64(payload_id);
                    attached = Some((RecordType::PayloadString, payload_id, name));
                }
                Event::MemAlloc { time, thread, ptr, size } => {
                    w.i64(t.encode(Timeline::Serial, *time)).u32(*thread).u64(*ptr).u64(*size);
                }
                Event::MemAllocNamed { time, thread, ptr, size, name } => {
                    w.i64(t.encode(Timeline::Serial, *time))
                        .u32(*thread)
                        .u64(*ptr)
                        .u64(*size)
                        .u64(str_handle(*name));
                }
                Event::MemFree { time, thread, ptr } => {
                    w.i64(t.encode(Timeline::Serial, *time)).u32(*thread).u64(*ptr);
                }
                Event::MemFreeNamed { time, thread, ptr, name } => {
                    w.i64(t.encode(Timeline::Serial, *time)).u32(*thread).u64(*ptr).u64(str_handle(*name));
                }
                Event::GpuNewContext { cpu_time, gpu_time, thread, period, context, flags } => {
                    w.i64(t.encode(Timeline::Serial, *cpu_time))
                        .i64(*gpu_time)
                        .u32(*thread)
                        .f32(*period)
                        .u8(*context)
                        .u8(*flags);
                }
                Event::GpuZoneBegin { cpu_time, thread, query_id, context, srcloc } => {
                    w.i64(t.encode(Timeline::Serial, *cpu_time))
                        .u32(*thread)
                        .u16(*query_id)
                        .u8(*context)
                        .u64(srcloc.handle());
                }
                Event::GpuZoneEnd { cpu_time, thread, query_id, context } => {
                    w.i64(t.encode(Timeline::Serial, *cpu_time)).u32(*thread).u16(*query_id).u8(*context);
                }
                Event::GpuTime { gpu_time, query_id, context } => {
                    w.i64(t.encode(Timeline::Gpu, *gpu_time)).u16(*query_id).u8(*context);
                }
                Event::GpuCalibration { gpu_time, cpu_time, cpu_delta, context } => {
                    w.i64(*gpu_time).i64(*cpu_time).i64(*cpu_delta).u8(*context);
                }
                Event::GpuContextName { context, name } => {
                    let id = id_for();
                    w.u8(*context).u64(id);
                    attached = Some((RecordType::PayloadString, id, name));
                }
            }
        }
        if let Some((tag, id, payload)) = attached {
            Self::blob(out, tag, id, payload);
        }
    }

    pub fn thread_context(&mut self, thread: u32, out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::ThreadContext).u32(thread);
    }

    pub fn keep_alive(&mut self, out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::KeepAlive);
    }

    pub fn terminate(&mut self, out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::Terminate);
    }

    /// `StringData`, `PlotName` or `FrameName` response
    pub fn string_response(&mut self, tag: RecordType, handle: u64, text: &str, out: &mut Vec<u8>) {
        debug_assert!(matches!(
            tag,
            RecordType::StringData | RecordType::PlotName | RecordType::FrameName | RecordType::ThreadName
        ));
        Writer(out).tag(tag).u64(handle).bytes(text.as_bytes());
    }

    pub fn source_location(&mut self, loc: &'static SourceLocation, out: &mut Vec<u8>) {
        Writer(out)
            .tag(RecordType::SourceLocation)
            .u64(loc.handle())
            .u64(opt_str_handle(loc.name))
            .u64(str_handle(loc.function))
            .u64(str_handle(loc.file))
            .u32(loc.line)
            .u32(loc.color);
    }

    pub fn callstack_frame(&mut self, address: u64, frames: &[SymbolFrame], out: &mut Vec<u8>) {
        let count = u8::try_from(frames.len()).unwrap_or(u8::MAX);
        let mut w = Writer(out);
        w.tag(RecordType::CallstackFrame).u64(address).u8(count);
        for frame in frames.iter().take(usize::from(count)) {
            w.u32(frame.line).bytes(frame.name.as_bytes()).bytes(frame.file.as_bytes());
        }
    }

    pub fn source_code(&mut self, id: u32, data: &[u8], out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::SourceCode).u32(id).bytes(data);
    }

    pub fn source_code_not_available(&mut self, id: u32, out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::SourceCodeNotAvailable).u32(id);
    }

    pub fn query_noop(&mut self, out: &mut Vec<u8>) {
        Writer(out).tag(RecordType::QueryNoop);
    }

    #[cfg(test)]
    fn peek_next_id(&self) -> u64 {
        self.next_payload_id + 1
    }
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMarkKind {
    Continuous,
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlotValue {
    Int(i64),
    Float(f32),
    Double(f64),
}

impl PlotValue {
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // plots are displayed, not summed
    pub fn as_f64(self) -> f64 {
        match self {
            PlotValue::Int(v) => v as f64,
            PlotValue::Float(v) => f64::from(v),
            PlotValue::Double(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Wait,
    Obtain,
    Release,
    SharedWait,
    SharedObtain,
    SharedRelease,
}

/// A decoded record with absolute times and owned data
///
/// Handles (`srcloc`, `name`, `text` of literals) are the client's addresses
/// and resolve through `SourceLocation`/`StringData` responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    ZoneBegin { time: i64, srcloc: u64 },
    ZoneBeginCallstack { time: i64, srcloc: u64, callstack: Vec<u64> },
    ZoneBeginAllocSrcLoc { time: i64, srcloc: DynamicSourceLocation },
    ZoneEnd { time: i64 },
    ZoneText { text: String },
    ZoneName { text: String },
    ZoneColor { color: u32 },
    ZoneValue { value: u64 },
    Message { time: i64, text: String, color: Option<u32> },
    MessageLiteral { time: i64, text: u64, color: Option<u32> },
    MessageAppInfo { time: i64, text: String },
    FrameMark { time: i64, name: u64, kind: FrameMarkKind },
    Plot { time: i64, name: u64, value: PlotValue },
    PlotConfig { name: u64, format: u8, step: bool, fill: bool, color: u32 },
    ParamSetup { idx: u32, name: u64, is_bool: bool, value: i32 },
    Callstack { frames: Vec<u64> },
    ContextSwitch { time: i64, old_thread: u32, new_thread: u32, cpu: u8, reason: u8, state: u8 },
    ThreadWakeup { time: i64, thread: u32 },
    LockAnnounce { id: u32, time: i64, srcloc: u64, shared: bool },
    LockTerminate { id: u32, time: i64 },
    Lock { action: LockAction, thread: u32, id: u32, time: i64 },
    LockMark { thread: u32, id: u32, srcloc: u64 },
    LockName { id: u32, name: String },
    MemAlloc { time: i64, thread: u32, ptr: u64, size: u64, name: Option<u64> },
    MemFree { time: i64, thread: u32, ptr: u64, name: Option<u64> },
    CallstackSerial { frames: Vec<u64> },
    GpuNewContext { cpu_time: i64, gpu_time: i64, thread: u32, period: f32, context: u8, flags: u8 },
    GpuZoneBegin { cpu_time: i64, thread: u32, query_id: u16, context: u8, srcloc: u64 },
    GpuZoneEnd { cpu_time: i64, thread: u32, query_id: u16, context: u8 },
    GpuTime { gpu_time: i64, query_id: u16, context: u8 },
    GpuCalibration { gpu_time: i64, cpu_time: i64, cpu_delta: i64, context: u8 },
    GpuContextName { context: u8, name: String },
    ThreadContext { thread: u32 },
    KeepAlive,
    Terminate,
    StringData { handle: u64, text: String },
    ThreadName { thread: u64, name: String },
    PlotName { handle: u64, text: String },
    FrameName { handle: u64, text: String },
    SourceLocation { handle: u64, name: u64, function: u64, file: u64, line: u32, color: u32 },
    CallstackFrame { address: u64, frames: Vec<SymbolFrame> },
    SourceCode { id: u32, data: Vec<u8> },
    SourceCodeNotAvailable { id: u32 },
    QueryNoop,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(ProtocolError::Truncated { needed: n, available });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }
    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }
    fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }
    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }
    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }
    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }
    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.array()?))
    }
    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.array()?))
    }
    fn bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
    fn string(&mut self) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }
    fn tag(&mut self) -> Result<RecordType, ProtocolError> {
        let raw = self.u8()?;
        RecordType::from_u8(raw).ok_or(ProtocolError::UnknownRecord(raw))
    }
}

fn callstack_frames(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .filter_map(|c| c.try_into().ok())
        .map(u64::from_le_bytes)
        .collect()
}

/// Collector-side deserializer mirroring [`RecordEncoder`]'s reference times
#[derive(Debug, Default)]
pub struct RecordDecoder {
    timelines: Timelines,
}

impl RecordDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.timelines.reset();
    }

    /// Decode every record in one decompressed frame
    ///
    /// # Errors
    /// Unknown tags, truncated records and unpaired payload blobs.
    pub fn decode_frame(&mut self, frame: &[u8]) -> Result<Vec<Record>, ProtocolError> {
        let mut reader = Reader { buf: frame, pos: 0 };
        let mut records = Vec::new();
        while reader.pos < frame.len() {
            records.push(self.decode_one(&mut reader)?);
        }
        Ok(records)
    }

    fn blob<'a>(reader: &mut Reader<'a>, expected: RecordType, id: u64) -> Result<&'a [u8], ProtocolError> {
        let tag = reader.tag()?;
        let blob_id = reader.u64()?;
        if tag != expected || blob_id != id {
            return Err(ProtocolError::MissingPayload { id });
        }
        reader.bytes()
    }

    fn blob_string(reader: &mut Reader<'_>, id: u64) -> Result<String, ProtocolError> {
        let bytes = Self::blob(reader, RecordType::PayloadString, id)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn blob_callstack(reader: &mut Reader<'_>, id: u64) -> Result<Vec<u64>, ProtocolError> {
        Self::blob(reader, RecordType::PayloadCallstack, id).map(callstack_frames)
    }

    #[allow(clippy::too_many_lines)] // one arm per record kind
    fn decode_one(&mut self, r: &mut Reader<'_>) -> Result<Record, ProtocolError> {
        let t = &mut self.timelines;
        let tag = r.tag()?;
        let record = match tag {
            RecordType::ZoneBegin => {
                Record::ZoneBegin { time: t.decode(Timeline::Thread, r.i64()?), srcloc: r.u64()? }
            }
            RecordType::ZoneBeginCallstack => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let srcloc = r.u64()?;
                let id = r.u64()?;
                Record::ZoneBeginCallstack { time, srcloc, callstack: Self::blob_callstack(r, id)? }
            }
            RecordType::ZoneBeginAllocSrcLoc => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let id = r.u64()?;
                let bytes = Self::blob(r, RecordType::PayloadSourceLocation, id)?;
                let srcloc = DynamicSourceLocation::from_bytes(bytes)
                    .ok_or(ProtocolError::Truncated { needed: 12, available: bytes.len() })?;
                Record::ZoneBeginAllocSrcLoc { time, srcloc }
            }
            RecordType::ZoneEnd => Record::ZoneEnd { time: t.decode(Timeline::Thread, r.i64()?) },
            RecordType::ZoneText => {
                let id = r.u64()?;
                Record::ZoneText { text: Self::blob_string(r, id)? }
            }
            RecordType::ZoneName => {
                let id = r.u64()?;
                Record::ZoneName { text: Self::blob_string(r, id)? }
            }
            RecordType::ZoneColor => Record::ZoneColor { color: r.u32()? },
            RecordType::ZoneValue => Record::ZoneValue { value: r.u64()? },
            RecordType::Message => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let id = r.u64()?;
                Record::Message { time, text: Self::blob_string(r, id)?, color: None }
            }
            RecordType::MessageColor => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let color = r.u32()?;
                let id = r.u64()?;
                Record::Message { time, text: Self::blob_string(r, id)?, color: Some(color) }
            }
            RecordType::MessageLiteral => Record::MessageLiteral {
                time: t.decode(Timeline::Thread, r.i64()?),
                text: r.u64()?,
                color: None,
            },
            RecordType::MessageLiteralColor => Record::MessageLiteral {
                time: t.decode(Timeline::Thread, r.i64()?),
                text: r.u64()?,
                color: Some(r.u32()?),
            },
            RecordType::MessageAppInfo => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let id = r.u64()?;
                Record::MessageAppInfo { time, text: Self::blob_string(r, id)? }
            }
            RecordType::FrameMarkMsg | RecordType::FrameMarkMsgStart | RecordType::FrameMarkMsgEnd => {
                let kind = match tag {
                    RecordType::FrameMarkMsgStart => FrameMarkKind::Start,
                    RecordType::FrameMarkMsgEnd => FrameMarkKind::End,
                    _ => FrameMarkKind::Continuous,
                };
                Record::FrameMark { time: t.decode(Timeline::Thread, r.i64()?), name: r.u64()?, kind }
            }
            RecordType::PlotDataInt | RecordType::PlotDataFloat | RecordType::PlotDataDouble => {
                let time = t.decode(Timeline::Thread, r.i64()?);
                let name = r.u64()?;
                let value = match tag {
                    RecordType::PlotDataInt => PlotValue::Int(r.i64()?),
                    RecordType::PlotDataFloat => PlotValue::Float(r.f32()?),
                    _ => PlotValue::Double(r.f64()?),
                };
                Record::Plot { time, name, value }
            }
            RecordType::PlotConfig => Record::PlotConfig {
                name: r.u64()?,
                format: r.u8()?,
                step: r.bool()?,
                fill: r.bool()?,
                color: r.u32()?,
            },
            RecordType::ParamSetup => Record::ParamSetup {
                idx: r.u32()?,
                name: r.u64()?,
                is_bool: r.bool()?,
                value: r.i32()?,
            },
            RecordType::Callstack => {
                let id = r.u64()?;
                Record::Callstack { frames: Self::blob_callstack(r, id)? }
            }
            RecordType::ContextSwitch => Record::ContextSwitch {
                time: t.decode(Timeline::Context, r.i64()?),
                old_thread: r.u32()?,
                new_thread: r.u32()?,
                cpu: r.u8()?,
                reason: r.u8()?,
                state: r.u8()?,
            },
            RecordType::ThreadWakeup => Record::ThreadWakeup {
                time: t.decode(Timeline::Context, r.i64()?),
                thread: r.u32()?,
            },
            RecordType::LockAnnounce => Record::LockAnnounce {
                id: r.u32()?,
                time: t.decode(Timeline::Serial, r.i64()?),
                srcloc: r.u64()?,
                shared: r.bool()?,
            },
            RecordType::LockTerminate => {
                Record::LockTerminate { id: r.u32()?, time: t.decode(Timeline::Serial, r.i64()?) }
            }
            RecordType::LockWait
            | RecordType::LockObtain
            | RecordType::LockRelease
            | RecordType::LockSharedWait
            | RecordType::LockSharedObtain
            | RecordType::LockSharedRelease => {
                let action = match tag {
                    RecordType::LockWait => LockAction::Wait,
                    RecordType::LockObtain => LockAction::Obtain,
                    RecordType::LockRelease => LockAction::Release,
                    RecordType::LockSharedWait => LockAction::SharedWait,
                    RecordType::LockSharedObtain => LockAction::SharedObtain,
                    _ => LockAction::SharedRelease,
                };
                Record::Lock {
                    action,
                    thread: r.u32()?,
                    id: r.u32()?,
                    time: t.decode(Timeline::Serial, r.i64()?),
                }
            }
            RecordType::LockMark => Record::LockMark { thread: r.u32()?, id: r.u32()?, srcloc: r.u64()? },
            RecordType::LockName => {
                let id = r.u32()?;
                let payload = r.u64()?;
                Record::LockName { id, name: Self::blob_string(r, payload)? }
            }
            RecordType::MemAlloc | RecordType::MemAllocNamed => Record::MemAlloc {
                time: t.decode(Timeline::Serial, r.i64()?),
                thread: r.u32()?,
                ptr: r.u64()?,
                size: r.u64()?,
                name: if tag == RecordType::MemAllocNamed { Some(r.u64()?) } else { None },
            },
            RecordType::MemFree | RecordType::MemFreeNamed => Record::MemFree {
                time: t.decode(Timeline::Serial, r.i64()?),
                thread: r.u32()?,
                ptr: r.u64()?,
                name: if tag == RecordType::MemFreeNamed { Some(r.u64()?) } else { None },
            },
            RecordType::CallstackSerial => {
                let id = r.u64()?;
                Record::CallstackSerial { frames: Self::blob_callstack(r, id)? }
            }
            RecordType::GpuNewContext => Record::GpuNewContext {
                cpu_time: t.decode(Timeline::Serial, r.i64()?),
                gpu_time: r.i64()?,
                thread: r.u32()?,
                period: r.f32()?,
                context: r.u8()?,
                flags: r.u8()?,
            },
            RecordType::GpuZoneBegin => Record::GpuZoneBegin {
                cpu_time: t.decode(Timeline::Serial, r.i64()?),
                thread: r.u32()?,
                query_id: r.u16()?,
                context: r.u8()?,
                srcloc: r.u64()?,
            },
            RecordType::GpuZoneEnd => Record::GpuZoneEnd {
                cpu_time: t.decode(Timeline::Serial, r.i64()?),
                thread: r.u32()?,
                query_id: r.u16()?,
                context: r.u8()?,
            },
            RecordType::GpuTime => Record::GpuTime {
                gpu_time: t.decode(Timeline::Gpu, r.i64()?),
                query_id: r.u16()?,
                context: r.u8()?,
            },
            RecordType::GpuCalibration => Record::GpuCalibration {
                gpu_time: r.i64()?,
                cpu_time: r.i64()?,
                cpu_delta: r.i64()?,
                context: r.u8()?,
            },
            RecordType::GpuContextName => {
                let context = r.u8()?;
                let id = r.u64()?;
                Record::GpuContextName { context, name: Self::blob_string(r, id)? }
            }
            RecordType::ThreadContext => Record::ThreadContext { thread: r.u32()? },
            RecordType::KeepAlive => Record::KeepAlive,
            RecordType::Terminate => Record::Terminate,
            RecordType::PayloadString | RecordType::PayloadCallstack | RecordType::PayloadSourceLocation => {
                // A blob is only valid right after its referencing record
                return Err(ProtocolError::MissingPayload { id: r.u64()? });
            }
            RecordType::StringData => Record::StringData { handle: r.u64()?, text: r.string()? },
            RecordType::ThreadName => Record::ThreadName { thread: r.u64()?, name: r.string()? },
            RecordType::PlotName => Record::PlotName { handle: r.u64()?, text: r.string()? },
            RecordType::FrameName => Record::FrameName { handle: r.u64()?, text: r.string()? },
            RecordType::SourceLocation => Record::SourceLocation {
                handle: r.u64()?,
                name: r.u64()?,
                function: r.u64()?,
                file: r.u64()?,
                line: r.u32()?,
                color: r.u32()?,
            },
            RecordType::CallstackFrame => {
                let address = r.u64()?;
                let count = r.u8()?;
                let mut frames = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let line = r.u32()?;
                    let name = r.string()?;
                    let file = r.string()?;
                    frames.push(SymbolFrame { name, file, line });
                }
                Record::CallstackFrame { address, frames }
            }
            RecordType::SourceCode => Record::SourceCode { id: r.u32()?, data: r.bytes()?.to_vec() },
            RecordType::SourceCodeNotAvailable => Record::SourceCodeNotAvailable { id: r.u32()? },
            RecordType::QueryNoop => Record::QueryNoop,
        };
        Ok(record)
    }
}
