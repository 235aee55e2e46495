//! Event records as they travel through the queues
//!
//! An [`Event`] is what instrumentation hands to the pipeline. Fixed fields
//! are stored inline; anything variable-length is a [`Payload`] that moves
//! with the event and is dropped by whoever consumes it last. Static data
//! (`&'static str`, `&'static SourceLocation`) is referenced by address and
//! resolved later when the collector asks for it.

use zonetrace_common::RecordType;

/// Compile-time description of an instrumented zone or lock site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub name: Option<&'static str>,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
    /// 0xRRGGBB, 0 for the collector's default
    pub color: u32,
}

impl SourceLocation {
    /// Address used as this location's handle on the wire
    #[must_use]
    pub fn handle(&'static self) -> u64 {
        std::ptr::from_ref(self) as usize as u64
    }
}

/// Address of a static string, used as its handle on the wire
#[must_use]
pub fn str_handle(s: &'static str) -> u64 {
    s.as_ptr() as usize as u64
}

/// Move-only owned byte buffer attached to an event
///
/// Not `Clone`: exactly one owner frees it.
#[derive(Debug, PartialEq, Eq)]
pub struct Payload(Box<[u8]>);

impl Payload {
    #[must_use]
    pub fn new(bytes: Box<[u8]>) -> Self {
        debug_assert!(u32::try_from(bytes.len()).is_ok(), "payload exceeds u32 length");
        Self(bytes)
    }

    /// Callstack frames as little-endian u64 addresses
    #[must_use]
    pub fn callstack(frames: &[u64]) -> Self {
        Self::new(frames.iter().flat_map(|f| f.to_le_bytes()).collect())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().into())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::new(text.into_bytes().into_boxed_slice())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes.into_boxed_slice())
    }
}

/// Source location built at runtime, e.g. from a scripting layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSourceLocation {
    pub line: u32,
    pub color: u32,
    pub function: String,
    pub file: String,
    pub name: Option<String>,
}

impl DynamicSourceLocation {
    /// `{u32 line}{u32 color}{u16 len}{function}{u16 len}{file}{name...}`
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        let mut out = Vec::with_capacity(12 + self.function.len() + self.file.len());
        out.extend_from_slice(&self.line.to_le_bytes());
        out.extend_from_slice(&self.color.to_le_bytes());
        for part in [&self.function, &self.file] {
            let len = u16::try_from(part.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&part.as_bytes()[..usize::from(len)]);
        }
        if let Some(name) = &self.name {
            out.extend_from_slice(name.as_bytes());
        }
        Payload::from(out)
    }

    /// Inverse of [`DynamicSourceLocation::to_payload`]
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
            if bytes.len() < n {
                return None;
            }
            let (head, tail) = bytes.split_at(n);
            *bytes = tail;
            Some(head)
        }
        fn take_str(bytes: &mut &[u8]) -> Option<String> {
            let len = u16::from_le_bytes(take(bytes, 2)?.try_into().ok()?);
            Some(String::from_utf8_lossy(take(bytes, usize::from(len))?).into_owned())
        }

        let mut rest = bytes;
        let line = u32::from_le_bytes(take(&mut rest, 4)?.try_into().ok()?);
        let color = u32::from_le_bytes(take(&mut rest, 4)?.try_into().ok()?);
        let function = take_str(&mut rest)?;
        let file = take_str(&mut rest)?;
        let name = (!rest.is_empty()).then(|| String::from_utf8_lossy(rest).into_owned());
        Some(Self { line, color, function, file, name })
    }
}

/// How plot values are displayed
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotFormat {
    Number = 0,
    Memory = 1,
    Percentage = 2,
}

impl PlotFormat {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Number),
            1 => Some(Self::Memory),
            2 => Some(Self::Percentage),
            _ => None,
        }
    }
}

/// A record produced by instrumentation
///
/// Times are absolute nanoseconds on the profiler clock; the worker turns
/// them into deltas. Events on the serial queue carry their thread id since
/// they are not grouped by producer.
#[derive(Debug)]
pub enum Event {
    ZoneBegin { time: i64, srcloc: &'static SourceLocation },
    ZoneBeginCallstack { time: i64, srcloc: &'static SourceLocation, callstack: Payload },
    ZoneBeginAllocSrcLoc { time: i64, srcloc: Payload },
    ZoneEnd { time: i64 },
    ZoneText { text: Payload },
    ZoneName { text: Payload },
    ZoneColor { color: u32 },
    ZoneValue { value: u64 },

    Message { time: i64, text: Payload },
    MessageColor { time: i64, text: Payload, color: u32 },
    MessageLiteral { time: i64, text: &'static str },
    MessageLiteralColor { time: i64, text: &'static str, color: u32 },
    MessageAppInfo { time: i64, text: Payload },

    FrameMark { time: i64, name: Option<&'static str> },
    FrameMarkStart { time: i64, name: &'static str },
    FrameMarkEnd { time: i64, name: &'static str },

    PlotInt { time: i64, name: &'static str, value: i64 },
    PlotFloat { time: i64, name: &'static str, value: f32 },
    PlotDouble { time: i64, name: &'static str, value: f64 },
    PlotConfig { name: &'static str, format: PlotFormat, step: bool, fill: bool, color: u32 },
    ParamSetup { idx: u32, name: &'static str, is_bool: bool, value: i32 },
    Callstack { callstack: Payload },

    ContextSwitch { time: i64, old_thread: u32, new_thread: u32, cpu: u8, reason: u8, state: u8 },
    ThreadWakeup { time: i64, thread: u32 },

    LockAnnounce { id: u32, time: i64, srcloc: &'static SourceLocation, shared: bool },
    LockTerminate { id: u32, time: i64 },
    LockWait { thread: u32, id: u32, time: i64 },
    LockObtain { thread: u32, id: u32, time: i64 },
    LockRelease { thread: u32, id: u32, time: i64 },
    LockSharedWait { thread: u32, id: u32, time: i64 },
    LockSharedObtain { thread: u32, id: u32, time: i64 },
    LockSharedRelease { thread: u32, id: u32, time: i64 },
    LockMark { thread: u32, id: u32, srcloc: &'static SourceLocation },
    LockName { id: u32, name: Payload },

    MemAlloc { time: i64, thread: u32, ptr: u64, size: u64 },
    MemAllocNamed { time: i64, thread: u32, ptr: u64, size: u64, name: &'static str },
    MemFree { time: i64, thread: u32, ptr: u64 },
    MemFreeNamed { time: i64, thread: u32, ptr: u64, name: &'static str },
    CallstackSerial { callstack: Payload },

    GpuNewContext { cpu_time: i64, gpu_time: i64, thread: u32, period: f32, context: u8, flags: u8 },
    GpuZoneBegin { cpu_time: i64, thread: u32, query_id: u16, context: u8, srcloc: &'static SourceLocation },
    GpuZoneEnd { cpu_time: i64, thread: u32, query_id: u16, context: u8 },
    GpuTime { gpu_time: i64, query_id: u16, context: u8 },
    GpuCalibration { gpu_time: i64, cpu_time: i64, cpu_delta: i64, context: u8 },
    GpuContextName { context: u8, name: Payload },
}

impl Event {
    /// Wire tag this event serializes under
    #[must_use]
    pub fn kind(&self) -> RecordType {
        match self {
            Event::ZoneBegin { .. } => RecordType::ZoneBegin,
            Event::ZoneBeginCallstack { .. } => RecordType::ZoneBeginCallstack,
            Event::ZoneBeginAllocSrcLoc { .. } => RecordType::ZoneBeginAllocSrcLoc,
            Event::ZoneEnd { .. } => RecordType::ZoneEnd,
            Event::ZoneText { .. } => RecordType::ZoneText,
            Event::ZoneName { .. } => RecordType::ZoneName,
            Event::ZoneColor { .. } => RecordType::ZoneColor,
            Event::ZoneValue { .. } => RecordType::ZoneValue,
            Event::Message { .. } => RecordType::Message,
            Event::MessageColor { .. } => RecordType::MessageColor,
            Event::MessageLiteral { .. } => RecordType::MessageLiteral,
            Event::MessageLiteralColor { .. } => RecordType::MessageLiteralColor,
            Event::MessageAppInfo { .. } => RecordType::MessageAppInfo,
            Event::FrameMark { .. } => RecordType::FrameMarkMsg,
            Event::FrameMarkStart { .. } => RecordType::FrameMarkMsgStart,
            Event::FrameMarkEnd { .. } => RecordType::FrameMarkMsgEnd,
            Event::PlotInt { .. } => RecordType::PlotDataInt,
            Event::PlotFloat { .. } => RecordType::PlotDataFloat,
            Event::PlotDouble { .. } => RecordType::PlotDataDouble,
            Event::PlotConfig { .. } => RecordType::PlotConfig,
            Event::ParamSetup { .. } => RecordType::ParamSetup,
            Event::Callstack { .. } => RecordType::Callstack,
            Event::ContextSwitch { .. } => RecordType::ContextSwitch,
            Event::ThreadWakeup { .. } => RecordType::ThreadWakeup,
            Event::LockAnnounce { .. } => RecordType::LockAnnounce,
            Event::LockTerminate { .. } => RecordType::LockTerminate,
            Event::LockWait { .. } => RecordType::LockWait,
            Event::LockObtain { .. } => RecordType::LockObtain,
            Event::LockRelease { .. } => RecordType::LockRelease,
            Event::LockSharedWait { .. } => RecordType::LockSharedWait,
            Event::LockSharedObtain { .. } => RecordType::LockSharedObtain,
            Event::LockSharedRelease { .. } => RecordType::LockSharedRelease,
            Event::LockMark { .. } => RecordType::LockMark,
            Event::LockName { .. } => RecordType::LockName,
            Event::MemAlloc { .. } => RecordType::MemAlloc,
            Event::MemAllocNamed { .. } => RecordType::MemAllocNamed,
            Event::MemFree { .. } => RecordType::MemFree,
            Event::MemFreeNamed { .. } => RecordType::MemFreeNamed,
            Event::CallstackSerial { .. } => RecordType::CallstackSerial,
            Event::GpuNewContext { .. } => RecordType::GpuNewContext,
            Event::GpuZoneBegin { .. } => RecordType::GpuZoneBegin,
            Event::GpuZoneEnd { .. } => RecordType::GpuZoneEnd,
            Event::GpuTime { .. } => RecordType::GpuTime,
            Event::GpuCalibration { .. } => RecordType::GpuCalibration,
            Event::GpuContextName { .. } => RecordType::GpuContextName,
        }
    }

    /// Whether the event travels through the serial queue
    ///
    /// Serial events carry their thread themselves and are ordered across
    /// threads; everything else goes through the calling thread's producer.
    #[must_use]
    pub fn is_serial(&self) -> bool {
        matches!(
            self,
            Event::ContextSwitch { .. }
                | Event::ThreadWakeup { .. }
                | Event::LockAnnounce { .. }
                | Event::LockTerminate { .. }
                | Event::LockWait { .. }
                | Event::LockObtain { .. }
                | Event::LockRelease { .. }
                | Event::LockSharedWait { .. }
                | Event::LockSharedObtain { .. }
                | Event::LockSharedRelease { .. }
                | Event::LockMark { .. }
                | Event::LockName { .. }
                | Event::MemAlloc { .. }
                | Event::MemAllocNamed { .. }
                | Event::MemFree { .. }
                | Event::MemFreeNamed { .. }
                | Event::CallstackSerial { .. }
                | Event::GpuNewContext { .. }
                | Event::GpuZoneBegin { .. }
                | Event::GpuZoneEnd { .. }
                | Event::GpuTime { .. }
                | Event::GpuCalibration { .. }
                | Event::GpuContextName { .. }
        )
    }

    /// Report every static string and source location the event references
    ///
    /// The worker registers these so it can answer the collector's queries.
    pub fn visit_statics(
        &self,
        mut on_str: impl FnMut(&'static str),
        mut on_srcloc: impl FnMut(&'static SourceLocation),
    ) {
        match self {
            Event::ZoneBegin { srcloc, .. }
            | Event::ZoneBeginCallstack { srcloc, .. }
            | Event::LockAnnounce { srcloc, .. }
            | Event::LockMark { srcloc, .. }
            | Event::GpuZoneBegin { srcloc, .. } => on_srcloc(*srcloc),
            Event::MessageLiteral { text, .. } | Event::MessageLiteralColor { text, .. } => on_str(*text),
            Event::FrameMark { name: Some(name), .. }
            | Event::FrameMarkStart { name, .. }
            | Event::FrameMarkEnd { name, .. }
            | Event::PlotInt { name, .. }
            | Event::PlotFloat { name, .. }
            | Event::PlotDouble { name, .. }
            | Event::PlotConfig { name, .. }
            | Event::ParamSetup { name, .. }
            | Event::MemAllocNamed { name, .. }
            | Event::MemFreeNamed { name, .. } => on_str(*name),
            _ => {}
        }
    }
}

/// Queue element: an event stamped with the epoch it was produced in
#[derive(Debug)]
pub struct QueueItem {
    pub epoch: u32,
    pub event: Event,
}
