//! # Wire Protocol Shared Between Client and Collector
//!
//! Defines the constants and fixed-size messages exchanged between an
//! instrumented process (the client) and a collector. Everything here is
//! little-endian and packed; fixed structs serialize into byte arrays of a
//! known size so both sides can read them with a single exact read.
//!
//! ## Connection Flow
//!
//! ```text
//!  collector                                   client
//!     │ ── SHIBBOLETH (8B) + PROTOCOL_VERSION (4B) ──▶ │
//!     │ ◀──────────── HandshakeStatus (1B) ─────────── │
//!     │ ◀──────────── WelcomeMessage (1174B) ───────── │  (Welcome only)
//!     │ ◀──────────── OnDemandPayload (16B) ────────── │  (on-demand only)
//!     │ ◀──── frames: {u32 len}{compressed records} ── │
//!     │ ── ServerQuery (13B) ─────────────────────────▶ │
//! ```
//!
//! ## Key Types
//!
//! - [`RecordType`] - 1-byte tag leading every serialized record
//! - [`HandshakeStatus`] - client reply to the handshake
//! - [`WelcomeMessage`] - process metadata sent once per session
//! - [`ServerQuery`] - collector → client request
//! - [`BroadcastMessage`] - UDP discovery datagram

#![no_std]

// ============================================================================
// Protocol Constants
// ============================================================================

/// Magic bytes opening every collector connection
pub const SHIBBOLETH: [u8; 8] = *b"ZoneTrce";

/// Size of [`SHIBBOLETH`] on the wire
pub const SHIBBOLETH_SIZE: usize = SHIBBOLETH.len();

/// Protocol revision; a mismatch is answered with [`HandshakeStatus::ProtocolMismatch`]
pub const PROTOCOL_VERSION: u32 = 3;

/// Revision of the [`BroadcastMessage`] layout
pub const BROADCAST_VERSION: u16 = 1;

/// Default TCP listen port and UDP broadcast port
pub const DEFAULT_PORT: u16 = 8086;

/// Size of the compressed-length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of a program name field (null-padded)
pub const PROGRAM_NAME_SIZE: usize = 64;

/// Size of the host info field (null-padded)
pub const HOST_INFO_SIZE: usize = 1024;

/// Size of the CPU manufacturer field
pub const CPU_MANUFACTURER_SIZE: usize = 12;

// Welcome flag bits
pub const WELCOME_FLAG_ON_DEMAND: u8 = 1 << 0;
pub const WELCOME_FLAG_IS_APPLE: u8 = 1 << 1;
pub const WELCOME_FLAG_CODE_TRANSFER: u8 = 1 << 2;
pub const WELCOME_FLAG_COMBINE_SAMPLES: u8 = 1 << 3;

// ============================================================================
// Record Tags
// ============================================================================

macro_rules! record_types {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Tag byte leading every serialized record
        ///
        /// Records emitted by instrumentation come first, followed by records
        /// synthesized by the worker, owned-payload blobs and query responses.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum RecordType {
            $($(#[$doc])* $name,)*
        }

        impl RecordType {
            /// Every tag in wire order
            pub const ALL: &'static [RecordType] = &[$(RecordType::$name,)*];

            /// Decode a tag byte
            #[must_use]
            pub fn from_u8(value: u8) -> Option<Self> {
                Self::ALL.get(usize::from(value)).copied()
            }
        }
    };
}

record_types! {
    ZoneBegin,
    ZoneBeginCallstack,
    /// Zone with a runtime-built source location carried as a payload blob
    ZoneBeginAllocSrcLoc,
    ZoneEnd,
    ZoneText,
    ZoneName,
    ZoneColor,
    ZoneValue,
    Message,
    MessageColor,
    /// Message whose text is a static string fetched later by query
    MessageLiteral,
    MessageLiteralColor,
    MessageAppInfo,
    FrameMarkMsg,
    FrameMarkMsgStart,
    FrameMarkMsgEnd,
    PlotDataInt,
    PlotDataFloat,
    PlotDataDouble,
    PlotConfig,
    ParamSetup,
    Callstack,
    ContextSwitch,
    ThreadWakeup,
    LockAnnounce,
    LockTerminate,
    LockWait,
    LockObtain,
    LockRelease,
    LockSharedWait,
    LockSharedObtain,
    LockSharedRelease,
    LockMark,
    LockName,
    MemAlloc,
    MemAllocNamed,
    MemFree,
    MemFreeNamed,
    /// Callstack attached to the preceding serial memory record
    CallstackSerial,
    GpuNewContext,
    GpuZoneBegin,
    GpuZoneEnd,
    GpuTime,
    GpuCalibration,
    GpuContextName,
    /// Following records belong to this thread
    ThreadContext,
    KeepAlive,
    /// Client is done; no further records follow
    Terminate,
    PayloadString,
    PayloadCallstack,
    PayloadSourceLocation,
    StringData,
    ThreadName,
    PlotName,
    FrameName,
    SourceLocation,
    CallstackFrame,
    SourceCode,
    SourceCodeNotAvailable,
    QueryNoop,
}

// ============================================================================
// Handshake
// ============================================================================

/// Outcome of a handshake attempt
///
/// The client only ever sends `Welcome`, `ProtocolMismatch` or
/// `NotAvailable`. `Pending` is the collector's state before a reply arrives
/// and `Dropped` is what the collector reports when the connection closes
/// before any reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Pending = 0,
    Welcome = 1,
    ProtocolMismatch = 2,
    NotAvailable = 3,
    Dropped = 4,
}

impl HandshakeStatus {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Welcome),
            2 => Some(Self::ProtocolMismatch),
            3 => Some(Self::NotAvailable),
            4 => Some(Self::Dropped),
            _ => None,
        }
    }
}

// ============================================================================
// Byte Helpers
// ============================================================================

/// Cursor writing little-endian fields into a fixed buffer
///
/// Panics on overflow; callers size the buffer from the struct's `SIZE`.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Copy `src` into a field of `width` bytes, truncating and null-padding
    pub fn put_padded(&mut self, src: &[u8], width: usize) {
        let field = &mut self.buf[self.pos..self.pos + width];
        field.fill(0);
        // Keep at least one terminating zero
        let n = src.len().min(width.saturating_sub(1));
        field[..n].copy_from_slice(&src[..n]);
        self.pos += width;
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }
    pub fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }
    pub fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }
    pub fn put_i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }
    pub fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }
    pub fn put_i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }
    pub fn put_f64(&mut self, v: f64) {
        self.put(&v.to_le_bytes());
    }
}

/// Cursor reading little-endian fields from a fixed buffer
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn get_u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
    pub fn get_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }
    pub fn get_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    pub fn get_i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
    pub fn get_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
    pub fn get_i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
    pub fn get_f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take())
    }
    pub fn get_array<const N: usize>(&mut self) -> [u8; N] {
        self.take()
    }
}

/// Bytes of a null-padded field up to the first zero
#[must_use]
pub fn trim_padded(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

// ============================================================================
// Welcome
// ============================================================================

/// Process metadata sent once after [`HandshakeStatus::Welcome`]
///
/// **Size**: [`WelcomeMessage::SIZE`] bytes, packed, little-endian.
#[derive(Clone, Copy, PartialEq)]
pub struct WelcomeMessage {
    /// Multiplier converting raw timer ticks to nanoseconds
    pub timer_mul: f64,
    /// Timer value when profiler initialization began
    pub init_begin: i64,
    /// Timer value when profiler initialization finished
    pub init_end: i64,
    /// Smallest observable timer step (ns)
    pub resolution: u64,
    /// Measured cost of taking a timestamp (ns)
    pub delay: u64,
    /// Process start, seconds since the unix epoch
    pub epoch: u64,
    /// Executable modification time, seconds since the unix epoch
    pub exec_time: u64,
    pub pid: u64,
    /// Sampling period in ns, 0 when sampling is unavailable
    pub sampling_period: i64,
    /// `WELCOME_FLAG_*` bits
    pub flags: u8,
    /// See [`CpuArch`]
    pub cpu_arch: u8,
    pub cpu_manufacturer: [u8; CPU_MANUFACTURER_SIZE],
    pub program_name: [u8; PROGRAM_NAME_SIZE],
    pub host_info: [u8; HOST_INFO_SIZE],
}

impl WelcomeMessage {
    pub const SIZE: usize =
        8 * 9 + 1 + 1 + CPU_MANUFACTURER_SIZE + PROGRAM_NAME_SIZE + HOST_INFO_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = ByteWriter::new(&mut out);
        w.put_f64(self.timer_mul);
        w.put_i64(self.init_begin);
        w.put_i64(self.init_end);
        w.put_u64(self.resolution);
        w.put_u64(self.delay);
        w.put_u64(self.epoch);
        w.put_u64(self.exec_time);
        w.put_u64(self.pid);
        w.put_i64(self.sampling_period);
        w.put_u8(self.flags);
        w.put_u8(self.cpu_arch);
        w.put(&self.cpu_manufacturer);
        w.put(&self.program_name);
        w.put(&self.host_info);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut r = ByteReader::new(bytes);
        Self {
            timer_mul: r.get_f64(),
            init_begin: r.get_i64(),
            init_end: r.get_i64(),
            resolution: r.get_u64(),
            delay: r.get_u64(),
            epoch: r.get_u64(),
            exec_time: r.get_u64(),
            pid: r.get_u64(),
            sampling_period: r.get_i64(),
            flags: r.get_u8(),
            cpu_arch: r.get_u8(),
            cpu_manufacturer: r.get_array(),
            program_name: r.get_array(),
            host_info: r.get_array(),
        }
    }

    #[must_use]
    pub fn is_on_demand(&self) -> bool {
        self.flags & WELCOME_FLAG_ON_DEMAND != 0
    }
}

/// CPU architecture byte in [`WelcomeMessage::cpu_arch`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    Unknown = 0,
    X86 = 1,
    X64 = 2,
    Arm32 = 3,
    Arm64 = 4,
}

/// Sent after the welcome in on-demand mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDemandPayload {
    /// Frames marked before this collector attached
    pub frames: u64,
    /// Timer value when the session started
    pub current_time: i64,
}

impl OnDemandPayload {
    pub const SIZE: usize = 16;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = ByteWriter::new(&mut out);
        w.put_u64(self.frames);
        w.put_i64(self.current_time);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut r = ByteReader::new(bytes);
        Self { frames: r.get_u64(), current_time: r.get_i64() }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Kind byte of a [`ServerQuery`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Terminate = 0,
    String = 1,
    ThreadString = 2,
    SourceLocation = 3,
    PlotName = 4,
    FrameName = 5,
    CallstackFrame = 6,
    SourceCode = 7,
    Parameter = 8,
    Disconnect = 9,
}

impl QueryKind {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Terminate),
            1 => Some(Self::String),
            2 => Some(Self::ThreadString),
            3 => Some(Self::SourceLocation),
            4 => Some(Self::PlotName),
            5 => Some(Self::FrameName),
            6 => Some(Self::CallstackFrame),
            7 => Some(Self::SourceCode),
            8 => Some(Self::Parameter),
            9 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Collector → client request: `{1B kind}{8B handle}{4B extra}`
///
/// The kind is kept raw so unknown kinds can be acknowledged instead of
/// tearing down the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerQuery {
    pub kind: u8,
    /// Opaque handle: string/source location address, thread id, code address
    pub handle: u64,
    /// Per-kind extra: request id for source code, value for parameters
    pub extra: u32,
}

impl ServerQuery {
    pub const SIZE: usize = 13;

    #[must_use]
    pub fn new(kind: QueryKind, handle: u64, extra: u32) -> Self {
        Self { kind: kind as u8, handle, extra }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = ByteWriter::new(&mut out);
        w.put_u8(self.kind);
        w.put_u64(self.handle);
        w.put_u32(self.extra);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut r = ByteReader::new(bytes);
        Self { kind: r.get_u8(), handle: r.get_u64(), extra: r.get_u32() }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// UDP datagram announcing a client waiting for a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub broadcast_version: u16,
    pub listen_port: u16,
    pub protocol_version: u32,
    pub pid: u64,
    /// Seconds since the client started, -1 while a collector is attached
    pub active_time: i32,
    pub program_name: [u8; PROGRAM_NAME_SIZE],
}

impl BroadcastMessage {
    pub const SIZE: usize = 2 + 2 + 4 + 8 + 4 + PROGRAM_NAME_SIZE;

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = ByteWriter::new(&mut out);
        w.put_u16(self.broadcast_version);
        w.put_u16(self.listen_port);
        w.put_u32(self.protocol_version);
        w.put_u64(self.pid);
        w.put_i32(self.active_time);
        w.put(&self.program_name);
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut r = ByteReader::new(bytes);
        Self {
            broadcast_version: r.get_u16(),
            listen_port: r.get_u16(),
            protocol_version: r.get_u32(),
            pid: r.get_u64(),
            active_time: r.get_i32(),
            program_name: r.get_array(),
        }
    }
}
