//! Client side of the connection handshake
//!
//! ```text
//!  collector                         client
//!  ─────────                         ──────
//!  "ZoneTrce" (8 bytes)  ─────────▶  wrong or late: close silently
//!  u32 LE version        ─────────▶  evaluate
//!                        ◀─────────  status byte
//!                        ◀─────────  WelcomeMessage          (Welcome only)
//!                        ◀─────────  OnDemandPayload         (on-demand only)
//!                        ◀─────────  frames ...
//! ```

use std::time::{Duration, SystemTime};

use log::warn;
use zonetrace_common::{
    trim_padded, CpuArch, HandshakeStatus, WelcomeMessage, CPU_MANUFACTURER_SIZE, HOST_INFO_SIZE,
    PROGRAM_NAME_SIZE, PROTOCOL_VERSION, SHIBBOLETH, SHIBBOLETH_SIZE,
};

use crate::clock;
use crate::domain::{Pid, TransportError};
use crate::transport::Connection;

/// How long a collector gets to identify itself
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Status to answer a collector with, or `None` to hang up without a word
#[must_use]
pub fn evaluate_handshake(
    shibboleth: &[u8; SHIBBOLETH_SIZE],
    version: u32,
    shutting_down: bool,
) -> Option<HandshakeStatus> {
    if *shibboleth != SHIBBOLETH {
        return None;
    }
    if version != PROTOCOL_VERSION {
        return Some(HandshakeStatus::ProtocolMismatch);
    }
    if shutting_down {
        return Some(HandshakeStatus::NotAvailable);
    }
    Some(HandshakeStatus::Welcome)
}

/// Read the collector's greeting and answer with a status byte
///
/// Returns the status sent, or `None` if the peer was not a collector.
///
/// # Errors
/// Transport failures other than a silent or wrong greeting.
pub fn perform_handshake(
    conn: &mut dyn Connection,
    shutting_down: bool,
) -> Result<Option<HandshakeStatus>, TransportError> {
    let mut shibboleth = [0u8; SHIBBOLETH_SIZE];
    match conn.recv_exact(&mut shibboleth, HANDSHAKE_TIMEOUT) {
        Ok(()) => {}
        Err(TransportError::Timeout(_) | TransportError::Closed) => return Ok(None),
        Err(e) => return Err(e),
    }
    if shibboleth != SHIBBOLETH {
        warn!("Rejected connection with unknown greeting");
        return Ok(None);
    }

    let mut version = [0u8; 4];
    conn.recv_exact(&mut version, HANDSHAKE_TIMEOUT)?;
    let version = u32::from_le_bytes(version);

    let Some(status) = evaluate_handshake(&shibboleth, version, shutting_down) else {
        return Ok(None);
    };
    match status {
        HandshakeStatus::ProtocolMismatch => {
            warn!("Collector speaks protocol {version}, we speak {PROTOCOL_VERSION}");
        }
        HandshakeStatus::NotAvailable => warn!("Collector arrived during shutdown, turned away"),
        _ => {}
    }
    conn.send(&[status as u8])?;
    Ok(Some(status))
}

/// Copy `text` into a null-padded fixed field, truncating on a char boundary
///
/// A text of exactly `N` bytes fills the field with no terminator.
#[must_use]
pub fn fixed_field<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut end = text.len().min(N);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&text.as_bytes()[..end]);
    out
}

/// Process metadata gathered once at startup and sent with every Welcome
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub init_begin: i64,
    pub init_end: i64,
    pub resolution: u64,
    pub delay: u64,
    pub epoch: u64,
    pub exec_time: u64,
    pub pid: Pid,
    pub program_name: String,
    pub host_info: String,
    pub cpu_manufacturer: String,
    pub cpu_arch: CpuArch,
}

impl ProcessInfo {
    /// Measure the clock and describe the host
    #[must_use]
    pub fn gather(program_name: &str, init_begin: i64) -> Self {
        let resolution = clock::resolution(1_000);
        let delay = clock::read_cost(1_000);
        let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();

        Self {
            init_begin,
            init_end: clock::now(),
            resolution,
            delay,
            epoch: clock::unix_seconds(SystemTime::now()),
            exec_time: executable_mtime(),
            pid: Pid::current(),
            program_name: program_name.to_string(),
            host_info: host_info(&cpuinfo, &meminfo),
            cpu_manufacturer: cpuinfo_field(&cpuinfo, "vendor_id").unwrap_or("unknown").to_string(),
            cpu_arch: cpu_arch(),
        }
    }

    /// Welcome carrying this metadata and the given `WELCOME_FLAG_*` bits
    #[must_use]
    pub fn welcome(&self, flags: u8) -> WelcomeMessage {
        WelcomeMessage {
            timer_mul: 1.0,
            init_begin: self.init_begin,
            init_end: self.init_end,
            resolution: self.resolution,
            delay: self.delay,
            epoch: self.epoch,
            exec_time: self.exec_time,
            pid: u64::from(self.pid.0),
            sampling_period: 0,
            flags,
            cpu_arch: self.cpu_arch as u8,
            cpu_manufacturer: fixed_field::<CPU_MANUFACTURER_SIZE>(&self.cpu_manufacturer),
            program_name: fixed_field::<PROGRAM_NAME_SIZE>(&self.program_name),
            host_info: fixed_field::<HOST_INFO_SIZE>(&self.host_info),
        }
    }
}

/// File name of the running executable, or "unknown"
#[must_use]
pub fn default_program_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn executable_mtime() -> u64 {
    std::env::current_exe()
        .and_then(std::fs::metadata)
        .and_then(|m| m.modified())
        .map_or(0, clock::unix_seconds)
}

const fn cpu_arch() -> CpuArch {
    if cfg!(target_arch = "x86_64") {
        CpuArch::X64
    } else if cfg!(target_arch = "x86") {
        CpuArch::X86
    } else if cfg!(target_arch = "aarch64") {
        CpuArch::Arm64
    } else if cfg!(target_arch = "arm") {
        CpuArch::Arm32
    } else {
        CpuArch::Unknown
    }
}

/// `key : value` lookup in `/proc/cpuinfo` text
fn cpuinfo_field<'a>(cpuinfo: &'a str, key: &str) -> Option<&'a str> {
    cpuinfo.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn mem_total_mb(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

#[allow(unsafe_code)] // gethostname has no std wrapper
fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for buf.len() bytes and outlives the call
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(trim_padded(&buf)).into_owned()
}

fn host_info(cpuinfo: &str, meminfo: &str) -> String {
    use std::fmt::Write as _;

    let mut info = String::new();
    let _ = writeln!(info, "OS: {}", std::env::consts::OS);
    let _ = writeln!(info, "Compiler: rustc");
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let _ = writeln!(info, "User: {user}@{}", host_name());
    let _ = writeln!(info, "Arch: {}", std::env::consts::ARCH);
    if let Some(model) = cpuinfo_field(cpuinfo, "model name") {
        let _ = writeln!(info, "CPU: {model}");
    }
    let cores = std::thread::available_parallelism().map_or(0, std::num::NonZeroUsize::get);
    let _ = writeln!(info, "CPU cores: {cores}");
    if let Some(mb) = mem_total_mb(meminfo) {
        let _ = writeln!(info, "RAM: {mb} MB");
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MemoryConnection;

    fn greeting(version: u32) -> Vec<u8> {
        let mut bytes = SHIBBOLETH.to_vec();
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes
    }

    #[test]
    fn test_evaluate_each_status() {
        assert_eq!(evaluate_handshake(b"NotTrace", PROTOCOL_VERSION, false), None);
        assert_eq!(
            evaluate_handshake(&SHIBBOLETH, PROTOCOL_VERSION + 1, false),
            Some(HandshakeStatus::ProtocolMismatch)
        );
        // A version mismatch wins over shutdown: the collector should learn why
        assert_eq!(
            evaluate_handshake(&SHIBBOLETH, PROTOCOL_VERSION + 1, true),
            Some(HandshakeStatus::ProtocolMismatch)
        );
        assert_eq!(
            evaluate_handshake(&SHIBBOLETH, PROTOCOL_VERSION, true),
            Some(HandshakeStatus::NotAvailable)
        );
        assert_eq!(evaluate_handshake(&SHIBBOLETH, PROTOCOL_VERSION, false), Some(HandshakeStatus::Welcome));
    }

    #[test]
    fn test_perform_sends_status_byte() {
        let mut conn = MemoryConnection::with_inbound(&greeting(PROTOCOL_VERSION));
        let status = perform_handshake(&mut conn, false).unwrap();
        assert_eq!(status, Some(HandshakeStatus::Welcome));
        assert_eq!(conn.sent(), vec![HandshakeStatus::Welcome as u8]);

        let mut conn = MemoryConnection::with_inbound(&greeting(1));
        assert_eq!(perform_handshake(&mut conn, false).unwrap(), Some(HandshakeStatus::ProtocolMismatch));
        assert_eq!(conn.sent(), vec![HandshakeStatus::ProtocolMismatch as u8]);
    }

    #[test]
    fn test_silent_close_on_wrong_or_missing_greeting() {
        let mut conn = MemoryConnection::with_inbound(b"GET / HTTP/1.1\r\n");
        assert_eq!(perform_handshake(&mut conn, false).unwrap(), None);
        assert!(conn.sent().is_empty());

        let mut conn = MemoryConnection::with_inbound(b"Zone");
        assert_eq!(perform_handshake(&mut conn, false).unwrap(), None);
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_fixed_field_truncates_and_pads() {
        let field = fixed_field::<8>("abc");
        assert_eq!(&field, b"abc\0\0\0\0\0");
        let field = fixed_field::<12>("GenuineIntel");
        assert_eq!(&field, b"GenuineIntel");
        let field = fixed_field::<4>("abcdef");
        assert_eq!(&field, b"abcd");
        // 'é' is two bytes and must not be split
        let field = fixed_field::<3>("aaé");
        assert_eq!(trim_padded(&field), "aa".as_bytes());
    }

    #[test]
    fn test_welcome_carries_metadata() {
        let info = ProcessInfo::gather("render-server", clock::now());
        assert!(info.init_end >= info.init_begin);
        let welcome = info.welcome(zonetrace_common::WELCOME_FLAG_ON_DEMAND);
        assert!(welcome.is_on_demand());
        assert_eq!(trim_padded(&welcome.program_name), b"render-server");
        assert_eq!(welcome.pid, u64::from(std::process::id()));
        let host = String::from_utf8_lossy(trim_padded(&welcome.host_info)).into_owned();
        assert!(host.starts_with("OS: "));
        assert!(host.contains("CPU cores: "));
    }

    #[test]
    fn test_proc_text_parsing() {
        let cpuinfo = "processor\t: 0\nvendor_id\t: GenuineIntel\nmodel name\t: Example CPU @ 3.00GHz\n";
        assert_eq!(cpuinfo_field(cpuinfo, "vendor_id"), Some("GenuineIntel"));
        assert_eq!(cpuinfo_field(cpuinfo, "model name"), Some("Example CPU @ 3.00GHz"));
        assert_eq!(cpuinfo_field(cpuinfo, "flags"), None);
        assert_eq!(mem_total_mb("MemTotal:       16384000 kB\nMemFree: 1 kB\n"), Some(16_000));
    }
}
