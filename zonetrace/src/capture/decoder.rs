//! Per-connection record decoding with thread context tracking

use crate::domain::ProtocolError;
use crate::wire::{Record, RecordDecoder};

/// A record together with the thread it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub thread: u32,
    pub record: Record,
}

/// Decodes a session's frames in order
///
/// `ThreadContext` records are consumed here and only change the thread
/// attributed to what follows. Records that carry their own thread (serial
/// kinds) are attributed to it instead.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    records: RecordDecoder,
    thread: u32,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Whatever the record decoder rejects; the rest of the frame is lost.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<DecodedRecord>, ProtocolError> {
        let mut out = Vec::new();
        for record in self.records.decode_frame(frame)? {
            if let Record::ThreadContext { thread } = record {
                self.thread = thread;
                continue;
            }
            let thread = own_thread(&record).unwrap_or(self.thread);
            out.push(DecodedRecord { thread, record });
        }
        Ok(out)
    }

    /// Thread of the most recent `ThreadContext`
    #[must_use]
    pub fn thread(&self) -> u32 {
        self.thread
    }
}

fn own_thread(record: &Record) -> Option<u32> {
    match *record {
        Record::ContextSwitch { new_thread: thread, .. }
        | Record::ThreadWakeup { thread, .. }
        | Record::Lock { thread, .. }
        | Record::LockMark { thread, .. }
        | Record::MemAlloc { thread, .. }
        | Record::MemFree { thread, .. }
        | Record::GpuNewContext { thread, .. }
        | Record::GpuZoneBegin { thread, .. }
        | Record::GpuZoneEnd { thread, .. } => Some(thread),
        _ => None,
    }
}
