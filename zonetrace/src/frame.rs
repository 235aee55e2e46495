//! Output framing and compression
//!
//! Serialized records accumulate in a [`FrameBuffer`]. A completed frame is
//! compressed as a unit and written with a 4-byte length prefix:
//!
//! ```text
//!  ┌────────────────┬───────────────────────────────────────────┐
//!  │ u32 LE: n      │ n bytes: codec output for one whole frame │
//!  └────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Records are never split: appending a record that would overflow the
//! target flushes what is already buffered first.

use zonetrace_common::FRAME_HEADER_SIZE;

use crate::domain::ProtocolError;

/// Default target size for an uncompressed frame
pub const DEFAULT_FRAME_TARGET: usize = 256 * 1024;

/// Largest uncompressed frame a collector accepts
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Block compressor applied to whole frames
pub trait Codec: Send {
    fn compress(&mut self, frame: &[u8]) -> Vec<u8>;

    /// # Errors
    /// `ProtocolError::FrameTooLarge` if the block declares more than
    /// `max_size` bytes, `ProtocolError::Codec` if it is corrupt.
    fn decompress(&mut self, block: &[u8], max_size: usize) -> Result<Vec<u8>, ProtocolError>;
}

/// LZ4 block format with the uncompressed size prepended
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&mut self, frame: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(frame)
    }

    fn decompress(&mut self, block: &[u8], max_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let declared = block
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(ProtocolError::Truncated { needed: 4, available: block.len() })?;
        let declared = declared as usize;
        if declared > max_size {
            return Err(ProtocolError::FrameTooLarge(declared));
        }
        lz4_flex::decompress_size_prepended(block).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

/// Compress `frame` and prepend the wire length header
pub fn encode_frame(codec: &mut dyn Codec, frame: &[u8]) -> Vec<u8> {
    let block = codec.compress(frame);
    let len = u32::try_from(block.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + block.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&block);
    out
}

/// Append-only staging buffer bounded by a target size
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    target: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(target: usize) -> Self {
        Self { buf: Vec::with_capacity(target), target: target.max(1) }
    }

    /// Add one whole record, handing completed frames to `flush`
    ///
    /// # Errors
    /// Propagates the first error returned by `flush`; the buffer keeps its
    /// contents in that case.
    pub fn append<E>(
        &mut self,
        record: &[u8],
        mut flush: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        if !self.buf.is_empty() && self.buf.len() + record.len() > self.target {
            self.complete(&mut flush)?;
        }
        self.buf.extend_from_slice(record);
        if self.buf.len() >= self.target {
            self.complete(&mut flush)?;
        }
        Ok(())
    }

    /// Flush whatever is buffered as a frame; no-op when empty
    ///
    /// # Errors
    /// Propagates the error returned by `flush`.
    pub fn complete<E>(&mut self, mut flush: impl FnMut(&[u8]) -> Result<(), E>) -> Result<(), E> {
        if self.buf.is_empty() {
            return Ok(());
        }
        flush(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Discard a partially built frame
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::convert::Infallible;

    fn run(target: usize, records: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut frames = Vec::new();
        let mut buffer = FrameBuffer::new(target);
        for record in records {
            buffer
                .append(record, |frame| {
                    frames.push(frame.to_vec());
                    Ok::<_, Infallible>(())
                })
                .unwrap();
        }
        let mut last = Vec::new();
        buffer
            .complete(|frame| {
                last = frame.to_vec();
                Ok::<_, Infallible>(())
            })
            .unwrap();
        (frames, last)
    }

    #[test]
    fn test_record_is_never_split() {
        let records = vec![vec![1; 6], vec![2; 6], vec![3; 3]];
        let (frames, last) = run(10, &records);
        assert_eq!(frames, vec![vec![1; 6]]);
        assert_eq!(last, [vec![2; 6], vec![3; 3]].concat());
    }

    #[test]
    fn test_oversized_record_travels_alone() {
        let (frames, last) = run(4, &[vec![9; 3], vec![8; 10]]);
        assert_eq!(frames, vec![vec![9; 3], vec![8; 10]]);
        assert!(last.is_empty());
    }

    #[test]
    fn test_flush_error_keeps_buffer() {
        let mut buffer = FrameBuffer::new(4);
        buffer.append(&[1, 2, 3], |_| Ok::<_, ()>(())).unwrap();
        assert_eq!(buffer.append(&[4, 5], |_| Err(())), Err(()));
        assert_eq!(buffer.len(), 3);
        buffer.reset();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_lz4_frame_round_trip_and_limit() {
        let mut codec = Lz4Codec;
        let frame = b"zone zone zone zone zone zone".repeat(20);
        let wire = encode_frame(&mut codec, &frame);
        let len = u32::from_le_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(len, wire.len() - FRAME_HEADER_SIZE);
        assert!(len < frame.len());

        let block = &wire[FRAME_HEADER_SIZE..];
        assert_eq!(codec.decompress(block, MAX_FRAME_SIZE).unwrap(), frame);
        assert!(matches!(codec.decompress(block, 16), Err(ProtocolError::FrameTooLarge(n)) if n == frame.len()));
        assert!(matches!(codec.decompress(&[1, 2], 16), Err(ProtocolError::Truncated { .. })));
    }

    proptest! {
        #[test]
        fn test_flushed_frames_concatenate_to_input(
            target in 1usize..64,
            records in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..40),
        ) {
            let (frames, last) = run(target, &records);
            let mut joined: Vec<u8> = frames.concat();
            joined.extend_from_slice(&last);
            prop_assert_eq!(&joined, &records.concat());

            let total: usize = records.iter().map(Vec::len).sum();
            if total > target {
                prop_assert!(!frames.is_empty());
            }
            for frame in &frames {
                prop_assert!(!frame.is_empty());
            }
        }
    }
}
