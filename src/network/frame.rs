use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::buffer::PooledBuffer;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Size of the wire envelope header: `u16 size | u16 message_id | i64 send_timestamp`.
pub const FRAME_HEADER_SIZE: usize = 12;

/// One complete protocol message as it appears on the wire.
///
/// `size` counts from the start of the header, so a frame occupies exactly
/// `FRAME_HEADER_SIZE + body.len()` bytes. All header fields are
/// little-endian fixed width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u16,
    pub send_timestamp: i64,
    pub body: Bytes,
}

impl Frame {
    /// Builds a frame stamped with the current wall-clock time in millis.
    pub fn new(message_id: u16, body: Bytes) -> Frame {
        Frame {
            message_id,
            send_timestamp: Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn with_timestamp(message_id: u16, send_timestamp: i64, body: Bytes) -> Frame {
        Frame {
            message_id,
            send_timestamp,
            body,
        }
    }

    pub fn total_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }
}

/// A decoded frame borrowing its body from the receive buffer.
///
/// The body slice points at the exact byte range inside the buffer, so
/// dispatch is zero-copy; handlers that need the bytes past the dispatch
/// call copy them out via [`to_frame`](FrameView::to_frame).
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub message_id: u16,
    pub send_timestamp: i64,
    pub body: &'a [u8],
}

impl FrameView<'_> {
    pub fn to_frame(&self) -> Frame {
        Frame {
            message_id: self.message_id,
            send_timestamp: self.send_timestamp,
            body: Bytes::copy_from_slice(self.body),
        }
    }
}

/// Serializes and deserializes the wire envelope against a size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Checks whether `src` starts with a complete frame.
    ///
    /// Returns the total frame size on success, `Err(Incomplete)` when more
    /// data is needed, and a protocol error when the declared size is out of
    /// bounds.
    fn check(&self, src: &[u8]) -> AppResult<usize> {
        if src.len() < 2 {
            return Err(Incomplete);
        }
        let declared = u16::from_le_bytes([src[0], src[1]]) as usize;
        if declared < FRAME_HEADER_SIZE {
            return Err(AppError::ProtocolViolation(format!(
                "declared frame size {} is smaller than the {} byte header",
                declared, FRAME_HEADER_SIZE
            )));
        }
        if declared > self.max_frame_size {
            return Err(AppError::FrameTooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }
        if src.len() < declared {
            return Err(Incomplete);
        }
        Ok(declared)
    }

    /// Decodes the frame at the start of `src`.
    ///
    /// Yields `None` when the range does not yet hold a complete frame (wait
    /// for more data), otherwise a zero-copy view plus the number of bytes
    /// consumed, so the caller can advance its read cursor. An out-of-bounds
    /// declared size is a protocol error and must terminate the connection.
    pub fn decode<'a>(&self, src: &'a [u8]) -> AppResult<Option<(FrameView<'a>, usize)>> {
        let total = match self.check(src) {
            Ok(total) => total,
            Err(Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let message_id = u16::from_le_bytes([src[2], src[3]]);
        let send_timestamp = i64::from_le_bytes(
            src[4..12]
                .try_into()
                .map_err(|_| AppError::ProtocolViolation("truncated frame header".to_string()))?,
        );
        let view = FrameView {
            message_id,
            send_timestamp,
            body: &src[FRAME_HEADER_SIZE..total],
        };
        Ok(Some((view, total)))
    }

    /// Encodes `frame` into the free space of a pooled buffer.
    ///
    /// Fails if the frame exceeds the configured maximum or the destination
    /// buffer's remaining space.
    pub fn encode(&self, frame: &Frame, dst: &mut PooledBuffer) -> AppResult<()> {
        let total = self.checked_total_size(frame)?;
        let space = dst.open(total)?;
        space[0..2].copy_from_slice(&(total as u16).to_le_bytes());
        space[2..4].copy_from_slice(&frame.message_id.to_le_bytes());
        space[4..12].copy_from_slice(&frame.send_timestamp.to_le_bytes());
        space[FRAME_HEADER_SIZE..].copy_from_slice(&frame.body);
        dst.commit(total)
    }

    /// Encodes `frame` into a standalone byte chunk for the send queue.
    pub fn encode_to_bytes(&self, frame: &Frame) -> AppResult<Bytes> {
        let total = self.checked_total_size(frame)?;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16_le(total as u16);
        buf.put_u16_le(frame.message_id);
        buf.put_i64_le(frame.send_timestamp);
        buf.put_slice(&frame.body);
        Ok(buf.freeze())
    }

    fn checked_total_size(&self, frame: &Frame) -> AppResult<usize> {
        let total = frame.total_size();
        if total > self.max_frame_size || total > u16::MAX as usize {
            return Err(AppError::FrameTooLarge {
                size: total,
                max: self.max_frame_size.min(u16::MAX as usize),
            });
        }
        Ok(total)
    }
}
