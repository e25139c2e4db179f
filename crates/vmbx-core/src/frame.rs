//! Frames: one capture result plus the buffer it lives in.
//!
//! A [`Frame`] wraps the payload memory and the metadata the transport
//! writes when it fills the buffer. The payload is laid out as
//!
//! ```text
//! [ image_size bytes of pixel data ][ chunk_size bytes of chunk trailer ][ unused ]
//! ```
//!
//! Frames circulate through a [`FrameQueue`](vmbx_pool::FrameQueue); the
//! consumer only ever sees them behind a queue guard, so the buffer is owned
//! by exactly one holder at a time.

use crate::chunk::ChunkEntry;
use crate::error::{Result, VmbError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use vmbx_pool::{AllocationMode, PayloadBuffer};

/// Memory behind a frame.
pub enum FrameBuffer {
    /// Allocated by the application.
    Application(Vec<u8>),
    /// Lent by the transport; returns to the transport pool when dropped.
    Transport(PayloadBuffer),
}

impl FrameBuffer {
    /// Whole buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FrameBuffer::Application(v) => v,
            FrameBuffer::Transport(b) => b.as_slice(),
        }
    }

    /// Whole buffer, mutable.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            FrameBuffer::Application(v) => v,
            FrameBuffer::Transport(b) => b.as_mut_slice(),
        }
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True for a zero-sized buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Who allocated the memory.
    #[must_use]
    pub fn origin(&self) -> AllocationMode {
        match self {
            FrameBuffer::Application(_) => AllocationMode::ApplicationAllocates,
            FrameBuffer::Transport(_) => AllocationMode::TransportAllocates,
        }
    }
}

/// Terminal state of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameStatus {
    /// Every byte arrived.
    Completed,
    /// Data was lost in transit; pixel content is partial.
    Incomplete,
    /// The buffer was too small for the payload.
    TooSmall,
    /// The transport rejected the frame.
    Invalid,
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FrameStatus::Completed => "Completed",
            FrameStatus::Incomplete => "Incomplete",
            FrameStatus::TooSmall => "TooSmall",
            FrameStatus::Invalid => "Invalid",
        };
        f.write_str(label)
    }
}

/// Pixel layout of the image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PixelFormat {
    /// 8 bits per pixel.
    Mono8,
    /// 10 bits in 16-bit little-endian words.
    Mono10,
    /// 12 bits in 16-bit little-endian words.
    Mono12,
    /// 16 bits per pixel, little-endian.
    Mono16,
}

impl PixelFormat {
    /// Storage bytes per pixel.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono10 | PixelFormat::Mono12 | PixelFormat::Mono16 => 2,
        }
    }

    /// Significant bits per pixel.
    #[must_use]
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Mono10 => 10,
            PixelFormat::Mono12 => 12,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Entry name of the `PixelFormat` feature.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono16 => "Mono16",
        }
    }

    /// Parse a `PixelFormat` entry name.
    pub fn from_entry(name: &str) -> Result<Self> {
        match name {
            "Mono8" => Ok(PixelFormat::Mono8),
            "Mono10" => Ok(PixelFormat::Mono10),
            "Mono12" => Ok(PixelFormat::Mono12),
            "Mono16" => Ok(PixelFormat::Mono16),
            other => Err(VmbError::NotImplemented(format!("pixel format '{}'", other))),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata written by the transport when it finishes a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameHeader {
    /// Device frame counter.
    pub frame_id: u64,
    /// Terminal state.
    pub status: FrameStatus,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Horizontal ROI offset.
    pub offset_x: u32,
    /// Vertical ROI offset.
    pub offset_y: u32,
    /// Pixel layout.
    pub pixel_format: PixelFormat,
    /// Device timestamp in nanoseconds.
    pub timestamp: u64,
    /// Bytes of pixel data at the start of the buffer.
    pub image_size: usize,
    /// Bytes of chunk trailer following the pixel data (0 = none).
    pub chunk_size: usize,
}

impl FrameHeader {
    fn empty() -> Self {
        Self {
            frame_id: 0,
            status: FrameStatus::Invalid,
            width: 0,
            height: 0,
            offset_x: 0,
            offset_y: 0,
            pixel_format: PixelFormat::Mono8,
            timestamp: 0,
            image_size: 0,
            chunk_size: 0,
        }
    }
}

/// One capture result.
pub struct Frame {
    buffer: FrameBuffer,
    header: FrameHeader,
    received_at: Option<DateTime<Utc>>,
    pub(crate) chunk_index: Option<Vec<ChunkEntry>>,
}

impl Frame {
    /// Wrap a buffer that has not received data yet.
    #[must_use]
    pub fn new(buffer: FrameBuffer) -> Self {
        Self {
            buffer,
            header: FrameHeader::empty(),
            received_at: None,
            chunk_index: None,
        }
    }

    /// Transport side: mutable access to the buffer before [`finish`](Self::finish).
    #[must_use]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Transport side: record the frame metadata.
    ///
    /// Sizes that do not fit the buffer turn the frame into `TooSmall`.
    pub fn finish(&mut self, mut header: FrameHeader) {
        if header.image_size + header.chunk_size > self.buffer.len() {
            header.status = FrameStatus::TooSmall;
            header.image_size = header.image_size.min(self.buffer.len());
            header.chunk_size = 0;
        }
        self.header = header;
        self.received_at = Some(Utc::now());
        self.chunk_index = None;
    }

    /// Metadata as written by the transport.
    #[must_use]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Device frame counter.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.header.frame_id
    }

    /// Terminal state.
    #[must_use]
    pub fn status(&self) -> FrameStatus {
        self.header.status
    }

    /// True for [`FrameStatus::Completed`].
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.header.status == FrameStatus::Completed
    }

    /// Image width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.header.width
    }

    /// Image height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Pixel layout.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.header.pixel_format
    }

    /// Device timestamp in nanoseconds.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Host time at which the transport finished the frame.
    #[must_use]
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    /// Pixel data.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.header.image_size]
    }

    /// Whether the frame carries a chunk trailer.
    #[must_use]
    pub fn has_chunk_data(&self) -> bool {
        self.header.chunk_size > 0
    }

    /// Raw chunk trailer, if present.
    #[must_use]
    pub fn chunk_data(&self) -> Option<&[u8]> {
        if !self.has_chunk_data() {
            return None;
        }
        let start = self.header.image_size;
        Some(&self.buffer.as_slice()[start..start + self.header.chunk_size])
    }

    /// Who allocated the buffer.
    #[must_use]
    pub fn origin(&self) -> AllocationMode {
        self.buffer.origin()
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Give the buffer back, e.g. after revoking it from a session.
    #[must_use]
    pub fn into_buffer(self) -> FrameBuffer {
        self.buffer
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.header.frame_id)
            .field("status", &self.header.status)
            .field("size", &format_args!("{}x{}", self.header.width, self.header.height))
            .field("chunk_size", &self.header.chunk_size)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(image_size: usize, chunk_size: usize) -> FrameHeader {
        FrameHeader {
            frame_id: 7,
            status: FrameStatus::Completed,
            width: 4,
            height: 2,
            offset_x: 0,
            offset_y: 0,
            pixel_format: PixelFormat::Mono8,
            timestamp: 1_000,
            image_size,
            chunk_size,
        }
    }

    #[test]
    fn test_fresh_frame_is_empty() {
        let frame = Frame::new(FrameBuffer::Application(vec![0u8; 32]));
        assert_eq!(frame.status(), FrameStatus::Invalid);
        assert!(frame.image().is_empty());
        assert!(frame.chunk_data().is_none());
        assert!(frame.received_at().is_none());
    }

    #[test]
    fn test_finish_splits_image_and_chunks() {
        let mut frame = Frame::new(FrameBuffer::Application(vec![0u8; 32]));
        frame.buffer_mut()[..8].copy_from_slice(&[1; 8]);
        frame.buffer_mut()[8..12].copy_from_slice(&[2; 4]);
        frame.finish(header(8, 4));

        assert!(frame.is_complete());
        assert_eq!(frame.id(), 7);
        assert_eq!(frame.image(), &[1; 8]);
        assert_eq!(frame.chunk_data(), Some(&[2u8; 4][..]));
        assert!(frame.received_at().is_some());
    }

    #[test]
    fn test_oversized_payload_marks_too_small() {
        let mut frame = Frame::new(FrameBuffer::Application(vec![0u8; 8]));
        frame.finish(header(8, 4));
        assert_eq!(frame.status(), FrameStatus::TooSmall);
        assert!(!frame.has_chunk_data());
        assert_eq!(frame.image().len(), 8);
    }

    #[test]
    fn test_pixel_format_entries() {
        assert_eq!(PixelFormat::from_entry("Mono12").unwrap(), PixelFormat::Mono12);
        assert_eq!(PixelFormat::Mono12.bytes_per_pixel(), 2);
        assert!(matches!(
            PixelFormat::from_entry("BayerRG8"),
            Err(VmbError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_origin_follows_buffer() {
        let frame = Frame::new(FrameBuffer::Application(vec![0u8; 4]));
        assert_eq!(frame.origin(), AllocationMode::ApplicationAllocates);
    }
}
