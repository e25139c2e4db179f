//! Chunk data: per-frame metadata appended after the pixel data.
//!
//! The trailer is a sequence of chunks, each followed by its tag, so it is
//! read from the end backwards:
//!
//! ```text
//! ... [ data (len bytes) ][ chunk id: u32 BE ][ len: u32 BE ]  <- end of trailer
//! ```
//!
//! A [`ChunkLayout`] maps chunk ids to feature names (`ChunkTimestamp`,
//! `ChunkWidth`, ...). [`ChunkDecoder::decode`] borrows the frame and returns
//! a [`ChunkFeatures`] view whose lifetime is tied to that borrow, so chunk
//! values cannot be read once the frame has been released.

use crate::error::{Result, VmbError};
use crate::feature::{
    Access, Constraint, FeatureInfo, FeatureSource, FeatureType, FeatureValue, Namespace,
    Visibility,
};
use crate::frame::Frame;
use crate::DeviceFaultKind;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::trace;

/// Encoding of a chunk value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// 8-byte big-endian signed integer.
    Integer,
    /// 8-byte big-endian IEEE 754 double.
    Float,
}

/// One known chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Tag written after the chunk data.
    pub id: u32,
    /// Entry of the `ChunkSelector` feature enabling this chunk.
    pub selector_entry: String,
    /// Name of the feature exposing the value (`Chunk` + selector entry).
    pub feature: String,
    /// Value encoding.
    pub kind: ChunkKind,
}

/// Chunk ids understood by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkLayout {
    descriptors: Vec<ChunkDescriptor>,
}

impl ChunkLayout {
    /// Empty layout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk.
    #[must_use]
    pub fn with(mut self, id: u32, selector_entry: &str, kind: ChunkKind) -> Self {
        self.descriptors.push(ChunkDescriptor {
            id,
            selector_entry: selector_entry.to_string(),
            feature: format!("Chunk{}", selector_entry),
            kind,
        });
        self
    }

    /// The chunks every simulated and SFNC-style camera offers.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(0x0A01, "Timestamp", ChunkKind::Integer)
            .with(0x0A02, "Width", ChunkKind::Integer)
            .with(0x0A03, "Height", ChunkKind::Integer)
            .with(0x0A04, "OffsetX", ChunkKind::Integer)
            .with(0x0A05, "OffsetY", ChunkKind::Integer)
            .with(0x0A06, "ExposureTime", ChunkKind::Float)
            .with(0x0A07, "Gain", ChunkKind::Float)
            .with(0x0A08, "FrameID", ChunkKind::Integer)
    }

    /// All descriptors in declaration order.
    #[must_use]
    pub fn descriptors(&self) -> &[ChunkDescriptor] {
        &self.descriptors
    }

    /// Descriptor for a chunk id.
    #[must_use]
    pub fn by_id(&self, id: u32) -> Option<&ChunkDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Descriptor for a `ChunkSelector` entry.
    #[must_use]
    pub fn by_selector(&self, entry: &str) -> Option<&ChunkDescriptor> {
        self.descriptors.iter().find(|d| d.selector_entry == entry)
    }
}

/// Location of one decoded chunk inside the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkEntry {
    name: String,
    kind: ChunkKind,
    offset: usize,
    len: usize,
}

/// Builds chunk views over completed frames.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    layout: Arc<ChunkLayout>,
}

impl ChunkDecoder {
    /// Decoder for a device's chunk layout.
    #[must_use]
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout: Arc::new(layout),
        }
    }

    /// The layout in use.
    #[must_use]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Chunk view borrowing `frame`.
    ///
    /// Fails with `InvalidState` on frames that are not `Completed` and with
    /// `NoChunkData` when the frame carries no trailer.
    pub fn decode<'f>(&self, frame: &'f Frame) -> Result<ChunkFeatures<'f>> {
        let data = trailer(frame)?;
        let entries = match &frame.chunk_index {
            Some(index) => Cow::Borrowed(index.as_slice()),
            None => Cow::Owned(self.parse(data)?),
        };
        Ok(ChunkFeatures {
            frame_id: frame.id(),
            data,
            entries,
        })
    }

    /// Decode once and cache the result in the frame, for [`Frame::chunks`].
    pub fn prepare(&self, frame: &mut Frame) -> Result<()> {
        let entries = self.parse(trailer(frame)?)?;
        frame.chunk_index = Some(entries);
        Ok(())
    }

    fn parse(&self, data: &[u8]) -> Result<Vec<ChunkEntry>> {
        let mut entries = Vec::new();
        let mut end = data.len();
        while end > 0 {
            if end < 8 {
                return Err(malformed("truncated chunk tag"));
            }
            let id = read_u32(&data[end - 8..end - 4]);
            let len = read_u32(&data[end - 4..end]) as usize;
            let start = (end - 8)
                .checked_sub(len)
                .ok_or_else(|| malformed("chunk length exceeds trailer"))?;
            match self.layout.by_id(id) {
                Some(desc) => entries.push(ChunkEntry {
                    name: desc.feature.clone(),
                    kind: desc.kind,
                    offset: start,
                    len,
                }),
                None => trace!(chunk_id = id, "Skipping unknown chunk"),
            }
            end = start;
        }
        entries.reverse();
        Ok(entries)
    }
}

impl Frame {
    /// Chunk view prepared by the acquisition engine.
    pub fn chunks(&self) -> Result<ChunkFeatures<'_>> {
        let data = trailer(self)?;
        let index = self
            .chunk_index
            .as_deref()
            .ok_or_else(|| VmbError::NotAvailable("chunk data was not decoded".into()))?;
        Ok(ChunkFeatures {
            frame_id: self.id(),
            data,
            entries: Cow::Borrowed(index),
        })
    }
}

fn trailer(frame: &Frame) -> Result<&[u8]> {
    if !frame.is_complete() {
        return Err(VmbError::InvalidState(format!(
            "frame {} is {}, chunk data is only decoded on completed frames",
            frame.id(),
            frame.status()
        )));
    }
    frame.chunk_data().ok_or(VmbError::NoChunkData)
}

fn malformed(detail: &str) -> VmbError {
    VmbError::device("chunk", DeviceFaultKind::Communication, detail)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}

fn read_8(bytes: &[u8]) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    raw
}

/// Read-only feature view over one frame's chunk trailer.
#[derive(Debug)]
pub struct ChunkFeatures<'f> {
    frame_id: u64,
    data: &'f [u8],
    entries: Cow<'f, [ChunkEntry]>,
}

impl<'f> ChunkFeatures<'f> {
    /// Id of the frame the data belongs to.
    #[must_use]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// Number of decoded chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the trailer held no known chunk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Result<&ChunkEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| VmbError::NotFound(format!("chunk feature '{}'", name)))
    }

    /// Read an integer chunk.
    pub fn read_int(&self, name: &str) -> Result<i64> {
        let value = FeatureSource::read(self, name)?;
        value.as_i64().ok_or_else(|| VmbError::TypeMismatch {
            feature: name.to_string(),
            expected: FeatureType::Integer,
            found: value.feature_type(),
        })
    }

    /// Read a float chunk.
    pub fn read_float(&self, name: &str) -> Result<f64> {
        let value = FeatureSource::read(self, name)?;
        value.as_f64().ok_or_else(|| VmbError::TypeMismatch {
            feature: name.to_string(),
            expected: FeatureType::Float,
            found: value.feature_type(),
        })
    }
}

impl FeatureSource for ChunkFeatures<'_> {
    fn feature_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    fn info(&self, name: &str) -> Result<FeatureInfo> {
        let entry = self.entry(name)?;
        let constraint = match (entry.kind, entry.len) {
            (ChunkKind::Integer, 8) => Constraint::Integer {
                min: i64::MIN,
                max: i64::MAX,
                increment: None,
            },
            (ChunkKind::Float, 8) => Constraint::Float {
                min: f64::MIN,
                max: f64::MAX,
                increment: None,
            },
            (_, len) => Constraint::Raw { max_size: len },
        };
        Ok(FeatureInfo {
            name: entry.name.clone(),
            display_name: entry.name.clone(),
            tooltip: String::new(),
            description: String::new(),
            namespace: Namespace::Standard,
            feature_type: constraint.feature_type(),
            access: Access::ReadOnly,
            visibility: Visibility::Expert,
            unit: None,
            constraint,
            selected_by: None,
            is_selector: false,
        })
    }

    fn read(&self, name: &str) -> Result<FeatureValue> {
        let entry = self.entry(name)?;
        let bytes = &self.data[entry.offset..entry.offset + entry.len];
        Ok(match (entry.kind, entry.len) {
            (ChunkKind::Integer, 8) => FeatureValue::Integer(i64::from_be_bytes(read_8(bytes))),
            (ChunkKind::Float, 8) => FeatureValue::Float(f64::from_be_bytes(read_8(bytes))),
            _ => FeatureValue::Raw(bytes.to_vec()),
        })
    }

    fn is_available(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }
}

/// Build a chunk trailer. Integer and float values take 8 bytes; raw
/// values are copied as is; other value types are skipped.
#[must_use]
pub fn encode_trailer(chunks: &[(u32, FeatureValue)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, value) in chunks {
        let data = match value {
            FeatureValue::Integer(v) => v.to_be_bytes().to_vec(),
            FeatureValue::Float(v) => v.to_be_bytes().to_vec(),
            FeatureValue::Raw(bytes) => bytes.clone(),
            _ => continue,
        };
        let len = data.len() as u32;
        out.extend_from_slice(&data);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffer, FrameHeader, FrameStatus, PixelFormat};

    fn frame_with(status: FrameStatus, trailer: &[u8]) -> Frame {
        let mut frame = Frame::new(FrameBuffer::Application(vec![0u8; 64 + trailer.len()]));
        frame.buffer_mut()[16..16 + trailer.len()].copy_from_slice(trailer);
        frame.finish(FrameHeader {
            frame_id: 3,
            status,
            width: 4,
            height: 4,
            offset_x: 0,
            offset_y: 0,
            pixel_format: PixelFormat::Mono8,
            timestamp: 99,
            image_size: 16,
            chunk_size: trailer.len(),
        });
        frame
    }

    fn sample_trailer() -> Vec<u8> {
        encode_trailer(&[
            (0x0A01, FeatureValue::Integer(123_456)),
            (0x0A02, FeatureValue::Integer(4)),
            (0x0A06, FeatureValue::Float(5000.5)),
            (0xBEEF, FeatureValue::Raw(vec![1, 2, 3])),
        ])
    }

    #[test]
    fn test_decode_completed_frame() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let frame = frame_with(FrameStatus::Completed, &sample_trailer());
        let chunks = decoder.decode(&frame).unwrap();

        assert_eq!(
            chunks.feature_names(),
            vec!["ChunkTimestamp", "ChunkWidth", "ChunkExposureTime"]
        );
        assert_eq!(chunks.read_int("ChunkTimestamp").unwrap(), 123_456);
        assert_eq!(chunks.read_float("ChunkExposureTime").unwrap(), 5000.5);
        assert_eq!(chunks.frame_id(), 3);
        assert!(matches!(
            chunks.read_float("ChunkWidth"),
            Err(VmbError::TypeMismatch { .. })
        ));
        assert!(matches!(
            chunks.read_int("ChunkGain"),
            Err(VmbError::NotFound(_))
        ));
    }

    #[test]
    fn test_no_chunk_data() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let frame = frame_with(FrameStatus::Completed, &[]);
        assert_eq!(decoder.decode(&frame).err(), Some(VmbError::NoChunkData));
    }

    #[test]
    fn test_incomplete_frame_rejected() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let frame = frame_with(FrameStatus::Incomplete, &sample_trailer());
        assert!(matches!(
            decoder.decode(&frame),
            Err(VmbError::InvalidState(_))
        ));
    }

    #[test]
    fn test_truncated_trailer() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let mut trailer = sample_trailer();
        trailer.drain(..4);
        let frame = frame_with(FrameStatus::Completed, &trailer);
        assert!(matches!(decoder.decode(&frame), Err(VmbError::Device(_))));
    }

    #[test]
    fn test_prepared_chunks_on_frame() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let mut frame = frame_with(FrameStatus::Completed, &sample_trailer());
        assert!(matches!(frame.chunks(), Err(VmbError::NotAvailable(_))));

        decoder.prepare(&mut frame).unwrap();
        let chunks = frame.chunks().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.read_int("ChunkWidth").unwrap(), 4);
        assert_eq!(chunks.display_value("ChunkWidth"), "4");
    }

    #[test]
    fn test_chunk_info_is_read_only() {
        let decoder = ChunkDecoder::new(ChunkLayout::standard());
        let frame = frame_with(FrameStatus::Completed, &sample_trailer());
        let chunks = decoder.decode(&frame).unwrap();
        let info = chunks.info("ChunkExposureTime").unwrap();
        assert_eq!(info.access, Access::ReadOnly);
        assert_eq!(info.feature_type, FeatureType::Float);
    }

    #[test]
    fn test_layout_lookup() {
        let layout = ChunkLayout::standard();
        assert_eq!(layout.by_selector("Gain").unwrap().feature, "ChunkGain");
        assert!(layout.by_id(0xFFFF).is_none());
    }
}
