//! # Transport Boundary
//!
//! The sender hands every encoded frame to a [`Transport`] as a
//! [`VideoFrameRecord`]. The network transport itself lives outside this
//! crate; two local transports are provided:
//!
//! - [`CountingTransport`] - counts frames and bytes, optionally keeps a log
//! - [`RawFileTransport`] - appends payloads to a file (playable as rawvideo)

use crate::frame::{EncodedFrame, FourCC};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,
    #[error("Transport rejected frame: {0}")]
    Rejected(String),
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ask the receiver to generate timecode
pub const TIMECODE_SYNTHESIZE: i64 = i64::MAX;

/// Frame rate as an N/D fraction with millisecond precision
pub fn frame_rate_fraction(fps: f64) -> (i32, i32) {
    let num = if fps.is_finite() && fps > 0.0 {
        (fps * 1000.0).round().min(i32::MAX as f64) as i32
    } else {
        0
    };
    (num, 1000)
}

// ============================================================================
// Frame Record
// ============================================================================

/// One outgoing video frame, borrowing the encoded buffer
#[derive(Debug, Clone, Copy)]
pub struct VideoFrameRecord<'a> {
    pub xres: u32,
    pub yres: u32,
    pub fourcc: FourCC,
    pub frame_rate_n: i32,
    pub frame_rate_d: i32,
    pub picture_aspect_ratio: f32,
    pub progressive: bool,
    pub timecode: i64,
    pub data: &'a [u8],
    /// Bytes per line (Y plane for planar layouts)
    pub line_stride: usize,
    pub metadata: Option<&'a str>,
}

impl<'a> VideoFrameRecord<'a> {
    pub fn from_encoded(
        frame: &'a EncodedFrame,
        frame_rate: (i32, i32),
        metadata: Option<&'a str>,
    ) -> Self {
        Self {
            xres: frame.width(),
            yres: frame.height(),
            fourcc: frame.fourcc(),
            frame_rate_n: frame_rate.0,
            frame_rate_d: frame_rate.1,
            picture_aspect_ratio: frame.width() as f32 / frame.height().max(1) as f32,
            progressive: true,
            timecode: TIMECODE_SYNTHESIZE,
            data: frame.as_bytes(),
            line_stride: frame.stride(),
            metadata,
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Push-based video sink
pub trait Transport: Send {
    /// Announce the source under `source_name`
    fn open(&mut self, source_name: &str) -> Result<(), TransportError>;

    /// Blocking send; returns once the transport no longer needs `frame.data`
    fn send_video(&mut self, frame: &VideoFrameRecord<'_>) -> Result<(), TransportError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

// ============================================================================
// Counting Transport
// ============================================================================

/// Copy of a frame kept by a logging [`CountingTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub fourcc: FourCC,
    pub xres: u32,
    pub yres: u32,
    pub frame_rate: (i32, i32),
    pub line_stride: usize,
    pub data: Vec<u8>,
    pub metadata: Option<String>,
}

/// Shared view of a [`CountingTransport`], usable after the transport moved
#[derive(Debug, Default)]
pub struct TransportCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    reject: AtomicBool,
    log: Mutex<Option<Vec<SentFrame>>>,
}

impl TransportCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Make every send fail until cleared
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::Relaxed);
    }

    /// Logged frames, oldest first. Empty unless logging was enabled.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.log.lock().clone().unwrap_or_default()
    }
}

pub struct CountingTransport {
    counters: Arc<TransportCounters>,
    source_name: Option<String>,
}

impl Default for CountingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingTransport {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(TransportCounters::default()),
            source_name: None,
        }
    }

    /// Also keep a copy of every frame
    pub fn with_log() -> Self {
        let transport = Self::new();
        *transport.counters.log.lock() = Some(Vec::new());
        transport
    }

    pub fn counters(&self) -> Arc<TransportCounters> {
        self.counters.clone()
    }
}

impl Transport for CountingTransport {
    fn open(&mut self, source_name: &str) -> Result<(), TransportError> {
        self.source_name = Some(source_name.to_string());
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_video(&mut self, frame: &VideoFrameRecord<'_>) -> Result<(), TransportError> {
        if self.source_name.is_none() {
            return Err(TransportError::NotOpen);
        }
        if self.counters.reject.load(Ordering::Relaxed) {
            return Err(TransportError::Rejected("receiver refused frame".into()));
        }

        if let Some(log) = self.counters.log.lock().as_mut() {
            log.push(SentFrame {
                fourcc: frame.fourcc,
                xres: frame.xres,
                yres: frame.yres,
                frame_rate: (frame.frame_rate_n, frame.frame_rate_d),
                line_stride: frame.line_stride,
                data: frame.data.to_vec(),
                metadata: frame.metadata.map(str::to_string),
            });
        }
        self.counters
            .bytes
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        self.counters.frames.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        if self.source_name.take().is_some() {
            self.counters.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn is_open(&self) -> bool {
        self.source_name.is_some()
    }
}

// ============================================================================
// Raw File Transport
// ============================================================================

/// Writes frame payloads back to back. Readable with e.g.
/// `ffplay -f rawvideo -pixel_format uyvy422 -video_size WxH out.raw`.
pub struct RawFileTransport {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    frames_written: u64,
}

impl RawFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Transport for RawFileTransport {
    fn open(&mut self, source_name: &str) -> Result<(), TransportError> {
        if self.writer.is_some() {
            return Ok(());
        }
        let file = File::create(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        tracing::info!("Raw output '{}' -> {}", source_name, self.path.display());
        Ok(())
    }

    fn send_video(&mut self, frame: &VideoFrameRecord<'_>) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer.write_all(frame.data)?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Raw output flush failed: {}", e);
            }
            tracing::info!(
                "Raw output closed after {} frames: {}",
                self.frames_written,
                self.path.display()
            );
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for RawFileTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;

    #[test]
    fn test_frame_rate_fraction() {
        assert_eq!(frame_rate_fraction(30.0), (30000, 1000));
        assert_eq!(frame_rate_fraction(29.97), (29970, 1000));
        assert_eq!(frame_rate_fraction(23.976), (23976, 1000));
        assert_eq!(frame_rate_fraction(f64::NAN), (0, 1000));
    }

    #[test]
    fn test_record_from_encoded() {
        let frame = EncodedFrame::new(PixelLayout::Uyvy422, 1920, 1080);
        let record = VideoFrameRecord::from_encoded(&frame, (60000, 1000), None);
        assert_eq!(record.fourcc, FourCC::UYVY);
        assert_eq!(record.line_stride, 3840);
        assert_eq!(record.data.len(), 1920 * 1080 * 2);
        assert!(record.progressive);
        assert_eq!(record.timecode, TIMECODE_SYNTHESIZE);
        assert!((record.picture_aspect_ratio - 16.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_counting_requires_open() {
        let mut transport = CountingTransport::with_log();
        let counters = transport.counters();
        let frame = EncodedFrame::new(PixelLayout::Rgba8, 2, 2);
        let record = VideoFrameRecord::from_encoded(&frame, (30000, 1000), Some("<m/>"));

        assert!(matches!(transport.send_video(&record), Err(TransportError::NotOpen)));

        transport.open("Test").unwrap();
        transport.send_video(&record).unwrap();
        counters.set_reject(true);
        assert!(matches!(transport.send_video(&record), Err(TransportError::Rejected(_))));

        assert_eq!(counters.frames(), 1);
        assert_eq!(counters.bytes(), 16);
        let sent = counters.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].metadata.as_deref(), Some("<m/>"));

        transport.close();
        transport.close();
        assert_eq!(counters.closes(), 1);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_raw_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut transport = RawFileTransport::new(&path);

        let mut frame = EncodedFrame::new(PixelLayout::Uyvy422, 4, 2);
        frame.as_bytes_mut().iter_mut().for_each(|b| *b = 7);
        let record = VideoFrameRecord::from_encoded(&frame, (25000, 1000), None);

        transport.open("File").unwrap();
        transport.send_video(&record).unwrap();
        transport.send_video(&record).unwrap();
        transport.close();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 2 * 16);
        assert!(data.iter().all(|b| *b == 7));
        assert_eq!(transport.frames_written(), 2);
    }
}
