//! # Frame Sender
//!
//! Composition root. Owns the transport, the acceleration context and the
//! async submitter, and is the only component that sends frames.
//!
//! ```text
//!              on_frame()
//!                  │
//!        ┌─────────┴──────────┐
//!        │ async_sending?     │
//!   no   ▼                    ▼  yes
//! ┌──────────────┐     ┌───────────────┐
//! │ sync pipeline│     │ AsyncSubmitter│──► worker pipeline
//! └──────┬───────┘     └───────────────┘         │
//!        └──────────────► Transport ◄────────────┘
//! ```
//!
//! Each path has its own [`FramePipeline`] and therefore its own output
//! buffer. Settings that change the encoding tear the pipeline down and
//! bring it back up before the next frame.

use crate::accel::{
    default_factory, AccelerationContext, AccelerationState, AcceleratorFactory, DeviceInfo,
};
use crate::config::{ConfigError, SenderConfig};
use crate::dispatch::{ConversionDispatcher, ConversionPath};
use crate::frame::{
    ColorMode, EncodedFrame, FrameDescriptor, FrameError, PixelLayout, QueueEntry, RawFrame,
};
use crate::frame_queue::{AsyncSubmitter, PushOutcome, QueueConfig};
use crate::metadata::{ColorimetryDescriptor, MetadataBuilder};
use crate::transport::{Transport, VideoFrameRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("Rejected frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("Rejected configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Sender disabled, frame ignored
    Disabled,
    /// Converted and sent on the calling thread
    Sent(ConversionPath),
    /// Handed to the async worker
    Queued,
    /// Not sent: queue overflow or the pipeline is down
    Dropped,
    /// Converted but the transport refused it
    SendFailed,
}

// ============================================================================
// Counters / Status
// ============================================================================

#[derive(Debug, Default)]
struct SenderCounters {
    frames_submitted: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    send_failures: AtomicU64,
    gpu_conversions: AtomicU64,
    cpu_conversions: AtomicU64,
}

/// Snapshot of sender health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderStatus {
    pub enabled: bool,
    pub active: bool,
    pub layout: PixelLayout,
    pub asynchronous: bool,
    pub acceleration_state: Option<AccelerationState>,
    pub backend: Option<String>,
    pub device: Option<DeviceInfo>,
    /// GPU conversion was requested but is not running
    pub cpu_fallback: bool,
    pub frames_submitted: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub send_failures: u64,
    pub gpu_conversions: u64,
    pub cpu_conversions: u64,
    pub queue_depth: usize,
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

// ============================================================================
// Frame Pipeline
// ============================================================================

/// Convert-then-send state for one call path
struct FramePipeline {
    dispatcher: ConversionDispatcher,
    output: EncodedFrame,
    metadata: MetadataBuilder,
}

impl FramePipeline {
    fn new() -> Self {
        Self {
            dispatcher: ConversionDispatcher::new(),
            output: EncodedFrame::new(PixelLayout::Rgba8, 0, 0),
            metadata: MetadataBuilder::new(),
        }
    }

    fn process(
        &mut self,
        frame: &RawFrame,
        descriptor: &FrameDescriptor,
        colorimetry: &ColorimetryDescriptor,
        accel: Option<&AccelerationContext>,
        transport: &Mutex<Box<dyn Transport>>,
        counters: &SenderCounters,
    ) -> FrameOutcome {
        let path = self.dispatcher.produce(
            frame,
            descriptor,
            colorimetry.transfer,
            accel,
            &mut self.output,
        );
        match path {
            ConversionPath::Gpu => counters.gpu_conversions.fetch_add(1, Ordering::Relaxed),
            ConversionPath::Cpu => counters.cpu_conversions.fetch_add(1, Ordering::Relaxed),
        };

        let metadata = match descriptor.color_mode() {
            ColorMode::Hdr => Some(self.metadata.cached(colorimetry)),
            ColorMode::Sdr => None,
        };
        let record = VideoFrameRecord::from_encoded(&self.output, descriptor.frame_rate(), metadata);

        match transport.lock().send_video(&record) {
            Ok(()) => {
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Sent(path)
            }
            Err(e) => {
                let failures = counters.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!("Frame send failed ({} total): {}", failures, e);
                FrameOutcome::SendFailed
            }
        }
    }
}

// ============================================================================
// Frame Sender
// ============================================================================

pub struct FrameSender {
    transport: SharedTransport,
    accel_factory: AcceleratorFactory,

    /// Last configuration seen
    config: SenderConfig,
    /// Transport open and pipeline running
    active: bool,

    accel: Option<Arc<AccelerationContext>>,
    submitter: Option<AsyncSubmitter>,
    sync_pipeline: FramePipeline,
    /// Current colorimetry; queued frames carry their own copy
    colorimetry: ColorimetryDescriptor,
    counters: Arc<SenderCounters>,
}

impl FrameSender {
    /// Sender that probes the machine for an acceleration backend
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_accelerator_factory(transport, default_factory())
    }

    pub fn with_accelerator_factory(
        transport: Box<dyn Transport>,
        accel_factory: AcceleratorFactory,
    ) -> Self {
        let config = SenderConfig::default();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            accel_factory,
            colorimetry: config.colorimetry(),
            config,
            active: false,
            accel: None,
            submitter: None,
            sync_pipeline: FramePipeline::new(),
            counters: Arc::new(SenderCounters::default()),
        }
    }

    /// Frame entry point for the render host.
    ///
    /// Only malformed input is reported as an error; conversion and
    /// transport problems are logged and show up in [`FrameSender::status`].
    pub fn on_frame(
        &mut self,
        pixels: &[f32],
        width: i32,
        height: i32,
        config: &SenderConfig,
    ) -> Result<FrameOutcome, SenderError> {
        config.validate()?;
        self.apply_config(config);

        if !config.enabled {
            return Ok(FrameOutcome::Disabled);
        }

        let (width, height) = FrameDescriptor::dimensions_from_host(width, height)?;
        let (num, den) = config.frame_rate_fraction();
        let descriptor = FrameDescriptor::new(width, height, config.color_mode(), config.layout(), num, den)?;
        let frame = RawFrame::from_slice(width, height, pixels)?;

        self.counters.frames_submitted.fetch_add(1, Ordering::Relaxed);

        if !self.active {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(FrameOutcome::Dropped);
        }

        if let Some(submitter) = &self.submitter {
            let outcome = match submitter.submit(frame, descriptor, self.colorimetry) {
                PushOutcome::Queued(_) => FrameOutcome::Queued,
                PushOutcome::QueuedEvicting { .. } => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    FrameOutcome::Queued
                }
                PushOutcome::Rejected => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    FrameOutcome::Dropped
                }
            };
            return Ok(outcome);
        }

        Ok(self.sync_pipeline.process(
            &frame,
            &descriptor,
            &self.colorimetry,
            self.accel.as_deref(),
            &self.transport,
            &self.counters,
        ))
    }

    /// Move to `config`, restarting the pipeline when the encoding changes
    pub fn apply_config(&mut self, config: &SenderConfig) {
        let restart = self.active && self.config.requires_restart(config);
        let was_enabled = self.config.enabled;
        let previous = std::mem::replace(&mut self.config, config.clone());
        self.colorimetry = config.colorimetry();

        match (config.enabled, self.active) {
            (false, true) => {
                tracing::info!("Sender disabled");
                self.teardown();
            }
            (true, false) => {
                // A failed start is retried only when the settings change
                if !was_enabled || previous.requires_restart(config) {
                    self.start();
                }
            }
            (true, true) if restart => {
                tracing::info!("Encoding settings changed, restarting pipeline");
                self.teardown();
                self.start();
            }
            _ => {}
        }
    }

    fn start(&mut self) {
        let config = self.config.clone();

        if let Err(e) = self.transport.lock().open(&config.source_name) {
            tracing::warn!("Transport open failed for '{}': {}", config.source_name, e);
            return;
        }

        self.accel = if config.gpu_acceleration {
            let ctx = AccelerationContext::new((self.accel_factory)());
            // Failure is logged by the context; conversion falls back to CPU
            let _ = ctx.initialize();
            Some(Arc::new(ctx))
        } else {
            None
        };

        self.submitter = if config.async_sending {
            self.spawn_submitter(&config)
        } else {
            None
        };

        self.active = true;
        tracing::info!(
            "Sender '{}' started: {:?}, {}, {}",
            config.source_name,
            config.layout(),
            if config.async_sending { "async" } else { "sync" },
            match &self.accel {
                Some(ctx) if ctx.is_ready() => ctx.backend_name(),
                _ => "CPU",
            }
        );
    }

    fn spawn_submitter(&self, config: &SenderConfig) -> Option<AsyncSubmitter> {
        let queue_config = QueueConfig {
            capacity: config.queue_capacity,
            policy: config.overflow_policy,
            block_timeout: Duration::from_millis(config.block_timeout_ms),
        };

        let mut pipeline = FramePipeline::new();
        let accel = self.accel.clone();
        let transport = self.transport.clone();
        let counters = self.counters.clone();

        let handler = move |entry: QueueEntry| {
            pipeline.process(
                &entry.frame,
                &entry.descriptor,
                &entry.colorimetry,
                accel.as_deref(),
                &transport,
                &counters,
            );
        };

        match AsyncSubmitter::start(queue_config, handler) {
            Ok(submitter) => Some(submitter),
            Err(e) => {
                tracing::warn!("Send worker could not start, sending synchronously: {}", e);
                None
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(mut submitter) = self.submitter.take() {
            let discarded = submitter.stop();
            self.counters
                .frames_dropped
                .fetch_add(discarded as u64, Ordering::Relaxed);
        }
        if let Some(accel) = self.accel.take() {
            accel.shutdown();
        }
        if self.active {
            self.transport.lock().close();
            self.active = false;
        }
    }

    /// Stop everything; the sender restarts on the next enabled frame
    pub fn shutdown(&mut self) {
        self.teardown();
        self.config.enabled = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn status(&self) -> SenderStatus {
        let acceleration_state = self.accel.as_ref().map(|ctx| ctx.state());
        let cpu_fallback = self.active
            && self.config.gpu_acceleration
            && acceleration_state != Some(AccelerationState::Ready);

        SenderStatus {
            enabled: self.config.enabled,
            active: self.active,
            layout: self.config.layout(),
            asynchronous: self.submitter.is_some(),
            acceleration_state,
            backend: self.accel.as_ref().map(|ctx| ctx.backend_name().to_string()),
            device: self.accel.as_ref().and_then(|ctx| ctx.device_info()),
            cpu_fallback,
            frames_submitted: self.counters.frames_submitted.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            gpu_conversions: self.counters.gpu_conversions.load(Ordering::Relaxed),
            cpu_conversions: self.counters.cpu_conversions.load(Ordering::Relaxed),
            queue_depth: self.submitter.as_ref().map_or(0, |s| s.queue().len()),
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{Accelerator, NullAccelerator};
    use crate::frame::FourCC;
    use crate::metadata::TransferFunction;
    use crate::transport::{CountingTransport, TransportCounters};

    fn cpu_only() -> AcceleratorFactory {
        Arc::new(|| Box::new(NullAccelerator) as Box<dyn Accelerator>)
    }

    fn sender() -> (FrameSender, Arc<TransportCounters>) {
        let transport = CountingTransport::with_log();
        let counters = transport.counters();
        (
            FrameSender::with_accelerator_factory(Box::new(transport), cpu_only()),
            counters,
        )
    }

    fn enabled() -> SenderConfig {
        SenderConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn white(width: usize, height: usize) -> Vec<f32> {
        vec![1.0; width * height * 4]
    }

    #[test]
    fn test_sync_white_frame() {
        let (mut sender, sent) = sender();
        let outcome = sender.on_frame(&white(2, 2), 2, 2, &enabled()).unwrap();
        assert_eq!(outcome, FrameOutcome::Sent(ConversionPath::Cpu));

        let frames = sent.sent();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].fourcc, FourCC::UYVY);
        assert_eq!(frames[0].line_stride, 4);
        assert_eq!(frames[0].frame_rate, (30000, 1000));
        assert_eq!(frames[0].data, vec![128, 255, 128, 255, 128, 255, 128, 255]);
        assert!(frames[0].metadata.is_none());
    }

    #[test]
    fn test_hdr_frames_carry_metadata() {
        let (mut sender, sent) = sender();
        let config = SenderConfig {
            hdr_enabled: true,
            transfer_function: TransferFunction::Pq,
            color_space: crate::config::ColorSpace::BT2020,
            ..enabled()
        };
        sender.on_frame(&white(4, 2), 4, 2, &config).unwrap();

        let frames = sent.sent();
        assert_eq!(frames[0].fourcc, FourCC::P216);
        assert_eq!(frames[0].data.len(), 4 * 2 * 4);
        let metadata = frames[0].metadata.as_deref().unwrap();
        assert!(metadata.contains("transfer=\"bt_2100_pq\""));
        assert!(metadata.contains("max_cll=\"1000\""));

        // Light level change applies without a restart
        let brighter = SenderConfig { max_cll: 4000.0, ..config };
        sender.on_frame(&white(4, 2), 4, 2, &brighter).unwrap();
        assert!(sent.sent()[1].metadata.as_deref().unwrap().contains("max_cll=\"4000\""));
        assert_eq!(sent.opens(), 1);
    }

    #[test]
    fn test_hdr_default_transfer_is_bt2020_pq() {
        let (mut sender, sent) = sender();
        let config = SenderConfig {
            hdr_enabled: true,
            color_space: crate::config::ColorSpace::BT2020,
            ..enabled()
        };
        let red = [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        sender.on_frame(&red, 2, 1, &config).unwrap();

        let frames = sent.sent();
        let luma = u16::from_ne_bytes([frames[0].data[0], frames[0].data[1]]);
        assert_eq!(luma, 18824);
        let metadata = frames[0].metadata.as_deref().unwrap();
        assert!(metadata.contains("transfer=\"bt_2100_pq\""));
        assert!(metadata.contains("matrix=\"bt_2020\""));
    }

    /// Transport that holds every send until the test releases the gate
    struct GatedTransport {
        gate: Arc<Mutex<()>>,
        metadata: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for GatedTransport {
        fn open(&mut self, _source_name: &str) -> Result<(), crate::transport::TransportError> {
            Ok(())
        }

        fn send_video(
            &mut self,
            frame: &VideoFrameRecord<'_>,
        ) -> Result<(), crate::transport::TransportError> {
            let _open = self.gate.lock();
            self.metadata
                .lock()
                .push(frame.metadata.unwrap_or_default().to_string());
            Ok(())
        }

        fn close(&mut self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_queued_frames_keep_their_colorimetry() {
        let gate = Arc::new(Mutex::new(()));
        let metadata = Arc::new(Mutex::new(Vec::new()));
        let transport = GatedTransport {
            gate: gate.clone(),
            metadata: metadata.clone(),
        };
        let mut sender = FrameSender::with_accelerator_factory(Box::new(transport), cpu_only());

        let config = SenderConfig {
            hdr_enabled: true,
            async_sending: true,
            ..enabled()
        };
        let brighter = SenderConfig {
            max_cll: 4000.0,
            ..config.clone()
        };

        let held = gate.lock();
        sender.on_frame(&white(2, 2), 2, 2, &config).unwrap();
        sender.on_frame(&white(2, 2), 2, 2, &config).unwrap();
        sender.on_frame(&white(2, 2), 2, 2, &brighter).unwrap();
        drop(held);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while metadata.lock().len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let sent = metadata.lock().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("max_cll=\"1000\""));
        assert!(sent[1].contains("max_cll=\"1000\""));
        assert!(sent[2].contains("max_cll=\"4000\""));
    }

    #[test]
    fn test_disabled_sends_nothing() {
        let (mut sender, sent) = sender();
        let disabled = SenderConfig::default();
        assert_eq!(
            sender.on_frame(&white(2, 2), 2, 2, &disabled).unwrap(),
            FrameOutcome::Disabled
        );
        assert_eq!(sent.frames(), 0);
        assert_eq!(sent.opens(), 0);

        sender.on_frame(&white(2, 2), 2, 2, &enabled()).unwrap();
        sender.on_frame(&white(2, 2), 2, 2, &disabled).unwrap();
        assert_eq!(sent.frames(), 1);
        assert_eq!(sent.closes(), 1);
        assert!(!sender.is_active());
    }

    #[test]
    fn test_restart_on_encoding_change() {
        let (mut sender, sent) = sender();
        sender.on_frame(&white(2, 2), 2, 2, &enabled()).unwrap();

        let hdr = SenderConfig {
            hdr_enabled: true,
            ..enabled()
        };
        sender.on_frame(&white(2, 2), 2, 2, &hdr).unwrap();
        assert_eq!(sent.opens(), 2);
        assert_eq!(sent.closes(), 1);
        assert_eq!(sent.sent()[1].fourcc, FourCC::P216);
    }

    #[test]
    fn test_malformed_input_rejected() {
        let (mut sender, sent) = sender();
        assert!(matches!(
            sender.on_frame(&[], 0, 2, &enabled()),
            Err(SenderError::InvalidFrame(_))
        ));
        assert!(matches!(
            sender.on_frame(&white(2, 2), -2, 2, &enabled()),
            Err(SenderError::InvalidFrame(_))
        ));
        assert!(matches!(
            sender.on_frame(&white(2, 1), 2, 2, &enabled()),
            Err(SenderError::InvalidFrame(FrameError::BufferSize { .. }))
        ));

        let bad_rate = SenderConfig {
            frame_rate: 500.0,
            ..enabled()
        };
        assert!(matches!(
            sender.on_frame(&white(2, 2), 2, 2, &bad_rate),
            Err(SenderError::InvalidConfig(_))
        ));

        assert_eq!(sent.frames(), 0);
        assert_eq!(sender.status().frames_submitted, 0);
    }

    #[test]
    fn test_status_reports_cpu_fallback() {
        let (mut sender, _sent) = sender();
        sender.on_frame(&white(2, 2), 2, 2, &enabled()).unwrap();

        let status = sender.status();
        assert!(status.active);
        assert!(status.cpu_fallback);
        assert_eq!(status.acceleration_state, Some(AccelerationState::Unavailable));
        assert_eq!(status.cpu_conversions, 1);
        assert_eq!(status.frames_sent, 1);

        let no_gpu = SenderConfig {
            gpu_acceleration: false,
            ..enabled()
        };
        sender.on_frame(&white(2, 2), 2, 2, &no_gpu).unwrap();
        let status = sender.status();
        assert!(!status.cpu_fallback);
        assert!(status.acceleration_state.is_none());
    }

    #[test]
    fn test_send_failure_is_counted_not_returned() {
        let (mut sender, sent) = sender();
        sent.set_reject(true);
        let outcome = sender.on_frame(&white(2, 2), 2, 2, &enabled()).unwrap();
        assert_eq!(outcome, FrameOutcome::SendFailed);
        assert_eq!(sender.status().send_failures, 1);
    }

    #[test]
    fn test_async_path_delivers() {
        let (mut sender, sent) = sender();
        let config = SenderConfig {
            async_sending: true,
            queue_capacity: 64,
            ..enabled()
        };
        for _ in 0..10 {
            assert_eq!(
                sender.on_frame(&white(2, 2), 2, 2, &config).unwrap(),
                FrameOutcome::Queued
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sent.frames() < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sent.frames(), 10);
        assert!(sender.status().asynchronous);

        sender.shutdown();
        assert!(!sender.is_active());
        assert_eq!(sent.closes(), 1);
    }
}
