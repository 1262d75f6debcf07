//! # Acceleration Context
//!
//! GPU conversion is optional. A context wraps exactly one backend chosen at
//! runtime and walks it through a small state machine:
//!
//! ```text
//! Uninitialized ──initialize()──► Initializing ──► Ready ──shutdown()──► ShuttingDown ──► Shutdown
//!                                       │
//!                                       └────────► Unavailable ──shutdown()──────────────► Shutdown
//! ```
//!
//! Unavailable is terminal for the context; a fresh context is needed to try
//! again. All transitions and every conversion happen under the context lock,
//! so at most one frame is ever inside the backend.

use crate::frame::{EncodedFrame, PixelLayout, RawFrame};
use crate::metadata::TransferFunction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("Acceleration backend unavailable: {0}")]
    Unavailable(String),
    #[error("{backend} cannot perform {kind:?} conversion")]
    Unsupported { backend: &'static str, kind: ConversionKind },
    #[error("Acceleration backend error: {0}")]
    Backend(String),
    #[error("Acceleration context not ready ({0:?})")]
    NotReady(AccelerationState),
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccelerationState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Unavailable = 3,
    ShuttingDown = 4,
    Shutdown = 5,
}

impl AccelerationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Unavailable,
            4 => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }
}

/// Conversions a backend may accelerate. RGBA8 packing is always CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversionKind {
    Uyvy,
    Planar16(TransferFunction),
}

impl ConversionKind {
    pub fn for_layout(layout: PixelLayout, transfer: TransferFunction) -> Option<Self> {
        match layout {
            PixelLayout::Uyvy422 => Some(Self::Uyvy),
            PixelLayout::Planar16_422 => Some(Self::Planar16(transfer)),
            PixelLayout::Rgba8 => None,
        }
    }

    pub fn layout(&self) -> PixelLayout {
        match self {
            Self::Uyvy => PixelLayout::Uyvy422,
            Self::Planar16(_) => PixelLayout::Planar16_422,
        }
    }
}

/// Device details reported by a Ready backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub backend: String,
    pub device_name: String,
    pub memory_free: Option<u64>,
    pub memory_total: Option<u64>,
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A GPU (or other) conversion backend
pub trait Accelerator: Send {
    /// Backend name for logs and status
    fn name(&self) -> &'static str;

    /// Cheap check whether the backend could work on this machine
    fn is_available(&self) -> bool;

    /// Allocate backend resources. On error nothing may stay allocated.
    fn open(&mut self) -> Result<(), AccelError>;

    /// Whether `convert` handles this kind at this size
    fn supports(&self, kind: ConversionKind, width: u32, height: u32) -> bool;

    /// Convert `src` into `dst`. `dst` is unspecified after an error.
    fn convert(
        &mut self,
        kind: ConversionKind,
        src: &RawFrame,
        dst: &mut EncodedFrame,
    ) -> Result<(), AccelError>;

    /// Release resources. Must be safe to call more than once.
    fn close(&mut self);

    fn device_info(&self) -> Option<DeviceInfo> {
        None
    }
}

/// Backend used when acceleration is off or nothing was found
#[derive(Debug, Default)]
pub struct NullAccelerator;

impl Accelerator for NullAccelerator {
    fn name(&self) -> &'static str {
        "None"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn open(&mut self) -> Result<(), AccelError> {
        Err(AccelError::Unavailable("no acceleration backend".into()))
    }

    fn supports(&self, _kind: ConversionKind, _width: u32, _height: u32) -> bool {
        false
    }

    fn convert(
        &mut self,
        kind: ConversionKind,
        _src: &RawFrame,
        _dst: &mut EncodedFrame,
    ) -> Result<(), AccelError> {
        Err(AccelError::Unsupported { backend: "None", kind })
    }

    fn close(&mut self) {}
}

// ============================================================================
// Backend Selection
// ============================================================================

/// Builds a backend for a new context
pub type AcceleratorFactory = Arc<dyn Fn() -> Box<dyn Accelerator> + Send + Sync>;

/// All compiled-in backends, in priority order
pub fn candidate_accelerators() -> Vec<Box<dyn Accelerator>> {
    #[allow(unused_mut)]
    let mut candidates: Vec<Box<dyn Accelerator>> = Vec::new();

    #[cfg(feature = "vendor-accel")]
    candidates.push(Box::new(crate::vendor_accel::VendorLibraryAccelerator::from_env()));

    #[cfg(feature = "gpu-compute")]
    candidates.push(Box::new(crate::gpu_compute::GpuComputeAccelerator::new()));

    candidates
}

/// Pick the first backend whose availability probe passes
pub fn select_accelerator() -> Box<dyn Accelerator> {
    for candidate in candidate_accelerators() {
        if candidate.is_available() {
            tracing::info!("Acceleration backend selected: {}", candidate.name());
            return candidate;
        }
        tracing::debug!("Acceleration backend not available: {}", candidate.name());
    }
    tracing::info!("No acceleration backend available, CPU conversion only");
    Box::new(NullAccelerator)
}

/// Factory that probes the machine each time a context is built
pub fn default_factory() -> AcceleratorFactory {
    Arc::new(select_accelerator)
}

// ============================================================================
// Context
// ============================================================================

struct ContextInner {
    state: AccelerationState,
    backend: Box<dyn Accelerator>,
}

/// Context counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccelStats {
    pub conversions: u64,
    pub failures: u64,
}

pub struct AccelerationContext {
    inner: Mutex<ContextInner>,
    /// Mirror of `inner.state` so status reads never wait on a conversion
    state: AtomicU8,
    backend_name: &'static str,
    conversions: AtomicU64,
    failures: AtomicU64,
}

impl AccelerationContext {
    pub fn new(backend: Box<dyn Accelerator>) -> Self {
        let backend_name = backend.name();
        Self {
            inner: Mutex::new(ContextInner {
                state: AccelerationState::Uninitialized,
                backend,
            }),
            state: AtomicU8::new(AccelerationState::Uninitialized as u8),
            backend_name,
            conversions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Context around whichever backend the machine supports
    pub fn probe() -> Self {
        Self::new(select_accelerator())
    }

    fn set_state(&self, inner: &mut ContextInner, state: AccelerationState) {
        tracing::debug!(
            "Acceleration [{}]: {:?} -> {:?}",
            self.backend_name,
            inner.state,
            state
        );
        inner.state = state;
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> AccelerationState {
        AccelerationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AccelerationState::Ready
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Bring the backend up. Idempotent while Ready; never retries after
    /// the backend turned out to be unavailable.
    pub fn initialize(&self) -> Result<(), AccelError> {
        let mut inner = self.inner.lock();

        match inner.state {
            AccelerationState::Ready => return Ok(()),
            AccelerationState::Uninitialized => {}
            other => return Err(AccelError::NotReady(other)),
        }

        self.set_state(&mut inner, AccelerationState::Initializing);

        let result = if inner.backend.is_available() {
            inner.backend.open()
        } else {
            Err(AccelError::Unavailable(format!(
                "{} not present on this system",
                self.backend_name
            )))
        };

        match result {
            Ok(()) => {
                self.set_state(&mut inner, AccelerationState::Ready);
                match inner.backend.device_info() {
                    Some(info) => tracing::info!(
                        "Acceleration ready: {} on {}",
                        info.backend,
                        info.device_name
                    ),
                    None => tracing::info!("Acceleration ready: {}", self.backend_name),
                }
                Ok(())
            }
            Err(e) => {
                inner.backend.close();
                self.set_state(&mut inner, AccelerationState::Unavailable);
                tracing::warn!(
                    "Acceleration backend {} unavailable, using CPU conversion: {}",
                    self.backend_name,
                    e
                );
                Err(e)
            }
        }
    }

    /// Convert one frame on the backend. Callers fall back to the CPU on
    /// any error; the context stays Ready after a per-frame failure.
    pub fn convert(
        &self,
        kind: ConversionKind,
        src: &RawFrame,
        dst: &mut EncodedFrame,
    ) -> Result<(), AccelError> {
        let mut inner = self.inner.lock();

        if inner.state != AccelerationState::Ready {
            return Err(AccelError::NotReady(inner.state));
        }
        if !inner.backend.supports(kind, src.width(), src.height()) {
            return Err(AccelError::Unsupported {
                backend: self.backend_name,
                kind,
            });
        }

        let result = inner.backend.convert(kind, src, dst).and_then(|()| {
            if dst.layout() == kind.layout()
                && dst.width() == src.width()
                && dst.height() == src.height()
                && dst.is_consistent()
            {
                Ok(())
            } else {
                Err(AccelError::Backend("backend produced a mis-sized frame".into()))
            }
        });

        match &result {
            Ok(()) => {
                self.conversions.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Acceleration [{}] frame failed: {}", self.backend_name, e);
            }
        }
        result
    }

    /// Release the backend. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            AccelerationState::Shutdown => {}
            AccelerationState::Ready => {
                self.set_state(&mut inner, AccelerationState::ShuttingDown);
                inner.backend.close();
                self.set_state(&mut inner, AccelerationState::Shutdown);
                tracing::info!("Acceleration [{}] shut down", self.backend_name);
            }
            _ => {
                inner.backend.close();
                self.set_state(&mut inner, AccelerationState::Shutdown);
            }
        }
    }

    /// Device details while Ready
    pub fn device_info(&self) -> Option<DeviceInfo> {
        let inner = self.inner.lock();
        if inner.state == AccelerationState::Ready {
            inner.backend.device_info()
        } else {
            None
        }
    }

    pub fn stats(&self) -> AccelStats {
        AccelStats {
            conversions: self.conversions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AccelerationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
