//! # Framecast Core
//!
//! Float RGBA render output to network video frames: colour conversion with
//! optional GPU acceleration, an async send worker, and HDR metadata.

// ============================================================================
// Frames / Conversion
// ============================================================================
pub mod frame;
pub mod pixel_convert;
pub mod metadata;
pub mod dispatch;

// ============================================================================
// Acceleration Backends
// ============================================================================
pub mod accel;
#[cfg(feature = "gpu-compute")]
pub mod gpu_compute;
#[cfg(feature = "vendor-accel")]
pub mod vendor_accel;

// ============================================================================
// Sending
// ============================================================================
pub mod config;
pub mod frame_queue;
pub mod transport;
pub mod sender;

pub use accel::{AccelerationContext, AccelerationState, Accelerator, AcceleratorFactory};
pub use config::{ColorSpace, OverflowPolicy, SenderConfig};
pub use frame::{EncodedFrame, FrameDescriptor, PixelLayout, RawFrame};
pub use metadata::{ColorimetryDescriptor, MetadataBuilder, TransferFunction};
pub use sender::{FrameOutcome, FrameSender, SenderError, SenderStatus};
pub use transport::{CountingTransport, RawFileTransport, Transport, VideoFrameRecord};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
