//! # Conversion Dispatcher
//!
//! Two-tier conversion: try the acceleration context, fall back to the CPU
//! converter on any failure. The CPU path always succeeds, so a frame is
//! never lost to a GPU problem.

use crate::accel::{AccelerationContext, ConversionKind};
use crate::frame::{EncodedFrame, FrameDescriptor, RawFrame};
use crate::metadata::TransferFunction;
use crate::pixel_convert::PixelConverter;
use serde::{Deserialize, Serialize};

/// Which path produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionPath {
    Gpu,
    Cpu,
}

#[derive(Debug, Default)]
pub struct ConversionDispatcher {
    converter: PixelConverter,
}

impl ConversionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill `dst` with `src` in the layout named by `descriptor`.
    ///
    /// `transfer` tags the backend request; planar output is always BT.2020.
    pub fn produce(
        &self,
        src: &RawFrame,
        descriptor: &FrameDescriptor,
        transfer: TransferFunction,
        accel: Option<&AccelerationContext>,
        dst: &mut EncodedFrame,
    ) -> ConversionPath {
        let layout = descriptor.layout();

        if let (Some(ctx), Some(kind)) = (accel, ConversionKind::for_layout(layout, transfer)) {
            if ctx.is_ready() {
                match ctx.convert(kind, src, dst) {
                    Ok(()) => {
                        tracing::trace!(
                            "Frame {}x{} converted on {}",
                            src.width(),
                            src.height(),
                            ctx.backend_name()
                        );
                        return ConversionPath::Gpu;
                    }
                    Err(e) => {
                        tracing::debug!("GPU conversion skipped, using CPU: {}", e);
                    }
                }
            }
        }

        self.converter.convert(layout, src, dst);
        ConversionPath::Cpu
    }

    pub fn converter(&self) -> &PixelConverter {
        &self.converter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{AccelError, Accelerator, NullAccelerator};
    use crate::frame::{ColorMode, PixelLayout};

    /// Backend that always reports a failed kernel launch
    struct FailingBackend;

    impl Accelerator for FailingBackend {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn open(&mut self) -> Result<(), AccelError> {
            Ok(())
        }

        fn supports(&self, _kind: ConversionKind, _width: u32, _height: u32) -> bool {
            true
        }

        fn convert(
            &mut self,
            _kind: ConversionKind,
            _src: &RawFrame,
            dst: &mut EncodedFrame,
        ) -> Result<(), AccelError> {
            // Leave garbage behind to prove the CPU path overwrites it
            dst.as_bytes_mut().iter_mut().for_each(|b| *b = 0xAB);
            Err(AccelError::Backend("launch failed".into()))
        }

        fn close(&mut self) {}
    }

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let t = (x + y * width) as f32 / (width * height) as f32;
                pixels.extend_from_slice(&[t, 1.0 - t, t * 0.5, 1.0]);
            }
        }
        RawFrame::new(width, height, pixels).unwrap()
    }

    fn descriptor(layout: PixelLayout, width: u32, height: u32) -> FrameDescriptor {
        let mode = if layout == PixelLayout::Planar16_422 {
            ColorMode::Hdr
        } else {
            ColorMode::Sdr
        };
        FrameDescriptor::new(width, height, mode, layout, 30000, 1000).unwrap()
    }

    #[test]
    fn test_fallback_matches_cpu() {
        let ctx = AccelerationContext::new(Box::new(FailingBackend));
        ctx.initialize().unwrap();
        let dispatcher = ConversionDispatcher::new();
        let src = gradient(6, 3);

        for (layout, transfer) in [
            (PixelLayout::Uyvy422, TransferFunction::Sdr),
            (PixelLayout::Planar16_422, TransferFunction::Pq),
            (PixelLayout::Planar16_422, TransferFunction::Hlg),
        ] {
            let desc = descriptor(layout, 6, 3);
            let mut dst = EncodedFrame::new(layout, 6, 3);
            let path = dispatcher.produce(&src, &desc, transfer, Some(&ctx), &mut dst);
            assert_eq!(path, ConversionPath::Cpu);

            let mut expected = EncodedFrame::new(layout, 6, 3);
            PixelConverter::new().convert(layout, &src, &mut expected);
            assert_eq!(dst.as_bytes(), expected.as_bytes());
        }
        assert_eq!(ctx.stats().failures, 3);
    }

    #[test]
    fn test_dispatcher_debug() {
        let text = format!("{:?}", ConversionDispatcher::default());
        assert!(text.contains("PixelConverter"));
    }

    #[test]
    fn test_rgba8_never_reaches_backend() {
        let ctx = AccelerationContext::new(Box::new(FailingBackend));
        ctx.initialize().unwrap();
        let dispatcher = ConversionDispatcher::new();
        let desc = descriptor(PixelLayout::Rgba8, 2, 2);
        let mut dst = EncodedFrame::new(PixelLayout::Rgba8, 2, 2);

        let path = dispatcher.produce(&gradient(2, 2), &desc, TransferFunction::Sdr, Some(&ctx), &mut dst);
        assert_eq!(path, ConversionPath::Cpu);
        assert_eq!(ctx.stats().failures, 0);
    }

    #[test]
    fn test_unready_context_uses_cpu() {
        let ctx = AccelerationContext::new(Box::new(NullAccelerator));
        let _ = ctx.initialize();
        let dispatcher = ConversionDispatcher::new();
        let desc = descriptor(PixelLayout::Uyvy422, 2, 2);
        let mut dst = EncodedFrame::new(PixelLayout::Uyvy422, 2, 2);

        let white = RawFrame::filled(2, 2, [1.0; 4]).unwrap();
        let path = dispatcher.produce(&white, &desc, TransferFunction::Sdr, Some(&ctx), &mut dst);
        assert_eq!(path, ConversionPath::Cpu);
        assert_eq!(dst.as_bytes(), &[128, 255, 128, 255, 128, 255, 128, 255]);
    }

    #[test]
    fn test_no_context_resizes_destination() {
        let dispatcher = ConversionDispatcher::new();
        let desc = descriptor(PixelLayout::Planar16_422, 4, 2);
        let mut dst = EncodedFrame::new(PixelLayout::Uyvy422, 1, 1);

        dispatcher.produce(&gradient(4, 2), &desc, TransferFunction::Pq, None, &mut dst);
        assert_eq!(dst.layout(), PixelLayout::Planar16_422);
        assert_eq!(dst.sample_count(), 4 * 2 * 2);
        assert!(dst.is_consistent());
    }
}
