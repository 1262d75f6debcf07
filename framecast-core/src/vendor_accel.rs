// VENDOR ACCEL - Dynamically loaded vendor conversion kernels
//
// Vendor kernels (CUDA on Windows/Linux, Metal on macOS) ship as a small
// shared library with a C ABI:
//
//   bool        <p>_gpu_is_available(void)
//   ctx*        <p>_gpu_init(void)
//   void        <p>_gpu_shutdown(ctx*)
//   bool        <p>_gpu_convert_rgba_to_uyvy(ctx*, const float*, uint8_t*, int w, int h)
//   const char* <p>_gpu_get_device_name(ctx*)                      (optional)
//   bool        <p>_gpu_get_memory_info(ctx*, size_t*, size_t*)    (optional)
//
// where <p> is "cuda" or "metal". The library is loaded at runtime via
// libloading; nothing links against a vendor SDK. Kernels follow the same
// contract as the CPU path: bottom-up input, top-down UYVY output.
//
// The HDR entry point of these libraries emits 16-bit RGBA rather than
// planar 4:2:2, so Planar16 stays on the CPU.

use crate::accel::{AccelError, Accelerator, ConversionKind, DeviceInfo};
use crate::frame::{EncodedFrame, PixelLayout, RawFrame};
use libloading::Library;
use once_cell::sync::OnceCell;
use std::ffi::{c_char, c_void, CStr};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

/// Overrides the library path
pub const ACCEL_LIB_ENV: &str = "FRAMECAST_ACCEL_LIB";

#[cfg(target_os = "windows")]
const DEFAULT_LIB: &str = "framecast_cuda.dll";
#[cfg(target_os = "macos")]
const DEFAULT_LIB: &str = "libframecast_metal.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DEFAULT_LIB: &str = "libframecast_cuda.so";

// Symbol prefixes tried in order
const PREFIXES: [&str; 2] = ["cuda", "metal"];
// Entry points a prefix must export in full to be used
const REQUIRED: [&str; 4] = ["is_available", "init", "shutdown", "convert_rgba_to_uyvy"];

type GpuContext = *mut c_void;
type IsAvailableFn = unsafe extern "C" fn() -> bool;
type InitFn = unsafe extern "C" fn() -> GpuContext;
type ShutdownFn = unsafe extern "C" fn(GpuContext);
type ConvertUyvyFn = unsafe extern "C" fn(GpuContext, *const f32, *mut u8, i32, i32) -> bool;
type DeviceNameFn = unsafe extern "C" fn(GpuContext) -> *const c_char;
type MemoryInfoFn = unsafe extern "C" fn(GpuContext, *mut usize, *mut usize) -> bool;

struct VendorLibrary {
    _lib: Library,
    prefix: &'static str,
    is_available: IsAvailableFn,
    init: InitFn,
    shutdown: ShutdownFn,
    convert_uyvy: ConvertUyvyFn,
    device_name: Option<DeviceNameFn>,
    memory_info: Option<MemoryInfoFn>,
}

fn symbol_name(prefix: &str, name: &str) -> Vec<u8> {
    format!("{}_gpu_{}\0", prefix, name).into_bytes()
}

/// First prefix exporting every required entry point
fn usable_prefix(has_symbol: impl Fn(&[u8]) -> bool) -> Option<&'static str> {
    PREFIXES.into_iter().find(|prefix| {
        REQUIRED
            .iter()
            .all(|name| has_symbol(symbol_name(prefix, name).as_slice()))
    })
}

impl VendorLibrary {
    fn load(path: &PathBuf) -> Option<Self> {
        unsafe {
            let lib = match Library::new(path) {
                Ok(lib) => lib,
                Err(e) => {
                    tracing::debug!("Vendor accel library {} not loaded: {}", path.display(), e);
                    return None;
                }
            };

            let Some(prefix) = usable_prefix(|name| lib.get::<*const c_void>(name).is_ok()) else {
                tracing::warn!("Vendor accel library {} exports no known entry points", path.display());
                return None;
            };

            let is_available: IsAvailableFn = *lib.get(&symbol_name(prefix, "is_available")).ok()?;
            let init: InitFn = *lib.get(&symbol_name(prefix, "init")).ok()?;
            let shutdown: ShutdownFn = *lib.get(&symbol_name(prefix, "shutdown")).ok()?;
            let convert_uyvy: ConvertUyvyFn =
                *lib.get(&symbol_name(prefix, "convert_rgba_to_uyvy")).ok()?;
            let device_name: Option<DeviceNameFn> = lib
                .get::<DeviceNameFn>(&symbol_name(prefix, "get_device_name"))
                .ok()
                .map(|s| *s);
            let memory_info: Option<MemoryInfoFn> = lib
                .get::<MemoryInfoFn>(&symbol_name(prefix, "get_memory_info"))
                .ok()
                .map(|s| *s);

            tracing::info!("Vendor accel library loaded: {} ({})", path.display(), prefix);

            Some(Self {
                _lib: lib,
                prefix,
                is_available,
                init,
                shutdown,
                convert_uyvy,
                device_name,
                memory_info,
            })
        }
    }
}

/// Accelerator backed by a vendor kernel library
pub struct VendorLibraryAccelerator {
    path: PathBuf,
    lib: OnceCell<Option<Arc<VendorLibrary>>>,
    ctx: GpuContext,
}

// The context pointer is only touched through &mut self
unsafe impl Send for VendorLibraryAccelerator {}

impl VendorLibraryAccelerator {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lib: OnceCell::new(),
            ctx: ptr::null_mut(),
        }
    }

    /// Library from `FRAMECAST_ACCEL_LIB`, or the platform default name
    pub fn from_env() -> Self {
        let path = std::env::var_os(ACCEL_LIB_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LIB));
        Self::with_path(path)
    }

    fn library(&self) -> Option<&Arc<VendorLibrary>> {
        self.lib
            .get_or_init(|| VendorLibrary::load(&self.path).map(Arc::new))
            .as_ref()
    }
}

impl Accelerator for VendorLibraryAccelerator {
    fn name(&self) -> &'static str {
        "Vendor Library"
    }

    fn is_available(&self) -> bool {
        match self.library() {
            Some(lib) => unsafe { (lib.is_available)() },
            None => false,
        }
    }

    fn open(&mut self) -> Result<(), AccelError> {
        if !self.ctx.is_null() {
            return Ok(());
        }
        let lib = self
            .library()
            .cloned()
            .ok_or_else(|| AccelError::Unavailable(format!("{} not loadable", self.path.display())))?;

        let ctx = unsafe { (lib.init)() };
        if ctx.is_null() {
            return Err(AccelError::Unavailable(format!("{}_gpu_init returned null", lib.prefix)));
        }
        self.ctx = ctx;
        Ok(())
    }

    fn supports(&self, kind: ConversionKind, width: u32, height: u32) -> bool {
        // Kernels write whole macropixels, odd widths would overrun the row
        kind == ConversionKind::Uyvy
            && width >= 2
            && width % 2 == 0
            && height >= 1
            && i32::try_from(width).is_ok()
            && i32::try_from(height).is_ok()
    }

    fn convert(
        &mut self,
        kind: ConversionKind,
        src: &RawFrame,
        dst: &mut EncodedFrame,
    ) -> Result<(), AccelError> {
        if kind != ConversionKind::Uyvy {
            return Err(AccelError::Unsupported {
                backend: self.name(),
                kind,
            });
        }
        let lib = self
            .library()
            .cloned()
            .ok_or_else(|| AccelError::Unavailable("library not loaded".into()))?;
        if self.ctx.is_null() {
            return Err(AccelError::Backend("context not initialized".into()));
        }

        dst.prepare(PixelLayout::Uyvy422, src.width(), src.height());
        let out = dst
            .packed_mut()
            .ok_or_else(|| AccelError::Backend("UYVY frame is not packed".into()))?;

        let ok = unsafe {
            (lib.convert_uyvy)(
                self.ctx,
                src.pixels().as_ptr(),
                out.as_mut_ptr(),
                src.width() as i32,
                src.height() as i32,
            )
        };
        if ok {
            Ok(())
        } else {
            Err(AccelError::Backend(format!("{}_gpu_convert_rgba_to_uyvy failed", lib.prefix)))
        }
    }

    fn close(&mut self) {
        if self.ctx.is_null() {
            return;
        }
        if let Some(lib) = self.library() {
            unsafe { (lib.shutdown)(self.ctx) };
        }
        self.ctx = ptr::null_mut();
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        let lib = self.library()?;
        if self.ctx.is_null() {
            return None;
        }

        let device_name = lib
            .device_name
            .map(|f| unsafe { f(self.ctx) })
            .filter(|p| !p.is_null())
            .map(|p| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        let (mut free, mut total) = (0usize, 0usize);
        let has_memory = lib
            .memory_info
            .map(|f| unsafe { f(self.ctx, &mut free, &mut total) })
            .unwrap_or(false);

        Some(DeviceInfo {
            backend: format!("{} ({})", self.name(), lib.prefix),
            device_name,
            memory_free: has_memory.then_some(free as u64),
            memory_total: has_memory.then_some(total as u64),
        })
    }
}

impl Drop for VendorLibraryAccelerator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{AccelerationContext, AccelerationState};

    #[test]
    fn test_missing_library_is_unavailable() {
        let mut accel = VendorLibraryAccelerator::with_path("/nonexistent/libframecast_missing.so");
        assert!(!accel.is_available());
        assert!(matches!(accel.open(), Err(AccelError::Unavailable(_))));
        assert!(accel.device_info().is_none());
        // close without open is harmless
        accel.close();
    }

    #[test]
    fn test_context_degrades_without_library() {
        let ctx = AccelerationContext::new(Box::new(VendorLibraryAccelerator::with_path(
            "/nonexistent/libframecast_missing.so",
        )));
        assert!(ctx.initialize().is_err());
        assert_eq!(ctx.state(), AccelerationState::Unavailable);
    }

    #[test]
    fn test_supports_only_uyvy() {
        let accel = VendorLibraryAccelerator::with_path("unused");
        assert!(accel.supports(ConversionKind::Uyvy, 1920, 1080));
        assert!(!accel.supports(
            ConversionKind::Planar16(crate::metadata::TransferFunction::Pq),
            1920,
            1080
        ));
        assert!(!accel.supports(ConversionKind::Uyvy, 3, 1));
        assert!(!accel.supports(ConversionKind::Uyvy, 1, 4));
        assert!(!accel.supports(ConversionKind::Uyvy, 1919, 1080));
        assert!(accel.supports(ConversionKind::Uyvy, 2, 1));
    }

    #[test]
    fn test_prefix_needs_every_entry_point() {
        let exported = |names: &[&str]| -> Vec<Vec<u8>> {
            names
                .iter()
                .map(|n| format!("{}\0", n).into_bytes())
                .collect()
        };

        // Partial CUDA export falls through to a complete Metal one
        let symbols = exported(&[
            "cuda_gpu_is_available",
            "metal_gpu_is_available",
            "metal_gpu_init",
            "metal_gpu_shutdown",
            "metal_gpu_convert_rgba_to_uyvy",
        ]);
        assert_eq!(usable_prefix(|name| symbols.iter().any(|s| s == name)), Some("metal"));

        let complete = exported(&[
            "cuda_gpu_is_available",
            "cuda_gpu_init",
            "cuda_gpu_shutdown",
            "cuda_gpu_convert_rgba_to_uyvy",
        ]);
        assert_eq!(usable_prefix(|name| complete.iter().any(|s| s == name)), Some("cuda"));

        let partial = exported(&["cuda_gpu_init", "metal_gpu_shutdown"]);
        assert_eq!(usable_prefix(|name| partial.iter().any(|s| s == name)), None);
    }

    #[test]
    fn test_symbol_names() {
        assert_eq!(symbol_name("cuda", "init"), b"cuda_gpu_init\0".to_vec());
        assert_eq!(
            symbol_name("metal", "convert_rgba_to_uyvy"),
            b"metal_gpu_convert_rgba_to_uyvy\0".to_vec()
        );
    }
}
