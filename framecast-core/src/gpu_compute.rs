//! # GPU Compute Accelerator
//!
//! Vendor-neutral frame conversion using wgpu compute shaders.
//!
//! - RGBA float → UYVY 4:2:2 (BT.709, full range)
//! - RGBA float → 16-bit planar 4:2:2 (limited range, BT.2020)
//!
//! One invocation handles one horizontal pixel pair, so only even widths run
//! here; odd widths are reported unsupported and go to the CPU. Device
//! buffers are kept between frames and rebuilt only when the size changes.

use crate::accel::{AccelError, Accelerator, ConversionKind, DeviceInfo};
use crate::frame::{EncodedFrame, RawFrame};
use crate::pixel_convert::ColorMatrix;
use std::sync::Arc;

// ============================================================================
// Compute Shaders (WGSL)
// ============================================================================

const SHADER_COMMON: &str = r#"
struct Params {
    width: u32,
    height: u32,
    pairs: u32,
    _pad: u32,
    m_y: vec4<f32>,
    m_u: vec4<f32>,
    m_v: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> rgba: array<f32>;

// Input rows are bottom-up; NaN maps to black
fn load_rgb(x: u32, src_row: u32) -> vec3<f32> {
    let i = (src_row * params.width + x) * 4u;
    let c = vec3<f32>(rgba[i], rgba[i + 1u], rgba[i + 2u]);
    let clean = select(c, vec3<f32>(0.0), c != c);
    return clamp(clean, vec3<f32>(0.0), vec3<f32>(1.0));
}

fn quant(v: f32, lo: f32, hi: f32) -> u32 {
    return u32(clamp(floor(v + 0.5), lo, hi));
}
"#;

/// RGBA float to UYVY, one u32 macropixel per pixel pair
const SHADER_UYVY: &str = r#"
@group(0) @binding(2) var<storage, read_write> out_packed: array<u32>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let px = gid.x;
    let row = gid.y;
    if px >= params.pairs || row >= params.height {
        return;
    }

    let src_row = params.height - 1u - row;
    let a = load_rgb(px * 2u, src_row);
    let b = load_rgb(px * 2u + 1u, src_row);

    let y0 = dot(params.m_y.xyz, a);
    let y1 = dot(params.m_y.xyz, b);
    let u = (dot(params.m_u.xyz, a) + dot(params.m_u.xyz, b)) * 0.5;
    let v = (dot(params.m_v.xyz, a) + dot(params.m_v.xyz, b)) * 0.5;

    // Byte order U, Y0, V, Y1
    let packed = quant(128.0 + u * 255.0, 0.0, 255.0)
        | (quant(y0 * 255.0, 0.0, 255.0) << 8u)
        | (quant(128.0 + v * 255.0, 0.0, 255.0) << 16u)
        | (quant(y1 * 255.0, 0.0, 255.0) << 24u);

    out_packed[row * params.pairs + px] = packed;
}
"#;

/// RGBA float to 16-bit planar 4:2:2, two u16 samples per u32
const SHADER_PLANAR16: &str = r#"
@group(0) @binding(2) var<storage, read_write> out_y: array<u32>;
@group(0) @binding(3) var<storage, read_write> out_uv: array<u32>;

fn luma16(y: f32) -> u32 {
    return quant(4096.0 + y * 56064.0, 4096.0, 60160.0);
}

fn chroma16(c: f32) -> u32 {
    return quant(32768.0 + c * 57344.0, 4096.0, 61440.0);
}

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let px = gid.x;
    let row = gid.y;
    if px >= params.pairs || row >= params.height {
        return;
    }

    let src_row = params.height - 1u - row;
    let a = load_rgb(px * 2u, src_row);
    let b = load_rgb(px * 2u + 1u, src_row);

    let y0 = dot(params.m_y.xyz, a);
    let y1 = dot(params.m_y.xyz, b);
    let u = (dot(params.m_u.xyz, a) + dot(params.m_u.xyz, b)) * 0.5;
    let v = (dot(params.m_v.xyz, a) + dot(params.m_v.xyz, b)) * 0.5;

    let idx = row * params.pairs + px;
    out_y[idx] = luma16(y0) | (luma16(y1) << 16u);
    out_uv[idx] = chroma16(u) | (chroma16(v) << 16u);
}
"#;

const WORKGROUP: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ConvertParams {
    width: u32,
    height: u32,
    pairs: u32,
    _pad: u32,
    m_y: [f32; 4],
    m_u: [f32; 4],
    m_v: [f32; 4],
}

impl ConvertParams {
    fn new(width: u32, height: u32, matrix: ColorMatrix) -> Self {
        let m = matrix.rgb_to_yuv_matrix();
        Self {
            width,
            height,
            pairs: width / 2,
            _pad: 0,
            m_y: [m[0][0], m[0][1], m[0][2], 0.0],
            m_u: [m[1][0], m[1][1], m[1][2], 0.0],
            m_v: [m[2][0], m[2][1], m[2][2], 0.0],
        }
    }
}

// ============================================================================
// Device State
// ============================================================================

/// Per-size buffers, reused across frames
struct FrameResources {
    width: u32,
    height: u32,
    input: wgpu::Buffer,
    out_a: wgpu::Buffer,
    out_b: wgpu::Buffer,
    staging: wgpu::Buffer,
    uyvy_bind_group: wgpu::BindGroup,
    planar_bind_group: wgpu::BindGroup,
}

struct GpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_name: String,
    backend: String,

    uyvy_pipeline: wgpu::ComputePipeline,
    uyvy_bind_group_layout: wgpu::BindGroupLayout,
    planar_pipeline: wgpu::ComputePipeline,
    planar_bind_group_layout: wgpu::BindGroupLayout,

    params_buffer: wgpu::Buffer,
    frame: Option<FrameResources>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn is_hardware(info: &wgpu::AdapterInfo) -> bool {
    info.device_type != wgpu::DeviceType::Cpu
}

impl GpuDevice {
    async fn new() -> Result<Self, AccelError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| AccelError::Unavailable("No GPU adapter found".into()))?;

        let info = adapter.get_info();
        if !is_hardware(&info) {
            return Err(AccelError::Unavailable(format!(
                "{} is a software adapter",
                info.name
            )));
        }

        // Full-resolution float frames exceed the default 128 MiB binding limit
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    label: Some("frame_converter"),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| AccelError::Unavailable(format!("Device error: {}", e)))?;

        device.on_uncaptured_error(Box::new(|e| {
            tracing::error!("wgpu uncaptured error: {}", e);
        }));

        let device = Arc::new(device);
        let queue = Arc::new(queue);

        tracing::info!("GPU frame converter: {} ({:?})", info.name, info.backend);

        // UYVY pipeline
        let uyvy_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("uyvy_shader"),
            source: wgpu::ShaderSource::Wgsl(format!("{}{}", SHADER_COMMON, SHADER_UYVY).into()),
        });

        let uyvy_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("uyvy_bind_group_layout"),
                entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
            });

        let uyvy_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("uyvy_pipeline_layout"),
            bind_group_layouts: &[&uyvy_bind_group_layout],
            push_constant_ranges: &[],
        });

        let uyvy_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("uyvy_pipeline"),
            layout: Some(&uyvy_pipeline_layout),
            module: &uyvy_shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        // Planar16 pipeline
        let planar_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("planar16_shader"),
            source: wgpu::ShaderSource::Wgsl(
                format!("{}{}", SHADER_COMMON, SHADER_PLANAR16).into(),
            ),
        });

        let planar_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("planar16_bind_group_layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, false),
                    storage_entry(3, false),
                ],
            });

        let planar_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("planar16_pipeline_layout"),
                bind_group_layouts: &[&planar_bind_group_layout],
                push_constant_ranges: &[],
            });

        let planar_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("planar16_pipeline"),
            layout: Some(&planar_pipeline_layout),
            module: &planar_shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("convert_params"),
            size: std::mem::size_of::<ConvertParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            adapter_name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            uyvy_pipeline,
            uyvy_bind_group_layout,
            planar_pipeline,
            planar_bind_group_layout,
            params_buffer,
            frame: None,
        })
    }

    fn max_binding(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }

    fn ensure_frame(&mut self, width: u32, height: u32) {
        if let Some(frame) = &self.frame {
            if frame.width == width && frame.height == height {
                return;
            }
        }

        let pixels = width as u64 * height as u64;
        let input_size = pixels * 16;
        let plane_size = pixels * 2;

        let input = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rgba_input"),
            size: input_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let out_a = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output_a"),
            size: plane_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let out_b = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output_b"),
            size: plane_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_buffer"),
            size: plane_size * 2,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uyvy_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("uyvy_bind_group"),
            layout: &self.uyvy_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: out_a.as_entire_binding(),
                },
            ],
        });

        let planar_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("planar16_bind_group"),
            layout: &self.planar_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: out_a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out_b.as_entire_binding(),
                },
            ],
        });

        tracing::debug!("GPU frame buffers allocated for {}x{}", width, height);

        self.frame = Some(FrameResources {
            width,
            height,
            input,
            out_a,
            out_b,
            staging,
            uyvy_bind_group,
            planar_bind_group,
        });
    }

    fn convert(
        &mut self,
        kind: ConversionKind,
        src: &RawFrame,
        dst: &mut EncodedFrame,
    ) -> Result<(), AccelError> {
        let width = src.width();
        let height = src.height();
        self.ensure_frame(width, height);
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| AccelError::Backend("frame buffers missing".into()))?;

        let params = ConvertParams::new(width, height, ColorMatrix::for_layout(kind.layout()));
        let plane_size = width as u64 * height as u64 * 2;
        let readback_size = match kind {
            ConversionKind::Uyvy => plane_size,
            ConversionKind::Planar16(_) => plane_size * 2,
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[params]));
        self.queue
            .write_buffer(&frame.input, 0, bytemuck::cast_slice(src.pixels()));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("convert_encoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("convert_pass"),
                timestamp_writes: None,
            });
            match kind {
                ConversionKind::Uyvy => {
                    pass.set_pipeline(&self.uyvy_pipeline);
                    pass.set_bind_group(0, &frame.uyvy_bind_group, &[]);
                }
                ConversionKind::Planar16(_) => {
                    pass.set_pipeline(&self.planar_pipeline);
                    pass.set_bind_group(0, &frame.planar_bind_group, &[]);
                }
            }
            pass.dispatch_workgroups(
                params.pairs.div_ceil(WORKGROUP),
                height.div_ceil(WORKGROUP),
                1,
            );
        }

        encoder.copy_buffer_to_buffer(&frame.out_a, 0, &frame.staging, 0, plane_size);
        if let ConversionKind::Planar16(_) = kind {
            encoder.copy_buffer_to_buffer(&frame.out_b, 0, &frame.staging, plane_size, plane_size);
        }
        self.queue.submit(Some(encoder.finish()));

        // Read back result
        let buffer_slice = frame.staging.slice(0..readback_size);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            frame.staging.unmap();
            return Err(AccelError::Backend(format!("GPU validation error: {}", error)));
        }

        rx.recv()
            .map_err(|_| AccelError::Backend("readback callback dropped".into()))?
            .map_err(|e| AccelError::Backend(format!("readback failed: {}", e)))?;

        dst.prepare(kind.layout(), width, height);
        {
            let data = buffer_slice.get_mapped_range();
            let out = dst.as_bytes_mut();
            if out.len() as u64 != readback_size {
                drop(data);
                frame.staging.unmap();
                return Err(AccelError::Backend("readback size mismatch".into()));
            }
            out.copy_from_slice(&data);
        }
        frame.staging.unmap();

        Ok(())
    }
}

// ============================================================================
// Accelerator
// ============================================================================

pub struct GpuComputeAccelerator {
    gpu: Option<GpuDevice>,
    frames_processed: u64,
}

impl Default for GpuComputeAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuComputeAccelerator {
    pub fn new() -> Self {
        Self {
            gpu: None,
            frames_processed: 0,
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }
}

impl Accelerator for GpuComputeAccelerator {
    fn name(&self) -> &'static str {
        "GPU Compute"
    }

    fn is_available(&self) -> bool {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        instance
            .enumerate_adapters(wgpu::Backends::all())
            .iter()
            .any(|adapter| is_hardware(&adapter.get_info()))
    }

    fn open(&mut self) -> Result<(), AccelError> {
        if self.gpu.is_some() {
            return Ok(());
        }
        self.gpu = Some(pollster::block_on(GpuDevice::new())?);
        Ok(())
    }

    fn supports(&self, _kind: ConversionKind, width: u32, height: u32) -> bool {
        if width < 2 || width % 2 != 0 || height == 0 {
            return false;
        }
        let Some(gpu) = &self.gpu else {
            return false;
        };
        let input_size = width as u64 * height as u64 * 16;
        let max_groups = gpu.device.limits().max_compute_workgroups_per_dimension;
        input_size <= gpu.max_binding()
            && (width / 2).div_ceil(WORKGROUP) <= max_groups
            && height.div_ceil(WORKGROUP) <= max_groups
    }

    fn convert(
        &mut self,
        kind: ConversionKind,
        src: &RawFrame,
        dst: &mut EncodedFrame,
    ) -> Result<(), AccelError> {
        let gpu = self
            .gpu
            .as_mut()
            .ok_or_else(|| AccelError::Backend("GPU device not open".into()))?;
        gpu.convert(kind, src, dst)?;
        self.frames_processed += 1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            tracing::debug!(
                "GPU frame converter released after {} frames",
                self.frames_processed
            );
            drop(gpu);
        }
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        let gpu = self.gpu.as_ref()?;
        Some(DeviceInfo {
            backend: format!("{} ({})", self.name(), gpu.backend),
            device_name: gpu.adapter_name.clone(),
            memory_free: None,
            memory_total: None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use crate::metadata::TransferFunction;
    use crate::pixel_convert::PixelConverter;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<ConvertParams>(), 64);
        let p = ConvertParams::new(1920, 1080, ColorMatrix::BT709);
        assert_eq!(p.pairs, 960);
        assert!((p.m_y[0] - 0.2126).abs() < 1e-6);
        assert_eq!(p.m_u[2], 0.5);
    }

    #[test]
    fn test_unopened_supports_nothing() {
        let accel = GpuComputeAccelerator::new();
        assert!(!accel.supports(ConversionKind::Uyvy, 1920, 1080));
        assert!(accel.device_info().is_none());
    }

    fn test_image(width: u32, height: u32) -> RawFrame {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(x as f32 / width as f32);
                pixels.push(y as f32 / height as f32);
                pixels.push(((x + y) % 7) as f32 / 6.0);
                pixels.push(1.0);
            }
        }
        RawFrame::new(width, height, pixels).unwrap()
    }

    fn assert_within_one(a: &[u8], b: &[u8]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((*x as i32 - *y as i32).abs() <= 1, "byte {} differs: {} vs {}", i, x, y);
        }
    }

    #[test]
    #[ignore = "requires a hardware GPU adapter"]
    fn test_gpu_cpu_parity() {
        let mut accel = GpuComputeAccelerator::new();
        accel.open().unwrap();
        let cpu = PixelConverter::new();
        let src = test_image(64, 36);

        let mut gpu_out = EncodedFrame::new(PixelLayout::Uyvy422, 64, 36);
        let mut cpu_out = EncodedFrame::new(PixelLayout::Uyvy422, 64, 36);
        accel.convert(ConversionKind::Uyvy, &src, &mut gpu_out).unwrap();
        cpu.convert_to_uyvy(&src, &mut cpu_out);
        assert_within_one(gpu_out.as_bytes(), cpu_out.as_bytes());

        let kind = ConversionKind::Planar16(TransferFunction::Pq);
        accel.convert(kind, &src, &mut gpu_out).unwrap();
        cpu.convert_to_planar16(&src, &mut cpu_out);
        let (gy, guv) = gpu_out.planes().unwrap();
        let (cy, cuv) = cpu_out.planes().unwrap();
        for (g, c) in gy.iter().chain(guv).zip(cy.iter().chain(cuv)) {
            assert!((*g as i32 - *c as i32).abs() <= 1);
        }

        // Black level is backend independent
        let black = RawFrame::filled(64, 36, [0.0; 4]).unwrap();
        accel.convert(ConversionKind::Uyvy, &black, &mut gpu_out).unwrap();
        cpu.convert_to_uyvy(&black, &mut cpu_out);
        assert_eq!(gpu_out.as_bytes(), cpu_out.as_bytes());

        accel.close();
    }
}
