//! GPU-accelerated kernels using WGPU.
//!
//! This module runs a subset of the kernel interface as WGSL compute shaders:
//!
//! - `add`: scaled elementwise sum, with optional accumulation
//! - `relu`: ReLU activation
//! - `mult2d`: matrix multiplication (transposes are materialized on the host)
//!
//! Every other operation reports as unsupported and is executed by the CPU
//! emulation adapter. The device context and the pipelines are created once
//! (via `lazy_static`) on first use; a machine without a usable adapter turns
//! every GPU kernel call into [`Error::Backend`].

use std::sync::mpsc;

use briny::prelude::*;
use wgpu::util::DeviceExt;

use super::cpu::CpuKernels;
use super::{Dims2, Kernels, Op};
use crate::error::{Error, Result};

const MATMUL: &str = include_str!("shaders/matmul.wgsl");
const ADD: &str = include_str!("shaders/add.wgsl");
const RELU: &str = include_str!("shaders/relu.wgsl");

/// Largest 1D dispatch (in workgroups) before the host path is used instead.
const MAX_GROUPS: u32 = 65_535;

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
    /// The shader source was rejected before compilation.
    Shader(&'static str),
    /// Buffer mapping or device polling failed.
    Readback(String),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "Adapter error: {e}"),
            GpuError::Device(e) => write!(f, "Device error: {e}"),
            GpuError::Shader(label) => write!(f, "Shader {label} failed validation"),
            GpuError::Readback(e) => write!(f, "Readback error: {e}"),
        }
    }
}

impl From<GpuError> for Error {
    fn from(e: GpuError) -> Self {
        Error::Backend(e.to_string())
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// Uses `pollster::block_on` to wait on the async WGPU calls.
    pub fn new() -> std::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_net"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self { device, queue })
    }
}

/// Number of GPU adapters visible to WGPU on this machine.
pub fn adapter_count() -> usize {
    wgpu::Instance::default()
        .enumerate_adapters(wgpu::Backends::all())
        .len()
}

/// Secure wrapper for WGSL source code embedded in the binary.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }

        // no source inclusion or host-language escapes
        let forbidden = ["import", "#include", "asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// A compiled compute pipeline plus the layout of its bind group:
/// binding 0 is a uniform block, then `inputs` read-only storage buffers,
/// then one read-write output buffer.
pub struct ComputeKernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    inputs: u32,
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

impl ComputeKernel {
    fn new(ctx: &GpuContext, label: &'static str, source: &str, inputs: u32) -> std::result::Result<Self, GpuError> {
        WgslSource(source).validate().map_err(|_| GpuError::Shader(label))?;
        let device = &ctx.device;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend((1..=inputs).map(|b| storage_entry(b, true)));
        entries.push(storage_entry(inputs + 1, false));

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        Ok(Self {
            layout,
            pipeline,
            inputs,
        })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: std::result::Result<GpuContext, String> =
        GpuContext::new().map_err(|e| e.to_string());
    static ref MATMUL_KERNEL: std::result::Result<ComputeKernel, String> =
        with_context(|ctx| ComputeKernel::new(ctx, "matmul", MATMUL, 2));
    static ref ADD_KERNEL: std::result::Result<ComputeKernel, String> =
        with_context(|ctx| ComputeKernel::new(ctx, "add", ADD, 2));
    static ref RELU_KERNEL: std::result::Result<ComputeKernel, String> =
        with_context(|ctx| ComputeKernel::new(ctx, "relu", RELU, 1));
}

fn with_context(
    f: impl FnOnce(&GpuContext) -> std::result::Result<ComputeKernel, GpuError>,
) -> std::result::Result<ComputeKernel, String> {
    let ctx = GPU_CONTEXT.as_ref().map_err(Clone::clone)?;
    f(ctx).map_err(|e| e.to_string())
}

fn ready(kernel: &'static std::result::Result<ComputeKernel, String>) -> Result<(&'static GpuContext, &'static ComputeKernel)> {
    let ctx = GPU_CONTEXT.as_ref().map_err(|e| Error::Backend(e.clone()))?;
    let kernel = kernel.as_ref().map_err(|e| Error::Backend(e.clone()))?;
    Ok((ctx, kernel))
}

fn f32_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn u32_bytes(v: &[u32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Uploads `inputs` and the current contents of `out`, runs `kernel`, and
/// reads the output buffer back into `out`.
fn run(
    kernel: &'static std::result::Result<ComputeKernel, String>,
    uniform: &[u32],
    inputs: &[&[f32]],
    out: &mut [f32],
    groups: (u32, u32),
) -> Result<()> {
    let (ctx, kernel) = ready(kernel)?;
    debug_assert_eq!(inputs.len() as u32, kernel.inputs);
    let device = &ctx.device;
    let size = (out.len() * 4) as u64;

    let uniform_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("params"),
        contents: &u32_bytes(uniform),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let input_bufs: Vec<wgpu::Buffer> = inputs
        .iter()
        .map(|data| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("input"),
                contents: &f32_bytes(data),
                usage: wgpu::BufferUsages::STORAGE,
            })
        })
        .collect();
    let out_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("output"),
        contents: &f32_bytes(out),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    });

    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: uniform_buf.as_entire_binding(),
    }];
    for (i, buf) in input_bufs.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: buf.as_entire_binding(),
        });
    }
    entries.push(wgpu::BindGroupEntry {
        binding: kernel.inputs + 1,
        resource: out_buf.as_entire_binding(),
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: None,
        layout: &kernel.layout,
        entries: &entries,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, 1);
    }

    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    encoder.copy_buffer_to_buffer(&out_buf, 0, &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| GpuError::Readback(e.to_string()))?;
    rx.recv()
        .map_err(|e| GpuError::Readback(e.to_string()))?
        .map_err(|e| GpuError::Readback(e.to_string()))?;

    {
        let data = slice.get_mapped_range();
        for (o, c) in out.iter_mut().zip(data.chunks_exact(4)) {
            *o = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
        }
    }
    staging.unmap();
    Ok(())
}

fn transposed(a: &[f32], d: Dims2) -> Vec<f32> {
    let mut t = vec![0.0; a.len()];
    for r in 0..d.rows {
        for c in 0..d.cols {
            t[c * d.rows + r] = a[r * d.cols + c];
        }
    }
    t
}

fn groups_1d(n: usize) -> Option<u32> {
    let g = u32::try_from(n.div_ceil(256)).ok()?;
    (g <= MAX_GROUPS).then_some(g)
}

/// Kernel set for [`Device::Gpu`](crate::backend::Device::Gpu).
#[derive(Debug, Default, Clone, Copy)]
pub struct WgpuKernels;

impl Kernels for WgpuKernels {
    fn name(&self) -> &'static str {
        "GPU"
    }

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::Add | Op::Relu | Op::Mult2d)
    }

    fn add(&self, sa: f32, a: &[f32], sb: f32, b: &[f32], c: &mut [f32], inc: bool) -> Result<()> {
        if c.is_empty() {
            return Ok(());
        }
        let Some(g) = groups_1d(c.len()) else {
            return CpuKernels.add(sa, a, sb, b, c, inc);
        };
        let params = [sa.to_bits(), sb.to_bits(), u32::from(inc), c.len() as u32];
        run(&ADD_KERNEL, &params, &[a, b], c, (g, 1))
    }

    fn relu(&self, a: &[f32], c: &mut [f32]) -> Result<()> {
        if c.is_empty() {
            return Ok(());
        }
        let Some(g) = groups_1d(c.len()) else {
            return CpuKernels.relu(a, c);
        };
        run(&RELU_KERNEL, &[c.len() as u32, 0, 0, 0], &[a], c, (g, 1))
    }

    fn mult2d(
        &self,
        a: &[f32],
        ad: Dims2,
        ta: bool,
        b: &[f32],
        bd: Dims2,
        tb: bool,
        c: &mut [f32],
        inc: bool,
    ) -> Result<()> {
        let (m, k) = if ta { (ad.cols, ad.rows) } else { (ad.rows, ad.cols) };
        let n = if tb { bd.rows } else { bd.cols };
        if c.is_empty() {
            return Ok(());
        }
        let gx = u32::try_from(n.div_ceil(16)).unwrap_or(u32::MAX);
        let gy = u32::try_from(m.div_ceil(16)).unwrap_or(u32::MAX);
        if gx > MAX_GROUPS || gy > MAX_GROUPS {
            return CpuKernels.mult2d(a, ad, ta, b, bd, tb, c, inc);
        }

        let a_host = if ta { transposed(a, ad) } else { a.to_vec() };
        let b_host = if tb { transposed(b, bd) } else { b.to_vec() };
        let mut product = vec![0.0; c.len()];
        run(
            &MATMUL_KERNEL,
            &[m as u32, k as u32, n as u32, 0],
            &[&a_host, &b_host],
            &mut product,
            (gx, gy),
        )?;

        if inc {
            for (o, p) in c.iter_mut().zip(product) {
                *o += p;
            }
        } else {
            c.copy_from_slice(&product);
        }
        Ok(())
    }
}
