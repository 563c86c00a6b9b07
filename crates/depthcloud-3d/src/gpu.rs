//! wgpu compute backend for the unprojection kernel.
//!
//! Validation, candidate grid and compaction are shared with the CPU kernel
//! through [`UnprojectPlan`]; only the per-item body runs on the device.

use depthcloud_tensor::{Tensor, Tensor1, Tensor2, Tensor3, TensorAllocator};
use wgpu::util::DeviceExt;

use crate::{
    pointcloud::PointCloud,
    unproject::{compact, PointOrder, UnprojectConfig, UnprojectError, UnprojectPlan},
};

const WORKGROUP_SIZE: usize = 64;
const MAX_WORKGROUPS_PER_DIM: usize = 65535;

const UNPROJECT_SHADER: &str = r#"
struct Params {
    pose_r0: vec4<f32>,
    pose_r1: vec4<f32>,
    pose_r2: vec4<f32>,
    // fx, fy, cx, cy
    intrinsics: vec4<f32>,
    width: u32,
    cols: u32,
    stride: u32,
    num_candidates: u32,
    depth_scale: f32,
    depth_max: f32,
    have_colors: u32,
    record_indices: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> depth: array<u32>;
@group(0) @binding(2) var<storage, read> colors: array<f32>;
@group(0) @binding(3) var<storage, read_write> out_points: array<f32>;
@group(0) @binding(4) var<storage, read_write> out_colors: array<f32>;
@group(0) @binding(5) var<storage, read_write> out_indices: array<u32>;
@group(0) @binding(6) var<storage, read_write> count: atomic<u32>;

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) num_groups: vec3<u32>,
) {
    let i = global_id.x + global_id.y * num_groups.x * 64u;
    if (i >= params.num_candidates) {
        return;
    }

    let y = (i / params.cols) * params.stride;
    let x = (i % params.cols) * params.stride;
    let pixel = y * params.width + x;

    let d = f32(depth[pixel]) / params.depth_scale;
    if (d <= 0.0 || d >= params.depth_max) {
        return;
    }

    let slot = atomicAdd(&count, 1u);

    let k = params.intrinsics;
    let pc = vec4<f32>(
        (f32(x) - k.z) * d / k.x,
        (f32(y) - k.w) * d / k.y,
        d,
        1.0,
    );
    out_points[slot * 3u] = dot(params.pose_r0, pc);
    out_points[slot * 3u + 1u] = dot(params.pose_r1, pc);
    out_points[slot * 3u + 2u] = dot(params.pose_r2, pc);

    if (params.have_colors != 0u) {
        out_colors[slot * 3u] = colors[pixel * 3u];
        out_colors[slot * 3u + 1u] = colors[pixel * 3u + 1u];
        out_colors[slot * 3u + 2u] = colors[pixel * 3u + 2u];
    }
    if (params.record_indices != 0u) {
        out_indices[slot] = i;
    }
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    pose_r0: [f32; 4],
    pose_r1: [f32; 4],
    pose_r2: [f32; 4],
    intrinsics: [f32; 4],
    width: u32,
    cols: u32,
    stride: u32,
    num_candidates: u32,
    depth_scale: f32,
    depth_max: f32,
    have_colors: u32,
    record_indices: u32,
}

/// GPU context holding the wgpu adapter, device and queue.
pub struct GpuContext {
    /// The logical device.
    pub device: wgpu::Device,
    /// The submission queue of `device`.
    pub queue: wgpu::Queue,
    /// The adapter `device` was created from.
    pub adapter: wgpu::Adapter,
}

impl GpuContext {
    /// Creates a context on the first high-performance adapter.
    ///
    /// # Errors
    ///
    /// Returns [`UnprojectError::Gpu`] if no adapter is available or the
    /// device cannot be created.
    pub async fn new() -> Result<Self, UnprojectError> {
        Self::with_limits(wgpu::Limits::default()).await
    }

    /// Like [`GpuContext::new`], requesting `limits` for the device.
    pub async fn with_limits(limits: wgpu::Limits) -> Result<Self, UnprojectError> {
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
            .ok_or_else(|| UnprojectError::Gpu("no suitable adapter found".to_string()))?;

        let info = adapter.get_info();
        log::info!("using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("depthcloud device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                },
                None,
            )
            .await
            .map_err(|e| UnprojectError::Gpu(format!("failed to create device: {e}")))?;

        Ok(Self {
            device,
            queue,
            adapter,
        })
    }

    fn storage_init<T: bytemuck::Pod>(&self, label: &str, data: &[T]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            })
    }

    fn staging(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        })
    }

    async fn read_back<T: bytemuck::Pod>(&self, staging: &wgpu::Buffer) -> Result<Vec<T>, UnprojectError> {
        let slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = sender.send(v);
        });
        self.device.poll(wgpu::Maintain::Wait);

        match receiver.receive().await {
            Some(Ok(())) => {
                let data = slice.get_mapped_range();
                let values = bytemuck::cast_slice(&data).to_vec();
                drop(data);
                staging.unmap();
                Ok(values)
            }
            Some(Err(e)) => Err(UnprojectError::Gpu(format!("failed to map buffer: {e}"))),
            None => Err(UnprojectError::Gpu("buffer mapping was cancelled".to_string())),
        }
    }
}

/// Unprojects a depth image on the GPU.
///
/// Same inputs, errors and results as [`crate::unproject::unproject_depth`];
/// `config.strategy` is ignored since scheduling belongs to the device.
pub async fn unproject_depth_gpu<const N: usize, A: TensorAllocator>(
    ctx: &GpuContext,
    depth: &Tensor<u16, N, A>,
    colors: Option<&Tensor3<f32, A>>,
    intrinsics: &[[f64; 3]; 3],
    extrinsics: &[[f64; 4]; 4],
    config: &UnprojectConfig,
) -> Result<PointCloud<A>, UnprojectError> {
    let plan = UnprojectPlan::new(depth, colors, intrinsics, extrinsics, config)?;
    let n = plan.num_candidates();
    let alloc = depth.storage.alloc().clone();
    let record_indices = config.order == PointOrder::PixelIndex;

    if n == 0 {
        log::warn!(
            "stride {} leaves no candidate pixel in a {:?} depth image",
            plan.stride(),
            plan.image_size()
        );
        let points = Tensor2::zeros([0, 3], alloc.clone())?;
        let colors = plan
            .have_colors()
            .then(|| Tensor2::zeros([0, 3], alloc))
            .transpose()?;
        return Ok(PointCloud::new(points, colors)?);
    }
    if u32::try_from(depth.numel()).is_err() {
        return Err(UnprojectError::Gpu(format!(
            "depth image of {} pixels exceeds the 32-bit index range",
            depth.numel()
        )));
    }

    let (_, width) = plan.image_size();
    let (rows, cols) = plan.grid();
    log::debug!("dispatching {rows}x{cols} candidates on the gpu");

    let [r0, r1, r2] = *plan.transform().pose_rows();
    let params = Params {
        pose_r0: r0,
        pose_r1: r1,
        pose_r2: r2,
        intrinsics: plan.transform().intrinsics(),
        width: width as u32,
        cols: cols as u32,
        stride: plan.stride() as u32,
        num_candidates: n as u32,
        depth_scale: plan.depth_scale(),
        depth_max: plan.depth_max(),
        have_colors: plan.have_colors() as u32,
        record_indices: record_indices as u32,
    };

    // storage bindings can't be empty, unused outputs get a placeholder
    let depth_wide = depth.as_slice().iter().map(|&d| d as u32).collect::<Vec<_>>();
    let colors_in = match colors.filter(|_| plan.have_colors()) {
        Some(c) => c.as_slice().to_vec(),
        None => vec![0.0f32; 3],
    };
    let colors_len = if plan.have_colors() { n * 3 } else { 3 };
    let indices_len = if record_indices { n } else { 1 };

    check_binding_sizes(
        &ctx.device.limits(),
        &[
            ("depth", std::mem::size_of_val(depth_wide.as_slice())),
            ("colors", std::mem::size_of_val(colors_in.as_slice())),
            ("out points", n * 3 * std::mem::size_of::<f32>()),
            ("out colors", colors_len * std::mem::size_of::<f32>()),
            ("out indices", indices_len * std::mem::size_of::<u32>()),
        ],
    )?;

    let params_buffer = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("unproject params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
    let depth_buffer = ctx.storage_init("depth", &depth_wide);
    let colors_buffer = ctx.storage_init("colors", &colors_in);
    let points_out = ctx.storage_init("out points", &vec![0.0f32; n * 3]);
    let colors_out = ctx.storage_init("out colors", &vec![0.0f32; colors_len]);
    let indices_out = ctx.storage_init("out indices", &vec![0u32; indices_len]);
    let count_buffer = ctx.storage_init("count", &[0u32]);

    let shader = ctx
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("unproject"),
            source: wgpu::ShaderSource::Wgsl(UNPROJECT_SHADER.into()),
        });
    let pipeline = ctx
        .device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("unproject pipeline"),
            layout: None,
            module: &shader,
            entry_point: "main",
            compilation_options: Default::default(),
        });
    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("unproject bindings"),
        layout: &pipeline.get_bind_group_layout(0),
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: depth_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: colors_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: points_out.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: colors_out.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: indices_out.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: count_buffer.as_entire_binding(),
            },
        ],
    });

    let groups = n.div_ceil(WORKGROUP_SIZE);
    let groups_x = groups.min(MAX_WORKGROUPS_PER_DIM);
    let groups_y = groups.div_ceil(groups_x);

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("unproject"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("unproject pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups_x as u32, groups_y as u32, 1);
    }

    let copy = |encoder: &mut wgpu::CommandEncoder, src: &wgpu::Buffer, label: &str| {
        let staging = ctx.staging(label, src.size());
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, src.size());
        staging
    };
    let count_staging = copy(&mut encoder, &count_buffer, "count staging");
    let points_staging = copy(&mut encoder, &points_out, "points staging");
    let colors_staging = plan
        .have_colors()
        .then(|| copy(&mut encoder, &colors_out, "colors staging"));
    let indices_staging = record_indices.then(|| copy(&mut encoder, &indices_out, "indices staging"));
    ctx.queue.submit(std::iter::once(encoder.finish()));

    let count = slot_count(&ctx.read_back::<u32>(&count_staging).await?)?;
    log::debug!("kept {count} of {n} candidates");

    let points = Tensor2::from_shape_vec([n, 3], ctx.read_back(&points_staging).await?, alloc.clone())?;
    let out_colors = match colors_staging {
        Some(staging) => Some(Tensor2::from_shape_vec(
            [n, 3],
            ctx.read_back(&staging).await?,
            alloc.clone(),
        )?),
        None => None,
    };
    let indices = match indices_staging {
        Some(staging) => {
            let raw = ctx.read_back::<u32>(&staging).await?;
            Some(Tensor1::from_shape_vec(
                [n],
                raw.into_iter().map(|i| i as usize).collect(),
                alloc,
            )?)
        }
        None => None,
    };

    compact(points, out_colors, indices, count)
}

fn slot_count(readback: &[u32]) -> Result<usize, UnprojectError> {
    match readback.first() {
        Some(&count) => Ok(count as usize),
        None => Err(UnprojectError::Gpu("empty counter readback".to_string())),
    }
}

/// Rejects storage bindings the device cannot hold, before any buffer exists.
fn check_binding_sizes(limits: &wgpu::Limits, bindings: &[(&str, usize)]) -> Result<(), UnprojectError> {
    let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    for &(label, bytes) in bindings {
        let bytes = bytes as u64;
        if bytes > max {
            return Err(UnprojectError::Gpu(format!(
                "{label} buffer of {bytes} bytes exceeds the device binding limit of {max} bytes"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depthcloud_tensor::CpuAllocator;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 96);
        assert_eq!(std::mem::size_of::<Params>() % 16, 0);
    }

    #[test]
    fn test_slot_count() {
        assert!(matches!(slot_count(&[7]), Ok(7)));
        assert!(matches!(slot_count(&[]), Err(UnprojectError::Gpu(_))));
    }

    #[test]
    fn test_binding_sizes() {
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: 1024,
            ..wgpu::Limits::default()
        };
        assert!(check_binding_sizes(&limits, &[("depth", 1024), ("out points", 12)]).is_ok());
        let res = check_binding_sizes(&limits, &[("depth", 1024), ("out colors", 1036)]);
        assert!(matches!(res, Err(UnprojectError::Gpu(msg)) if msg.contains("out colors")));

        let limits = wgpu::Limits {
            max_buffer_size: 256,
            ..wgpu::Limits::default()
        };
        assert!(check_binding_sizes(&limits, &[("colors", 512)]).is_err());
    }

    #[test]
    fn test_unproject_gpu_oversized_frame() -> Result<(), UnprojectError> {
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: 1024,
            ..wgpu::Limits::downlevel_defaults()
        };
        let Ok(ctx) = pollster::block_on(GpuContext::with_limits(limits)) else {
            eprintln!("no gpu adapter available, skipping");
            return Ok(());
        };

        // 3072 bytes of colors, the cpu path has no such limit
        let depth = Tensor2::from_shape_val([16, 16], 1000u16, CpuAllocator)?;
        let colors = Tensor3::from_shape_val([16, 16, 3], 0.5f32, CpuAllocator)?;
        let k = [[20.0, 0.0, 8.0], [0.0, 20.0, 8.0], [0.0, 0.0, 1.0]];
        let pose = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let config = UnprojectConfig::default();

        let cpu = crate::unproject::unproject_depth(&depth, Some(&colors), &k, &pose, &config)?;
        assert_eq!(cpu.len(), 256);

        let res = pollster::block_on(unproject_depth_gpu(
            &ctx,
            &depth,
            Some(&colors),
            &k,
            &pose,
            &config,
        ));
        assert!(matches!(res, Err(UnprojectError::Gpu(_))));
        Ok(())
    }

    #[test]
    fn test_unproject_gpu_matches_cpu() -> Result<(), UnprojectError> {
        let Ok(ctx) = pollster::block_on(GpuContext::new()) else {
            eprintln!("no gpu adapter available, skipping");
            return Ok(());
        };

        let depth = Tensor2::from_shape_fn([24, 32], CpuAllocator, |[r, c]| {
            if (r + c) % 5 == 0 {
                0
            } else {
                (400 + r * 37 + c * 11) as u16
            }
        })?;
        let colors = Tensor3::from_shape_fn([24, 32, 3], CpuAllocator, |[r, c, ch]| {
            (r * 32 + c) as f32 + ch as f32 * 0.1
        })?;
        let k = [[30.0, 0.0, 16.0], [0.0, 30.0, 12.0], [0.0, 0.0, 1.0]];
        let pose = [
            [1.0, 0.0, 0.0, 0.5],
            [0.0, 1.0, 0.0, -0.25],
            [0.0, 0.0, 1.0, 1.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let config = UnprojectConfig::default()
            .with_stride(2)
            .with_order(PointOrder::PixelIndex);

        let cpu = crate::unproject::unproject_depth(&depth, Some(&colors), &k, &pose, &config)?;
        let gpu = pollster::block_on(unproject_depth_gpu(
            &ctx,
            &depth,
            Some(&colors),
            &k,
            &pose,
            &config,
        ))?;

        assert_eq!(cpu.len(), gpu.len());
        for (a, b) in cpu.iter_points().zip(gpu.iter_points()) {
            for (x, y) in a.iter().zip(b.iter()) {
                approx::assert_relative_eq!(x, y, epsilon = 1e-4);
            }
        }
        assert_eq!(
            cpu.colors().map(|c| c.as_slice().to_vec()),
            gpu.colors().map(|c| c.as_slice().to_vec())
        );
        Ok(())
    }
}
