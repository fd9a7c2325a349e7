// src/path_tracing/wavefront/gpu_compact.rs
// WGSL compaction kernel for the wavefront queue (feature "gpu")
// RELEVANT FILES:src/shaders/integrator_queued_paths.wgsl,src/path_tracing/wavefront/compact.rs

use std::sync::mpsc;

use wgpu::util::DeviceExt;

use super::compact::PathCompactor;
use crate::error::{RenderError, RenderResult};
use crate::path_tracing::kernel::CompactionKind;

/// Must match `@workgroup_size` in the shader.
const WORKGROUP_SIZE: u32 = 256;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct CompactParams {
    work_size: u32,
    flag: u32,
    kind: u32,
    _pad: u32,
}

fn kind_id(kind: CompactionKind) -> u32 {
    match kind {
        CompactionKind::QueuedPaths => 0,
        CompactionKind::QueuedShadowPaths => 1,
        CompactionKind::TerminatedPaths => 2,
    }
}

/// Storage sized for a slot count; grown on demand.
struct CompactBuffers {
    capacity: usize,
    path_tags: wgpu::Buffer,
    shadow_tags: wgpu::Buffer,
    queued_paths: wgpu::Buffer,
    num_queued: wgpu::Buffer,
    readback: wgpu::Buffer,
}

impl CompactBuffers {
    fn new(device: &wgpu::Device, capacity: usize) -> Self {
        let bytes = (capacity.max(1) * std::mem::size_of::<u32>()) as u64;
        let storage = |label: &str, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };
        Self {
            capacity,
            path_tags: storage("integrator-path-tags", wgpu::BufferUsages::COPY_DST),
            shadow_tags: storage("integrator-shadow-tags", wgpu::BufferUsages::COPY_DST),
            queued_paths: storage("integrator-queued-paths", wgpu::BufferUsages::COPY_SRC),
            num_queued: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("integrator-num-queued"),
                size: std::mem::size_of::<u32>() as u64,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            // count followed by indices
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("integrator-queued-paths-readback"),
                size: bytes + std::mem::size_of::<u32>() as u64,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            }),
        }
    }
}

pub struct WgpuCompactor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    buffers: Option<CompactBuffers>,
}

impl WgpuCompactor {
    pub fn new() -> RenderResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| RenderError::device("No suitable GPU adapter for path compaction"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("forge3d-integrator-compaction"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|e| RenderError::device(format!("request_device failed: {e}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("integrator-queued-paths-shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("../../shaders/integrator_queued_paths.wgsl").into(),
            ),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("integrator-queued-paths-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("integrator-queued-paths-pipeline-layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("integrator-queued-paths-pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
        });

        log::info!("GPU path compaction on {}", adapter.get_info().name);

        Ok(Self {
            device,
            queue,
            pipeline,
            layout,
            buffers: None,
        })
    }

    fn ensure_buffers(&mut self, work_size: usize) {
        let grow = self
            .buffers
            .as_ref()
            .map_or(true, |buffers| buffers.capacity < work_size);
        if grow {
            self.buffers = Some(CompactBuffers::new(&self.device, work_size));
        }
    }
}

impl PathCompactor for WgpuCompactor {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn compact(
        &mut self,
        kind: CompactionKind,
        flag: u32,
        path_tags: &[u32],
        shadow_tags: &[u32],
        work_size: usize,
        _threads_per_block: usize,
        queued_paths: &mut Vec<u32>,
    ) -> RenderResult<usize> {
        let work_size = work_size.min(path_tags.len()).min(shadow_tags.len());
        queued_paths.clear();
        if work_size == 0 {
            return Ok(0);
        }

        let num_groups = (work_size as u32).div_ceil(WORKGROUP_SIZE);
        let max_groups = self.device.limits().max_compute_workgroups_per_dimension;
        if num_groups > max_groups {
            return Err(RenderError::device(format!(
                "Compaction of {work_size} slots needs {num_groups} workgroups, limit is {max_groups}"
            )));
        }

        let params = CompactParams {
            work_size: work_size as u32,
            flag,
            kind: kind_id(kind),
            _pad: 0,
        };
        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("integrator-compact-params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        self.ensure_buffers(work_size);
        let Self {
            device,
            queue,
            pipeline,
            layout,
            buffers,
        } = self;
        let buffers = buffers
            .as_ref()
            .ok_or_else(|| RenderError::device("Compaction buffers missing"))?;

        queue.write_buffer(&buffers.path_tags, 0, bytemuck::cast_slice(&path_tags[..work_size]));
        queue.write_buffer(&buffers.shadow_tags, 0, bytemuck::cast_slice(&shadow_tags[..work_size]));
        queue.write_buffer(&buffers.num_queued, 0, bytemuck::bytes_of(&0u32));

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("integrator-queued-paths-bind-group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.path_tags.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.shadow_tags.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.num_queued.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.queued_paths.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("integrator-queued-paths-encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("integrator-queued-paths"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(num_groups, 1, 1);
        }
        let word = std::mem::size_of::<u32>() as u64;
        encoder.copy_buffer_to_buffer(&buffers.num_queued, 0, &buffers.readback, 0, word);
        encoder.copy_buffer_to_buffer(
            &buffers.queued_paths,
            0,
            &buffers.readback,
            word,
            work_size as u64 * word,
        );
        queue.submit(std::iter::once(encoder.finish()));

        let slice = buffers.readback.slice(..(work_size as u64 + 1) * word);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| RenderError::device("map_async callback channel dropped"))?
            .map_err(|e| RenderError::device(format!("Compaction readback failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            let words: &[u32] = bytemuck::cast_slice(&data);
            let count = (words[0] as usize).min(work_size);
            queued_paths.extend_from_slice(&words[1..1 + count]);
        }
        buffers.readback.unmap();

        // Atomic append order is arbitrary.
        queued_paths.sort_unstable();
        log::trace!("GPU compaction {:?} flag {:#x}: {} of {}", kind, flag, queued_paths.len(), work_size);
        Ok(queued_paths.len())
    }
}
