//!
//! The GPU effect: one WGSL program with a vertex and a fragment stage drawn over a whole frame
//!

use std::sync::{mpsc, LazyLock};
use std::time::Duration;

use crate::glib;
use crate::layout::{copy_rows, padded_bytes_per_row, unpadded_bytes_per_row};
use crate::WgpuContext;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "ditectoreffect",
        gst::DebugColorFlags::empty(),
        Some("Ditector GPU effect"),
    )
});

/// Embedded shader inverting the colour channels and keeping alpha as is
pub const INVERT_WGSL: &str = include_str!("shaders/invert.wgsl");

const VERTEX_ENTRY_POINT: &str = "vs_main";
const FRAGMENT_ENTRY_POINT: &str = "fs_main";

/// Format of both the sampled input and the render target
const FRAME_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Wait allowed for any frame, on top of [`SUBMISSION_TIMEOUT_PER_MEGAPIXEL`]
const SUBMISSION_TIMEOUT: Duration = Duration::from_millis(1_000);
const SUBMISSION_TIMEOUT_PER_MEGAPIXEL: Duration = Duration::from_millis(50);

/// How long to wait for one frame of `width`x`height`, software adapters included
fn submission_timeout(width: u32, height: u32) -> Duration {
    let megapixels = (width as u64 * height as u64).div_ceil(1_000_000) as u32;
    SUBMISSION_TIMEOUT + SUBMISSION_TIMEOUT_PER_MEGAPIXEL * megapixels
}

/// A compiled effect, bound to the device it was compiled on
#[derive(Debug)]
pub struct Effect {
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    pipeline: wgpu::RenderPipeline,
}

/// GPU resources sized for one negotiated frame size
#[derive(Debug)]
pub struct FrameTargets {
    width: u32,
    height: u32,
    input_texture: wgpu::Texture,
    output_texture: wgpu::Texture,
    output_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl FrameTargets {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Effect {
    /// Compiles the embedded inversion shader
    pub fn invert(context: &WgpuContext) -> Result<Self, glib::BoolError> {
        Self::new(context, "ditector invert", INVERT_WGSL)
    }

    /// Compiles `source` into a render pipeline.
    ///
    /// The source must provide `vs_main` and `fs_main` and sample a 2D texture at
    /// `@group(0) @binding(0)` with the sampler at `@binding(1)`.
    pub fn new(context: &WgpuContext, label: &str, source: &str) -> Result<Self, glib::BoolError> {
        let device = context.device();

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some(VERTEX_ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some(FRAGMENT_ENTRY_POINT),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: FRAME_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(label),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            gst::error!(CAT, "failed to compile effect {}: {}", label, err);
            return Err(glib::bool_error!("failed to compile effect {}: {}", label, err));
        }

        gst::debug!(CAT, "compiled effect {}", label);

        Ok(Self {
            bind_group_layout,
            sampler,
            pipeline,
        })
    }

    /// Allocates input, render target and readback resources for `width`x`height` frames
    pub fn targets(
        &self,
        context: &WgpuContext,
        width: u32,
        height: u32,
    ) -> Result<FrameTargets, glib::BoolError> {
        let max = context.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(glib::bool_error!(
                "unsupported frame size {}x{}, limit {}",
                width,
                height,
                max
            ));
        }

        let device = context.device();

        let descriptor = wgpu::TextureDescriptor {
            label: Some("ditector input"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        };

        let input_texture = device.create_texture(&descriptor);
        let output_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("ditector output"),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            ..descriptor
        });

        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("ditector readback"),
            size: padded_bytes_per_row(width) as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let input_view = input_texture.create_view(&Default::default());
        let output_view = output_texture.create_view(&Default::default());

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ditector frame"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        gst::debug!(CAT, "allocated targets for {}x{}", width, height);

        Ok(FrameTargets {
            width,
            height,
            input_texture,
            output_texture,
            output_view,
            readback,
            bind_group,
        })
    }

    /// Runs the effect over one frame.
    ///
    /// `input` holds `targets.height()` rows laid out with `input_stride`. The result stays
    /// mapped until the returned [`Readback`] is dropped, so the caller may write it back
    /// into the very frame it uploaded.
    pub fn apply<'t>(
        &self,
        context: &WgpuContext,
        targets: &'t FrameTargets,
        input: &[u8],
        input_stride: usize,
    ) -> Result<Readback<'t>, glib::BoolError> {
        let FrameTargets { width, height, .. } = *targets;
        let row_bytes = unpadded_bytes_per_row(width) as usize;
        let needed = input_stride * (height as usize - 1) + row_bytes;
        if input_stride < row_bytes || input.len() < needed {
            return Err(glib::bool_error!(
                "input frame too short: {} bytes with stride {}, need {}",
                input.len(),
                input_stride,
                needed
            ));
        }

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        context.queue().write_texture(
            targets.input_texture.as_image_copy(),
            &input[..needed],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(input_stride as u32),
                rows_per_image: Some(height),
            },
            extent,
        );

        let mut encoder = context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("ditector render"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("ditector render"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.output_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &targets.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        let padded = padded_bytes_per_row(width);
        encoder.copy_texture_to_buffer(
            targets.output_texture.as_image_copy(),
            wgpu::TexelCopyBufferInfoBase {
                buffer: &targets.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: None,
                },
            },
            extent,
        );

        let index = context.queue().submit([encoder.finish()]);

        let (sender, receiver) = mpsc::channel();
        targets
            .readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });

        if let Err(err) = context.device().poll(wgpu::PollType::Wait {
            submission_index: Some(index),
            timeout: Some(submission_timeout(width, height)),
        }) {
            gst::error!(CAT, "error waiting for the effect: {}", err);
            targets.readback.unmap();
            return Err(glib::bool_error!("error waiting for the effect: {}", err));
        }

        match receiver.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                gst::error!(CAT, "failed to map readback buffer: {}", err);
                return Err(glib::bool_error!("failed to map readback buffer: {}", err));
            }
            Err(_) => {
                targets.readback.unmap();
                return Err(glib::bool_error!("readback buffer not mapped after wait"));
            }
        }

        Ok(Readback {
            targets,
            stride: padded as usize,
            row_bytes,
        })
    }
}

/// Mapped result of [`Effect::apply`], unmapped on drop
#[derive(Debug)]
pub struct Readback<'a> {
    targets: &'a FrameTargets,
    stride: usize,
    row_bytes: usize,
}

impl Readback<'_> {
    /// Copies the processed rows into `output` laid out with `output_stride`
    pub fn copy_to(&self, output: &mut [u8], output_stride: usize) -> Result<(), glib::BoolError> {
        let mapped = self.targets.readback.slice(..).get_mapped_range();
        copy_rows(
            &mapped,
            self.stride,
            output,
            output_stride,
            self.row_bytes,
            self.targets.height as usize,
        )
    }
}

impl Drop for Readback<'_> {
    fn drop(&mut self) {
        self.targets.readback.unmap();
    }
}
