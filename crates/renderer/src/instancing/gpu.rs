//! GPU resources for the instanced vegetation batch.

use super::allocator::InstancedGeometryAllocator;
use super::attribute::AttributeChannel;
use crate::atlas::{Atlas, AtlasChannel};
use crate::camera::{Camera, CameraUniform, Frustum};
use crate::mesh::Mesh;
use crate::vertex::Vertex;
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use wgpu::util::DeviceExt;

/// Vertex-stage source (draw-call slot addressing, quaternion rotation).
pub const VEGETATION_SHADER: &str = include_str!("../shaders/vegetation.wgsl");

/// Something that uploads its own state and records draws into a pass.
pub trait Renderable {
    /// Push CPU-side changes to the GPU. Call once per frame before drawing.
    fn prepare(&mut self, queue: &wgpu::Queue, camera: &Camera);
    /// Record draws for everything intersecting `frustum`. Returns the draw count.
    fn draw(&self, pass: &mut wgpu::RenderPass<'_>, frustum: &Frustum) -> u32;
}

/// Must match vegetation.wgsl `Instancing`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InstancingUniform {
    params: [u32; 4],
}

/// Merged geometry, attribute textures, atlas material and pipeline.
pub struct GpuInstanceBatch {
    pipeline: wgpu::RenderPipeline,
    geometry: Mesh,
    position_texture: wgpu::Texture,
    orientation_texture: wgpu::Texture,
    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
    instance_bind_group: wgpu::BindGroup,
    material_bind_group: wgpu::BindGroup,
    texture_width: u32,
}

impl GpuInstanceBatch {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        color_format: wgpu::TextureFormat,
        depth_format: Option<wgpu::TextureFormat>,
        allocator: &InstancedGeometryAllocator,
        atlas: &Atlas,
    ) -> Self {
        let geometry = allocator.geometry().upload(device);

        let positions = allocator.buffer(AttributeChannel::Position);
        let texture_width = positions.width();
        let texture_height = positions.height();
        let position_texture = create_attribute_texture(device, "Instance Positions", texture_width, texture_height);
        let orientation_texture =
            create_attribute_texture(device, "Instance Orientations", texture_width, texture_height);

        let camera_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vegetation Camera Buffer"),
            contents: bytemuck::cast_slice(&[CameraUniform::new()]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let instancing_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vegetation Instancing Buffer"),
            contents: bytemuck::cast_slice(&[InstancingUniform {
                params: [texture_width, allocator.limits().max_instances_per_draw_call, 0, 0],
            }]),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let color = upload_atlas_channel(device, queue, atlas.image(AtlasChannel::Color), true, [255; 4]);
        let normal = upload_atlas_channel(device, queue, atlas.image(AtlasChannel::Normal), false, [128, 128, 255, 255]);
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Vegetation Atlas Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let camera_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Vegetation Camera Layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX)],
        });
        let instance_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Vegetation Instance Layout"),
            entries: &[
                texture_entry(0, wgpu::ShaderStages::VERTEX, false),
                texture_entry(1, wgpu::ShaderStages::VERTEX, false),
                uniform_entry(2, wgpu::ShaderStages::VERTEX),
            ],
        });
        let material_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Vegetation Material Layout"),
            entries: &[
                texture_entry(0, wgpu::ShaderStages::FRAGMENT, true),
                texture_entry(1, wgpu::ShaderStages::FRAGMENT, true),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let position_view = position_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let orientation_view = orientation_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Vegetation Camera Bind Group"),
            layout: &camera_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            }],
        });
        let instance_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Vegetation Instance Bind Group"),
            layout: &instance_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&position_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&orientation_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: instancing_buffer.as_entire_binding(),
                },
            ],
        });
        let material_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Vegetation Material Bind Group"),
            layout: &material_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&color),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&normal),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vegetation Shader"),
            source: wgpu::ShaderSource::Wgsl(VEGETATION_SHADER.into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Vegetation Pipeline Layout"),
            bind_group_layouts: &[&camera_layout, &instance_layout, &material_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Vegetation Pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[Vertex::layout()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(color_format.into())],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                // Cards are single-sided quads seen from both directions.
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: depth_format.map(|format| wgpu::DepthStencilState {
                format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            geometry,
            position_texture,
            orientation_texture,
            camera_buffer,
            camera_bind_group,
            instance_bind_group,
            material_bind_group,
            texture_width,
        }
    }

    pub fn update_camera(&self, queue: &wgpu::Queue, camera: &Camera) {
        let mut uniform = CameraUniform::new();
        uniform.update(camera);
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::cast_slice(&[uniform]));
    }

    /// Copy dirty attribute rows into the textures. Returns the rows uploaded.
    pub fn upload_attributes(&self, queue: &wgpu::Queue, allocator: &mut InstancedGeometryAllocator) -> u32 {
        let mut uploaded = 0;
        for (channel, rows) in allocator.take_dirty_rows() {
            let Some(rows) = rows else { continue };
            let texture = match channel {
                AttributeChannel::Position => &self.position_texture,
                AttributeChannel::Orientation => &self.orientation_texture,
            };
            let data = allocator.buffer(channel).rows_rgba(rows.clone());
            let row_count = rows.end - rows.start;
            queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: rows.start,
                        z: 0,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                bytemuck::cast_slice(&data),
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.texture_width * 16),
                    rows_per_image: Some(row_count),
                },
                wgpu::Extent3d {
                    width: self.texture_width,
                    height: row_count,
                    depth_or_array_layers: 1,
                },
            );
            uploaded += row_count;
        }
        uploaded
    }

    /// One indexed draw per visible live slot.
    pub fn record(
        &self,
        pass: &mut wgpu::RenderPass<'_>,
        allocator: &InstancedGeometryAllocator,
        frustum: &Frustum,
    ) -> u32 {
        let commands = allocator.draw_commands();
        if commands.is_empty() {
            return 0;
        }
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.camera_bind_group, &[]);
        pass.set_bind_group(1, &self.instance_bind_group, &[]);
        pass.set_bind_group(2, &self.material_bind_group, &[]);
        pass.set_vertex_buffer(0, self.geometry.vertex_buffer.slice(..));
        pass.set_index_buffer(self.geometry.index_buffer.slice(..), wgpu::IndexFormat::Uint32);

        let mut draws = 0;
        for cmd in commands.iter().filter(|c| frustum.intersects_aabb(&c.bounds)) {
            pass.draw_indexed(cmd.indices.clone(), cmd.base_vertex, cmd.instances.clone());
            draws += 1;
        }
        draws
    }
}

fn create_attribute_texture(device: &wgpu::Device, label: &str, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba32Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn upload_atlas_channel(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    image: Option<&RgbaImage>,
    srgb: bool,
    fallback: [u8; 4],
) -> wgpu::TextureView {
    let fallback_image;
    let image = match image {
        Some(img) => img,
        None => {
            fallback_image = RgbaImage::from_pixel(1, 1, image::Rgba(fallback));
            &fallback_image
        }
    };
    let (width, height) = image.dimensions();
    let size = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(if srgb { "Vegetation Atlas Color" } else { "Vegetation Atlas Normal" }),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: if srgb {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        },
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        image.as_raw(),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        },
        size,
    );
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32, visibility: wgpu::ShaderStages, filterable: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}
