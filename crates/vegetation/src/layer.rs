//! Vegetation as a drawable layer: the streaming renderer plus its GPU batch.

use crate::batch::VegetationRenderer;
use crate::collision::CollisionBackend;
use crate::source::PlacementSource;
use renderer::{Atlas, Camera, Frustum, GpuInstanceBatch, Renderable};

pub struct VegetationLayer<S: PlacementSource, C: CollisionBackend> {
    renderer: VegetationRenderer<S, C>,
    gpu: GpuInstanceBatch,
}

impl<S: PlacementSource, C: CollisionBackend> VegetationLayer<S, C> {
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        color_format: wgpu::TextureFormat,
        depth_format: Option<wgpu::TextureFormat>,
        renderer: VegetationRenderer<S, C>,
        atlas: &Atlas,
    ) -> Self {
        let gpu = GpuInstanceBatch::new(device, queue, color_format, depth_format, renderer.allocator(), atlas);
        Self { renderer, gpu }
    }

    pub fn renderer(&self) -> &VegetationRenderer<S, C> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut VegetationRenderer<S, C> {
        &mut self.renderer
    }

    pub fn into_renderer(self) -> VegetationRenderer<S, C> {
        self.renderer
    }
}

impl<S: PlacementSource, C: CollisionBackend> Renderable for VegetationLayer<S, C> {
    fn prepare(&mut self, queue: &wgpu::Queue, camera: &Camera) {
        self.gpu.update_camera(queue, camera);
        let rows = self.gpu.upload_attributes(queue, self.renderer.allocator_mut());
        if rows > 0 {
            log::trace!("Uploaded {} attribute rows", rows);
        }
    }

    fn draw(&self, pass: &mut wgpu::RenderPass<'_>, frustum: &Frustum) -> u32 {
        self.gpu.record(pass, self.renderer.allocator(), frustum)
    }
}
