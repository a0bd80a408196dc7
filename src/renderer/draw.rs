use bytemuck::Pod;
use glam::Mat4;
use hecs::Entity;

use crate::asset::{Handle, Mesh};
use crate::renderer::buffer::DynamicUniforms;
use crate::renderer::uniforms::ObjectUniform;
use crate::renderer::{GraphicsContext, Material};
use crate::scene::{MeshComponent, Scene};

/// One subset draw with its object uniform already staged.
#[derive(Debug, Clone, Copy)]
pub struct DrawItem {
    pub mesh: Handle<Mesh>,
    pub material: Handle<Material>,
    pub first_index: u32,
    pub index_count: u32,
    pub object_offset: u32,
    pub world: Mat4,
}

/// Per-pass and per-object uniforms bound together as group 0 with two
/// dynamic offsets.
pub struct PassUniforms<P: Pod> {
    label: String,
    pass: DynamicUniforms<P>,
    objects: DynamicUniforms<ObjectUniform>,
    layout: wgpu::BindGroupLayout,
    bind_group: Option<wgpu::BindGroup>,
    generations: (u64, u64),
}

impl<P: Pod> PassUniforms<P> {
    pub fn new(ctx: &GraphicsContext, label: &str, pass_visibility: wgpu::ShaderStages) -> Self {
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{label}Layout")),
                entries: &[
                    DynamicUniforms::<P>::layout_entry(0, pass_visibility),
                    DynamicUniforms::<ObjectUniform>::layout_entry(
                        1,
                        wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ),
                ],
            });

        Self {
            label: label.to_owned(),
            pass: DynamicUniforms::new(ctx, &format!("{label}Pass"), 16),
            objects: DynamicUniforms::new(ctx, &format!("{label}Objects"), 256),
            layout,
            bind_group: None,
            generations: (u64::MAX, u64::MAX),
        }
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn clear(&mut self) {
        self.pass.clear();
        self.objects.clear();
    }

    pub fn push_pass(&mut self, value: P) -> u32 {
        self.pass.push(value)
    }

    pub fn objects_mut(&mut self) -> &mut DynamicUniforms<ObjectUniform> {
        &mut self.objects
    }

    /// Upload staged data; rebuilds the bind group when a buffer was
    /// reallocated.
    pub fn flush(&mut self, ctx: &GraphicsContext) {
        self.pass.flush(ctx);
        self.objects.flush(ctx);

        let generations = (self.pass.generation(), self.objects.generation());
        if self.bind_group.is_none() || generations != self.generations {
            self.bind_group = Some(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{}BindGroup", self.label)),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.pass.binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.objects.binding(),
                    },
                ],
            }));
            self.generations = generations;
        }
    }

    /// `None` before the first flush.
    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.bind_group.as_ref()
    }
}

/// Stage object uniforms for every subset of the given mesh entities.
pub fn collect_draws(
    scene: &Scene,
    entities: &[Entity],
    view_proj: Mat4,
    objects: &mut DynamicUniforms<ObjectUniform>,
) -> Vec<DrawItem> {
    let mut items = Vec::new();
    for &entity in entities {
        let Ok(component) = scene.world.get::<&MeshComponent>(entity) else {
            continue;
        };
        let Some(mesh) = scene.assets.meshes.get(component.mesh) else {
            log::debug!("Entity {:?} references a missing mesh", entity);
            continue;
        };

        let world = scene.world_matrix(entity);
        let object_offset = objects.push(ObjectUniform::new(world, view_proj));

        for (index, subset) in mesh.subsets().iter().enumerate() {
            let Some(material) = component.material_for_subset(index) else {
                continue;
            };
            items.push(DrawItem {
                mesh: component.mesh,
                material,
                first_index: subset.first_index,
                index_count: subset.index_count,
                object_offset,
                world,
            });
        }
    }
    items
}

/// Record the draws. Group 0 receives `[pass_offset, object_offset]`, the
/// material goes to `material_group`. Draws with missing assets are skipped.
pub fn record_draws(
    pass: &mut wgpu::RenderPass<'_>,
    scene: &Scene,
    items: &[DrawItem],
    uniforms: &wgpu::BindGroup,
    pass_offset: u32,
    material_group: u32,
    instances: u32,
) {
    for item in items {
        let (Some(mesh), Some(material)) = (
            scene.assets.meshes.get(item.mesh),
            scene.assets.materials.get(item.material),
        ) else {
            continue;
        };
        let Some(material_bind_group) = material.bind_group() else {
            log::debug!("Skipping draw with uncommitted material");
            continue;
        };

        pass.set_bind_group(0, uniforms, &[pass_offset, item.object_offset]);
        pass.set_bind_group(material_group, material_bind_group, &[]);
        pass.set_vertex_buffer(0, mesh.vertex_buffer().slice(..));
        pass.set_index_buffer(mesh.index_buffer().slice(..), mesh.index_format());
        pass.draw_indexed(
            item.first_index..item.first_index + item.index_count,
            0,
            0..instances,
        );
    }
}
