// renderer/material.rs

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::error::Result;
use crate::renderer::buffer::StructuredBuffer;
use crate::renderer::shader::{CompiledShader, ShaderKey, ShaderLibrary};
use crate::renderer::texture::Texture;
use crate::renderer::GraphicsContext;

/// GPU layout of the per-material constants.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct MaterialUniform {
    /// rgb albedo, a emissivity
    pub albedo_emissivity: [f32; 4],
    /// x specular intensity, y shininess
    pub specular_shininess: [f32; 4],
}

impl Default for MaterialUniform {
    fn default() -> Self {
        Self {
            albedo_emissivity: [0.8, 0.8, 0.8, 0.0],
            specular_shininess: [0.2, 16.0, 0.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Color,
    Scalar,
    Texture,
}

#[derive(Debug, Clone)]
pub enum MaterialInput {
    Color(Vec3),
    Scalar(f32),
    Texture(Arc<Texture>),
}

impl MaterialInput {
    pub fn kind(&self) -> InputKind {
        match self {
            MaterialInput::Color(_) => InputKind::Color,
            MaterialInput::Scalar(_) => InputKind::Scalar,
            MaterialInput::Texture(_) => InputKind::Texture,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InputSlot {
    pub tag: &'static str,
    pub kind: InputKind,
}

/// Compiled shader, bind group layout and declared inputs, shared by every
/// material instantiated from it.
pub struct MaterialTemplate {
    name: String,
    shader: Arc<CompiledShader>,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    white: Arc<Texture>,
    slots: Vec<InputSlot>,
}

impl MaterialTemplate {
    pub const ALBEDO: &'static str = "albedo";
    pub const EMISSIVITY: &'static str = "emissivity";
    pub const SPECULAR: &'static str = "specular";
    pub const SHININESS: &'static str = "shininess";
    pub const ALBEDO_MAP: &'static str = "albedo_map";

    /// The standard GBuffer material.
    pub fn deferred(ctx: &GraphicsContext, shaders: &mut ShaderLibrary) -> Result<Arc<Self>> {
        let shader = shaders.graphics(&ctx.device, &ShaderKey::new("gbuffer.wgsl"))?;

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("MaterialLayout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("MaterialSampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Arc::new(Self {
            name: "deferred".to_owned(),
            shader,
            layout,
            sampler,
            white: Arc::new(Texture::white(ctx)),
            slots: Self::deferred_slots(),
        }))
    }

    pub fn deferred_slots() -> Vec<InputSlot> {
        vec![
            InputSlot {
                tag: Self::ALBEDO,
                kind: InputKind::Color,
            },
            InputSlot {
                tag: Self::EMISSIVITY,
                kind: InputKind::Scalar,
            },
            InputSlot {
                tag: Self::SPECULAR,
                kind: InputKind::Scalar,
            },
            InputSlot {
                tag: Self::SHININESS,
                kind: InputKind::Scalar,
            },
            InputSlot {
                tag: Self::ALBEDO_MAP,
                kind: InputKind::Texture,
            },
        ]
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader(&self) -> &CompiledShader {
        &self.shader
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn slots(&self) -> &[InputSlot] {
        &self.slots
    }

    pub fn slot(&self, tag: &str) -> Option<&InputSlot> {
        self.slots.iter().find(|slot| slot.tag == tag)
    }
}

/// Material instance: owns its inputs and GPU constant buffer.
pub struct Material {
    template: Arc<MaterialTemplate>,
    values: MaterialUniform,
    albedo_map: Option<Arc<Texture>>,
    uniform: Option<StructuredBuffer<MaterialUniform>>,
    bind_group: Option<wgpu::BindGroup>,
    dirty: bool,
}

impl Material {
    pub fn new(template: &Arc<MaterialTemplate>) -> Self {
        Self {
            template: Arc::clone(template),
            values: MaterialUniform::default(),
            albedo_map: None,
            uniform: None,
            bind_group: None,
            dirty: true,
        }
    }

    pub fn colored(template: &Arc<MaterialTemplate>, albedo: Vec3, emissivity: f32) -> Self {
        let mut material = Self::new(template);
        material.set_input(MaterialTemplate::ALBEDO, MaterialInput::Color(albedo));
        material.set_input(MaterialTemplate::EMISSIVITY, MaterialInput::Scalar(emissivity));
        material
    }

    pub fn template(&self) -> &Arc<MaterialTemplate> {
        &self.template
    }

    /// Returns false when the template declares no input `tag` of the given
    /// kind; the material is left untouched in that case.
    pub fn set_input(&mut self, tag: &str, input: MaterialInput) -> bool {
        match self.template.slot(tag) {
            Some(slot) if slot.kind == input.kind() => {}
            _ => return false,
        }

        match (tag, input) {
            (MaterialTemplate::ALBEDO, MaterialInput::Color(color)) => {
                self.values.albedo_emissivity[..3].copy_from_slice(&color.to_array());
            }
            (MaterialTemplate::EMISSIVITY, MaterialInput::Scalar(value)) => {
                self.values.albedo_emissivity[3] = value.max(0.0);
            }
            (MaterialTemplate::SPECULAR, MaterialInput::Scalar(value)) => {
                self.values.specular_shininess[0] = value.max(0.0);
            }
            (MaterialTemplate::SHININESS, MaterialInput::Scalar(value)) => {
                self.values.specular_shininess[1] = value.max(1.0);
            }
            (MaterialTemplate::ALBEDO_MAP, MaterialInput::Texture(texture)) => {
                self.albedo_map = Some(texture);
            }
            _ => return false,
        }
        self.dirty = true;
        true
    }

    /// Copy of this material with its own GPU state. Inputs are copied, not
    /// aliased.
    pub fn instantiate(&self) -> Material {
        Self {
            template: Arc::clone(&self.template),
            values: self.values,
            albedo_map: self.albedo_map.clone(),
            uniform: None,
            bind_group: None,
            dirty: true,
        }
    }

    pub fn values(&self) -> &MaterialUniform {
        &self.values
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Upload changed inputs and rebuild the bind group.
    pub fn commit(&mut self, ctx: &GraphicsContext) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let uniform = self
            .uniform
            .get_or_insert_with(|| StructuredBuffer::constant(&ctx.device, "MaterialUniform"));
        let values = self.values;
        uniform.write_with(&ctx.queue, |slice| slice[0] = values)?;

        let albedo_map = self.albedo_map.as_ref().unwrap_or(&self.template.white);
        self.bind_group = Some(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("MaterialBindGroup"),
            layout: &self.template.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&albedo_map.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.template.sampler),
                },
            ],
        }));
        self.dirty = false;
        Ok(())
    }

    /// `None` until the first [`Material::commit`].
    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.bind_group.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_kind(tag: &str) -> Option<InputKind> {
        MaterialTemplate::deferred_slots()
            .into_iter()
            .find(|slot| slot.tag == tag)
            .map(|slot| slot.kind)
    }

    #[test]
    fn deferred_slots_cover_uniform_inputs() {
        assert_eq!(slot_kind(MaterialTemplate::ALBEDO), Some(InputKind::Color));
        assert_eq!(slot_kind(MaterialTemplate::SHININESS), Some(InputKind::Scalar));
        assert_eq!(slot_kind(MaterialTemplate::ALBEDO_MAP), Some(InputKind::Texture));
        assert_eq!(slot_kind("roughness"), None);
    }

    #[test]
    fn input_kinds() {
        assert_eq!(MaterialInput::Scalar(1.0).kind(), InputKind::Scalar);
        assert_eq!(MaterialInput::Color(Vec3::ONE).kind(), InputKind::Color);
    }

    #[test]
    fn uniform_size_matches_wgsl() {
        assert_eq!(std::mem::size_of::<MaterialUniform>(), 32);
    }
}
