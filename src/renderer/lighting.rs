use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use hecs::Entity;

use crate::error::Result;
use crate::renderer::buffer::{DynamicUniforms, StructuredBuffer};
use crate::renderer::deferred::FrameInfo;
use crate::renderer::lights::{
    DirectionalLightRaw, LightPacker, LightParamsRaw, PackedLights, PointLightRaw, ShadowRaw,
    MAX_DIRECTIONAL_LIGHTS, MAX_POINT_LIGHTS,
};
use crate::renderer::material::MaterialTemplate;
use crate::renderer::pipeline_builder::{
    compute_pipeline, dispatch_size, pipeline_layout, PipelineBuilder, ADDITIVE_BLEND,
};
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::shadow::{ShadowAtlas, ShadowOutcome};
use crate::renderer::texture::{
    GpTexture, GpTextureAllocator, GpTextureCache, GpTextureKey, PooledGpTexture, PooledTarget,
    RenderTarget, RenderTargetAllocator, RenderTargetCache, RenderTargetKey,
};
use crate::renderer::uniforms::FrameUniform;
use crate::renderer::voxel::{Voxelization, VOXEL_COMMON};
use crate::renderer::GraphicsContext;
use crate::scene::Aabb;
use crate::settings::RenderSettings;

pub const LIGHT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const SH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const POINT_SHADOW_NEAR: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Point,
    Directional,
}

/// One step of light accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightingPass {
    Shadow(LightKind, usize),
    Inject(LightKind, usize),
    CommitShadows,
    DirectLight,
    FilterStack,
    FilterPyramid,
    ConvertSh,
    ConeTrace,
    Composite,
}

impl LightingPass {
    pub fn is_indirect(&self) -> bool {
        matches!(
            self,
            LightingPass::Inject(..)
                | LightingPass::FilterStack
                | LightingPass::FilterPyramid
                | LightingPass::ConvertSh
                | LightingPass::ConeTrace
                | LightingPass::Composite
        )
    }
}

/// Which buffer accumulation hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightingResult {
    #[default]
    Direct,
    Combined,
}

/// Ordered pass list for a frame. Each light's shadow is rendered before its
/// injection; direct light follows every shadow; the indirect passes only
/// exist with global illumination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightingPlan {
    passes: Vec<LightingPass>,
    result: LightingResult,
}

impl LightingPlan {
    pub fn new(point_lights: usize, directional_lights: usize, global_illumination: bool) -> Self {
        let lights = (0..point_lights)
            .map(|index| (LightKind::Point, index))
            .chain((0..directional_lights).map(|index| (LightKind::Directional, index)));

        let mut passes = Vec::new();
        for (kind, index) in lights {
            passes.push(LightingPass::Shadow(kind, index));
            if global_illumination {
                passes.push(LightingPass::Inject(kind, index));
            }
        }
        passes.push(LightingPass::CommitShadows);
        passes.push(LightingPass::DirectLight);

        let result = if global_illumination {
            passes.extend([
                LightingPass::FilterStack,
                LightingPass::FilterPyramid,
                LightingPass::ConvertSh,
                LightingPass::ConeTrace,
                LightingPass::Composite,
            ]);
            LightingResult::Combined
        } else {
            LightingResult::Direct
        };

        Self { passes, result }
    }

    pub fn passes(&self) -> &[LightingPass] {
        &self.passes
    }

    pub fn result(&self) -> LightingResult {
        self.result
    }

    pub fn position(&self, pass: LightingPass) -> Option<usize> {
        self.passes.iter().position(|&p| p == pass)
    }
}

/// What one accumulation did. `point_shadows[i]` belongs to `point_lights[i]`.
#[derive(Debug, Clone, Default)]
pub struct LightingReport {
    pub point_lights: Vec<Entity>,
    pub point_shadows: Vec<ShadowRaw>,
    pub directional_lights: Vec<Entity>,
    pub directional_shadows: Vec<ShadowRaw>,
    pub dropped_lights: usize,
    pub executed: Vec<LightingPass>,
    pub result: LightingResult,
}

impl LightingReport {
    /// One disabled shadow descriptor per packed light, index-aligned with
    /// the light lists.
    pub fn new(lights: &PackedLights, plan: &LightingPlan) -> Self {
        Self {
            point_lights: lights.point.iter().map(|l| l.entity).collect(),
            point_shadows: vec![ShadowRaw::DISABLED; lights.point.len()],
            directional_lights: lights.directional.iter().map(|l| l.entity).collect(),
            directional_shadows: vec![ShadowRaw::DISABLED; lights.directional.len()],
            dropped_lights: lights.dropped_point + lights.dropped_directional,
            executed: Vec::with_capacity(plan.passes().len()),
            result: plan.result(),
        }
    }

    /// Store the shadow of light `index`. Out of range indices are ignored.
    pub fn record_shadow(&mut self, kind: LightKind, index: usize, descriptor: ShadowRaw) {
        let shadows = match kind {
            LightKind::Point => &mut self.point_shadows,
            LightKind::Directional => &mut self.directional_shadows,
        };
        match shadows.get_mut(index) {
            Some(slot) => *slot = descriptor,
            None => log::warn!("No {:?} light at index {}; shadow dropped", kind, index),
        }
    }
}

pub struct LightingOutput {
    pub buffer: PooledTarget,
    pub report: LightingReport,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct InjectParams {
    /// xyz world origin of the stored positions
    origin: [f32; 4],
    size: [u32; 2],
    weight: f32,
    /// 1 when `weight` is per squared distance from `origin`
    point: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct FilterParams {
    src_slot: u32,
    dst_slot: u32,
    _pad: [u32; 2],
    offset: [i32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct ConvertParams {
    slot: u32,
    _pad: [u32; 3],
}

/// World area one shadow map texel stands for. Paraboloid texels cover
/// `16 / (w * h)` per squared distance from the light; orthographic texels
/// split the `extent` square evenly.
pub fn injection_weight(kind: LightKind, width: u32, height: u32, extent: f32) -> f32 {
    let texels = width.max(1) as f32 * height.max(1) as f32;
    match kind {
        LightKind::Point => 16.0 / texels,
        LightKind::Directional => extent * extent / texels,
    }
}

fn uniform_entry(binding: u32, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

fn read_storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    view_dimension: wgpu::TextureViewDimension,
    sample_type: wgpu::TextureSampleType,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension,
            sample_type,
        },
        count: None,
    }
}

fn storage_texture_entry(
    binding: u32,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: LIGHT_FORMAT,
            view_dimension,
        },
        count: None,
    }
}

const UNFILTERED: wgpu::TextureSampleType = wgpu::TextureSampleType::Float { filterable: false };
const FILTERED: wgpu::TextureSampleType = wgpu::TextureSampleType::Float { filterable: true };

/// Per-channel SH coefficients of every level, split into the cascade stack
/// (layers stacked along z) and the pyramid (one mip per level).
struct ShTextures {
    stack: [GpTexture; 3],
    pyramid: [GpTexture; 3],
}

impl ShTextures {
    fn new(device: &wgpu::Device, voxels: &Voxelization) -> Self {
        let layout = voxels.layout();
        let res = layout.resolution();
        let stack_key = GpTextureKey::d3([res, res, res * layout.cascades()], 1, SH_FORMAT);
        let pyramid_key = GpTextureKey::d3([res, res, res], layout.mip_count(), SH_FORMAT);
        let channels = ["R", "G", "B"];
        Self {
            stack: channels.map(|c| GpTexture::new(device, &stack_key, &format!("ShStack{c}"))),
            pyramid: channels.map(|c| GpTexture::new(device, &pyramid_key, &format!("ShPyramid{c}"))),
        }
    }
}

struct IndirectPipelines {
    inject_layout: wgpu::BindGroupLayout,
    inject: wgpu::ComputePipeline,
    inject_params: DynamicUniforms<InjectParams>,
    filter_layout: wgpu::BindGroupLayout,
    filter: wgpu::ComputePipeline,
    filter_params: DynamicUniforms<FilterParams>,
    convert_layout: wgpu::BindGroupLayout,
    convert: wgpu::ComputePipeline,
    convert_params: DynamicUniforms<ConvertParams>,
    convert_bind_groups: Vec<wgpu::BindGroup>,
    cone_layout: wgpu::BindGroupLayout,
    cone: wgpu::ComputePipeline,
    composite_layout: wgpu::BindGroupLayout,
    composite: wgpu::RenderPipeline,
    sh: ShTextures,
    sampler: wgpu::Sampler,
}

impl IndirectPipelines {
    fn new(ctx: &GraphicsContext, shaders: &mut ShaderLibrary, voxels: &Voxelization) -> Result<Self> {
        let device = &ctx.device;
        let voxel_key = |path: &str| ShaderKey::new(path).with_define("VOXEL_COMMON", VOXEL_COMMON);

        let inject_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("InjectLayout"),
            entries: &[
                DynamicUniforms::<InjectParams>::layout_entry(0, wgpu::ShaderStages::COMPUTE),
                texture_entry(1, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(2, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(3, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
            ],
        });
        let shader = shaders.compute(device, &voxel_key("inject_light.wgsl"))?;
        let layout = pipeline_layout(
            device,
            "InjectPipelineLayout",
            &[&inject_layout, voxels.storage_layout()],
        );
        let inject = compute_pipeline(device, "InjectPipeline", &layout, &shader)?;

        let filter_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ShFilterLayout"),
            entries: &[DynamicUniforms::<FilterParams>::layout_entry(
                0,
                wgpu::ShaderStages::COMPUTE,
            )],
        });
        let shader = shaders.compute(device, &voxel_key("sh_filter.wgsl"))?;
        let layout = pipeline_layout(
            device,
            "ShFilterPipelineLayout",
            &[&filter_layout, voxels.storage_layout()],
        );
        let filter = compute_pipeline(device, "ShFilterPipeline", &layout, &shader)?;

        let convert_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ShConvertLayout"),
            entries: &[
                DynamicUniforms::<ConvertParams>::layout_entry(0, wgpu::ShaderStages::COMPUTE),
                storage_texture_entry(1, wgpu::TextureViewDimension::D3),
                storage_texture_entry(2, wgpu::TextureViewDimension::D3),
                storage_texture_entry(3, wgpu::TextureViewDimension::D3),
            ],
        });
        let shader = shaders.compute(device, &voxel_key("sh_convert.wgsl"))?;
        let layout = pipeline_layout(
            device,
            "ShConvertPipelineLayout",
            &[&convert_layout, voxels.read_layout()],
        );
        let convert = compute_pipeline(device, "ShConvertPipeline", &layout, &shader)?;

        let cone_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("ConeTraceLayout"),
            entries: &[
                uniform_entry(0, false),
                uniform_entry(1, false),
                texture_entry(2, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(3, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(
                    4,
                    wgpu::ShaderStages::COMPUTE,
                    wgpu::TextureViewDimension::D2,
                    wgpu::TextureSampleType::Depth,
                ),
                texture_entry(5, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                texture_entry(6, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                texture_entry(7, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                texture_entry(8, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                texture_entry(9, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                texture_entry(10, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D3, FILTERED),
                wgpu::BindGroupLayoutEntry {
                    binding: 11,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                storage_texture_entry(12, wgpu::TextureViewDimension::D2),
            ],
        });
        let shader = shaders.compute(device, &voxel_key("cone_trace.wgsl"))?;
        let layout = pipeline_layout(device, "ConeTracePipelineLayout", &[&cone_layout]);
        let cone = compute_pipeline(device, "ConeTracePipeline", &layout, &shader)?;

        let composite_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("CompositeLayout"),
            entries: &[
                texture_entry(0, wgpu::ShaderStages::FRAGMENT, wgpu::TextureViewDimension::D2, FILTERED),
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let shader = shaders.graphics(device, &ShaderKey::new("composite.wgsl"))?;
        let layout = pipeline_layout(device, "CompositePipelineLayout", &[&composite_layout]);
        let composite = PipelineBuilder::new(device, &layout, &shader)
            .with_label("CompositePipeline")
            .with_color_target(LIGHT_FORMAT, Some(ADDITIVE_BLEND))
            .with_no_culling()
            .build()?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("IndirectSampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let sh = ShTextures::new(device, voxels);
        let level_count = voxels.layout().levels().len() as u32;
        let convert_params = DynamicUniforms::new(ctx, "ShConvertParams", level_count);

        let mut this = Self {
            inject_layout,
            inject,
            inject_params: DynamicUniforms::new(ctx, "InjectParams", 64),
            filter_layout,
            filter,
            filter_params: DynamicUniforms::new(ctx, "ShFilterParams", level_count),
            convert_layout,
            convert,
            convert_params,
            convert_bind_groups: Vec::new(),
            cone_layout,
            cone,
            composite_layout,
            composite,
            sh,
            sampler,
        };
        this.convert_bind_groups = this.build_convert_bind_groups(device, voxels);
        Ok(this)
    }

    /// One bind group per level: the stack for cascades, the matching mip
    /// for pyramid levels.
    fn build_convert_bind_groups(&self, device: &wgpu::Device, voxels: &Voxelization) -> Vec<wgpu::BindGroup> {
        voxels
            .layout()
            .levels()
            .iter()
            .map(|level| {
                let (targets, mip) = if level.is_stack() {
                    (&self.sh.stack, 0)
                } else {
                    (&self.sh.pyramid, level.level as u32)
                };
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("ShConvertBindGroup"),
                    layout: &self.convert_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: self.convert_params.binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(targets[0].mip_view(mip)),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::TextureView(targets[1].mip_view(mip)),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: wgpu::BindingResource::TextureView(targets[2].mip_view(mip)),
                        },
                    ],
                })
            })
            .collect()
    }
}

/// Shadows, light injection, direct light and voxel cone traced indirect
/// light, accumulated into one HDR buffer per frame.
pub struct LightAccumulator {
    packer: LightPacker,
    atlas: ShadowAtlas,
    targets: RenderTargetCache,
    textures: GpTextureCache,
    frame: StructuredBuffer<FrameUniform>,
    light_params: StructuredBuffer<LightParamsRaw>,
    point_lights: StructuredBuffer<PointLightRaw>,
    directional_lights: StructuredBuffer<DirectionalLightRaw>,
    point_shadows: StructuredBuffer<ShadowRaw>,
    directional_shadows: StructuredBuffer<ShadowRaw>,
    direct_layout: wgpu::BindGroupLayout,
    direct: wgpu::ComputePipeline,
    indirect: Option<IndirectPipelines>,
    ambient: Vec3,
}

impl LightAccumulator {
    /// `voxels` enables the indirect passes; without it every frame is
    /// direct light only.
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        template: &MaterialTemplate,
        settings: &RenderSettings,
        voxels: Option<&Voxelization>,
    ) -> Result<Self> {
        let device = &ctx.device;
        let atlas = ShadowAtlas::new(ctx, shaders, template, &settings.shadows)?;

        let direct_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("DirectLightLayout"),
            entries: &[
                uniform_entry(0, false),
                uniform_entry(1, false),
                read_storage_entry(2),
                read_storage_entry(3),
                read_storage_entry(4),
                read_storage_entry(5),
                texture_entry(6, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(7, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2, UNFILTERED),
                texture_entry(
                    8,
                    wgpu::ShaderStages::COMPUTE,
                    wgpu::TextureViewDimension::D2,
                    wgpu::TextureSampleType::Depth,
                ),
                texture_entry(9, wgpu::ShaderStages::COMPUTE, wgpu::TextureViewDimension::D2Array, FILTERED),
                wgpu::BindGroupLayoutEntry {
                    binding: 10,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                storage_texture_entry(11, wgpu::TextureViewDimension::D2),
            ],
        });
        let shader = shaders.compute(device, &ShaderKey::new("direct_light.wgsl"))?;
        let layout = pipeline_layout(device, "DirectLightPipelineLayout", &[&direct_layout]);
        let direct = compute_pipeline(device, "DirectLightPipeline", &layout, &shader)?;

        let indirect = voxels
            .map(|voxels| IndirectPipelines::new(ctx, shaders, voxels))
            .transpose()?;

        Ok(Self {
            packer: LightPacker::new(settings.light_overflow),
            atlas,
            targets: RenderTargetCache::new(RenderTargetAllocator::new(device)),
            textures: GpTextureCache::new(GpTextureAllocator::new(device)),
            frame: StructuredBuffer::constant(device, "LightingFrame"),
            light_params: StructuredBuffer::constant(device, "LightParams"),
            point_lights: StructuredBuffer::array(device, "PointLights", MAX_POINT_LIGHTS),
            directional_lights: StructuredBuffer::array(
                device,
                "DirectionalLights",
                MAX_DIRECTIONAL_LIGHTS,
            ),
            point_shadows: StructuredBuffer::array(device, "PointShadows", MAX_POINT_LIGHTS),
            directional_shadows: StructuredBuffer::array(
                device,
                "DirectionalShadows",
                MAX_DIRECTIONAL_LIGHTS,
            ),
            direct_layout,
            direct,
            indirect,
            ambient: Vec3::ZERO,
        })
    }

    pub fn shadow_atlas(&self) -> &ShadowAtlas {
        &self.atlas
    }

    pub fn supports_global_illumination(&self) -> bool {
        self.indirect.is_some()
    }

    pub fn set_ambient(&mut self, ambient: Vec3) {
        self.ambient = ambient;
    }

    /// Record every lighting pass for `frame` into `encoder` and return the
    /// buffer holding the result: direct light alone, or direct plus
    /// indirect when global illumination runs.
    pub fn accumulate(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameInfo<'_>,
        gbuffer: &RenderTarget,
        voxels: Option<&Voxelization>,
        shadow_focus: &Aabb,
    ) -> Result<LightingOutput> {
        let visible = self.visible_lights(frame, voxels);
        let lights = self.packer.pack(frame.scene, &visible, frame.camera_position);
        let global_illumination =
            frame.enable_global_illumination && voxels.is_some() && self.indirect.is_some();
        let plan = LightingPlan::new(lights.point.len(), lights.directional.len(), global_illumination);

        let mut report = LightingReport::new(&lights, &plan);

        let output = self.targets.pop(&RenderTargetKey::new(
            frame.width,
            frame.height,
            &[LIGHT_FORMAT],
            false,
        ))?;
        let mut indirect_target: Option<PooledGpTexture> = None;
        let mut pending: Option<ShadowOutcome> = None;

        if let Some(indirect) = self.indirect.as_mut() {
            indirect.inject_params.clear();
            indirect.filter_params.clear();
        }
        self.atlas.begin(encoder);

        for &pass in plan.passes() {
            let executed = match pass {
                LightingPass::Shadow(kind, index) => {
                    let outcome = self.render_shadow(ctx, encoder, frame, &lights, kind, index, shadow_focus)?;
                    report.record_shadow(kind, index, outcome.descriptor);
                    pending = Some(outcome);
                    true
                }
                LightingPass::Inject(kind, _) => {
                    let outcome = pending.take();
                    match (outcome.as_ref(), voxels) {
                        (Some(outcome @ ShadowOutcome { target: Some(_), .. }), Some(voxels)) => {
                            self.inject(ctx, encoder, kind, outcome, voxels)
                        }
                        _ => false,
                    }
                }
                LightingPass::CommitShadows => {
                    pending = None;
                    self.atlas.commit(ctx, encoder, &self.textures)?;
                    self.upload_lights(ctx, frame, &lights, &report)?;
                    true
                }
                LightingPass::DirectLight => {
                    self.direct_light(ctx, encoder, gbuffer, &output);
                    true
                }
                LightingPass::FilterStack | LightingPass::FilterPyramid => {
                    match voxels {
                        Some(voxels) => self.filter(ctx, encoder, voxels, pass == LightingPass::FilterStack),
                        None => false,
                    }
                }
                LightingPass::ConvertSh => match voxels {
                    Some(voxels) => self.convert(ctx, encoder, voxels),
                    None => false,
                },
                LightingPass::ConeTrace => match voxels {
                    Some(voxels) => {
                        indirect_target = self.cone_trace(ctx, encoder, frame, gbuffer, voxels)?;
                        indirect_target.is_some()
                    }
                    None => false,
                },
                LightingPass::Composite => match indirect_target.as_ref() {
                    Some(indirect) => {
                        self.composite(ctx, encoder, indirect, &output);
                        true
                    }
                    None => false,
                },
            };
            if executed {
                report.executed.push(pass);
            }
        }

        log::trace!(
            "Lighting: {} point, {} directional, {} passes, {:?}",
            report.point_lights.len(),
            report.directional_lights.len(),
            report.executed.len(),
            report.result
        );
        Ok(LightingOutput {
            buffer: output,
            report,
        })
    }

    /// Lights in the view frustum, plus those reaching the clipmap when it
    /// is being lit.
    fn visible_lights(&self, frame: &FrameInfo<'_>, voxels: Option<&Voxelization>) -> Vec<Entity> {
        let hierarchy = frame.scene.light_hierarchy();
        let mut visible = hierarchy.intersections_frustum(&frame.frustum);
        if let (true, Some(voxels)) = (frame.enable_global_illumination, voxels) {
            for entity in hierarchy.intersections_aabb(&voxels.layout().domain()) {
                if !visible.contains(&entity) {
                    visible.push(entity);
                }
            }
        }
        visible
    }

    #[allow(clippy::too_many_arguments)]
    fn render_shadow(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameInfo<'_>,
        lights: &PackedLights,
        kind: LightKind,
        index: usize,
        focus: &Aabb,
    ) -> Result<ShadowOutcome> {
        match kind {
            LightKind::Point => {
                let light = &lights.point[index];
                self.atlas.compute_point_shadow(
                    ctx,
                    encoder,
                    &self.targets,
                    frame.scene,
                    &frame.meshes,
                    light,
                    POINT_SHADOW_NEAR,
                    light.light.cutoff,
                )
            }
            LightKind::Directional => self.atlas.compute_directional_shadow(
                ctx,
                encoder,
                &self.targets,
                frame.scene,
                &frame.meshes,
                &lights.directional[index],
                focus,
            ),
        }
    }

    fn upload_lights(
        &mut self,
        ctx: &GraphicsContext,
        frame: &FrameInfo<'_>,
        lights: &PackedLights,
        report: &LightingReport,
    ) -> Result<()> {
        let point = lights.point_raw();
        let directional = lights.directional_raw();
        let params = LightParamsRaw {
            point_count: point.len() as u32,
            directional_count: directional.len() as u32,
            atlas_size: self.atlas.map_size() as f32,
            _pad: 0.0,
            ambient: self.ambient.extend(0.0).to_array(),
        };

        self.frame.write_with(&ctx.queue, |slice| {
            slice[0] = FrameUniform::new(frame.view_proj, frame.camera_position, frame.width, frame.height)
        })?;
        self.light_params.write_with(&ctx.queue, |slice| slice[0] = params)?;
        self.point_lights.write_with(&ctx.queue, |slice| fill_prefix(slice, &point))?;
        self.directional_lights
            .write_with(&ctx.queue, |slice| fill_prefix(slice, &directional))?;
        self.point_shadows
            .write_with(&ctx.queue, |slice| fill_prefix(slice, &report.point_shadows))?;
        self.directional_shadows
            .write_with(&ctx.queue, |slice| fill_prefix(slice, &report.directional_shadows))?;
        Ok(())
    }

    /// Add the reflected light captured by one shadow map to the clipmap.
    fn inject(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        kind: LightKind,
        outcome: &ShadowOutcome,
        voxels: &Voxelization,
    ) -> bool {
        let (Some(indirect), Some(target)) = (self.indirect.as_mut(), outcome.target.as_ref()) else {
            return false;
        };
        if target.color_count() < 4 {
            log::warn!("Shadow target carries no reflective outputs; skipping injection");
            return false;
        }
        let offset = indirect.inject_params.push(InjectParams {
            origin: outcome.origin.extend(1.0).to_array(),
            size: [target.width(), target.height()],
            weight: injection_weight(kind, target.width(), target.height(), outcome.descriptor.far),
            point: u32::from(kind == LightKind::Point),
        });
        indirect.inject_params.flush(ctx);

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("InjectBindGroup"),
            layout: &indirect.inject_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: indirect.inject_params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(target.color_view(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(target.color_view(2)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(target.color_view(3)),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("InjectLight"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&indirect.inject);
        pass.set_bind_group(0, &bind_group, &[offset]);
        pass.set_bind_group(1, voxels.storage_bind_group(), &[]);
        pass.dispatch_workgroups(dispatch_size(target.width(), 8), dispatch_size(target.height(), 8), 1);
        true
    }

    fn direct_light(
        &self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        gbuffer: &RenderTarget,
        output: &RenderTarget,
    ) {
        let Some(depth) = gbuffer.depth_view() else {
            log::error!("GBuffer has no depth surface; skipping direct light");
            return;
        };
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("DirectLightBindGroup"),
            layout: &self.direct_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.frame.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.light_params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.point_lights.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.directional_lights.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.point_shadows.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.directional_shadows.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::TextureView(gbuffer.color_view(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: wgpu::BindingResource::TextureView(gbuffer.color_view(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: wgpu::BindingResource::TextureView(self.atlas.blurred_view()),
                },
                wgpu::BindGroupEntry {
                    binding: 10,
                    resource: wgpu::BindingResource::Sampler(self.atlas.sampler()),
                },
                wgpu::BindGroupEntry {
                    binding: 11,
                    resource: wgpu::BindingResource::TextureView(output.color_view(0)),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("DirectLight"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.direct);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            dispatch_size(output.width(), 8),
            dispatch_size(output.height(), 8),
            1,
        );
    }

    /// Run the stack or the pyramid half of the SH filter.
    fn filter(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        voxels: &Voxelization,
        stack: bool,
    ) -> bool {
        let Some(indirect) = self.indirect.as_mut() else {
            return false;
        };
        let layout = voxels.layout();
        let steps: Vec<_> = layout
            .filter_steps()
            .into_iter()
            .filter(|step| step.is_stack() == stack)
            .collect();
        if steps.is_empty() {
            return false;
        }

        let mut dispatches = Vec::with_capacity(steps.len());
        for step in &steps {
            let (Some(src), Some(dst)) = (layout.level(step.src), layout.level(step.dst)) else {
                continue;
            };
            let offset = indirect.filter_params.push(FilterParams {
                src_slot: src.slot,
                dst_slot: dst.slot,
                _pad: [0; 2],
                offset: step.offset.extend(0).to_array(),
            });
            dispatches.push((offset, dst.resolution));
        }
        indirect.filter_params.flush(ctx);

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ShFilterBindGroup"),
            layout: &indirect.filter_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: indirect.filter_params.binding(),
            }],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(if stack { "ShFilterStack" } else { "ShFilterPyramid" }),
            timestamp_writes: None,
        });
        pass.set_pipeline(&indirect.filter);
        pass.set_bind_group(1, voxels.storage_bind_group(), &[]);
        for (offset, resolution) in dispatches {
            let groups = dispatch_size(resolution, 4);
            pass.set_bind_group(0, &bind_group, &[offset]);
            pass.dispatch_workgroups(groups, groups, groups);
        }
        true
    }

    fn convert(&mut self, ctx: &GraphicsContext, encoder: &mut wgpu::CommandEncoder, voxels: &Voxelization) -> bool {
        let Some(indirect) = self.indirect.as_mut() else {
            return false;
        };
        let levels = voxels.layout().levels();
        indirect.convert_params.clear();
        let offsets: Vec<u32> = levels
            .iter()
            .map(|level| {
                indirect.convert_params.push(ConvertParams {
                    slot: level.slot,
                    _pad: [0; 3],
                })
            })
            .collect();
        indirect.convert_params.flush(ctx);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("ShConvert"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&indirect.convert);
        pass.set_bind_group(1, voxels.read_bind_group(), &[]);
        for ((level, offset), bind_group) in levels.iter().zip(offsets).zip(&indirect.convert_bind_groups) {
            let groups = dispatch_size(level.resolution, 4);
            pass.set_bind_group(0, bind_group, &[offset]);
            pass.dispatch_workgroups(groups, groups, groups);
        }
        true
    }

    fn cone_trace(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameInfo<'_>,
        gbuffer: &RenderTarget,
        voxels: &Voxelization,
    ) -> Result<Option<PooledGpTexture>> {
        let Some(indirect) = self.indirect.as_ref() else {
            return Ok(None);
        };
        let Some(depth) = gbuffer.depth_view() else {
            return Ok(None);
        };
        let key = GpTextureKey::d2(frame.width.div_ceil(2), frame.height.div_ceil(2), LIGHT_FORMAT);
        let target = self.textures.pop(&key)?;

        fn view(texture: &GpTexture) -> wgpu::BindingResource<'_> {
            wgpu::BindingResource::TextureView(texture.view())
        }
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ConeTraceBindGroup"),
            layout: &indirect.cone_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.frame.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: voxels.params_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(gbuffer.color_view(0)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(gbuffer.color_view(1)),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(depth),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: view(&indirect.sh.stack[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: view(&indirect.sh.stack[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: view(&indirect.sh.stack[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: view(&indirect.sh.pyramid[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: view(&indirect.sh.pyramid[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 10,
                    resource: view(&indirect.sh.pyramid[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 11,
                    resource: wgpu::BindingResource::Sampler(&indirect.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 12,
                    resource: wgpu::BindingResource::TextureView(target.view()),
                },
            ],
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ConeTrace"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&indirect.cone);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch_size(key.width, 8), dispatch_size(key.height, 8), 1);
        }
        Ok(Some(target))
    }

    /// Upscale the half resolution indirect light and add it onto `output`.
    fn composite(
        &self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        indirect_light: &GpTexture,
        output: &RenderTarget,
    ) {
        let Some(indirect) = self.indirect.as_ref() else {
            return;
        };
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("CompositeBindGroup"),
            layout: &indirect.composite_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(indirect_light.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&indirect.sampler),
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("CompositeIndirect"),
            color_attachments: &output.color_attachments(wgpu::LoadOp::Load),
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&indirect.composite);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

fn fill_prefix<T: Pod>(slice: &mut [T], values: &[T]) {
    slice.fill(T::zeroed());
    let count = values.len().min(slice.len());
    slice[..count].copy_from_slice(&values[..count]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shadow::{point_light_view, point_shadow_descriptor, AtlasAllocator};
    use crate::scene::{DirectionalLight, PointLight, Scene};
    use crate::settings::LightOverflowPolicy;

    #[test]
    fn shadows_stay_index_aligned_with_their_lights() {
        let mut scene = Scene::new();
        let mut visible = Vec::new();
        for i in 0..10 {
            let light = PointLight::new(Vec3::ONE, 8.0);
            let light = if i % 2 == 0 { light } else { light.without_shadows() };
            visible.push(scene.spawn_point_light(Vec3::new(i as f32, 1.0, 0.0), light));
        }
        visible.push(scene.spawn_directional_light(-Vec3::Y, DirectionalLight::new(Vec3::ONE)));

        let lights = LightPacker::new(LightOverflowPolicy::DropFarthest).pack(&scene, &visible, Vec3::ZERO);
        let plan = LightingPlan::new(lights.point.len(), lights.directional.len(), true);
        let mut report = LightingReport::new(&lights, &plan);

        // One page holds four point shadows: the fifth shadowed light and
        // the directional light overflow.
        let mut allocator = AtlasAllocator::new(1);
        for pass in plan.passes() {
            let LightingPass::Shadow(kind, index) = *pass else {
                continue;
            };
            let descriptor = match kind {
                LightKind::Point => {
                    let light = &lights.point[index];
                    light
                        .light
                        .shadow_enabled
                        .then(|| allocator.allocate_point())
                        .flatten()
                        .map(|region| point_shadow_descriptor(light, &region, 0.05, 100.0))
                }
                LightKind::Directional => allocator.allocate_directional().map(|_| ShadowRaw::DISABLED),
            };
            report.record_shadow(kind, index, descriptor.unwrap_or(ShadowRaw::DISABLED));
        }

        assert_eq!(report.point_lights.len(), report.point_shadows.len());
        assert_eq!(report.directional_lights.len(), report.directional_shadows.len());
        assert_eq!(report.point_lights.len(), 10);
        assert_eq!(allocator.slots_used(), 4);

        for (i, (entity, shadow)) in report.point_lights.iter().zip(&report.point_shadows).enumerate() {
            assert_eq!(*entity, visible[i]);
            assert_eq!(shadow.is_enabled(), i % 2 == 0 && i < 8, "light {i}");
            if shadow.is_enabled() {
                let position = lights.point[i].position;
                assert_eq!(shadow.light_view(), point_light_view(position));
                assert!(shadow.far <= lights.point[i].light.cutoff);
            }
        }
        assert!(!report.directional_shadows[0].is_enabled());
    }

    #[test]
    fn out_of_range_shadows_are_ignored() {
        let plan = LightingPlan::new(0, 0, false);
        let mut report = LightingReport::new(&PackedLights::default(), &plan);
        report.record_shadow(LightKind::Point, 3, ShadowRaw::DISABLED);
        assert!(report.point_shadows.is_empty());
    }

    #[test]
    fn direct_only_plan_has_no_indirect_passes() {
        let plan = LightingPlan::new(2, 1, false);
        assert_eq!(plan.result(), LightingResult::Direct);
        assert!(plan.passes().iter().all(|pass| !pass.is_indirect()));
        assert_eq!(
            plan.passes(),
            &[
                LightingPass::Shadow(LightKind::Point, 0),
                LightingPass::Shadow(LightKind::Point, 1),
                LightingPass::Shadow(LightKind::Directional, 0),
                LightingPass::CommitShadows,
                LightingPass::DirectLight,
            ]
        );
    }

    #[test]
    fn injection_follows_its_own_shadow() {
        let plan = LightingPlan::new(3, 2, true);
        for (kind, count) in [(LightKind::Point, 3), (LightKind::Directional, 2)] {
            for index in 0..count {
                let shadow = plan.position(LightingPass::Shadow(kind, index));
                let inject = plan.position(LightingPass::Inject(kind, index));
                assert_eq!(inject, shadow.map(|s| s + 1));
            }
        }
    }

    #[test]
    fn global_illumination_orders_filter_before_indirect() {
        let plan = LightingPlan::new(1, 0, true);
        assert_eq!(plan.result(), LightingResult::Combined);
        let at = |pass| plan.position(pass).expect("pass planned");
        assert!(at(LightingPass::CommitShadows) < at(LightingPass::DirectLight));
        assert!(at(LightingPass::DirectLight) < at(LightingPass::FilterStack));
        assert!(at(LightingPass::FilterStack) < at(LightingPass::FilterPyramid));
        assert!(at(LightingPass::FilterPyramid) < at(LightingPass::ConvertSh));
        assert!(at(LightingPass::ConvertSh) < at(LightingPass::ConeTrace));
        assert!(at(LightingPass::ConeTrace) < at(LightingPass::Composite));
    }

    #[test]
    fn lightless_plan_still_lights_the_frame() {
        let plan = LightingPlan::new(0, 0, true);
        assert!(plan.position(LightingPass::DirectLight).is_some());
        assert!(!plan
            .passes()
            .iter()
            .any(|pass| matches!(pass, LightingPass::Shadow(..) | LightingPass::Inject(..))));
    }

    #[test]
    fn injection_weight_scales_with_texel_count() {
        assert!((injection_weight(LightKind::Point, 4, 4, 100.0) - 1.0).abs() < 1e-6);
        assert!((injection_weight(LightKind::Point, 64, 32, 0.0) - 16.0 / 2048.0).abs() < 1e-9);
    }

    #[test]
    fn directional_texels_split_the_projected_square() {
        let weight = injection_weight(LightKind::Directional, 128, 128, 32.0);
        assert!((weight * 128.0 * 128.0 - 32.0 * 32.0).abs() < 1e-3);
    }

    #[test]
    fn fill_prefix_zeroes_the_tail() {
        let mut slice = [7u32; 4];
        fill_prefix(&mut slice, &[1, 2]);
        assert_eq!(slice, [1, 2, 0, 0]);
    }

    #[test]
    fn parameter_blocks_match_wgsl() {
        assert_eq!(std::mem::size_of::<InjectParams>(), 32);
        assert_eq!(std::mem::size_of::<FilterParams>(), 32);
        assert_eq!(std::mem::size_of::<ConvertParams>(), 16);
    }
}
