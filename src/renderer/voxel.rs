use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Mat4, UVec3, Vec3};

use crate::error::{RenderError, Result};
use crate::renderer::buffer::{ScratchArray, StructuredBuffer};
use crate::renderer::deferred::FrameInfo;
use crate::renderer::draw::{collect_draws, record_draws, PassUniforms};
use crate::renderer::material::MaterialTemplate;
use crate::renderer::pipeline_builder::{pipeline_layout, PipelineBuilder};
use crate::renderer::shader::{ShaderKey, ShaderLibrary};
use crate::renderer::texture::{RenderTarget, DEPTH_FORMAT};
use crate::renderer::{GraphicsContext, Vertex};
use crate::scene::Aabb;
use crate::settings::VoxelSettings;

/// Stack cascades plus pyramid mips the parameter block can describe.
pub const MAX_VOXEL_LEVELS: usize = 24;
pub const MAX_VOXEL_RESOLUTION: u32 = 256;
/// Four SH coefficients for each colour channel.
pub const SH_COMPONENTS: u64 = 12;
/// Fixed point scale of the SH accumulation integers.
pub const SH_SCALE: f32 = 16384.0;

const DEBUG_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

/// Shared WGSL for every voxel shader: parameter block, cell addressing and
/// the SH basis. Spliced in through the `VOXEL_COMMON` define.
pub const VOXEL_COMMON: &str = include_str!("../../shader/voxel_common.wgsl");

/// Round a requested resolution up to a power of two, at least 2.
pub fn voxel_resolution(requested: u32) -> Result<u32> {
    if requested == 0 || requested > MAX_VOXEL_RESOLUTION {
        return Err(RenderError::InvalidVoxelResolution(requested));
    }
    let resolution = requested.max(2).next_power_of_two();
    if resolution != requested {
        log::warn!(
            "Voxel resolution {} is not a power of two; using {}",
            requested,
            resolution
        );
    }
    Ok(resolution)
}

/// Grid center for a camera at `position`: `floor(p / s) * s`.
pub fn snap_center(position: Vec3, voxel_size: f32) -> Vec3 {
    (position / voxel_size).floor() * voxel_size
}

/// Lattice offset between a grid of `voxel_size` and the grid of twice that
/// size, both snapped to `center`. Each component is 0 or 1.
pub fn cascade_offset(center: Vec3, voxel_size: f32) -> IVec3 {
    let cells = (center / voxel_size).floor().as_ivec3();
    IVec3::new(
        cells.x.rem_euclid(2),
        cells.y.rem_euclid(2),
        cells.z.rem_euclid(2),
    )
}

/// First of the 2x2x2 fine cells covered by coarse cell `coarse`.
pub fn child_base(coarse: IVec3, offset: IVec3, fine_resolution: i32, coarse_resolution: i32) -> IVec3 {
    coarse * 2 - IVec3::splat(coarse_resolution - fine_resolution / 2) - offset
}

/// Coarse cell covering fine cell `fine`.
pub fn parent_cell(fine: IVec3, offset: IVec3, fine_resolution: i32, coarse_resolution: i32) -> IVec3 {
    let shifted = fine + offset + IVec3::splat(coarse_resolution - fine_resolution / 2);
    IVec3::new(
        shifted.x.div_euclid(2),
        shifted.y.div_euclid(2),
        shifted.z.div_euclid(2),
    )
}

/// One grid of the clipmap. Negative levels are the stack cascades, level
/// `m >= 0` is mip `m` of the pyramid under the finest grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelLevel {
    pub level: i32,
    pub slot: u32,
    pub voxel_size: f32,
    pub resolution: u32,
    pub address_offset: u32,
    pub center: Vec3,
}

impl VoxelLevel {
    pub fn is_stack(&self) -> bool {
        self.level < 0
    }

    pub fn cell_count(&self) -> u32 {
        self.resolution.pow(3)
    }

    pub fn extent(&self) -> f32 {
        self.resolution as f32 * self.voxel_size
    }

    pub fn min_corner(&self) -> Vec3 {
        self.center - Vec3::splat(self.extent() * 0.5)
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_center_half_extents(self.center, Vec3::splat(self.extent() * 0.5))
    }

    pub fn cell_of(&self, position: Vec3) -> Option<UVec3> {
        let cell = ((position - self.min_corner()) / self.voxel_size).floor();
        let resolution = self.resolution as f32;
        (cell.cmpge(Vec3::ZERO).all() && cell.cmplt(Vec3::splat(resolution)).all())
            .then(|| cell.as_uvec3())
    }

    /// Entry of `cell` in the address table.
    pub fn address_of(&self, cell: UVec3) -> u32 {
        self.address_offset + (cell.z * self.resolution + cell.y) * self.resolution + cell.x
    }

    /// Orthographic view-projections looking down +X, +Y and +Z onto the grid.
    pub fn axis_view_projections(&self) -> [Mat4; 3] {
        let half = self.extent() * 0.5;
        let proj = Mat4::orthographic_rh(-half, half, -half, half, 0.0, 2.0 * half);
        let look = |axis: Vec3, up: Vec3| {
            proj * Mat4::look_at_rh(self.center + axis * half, self.center, up)
        };
        [
            look(Vec3::X, Vec3::Y),
            look(Vec3::Y, Vec3::Z),
            look(Vec3::Z, Vec3::Y),
        ]
    }
}

/// One SH filter dispatch from a finer level into the next coarser one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStep {
    pub src: i32,
    pub dst: i32,
    pub offset: IVec3,
}

impl FilterStep {
    pub fn is_stack(&self) -> bool {
        self.dst < 0
    }
}

/// GPU layout of the clipmap description shared by every voxel shader.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
pub struct VoxelParamsRaw {
    /// xyz grid center, w voxel size; indexed by slot
    pub level_centers: [[f32; 4]; MAX_VOXEL_LEVELS],
    /// address offset, resolution, texture layer base, stack flag
    pub level_info: [[u32; 4]; MAX_VOXEL_LEVELS],
    pub resolution: u32,
    pub cascades: u32,
    pub mip_count: u32,
    pub level_count: u32,
}

/// Clipmap geometry: level sizes, address table layout and the grid centers
/// for the current camera. Pure, so it can be driven without a device.
#[derive(Debug, Clone)]
pub struct VoxelLayout {
    voxel_size: f32,
    resolution: u32,
    cascades: u32,
    mip_count: u32,
    base_cell: IVec3,
    levels: Vec<VoxelLevel>,
}

impl VoxelLayout {
    pub fn new(voxel_size: f32, resolution: u32, cascades: u32) -> Result<Self> {
        let resolution = voxel_resolution(resolution)?;
        let mip_count = resolution.trailing_zeros() + 1;
        let cascades = cascades.min(MAX_VOXEL_LEVELS as u32 - mip_count);

        let mut levels = Vec::with_capacity((cascades + mip_count) as usize);
        for slot in 0..cascades {
            let k = cascades - slot;
            levels.push(VoxelLevel {
                level: -(k as i32),
                slot,
                voxel_size: voxel_size * (1u32 << k) as f32,
                resolution,
                address_offset: (k - 1) * resolution.pow(3),
                center: Vec3::ZERO,
            });
        }
        let mut address_offset = cascades * resolution.pow(3);
        for mip in 0..mip_count {
            let mip_resolution = resolution >> mip;
            levels.push(VoxelLevel {
                level: mip as i32,
                slot: cascades + mip,
                voxel_size: voxel_size * (1u32 << mip) as f32,
                resolution: mip_resolution,
                address_offset,
                center: Vec3::ZERO,
            });
            address_offset += mip_resolution.pow(3);
        }

        let mut layout = Self {
            voxel_size,
            resolution,
            cascades,
            mip_count,
            base_cell: IVec3::ZERO,
            levels,
        };
        layout.update(Vec3::ZERO);
        Ok(layout)
    }

    pub fn from_settings(settings: &VoxelSettings) -> Result<Self> {
        Self::new(settings.voxel_size, settings.resolution, settings.cascades)
    }

    /// Snap every level to `camera_position`. Depends on nothing but the
    /// position.
    pub fn update(&mut self, camera_position: Vec3) {
        self.base_cell = (camera_position / self.voxel_size).floor().as_ivec3();
        for index in 0..self.levels.len() {
            let exponent = self.size_exponent(self.levels[index].level);
            let cells = self.cells_at(exponent);
            let level = &mut self.levels[index];
            level.center = cells.as_vec3() * level.voxel_size;
        }
    }

    fn size_exponent(&self, level: i32) -> u32 {
        level.unsigned_abs()
    }

    fn cells_at(&self, exponent: u32) -> IVec3 {
        let step = 1i32 << exponent;
        IVec3::new(
            self.base_cell.x.div_euclid(step),
            self.base_cell.y.div_euclid(step),
            self.base_cell.z.div_euclid(step),
        )
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn cascades(&self) -> u32 {
        self.cascades
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    /// Levels in slot order: coarsest cascade first, then mips 0 upwards.
    pub fn levels(&self) -> &[VoxelLevel] {
        &self.levels
    }

    pub fn level(&self, level: i32) -> Option<&VoxelLevel> {
        let slot = self.cascades as i32 + level;
        usize::try_from(slot).ok().and_then(|slot| self.levels.get(slot))
    }

    /// Levels written by voxelization and light injection: the cascades and
    /// the finest mip.
    pub fn rasterized_levels(&self) -> impl Iterator<Item = &VoxelLevel> {
        self.levels.iter().filter(|level| level.level <= 0)
    }

    /// Address table entries: `cascades * res^3` plus the pyramid under the
    /// finest grid.
    pub fn capacity(&self) -> u32 {
        self.levels.iter().map(VoxelLevel::cell_count).sum()
    }

    /// World space covered by any level.
    pub fn domain(&self) -> Aabb {
        self.levels.iter().fold(Aabb::EMPTY, |acc, level| {
            let bounds = level.bounds();
            Aabb::new(acc.min.min(bounds.min), acc.max.max(bounds.max))
        })
    }

    /// Finer into coarser: stack steps `0 -> -1` outwards, then pyramid
    /// steps from mip 0 upwards. Every source is final before it is read.
    /// The two coarsest mips are never filled.
    pub fn filter_steps(&self) -> Vec<FilterStep> {
        let mut steps = Vec::new();
        for dst in (-(self.cascades as i32)..=-1).rev() {
            let src = dst + 1;
            steps.push(FilterStep {
                src,
                dst,
                offset: self.offset_at(self.size_exponent(src)),
            });
        }
        let top = self.mip_count as i32 - 1;
        for dst in 1..=top - 2 {
            let src = dst - 1;
            steps.push(FilterStep {
                src,
                dst,
                offset: self.offset_at(src as u32),
            });
        }
        steps
    }

    fn offset_at(&self, exponent: u32) -> IVec3 {
        let cells = self.cells_at(exponent);
        IVec3::new(
            cells.x.rem_euclid(2),
            cells.y.rem_euclid(2),
            cells.z.rem_euclid(2),
        )
    }

    pub fn params_raw(&self) -> VoxelParamsRaw {
        let mut raw = VoxelParamsRaw::zeroed();
        for level in &self.levels {
            let slot = level.slot as usize;
            raw.level_centers[slot] = level.center.extend(level.voxel_size).to_array();
            let layer_base = if level.is_stack() {
                level.slot * self.resolution
            } else {
                0
            };
            raw.level_info[slot] = [
                level.address_offset,
                level.resolution,
                layer_base,
                u32::from(level.is_stack()),
            ];
        }
        raw.resolution = self.resolution;
        raw.cascades = self.cascades;
        raw.mip_count = self.mip_count;
        raw.level_count = self.levels.len() as u32;
        raw
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct VoxelizePass {
    axis_view_proj: [[[f32; 4]; 4]; 3],
    slot: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug)]
struct DebugParams {
    view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    slot: u32,
    mode: u32,
    _pad: [u32; 2],
}

const DEBUG_ALBEDO: u32 = 0;
const DEBUG_SH: u32 = 1;

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
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

/// Sparse SH clipmap on the GPU.
///
/// The address table maps every cell of every level to a storage slot
/// (`slot + 1`, 0 when absent). Voxelization allocates slots and records
/// albedo, light injection accumulates SH into them, the filter fills the
/// inner cells of coarser levels from finer ones.
pub struct Voxelization {
    layout: VoxelLayout,
    params: StructuredBuffer<VoxelParamsRaw>,
    address: wgpu::Buffer,
    sh: wgpu::Buffer,
    albedo: wgpu::Buffer,
    counter: ScratchArray<u32>,
    storage_layout: wgpu::BindGroupLayout,
    storage_bind_group: wgpu::BindGroup,
    read_layout: wgpu::BindGroupLayout,
    read_bind_group: wgpu::BindGroup,
    uniforms: PassUniforms<VoxelizePass>,
    pipeline: wgpu::RenderPipeline,
    raster_view: wgpu::TextureView,
    debug_pipeline: wgpu::RenderPipeline,
    debug_layout: wgpu::BindGroupLayout,
    debug_params: [wgpu::Buffer; 2],
}

impl Voxelization {
    pub fn new(
        ctx: &GraphicsContext,
        shaders: &mut ShaderLibrary,
        template: &Arc<MaterialTemplate>,
        settings: &VoxelSettings,
    ) -> Result<Self> {
        let layout = VoxelLayout::from_settings(settings)?;
        let capacity = u64::from(layout.capacity());
        let sh_size = capacity * SH_COMPONENTS * 4;
        if sh_size > u64::from(ctx.capabilities.max_storage_buffer_binding_size) {
            log::error!(
                "Voxel SH storage needs {} bytes, device allows {}",
                sh_size,
                ctx.capabilities.max_storage_buffer_binding_size
            );
            return Err(RenderError::InvalidVoxelResolution(layout.resolution()));
        }
        log::info!(
            "Voxel clipmap: {}^3 cells of {} m, {} cascades, {} mips, {} entries",
            layout.resolution(),
            layout.voxel_size(),
            layout.cascades(),
            layout.mip_count(),
            capacity
        );

        let storage = |label: &str, size: u64| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let address = storage("VoxelAddress", capacity * 4);
        let sh = storage("VoxelSh", sh_size);
        let albedo = storage("VoxelAlbedo", capacity * 4);
        let counter = ScratchArray::new(&ctx.device, "VoxelCounter", 1);
        let params = StructuredBuffer::constant(&ctx.device, "VoxelParams");

        let writers = wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::COMPUTE;
        let storage_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("VoxelStorageLayout"),
                entries: &[
                    uniform_entry(0, writers),
                    storage_entry(1, writers, false),
                    storage_entry(2, writers, false),
                    storage_entry(3, writers, false),
                    storage_entry(4, writers, false),
                ],
            });
        let readers = wgpu::ShaderStages::VERTEX_FRAGMENT | wgpu::ShaderStages::COMPUTE;
        let read_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("VoxelReadLayout"),
                entries: &[
                    uniform_entry(0, readers),
                    storage_entry(1, readers, true),
                    storage_entry(2, readers, true),
                    storage_entry(3, readers, true),
                ],
            });

        let storage_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VoxelStorageBindGroup"),
            layout: &storage_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: address.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: sh.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: albedo.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: counter.binding(),
                },
            ],
        });
        let read_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VoxelReadBindGroup"),
            layout: &read_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: address.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: sh.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: albedo.as_entire_binding(),
                },
            ],
        });

        let uniforms = PassUniforms::new(ctx, "VoxelizeUniforms", wgpu::ShaderStages::VERTEX_FRAGMENT);
        let shader = shaders.graphics(
            &ctx.device,
            &ShaderKey::new("voxelize.wgsl").with_define("VOXEL_COMMON", VOXEL_COMMON),
        )?;
        let voxelize_layout = pipeline_layout(
            &ctx.device,
            "VoxelizePipelineLayout",
            &[uniforms.layout(), template.layout(), &storage_layout],
        );
        let pipeline = PipelineBuilder::new(&ctx.device, &voxelize_layout, &shader)
            .with_label("VoxelizePipeline")
            .with_vertex_buffer(Vertex::layout())
            .with_masked_color_target(wgpu::TextureFormat::R8Unorm)
            .with_no_culling()
            .build()?;

        let raster = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("VoxelizeRaster"),
            size: wgpu::Extent3d {
                width: layout.resolution(),
                height: layout.resolution(),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let raster_view = raster.create_view(&wgpu::TextureViewDescriptor::default());

        let debug_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("VoxelDebugLayout"),
                entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX_FRAGMENT)],
            });
        let debug_shader = shaders.graphics(
            &ctx.device,
            &ShaderKey::new("voxel_debug.wgsl").with_define("VOXEL_COMMON", VOXEL_COMMON),
        )?;
        let debug_pipeline_layout = pipeline_layout(
            &ctx.device,
            "VoxelDebugPipelineLayout",
            &[&debug_layout, &read_layout],
        );
        let debug_pipeline = PipelineBuilder::new(&ctx.device, &debug_pipeline_layout, &debug_shader)
            .with_label("VoxelDebugPipeline")
            .with_color_target(DEBUG_FORMAT, None)
            .with_depth_stencil(DEPTH_FORMAT, true, wgpu::CompareFunction::Less)
            .with_no_culling()
            .build()?;
        let debug_params = [DEBUG_ALBEDO, DEBUG_SH].map(|mode| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("VoxelDebugParams{mode}")),
                size: std::mem::size_of::<DebugParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });

        Ok(Self {
            layout,
            params,
            address,
            sh,
            albedo,
            counter,
            storage_layout,
            storage_bind_group,
            read_layout,
            read_bind_group,
            uniforms,
            pipeline,
            raster_view,
            debug_pipeline,
            debug_layout,
            debug_params,
        })
    }

    pub fn layout(&self) -> &VoxelLayout {
        &self.layout
    }

    /// Uniform block describing every level, as written by the last update.
    pub fn params_binding(&self) -> wgpu::BindingResource<'_> {
        self.params.binding()
    }

    /// Read-write view of the clipmap for injection and filtering.
    pub fn storage_layout(&self) -> &wgpu::BindGroupLayout {
        &self.storage_layout
    }

    pub fn storage_bind_group(&self) -> &wgpu::BindGroup {
        &self.storage_bind_group
    }

    /// Read-only view of the clipmap for conversion and debug draws.
    pub fn read_layout(&self) -> &wgpu::BindGroupLayout {
        &self.read_layout
    }

    pub fn read_bind_group(&self) -> &wgpu::BindGroup {
        &self.read_bind_group
    }

    /// Re-center on the camera, clear the clipmap and rasterize every mesh
    /// inside a level into it.
    pub fn update(
        &mut self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        frame: &FrameInfo<'_>,
    ) -> Result<()> {
        self.layout.update(frame.camera_position);
        let raw = self.layout.params_raw();
        self.params.write_with(&ctx.queue, |params| params[0] = raw)?;

        encoder.clear_buffer(&self.address, 0, None);
        encoder.clear_buffer(&self.sh, 0, None);
        encoder.clear_buffer(&self.albedo, 0, None);
        self.counter.clear(encoder);

        self.uniforms.clear();
        let mut batches = Vec::new();
        for level in self.layout.rasterized_levels() {
            let pass_offset = self.uniforms.push_pass(VoxelizePass {
                axis_view_proj: level.axis_view_projections().map(|m| m.to_cols_array_2d()),
                slot: level.slot,
                _pad: [0; 3],
            });
            let entities = frame.meshes.intersections_aabb(&level.bounds());
            let items = collect_draws(frame.scene, &entities, Mat4::IDENTITY, self.uniforms.objects_mut());
            batches.push((pass_offset, items));
        }
        self.uniforms.flush(ctx);

        let Some(uniforms) = self.uniforms.bind_group() else {
            return Ok(());
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("VoxelizePass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.raster_view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Discard,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(2, &self.storage_bind_group, &[]);
        for (pass_offset, items) in &batches {
            // One instance per projection axis.
            record_draws(&mut pass, frame.scene, items, uniforms, *pass_offset, 1, 3);
        }
        log::trace!(
            "Voxelized {} draws over {} levels",
            batches.iter().map(|(_, items)| items.len()).sum::<usize>(),
            batches.len()
        );
        Ok(())
    }

    /// Allocated storage slots after the last submitted update. Submits
    /// `encoder` and waits.
    pub fn read_voxel_count(&mut self, ctx: &GraphicsContext) -> Result<u32> {
        let encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("VoxelCounterReadback"),
            });
        self.counter.refresh(ctx, encoder)?;
        Ok(self.counter.element_at(0).copied().unwrap_or(0))
    }

    /// Overlay the allocated cells of `level` as albedo coloured cubes.
    pub fn draw_voxels(
        &self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        target: &RenderTarget,
        view_proj: Mat4,
        camera_position: Vec3,
        level: i32,
    ) {
        self.draw_debug(ctx, encoder, target, view_proj, camera_position, level, DEBUG_ALBEDO);
    }

    /// Overlay the SH radiance of `level` as seen from the camera.
    pub fn draw_sh(
        &self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        target: &RenderTarget,
        view_proj: Mat4,
        camera_position: Vec3,
        level: i32,
    ) {
        self.draw_debug(ctx, encoder, target, view_proj, camera_position, level, DEBUG_SH);
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_debug(
        &self,
        ctx: &GraphicsContext,
        encoder: &mut wgpu::CommandEncoder,
        target: &RenderTarget,
        view_proj: Mat4,
        camera_position: Vec3,
        level: i32,
        mode: u32,
    ) {
        let Some(level) = self.layout.level(level) else {
            log::warn!("No voxel level {} to draw", level);
            return;
        };
        let Some(depth) = target.depth_attachment() else {
            log::warn!("Voxel debug draw needs a target with depth");
            return;
        };

        let buffer = &self.debug_params[mode as usize];
        let params = DebugParams {
            view_proj: view_proj.to_cols_array_2d(),
            camera_position: camera_position.extend(1.0).to_array(),
            slot: level.slot,
            mode,
            _pad: [0; 2],
        };
        ctx.queue.write_buffer(buffer, 0, bytemuck::bytes_of(&params));
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VoxelDebugBindGroup"),
            layout: &self.debug_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let colors = target.color_attachments(wgpu::LoadOp::Load);
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("VoxelDebugPass"),
            color_attachments: colors.get(..1).unwrap_or_default(),
            depth_stencil_attachment: Some(depth),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.debug_pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.set_bind_group(1, &self.read_bind_group, &[]);
        // 36 cube vertices per cell; absent cells collapse to nothing.
        pass.draw(0..36, 0..level.cell_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_rounds_up_to_power_of_two() {
        assert_eq!(voxel_resolution(64).ok(), Some(64));
        assert_eq!(voxel_resolution(48).ok(), Some(64));
        assert_eq!(voxel_resolution(1).ok(), Some(2));
        assert!(matches!(
            voxel_resolution(0),
            Err(RenderError::InvalidVoxelResolution(0))
        ));
    }

    #[test]
    fn capacity_is_stack_plus_pyramid() {
        let layout = VoxelLayout::new(0.5, 8, 2).expect("valid layout");
        assert_eq!(layout.mip_count(), 4);
        assert_eq!(layout.capacity(), 2 * 512 + 512 + 64 + 8 + 1);
    }

    #[test]
    fn address_ranges_tile_the_table() {
        let layout = VoxelLayout::new(0.25, 16, 3).expect("valid layout");
        let mut ranges: Vec<_> = layout
            .levels()
            .iter()
            .map(|l| (l.address_offset, l.address_offset + l.cell_count()))
            .collect();
        ranges.sort();
        assert_eq!(ranges[0].0, 0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
        assert_eq!(ranges.last().map(|r| r.1), Some(layout.capacity()));
    }

    #[test]
    fn levels_are_in_slot_order() {
        let layout = VoxelLayout::new(1.0, 4, 2).expect("valid layout");
        let levels: Vec<_> = layout.levels().iter().map(|l| (l.level, l.slot)).collect();
        assert_eq!(levels, vec![(-2, 0), (-1, 1), (0, 2), (1, 3), (2, 4)]);
        assert_eq!(layout.level(-1).map(|l| l.voxel_size), Some(2.0));
        assert_eq!(layout.level(1).map(|l| l.resolution), Some(2));
        assert!(layout.level(-3).is_none());
    }

    #[test]
    fn filter_steps_skip_two_coarsest_mips() {
        let layout = VoxelLayout::new(1.0, 64, 2).expect("valid layout");
        let pairs: Vec<_> = layout.filter_steps().iter().map(|s| (s.src, s.dst)).collect();
        assert_eq!(
            pairs,
            vec![(0, -1), (-1, -2), (0, 1), (1, 2), (2, 3), (3, 4)]
        );
    }

    #[test]
    fn small_grids_have_no_pyramid_steps() {
        let layout = VoxelLayout::new(1.0, 4, 0).expect("valid layout");
        assert!(layout.filter_steps().is_empty());
    }

    #[test]
    fn snapping_is_a_pure_function_of_position() {
        let mut layout = VoxelLayout::new(0.25, 16, 2).expect("valid layout");
        let position = Vec3::new(3.13, -7.9, 0.6);
        layout.update(position);
        let first: Vec<_> = layout.levels().iter().map(|l| l.center).collect();
        layout.update(Vec3::new(100.0, 2.0, -3.0));
        layout.update(position);
        let second: Vec<_> = layout.levels().iter().map(|l| l.center).collect();
        assert_eq!(first, second);

        let finest = layout.level(0).expect("mip 0");
        assert!((finest.center - snap_center(position, 0.25)).length() < 1e-5);
    }

    #[test]
    fn children_line_up_with_their_parent() {
        let mut layout = VoxelLayout::new(0.5, 8, 2).expect("valid layout");
        layout.update(Vec3::new(1.3, -0.7, 2.9));
        for step in layout.filter_steps() {
            let fine = layout.level(step.src).expect("src level");
            let coarse = layout.level(step.dst).expect("dst level");
            let (rf, rc) = (fine.resolution as i32, coarse.resolution as i32);
            for d in [IVec3::ZERO, IVec3::new(1, 2, 3), IVec3::splat(rc - 1)] {
                let base = child_base(d, step.offset, rf, rc);
                let fine_corner = fine.min_corner() + base.as_vec3() * fine.voxel_size;
                let coarse_corner = coarse.min_corner() + d.as_vec3() * coarse.voxel_size;
                assert!((fine_corner - coarse_corner).length() < 1e-4, "{step:?} {d}");
                for t in [IVec3::ZERO, IVec3::ONE, IVec3::new(1, 0, 1)] {
                    assert_eq!(parent_cell(base + t, step.offset, rf, rc), d);
                }
            }
        }
    }

    #[test]
    fn cell_lookup_respects_bounds() {
        let layout = VoxelLayout::new(1.0, 4, 0).expect("valid layout");
        let level = layout.level(0).expect("mip 0");
        assert_eq!(level.cell_of(Vec3::new(-2.0, -2.0, -2.0)), Some(UVec3::ZERO));
        assert_eq!(level.cell_of(Vec3::new(1.5, 0.5, -0.5)), Some(UVec3::new(3, 2, 1)));
        assert!(level.cell_of(Vec3::new(2.0, 0.0, 0.0)).is_none());
        assert_eq!(level.address_of(UVec3::new(1, 1, 1)), level.address_offset + 21);
    }

    #[test]
    fn domain_covers_coarsest_cascade() {
        let layout = VoxelLayout::new(0.25, 16, 3).expect("valid layout");
        let domain = layout.domain();
        let coarsest = layout.level(-3).expect("coarsest");
        assert!(domain.contains_point(coarsest.bounds().min));
        assert!(domain.contains_point(coarsest.bounds().max));
    }

    #[test]
    fn axis_projections_map_grid_into_clip_space() {
        let mut layout = VoxelLayout::new(0.5, 8, 1).expect("valid layout");
        layout.update(Vec3::new(10.2, 3.3, -4.1));
        let level = layout.level(-1).expect("cascade");
        let bounds = level.bounds();
        for view_proj in level.axis_view_projections() {
            for corner in [bounds.min, bounds.max, bounds.center()] {
                let clip = view_proj.project_point3(corner);
                assert!(clip.x.abs() <= 1.0 + 1e-4 && clip.y.abs() <= 1.0 + 1e-4);
                assert!((-1e-4..=1.0 + 1e-4).contains(&clip.z));
            }
        }
    }

    #[test]
    fn params_describe_every_level() {
        let layout = VoxelLayout::new(0.25, 8, 2).expect("valid layout");
        let raw = layout.params_raw();
        assert_eq!(raw.level_count, 6);
        assert_eq!(raw.level_info[0], [8 * 8 * 8, 8, 0, 1]);
        assert_eq!(raw.level_info[1], [0, 8, 8, 1]);
        assert_eq!(raw.level_info[2], [2 * 512, 8, 0, 0]);
        assert_eq!(raw.level_centers[0][3], 1.0);
        assert_eq!(std::mem::size_of::<VoxelParamsRaw>(), 784);
    }

    #[test]
    fn wgsl_agrees_on_fixed_point_scale() {
        let declaration = format!("const SH_SCALE: f32 = {SH_SCALE:.1};");
        assert!(VOXEL_COMMON.contains(&declaration));
        assert!(VOXEL_COMMON.contains(&format!("const MAX_VOXEL_LEVELS: u32 = {MAX_VOXEL_LEVELS}u;")));
    }

    #[test]
    fn voxelize_retries_slot_claims() {
        let source = include_str!("../../shader/voxelize.wgsl");
        let (helper, fragment) = source.split_once("@fragment").unwrap();
        assert!(helper.contains("fn claim_entry(index: u32) -> u32"));
        assert!(helper.contains("attempt < CLAIM_ATTEMPTS"));
        assert!(helper.contains("entry == SLOT_PENDING"));
        assert_eq!(source.matches("atomicCompareExchangeWeak").count(), 1);
        assert!(fragment.contains("claim_entry("));
        assert!(!fragment.contains("atomicCompareExchangeWeak"));
    }

    #[test]
    fn pass_uniform_sizes_match_wgsl() {
        assert_eq!(std::mem::size_of::<VoxelizePass>(), 208);
        assert_eq!(std::mem::size_of::<DebugParams>(), 96);
    }
}
