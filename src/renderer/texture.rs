// renderer/texture.rs

use std::path::Path;
use std::sync::mpsc;

use crate::error::{RenderError, Result};
use crate::renderer::cache::{Pooled, ResourcePool, SurfaceAllocator};
use crate::renderer::GraphicsContext;

pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

fn color_usages(format: wgpu::TextureFormat) -> wgpu::TextureUsages {
    let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT
        | wgpu::TextureUsages::TEXTURE_BINDING
        | wgpu::TextureUsages::COPY_SRC
        | wgpu::TextureUsages::COPY_DST;
    if format
        .guaranteed_format_features(wgpu::Features::empty())
        .allowed_usages
        .contains(wgpu::TextureUsages::STORAGE_BINDING)
    {
        usage |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    usage
}

/// Exact description of a pooled render target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetKey {
    pub width: u32,
    pub height: u32,
    pub formats: Vec<wgpu::TextureFormat>,
    pub depth: bool,
}

impl RenderTargetKey {
    pub fn new(width: u32, height: u32, formats: &[wgpu::TextureFormat], depth: bool) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            formats: formats.to_vec(),
            depth,
        }
    }
}

/// One or more colour surfaces plus an optional depth surface, all sized
/// alike.
pub struct RenderTarget {
    key: RenderTargetKey,
    colors: Vec<wgpu::Texture>,
    color_views: Vec<wgpu::TextureView>,
    depth: Option<(wgpu::Texture, wgpu::TextureView)>,
}

impl RenderTarget {
    pub fn new(device: &wgpu::Device, key: &RenderTargetKey, label: &str) -> Self {
        let size = wgpu::Extent3d {
            width: key.width,
            height: key.height,
            depth_or_array_layers: 1,
        };

        let colors: Vec<wgpu::Texture> = key
            .formats
            .iter()
            .enumerate()
            .map(|(index, &format)| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&format!("{label}Color{index}")),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: color_usages(format),
                    view_formats: &[],
                })
            })
            .collect();
        let color_views = colors
            .iter()
            .map(|texture| texture.create_view(&wgpu::TextureViewDescriptor::default()))
            .collect();

        let depth = key.depth.then(|| {
            let texture = device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("{label}Depth")),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: DEPTH_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            (texture, view)
        });

        Self {
            key: key.clone(),
            colors,
            color_views,
            depth,
        }
    }

    pub fn key(&self) -> &RenderTargetKey {
        &self.key
    }

    pub fn width(&self) -> u32 {
        self.key.width
    }

    pub fn height(&self) -> u32 {
        self.key.height
    }

    pub fn extent(&self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.key.width,
            height: self.key.height,
            depth_or_array_layers: 1,
        }
    }

    pub fn color_count(&self) -> usize {
        self.colors.len()
    }

    pub fn color_texture(&self, index: usize) -> &wgpu::Texture {
        &self.colors[index]
    }

    pub fn color_view(&self, index: usize) -> &wgpu::TextureView {
        &self.color_views[index]
    }

    pub fn depth_view(&self) -> Option<&wgpu::TextureView> {
        self.depth.as_ref().map(|(_, view)| view)
    }

    pub fn color_attachments(
        &self,
        load: wgpu::LoadOp<wgpu::Color>,
    ) -> Vec<Option<wgpu::RenderPassColorAttachment<'_>>> {
        self.color_views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect()
    }

    pub fn depth_attachment(&self) -> Option<wgpu::RenderPassDepthStencilAttachment<'_>> {
        self.depth_view()
            .map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            })
    }

    /// Read a floating point colour surface back to the CPU. Blocks.
    pub fn read_color(&self, ctx: &GraphicsContext, index: usize) -> Result<Vec<[f32; 4]>> {
        let format = self.key.formats[index];
        let texel_size = match format {
            wgpu::TextureFormat::Rgba16Float => 8u32,
            wgpu::TextureFormat::Rgba32Float => 16u32,
            other => {
                return Err(RenderError::ReadbackFailed(format!(
                    "unsupported read-back format {other:?}"
                )))
            }
        };

        let unpadded = self.key.width * texel_size;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("RenderTargetReadback"),
            size: (padded * self.key.height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("RenderTargetReadback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.colors[index],
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.key.height),
                },
            },
            self.extent(),
        );
        ctx.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.wait_idle()?;
        rx.recv()
            .map_err(|err| RenderError::ReadbackFailed(err.to_string()))?
            .map_err(|err| RenderError::ReadbackFailed(err.to_string()))?;

        let mut pixels = Vec::with_capacity((self.key.width * self.key.height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(padded as usize) {
                for texel in row[..unpadded as usize].chunks(texel_size as usize) {
                    pixels.push(decode_texel(texel, format));
                }
            }
        }
        buffer.unmap();
        Ok(pixels)
    }
}

fn decode_texel(texel: &[u8], format: wgpu::TextureFormat) -> [f32; 4] {
    let mut out = [0.0; 4];
    match format {
        wgpu::TextureFormat::Rgba16Float => {
            for (value, bytes) in out.iter_mut().zip(texel.chunks_exact(2)) {
                *value = half::f16::from_le_bytes([bytes[0], bytes[1]]).to_f32();
            }
        }
        _ => {
            for (value, bytes) in out.iter_mut().zip(texel.chunks_exact(4)) {
                *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
    }
    out
}

pub struct RenderTargetAllocator {
    device: wgpu::Device,
}

impl RenderTargetAllocator {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl SurfaceAllocator for RenderTargetAllocator {
    type Key = RenderTargetKey;
    type Resource = RenderTarget;

    fn allocate(&self, key: &RenderTargetKey) -> Result<RenderTarget> {
        checked_allocation(&self.device, "render target", || {
            RenderTarget::new(&self.device, key, "PooledTarget")
        })
    }

    fn key_of(resource: &RenderTarget) -> RenderTargetKey {
        resource.key.clone()
    }
}

pub type RenderTargetCache = ResourcePool<RenderTargetAllocator>;
pub type PooledTarget = Pooled<RenderTargetKey, RenderTarget>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpDimension {
    D2,
    D2Array,
    D3,
}

/// Exact description of a general purpose (storage capable) texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpTextureKey {
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
    pub dimension: GpDimension,
    pub format: wgpu::TextureFormat,
    pub mip_levels: u32,
}

impl GpTextureKey {
    pub fn d2(width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            depth_or_layers: 1,
            dimension: GpDimension::D2,
            format,
            mip_levels: 1,
        }
    }

    pub fn d2_array(width: u32, height: u32, layers: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            depth_or_layers: layers.max(1),
            dimension: GpDimension::D2Array,
            ..Self::d2(width, height, format)
        }
    }

    pub fn d3(size: [u32; 3], mip_levels: u32, format: wgpu::TextureFormat) -> Self {
        Self {
            width: size[0].max(1),
            height: size[1].max(1),
            depth_or_layers: size[2].max(1),
            dimension: GpDimension::D3,
            format,
            mip_levels: mip_levels.max(1),
        }
    }
}

/// Texture readable by shaders and writable from compute, with one storage
/// view per mip level.
pub struct GpTexture {
    key: GpTextureKey,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    mip_views: Vec<wgpu::TextureView>,
}

impl GpTexture {
    pub fn new(device: &wgpu::Device, key: &GpTextureKey, label: &str) -> Self {
        let (dimension, view_dimension) = match key.dimension {
            GpDimension::D2 => (wgpu::TextureDimension::D2, wgpu::TextureViewDimension::D2),
            GpDimension::D2Array => (
                wgpu::TextureDimension::D2,
                wgpu::TextureViewDimension::D2Array,
            ),
            GpDimension::D3 => (wgpu::TextureDimension::D3, wgpu::TextureViewDimension::D3),
        };

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: key.width,
                height: key.height,
                depth_or_array_layers: key.depth_or_layers,
            },
            mip_level_count: key.mip_levels,
            sample_count: 1,
            dimension,
            format: key.format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&format!("{label}View")),
            dimension: Some(view_dimension),
            ..Default::default()
        });

        let mip_views = (0..key.mip_levels)
            .map(|mip| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("{label}Mip{mip}")),
                    dimension: Some(view_dimension),
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        Self {
            key: *key,
            texture,
            view,
            mip_views,
        }
    }

    pub fn key(&self) -> &GpTextureKey {
        &self.key
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn mip_view(&self, mip: u32) -> &wgpu::TextureView {
        &self.mip_views[mip as usize]
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.key.format
    }

    pub fn layers(&self) -> u32 {
        self.key.depth_or_layers
    }
}

pub struct GpTextureAllocator {
    device: wgpu::Device,
}

impl GpTextureAllocator {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl SurfaceAllocator for GpTextureAllocator {
    type Key = GpTextureKey;
    type Resource = GpTexture;

    fn allocate(&self, key: &GpTextureKey) -> Result<GpTexture> {
        checked_allocation(&self.device, "GP texture", || {
            GpTexture::new(&self.device, key, "PooledGpTexture")
        })
    }

    fn key_of(resource: &GpTexture) -> GpTextureKey {
        resource.key
    }
}

pub type GpTextureCache = ResourcePool<GpTextureAllocator>;
pub type PooledGpTexture = Pooled<GpTextureKey, GpTexture>;

/// Run an allocation inside an error scope so that a failure surfaces as an
/// error instead of a device-lost callback.
fn checked_allocation<T>(
    device: &wgpu::Device,
    what: &str,
    allocate: impl FnOnce() -> T,
) -> Result<T> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let resource = allocate();
    let validation = pollster::block_on(device.pop_error_scope());
    let memory = pollster::block_on(device.pop_error_scope());
    match validation.or(memory) {
        Some(err) => Err(RenderError::Texture(format!("{what} allocation failed: {err}"))),
        None => Ok(resource),
    }
}

/// Decode an encoded image (PNG, JPEG, ...) into tightly packed RGBA8.
pub fn decode_rgba8(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| RenderError::Texture(format!("Failed to decode image: {e}")))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok((rgba.into_raw(), width, height))
}

/// Sampled colour texture used as a material input.
#[derive(Debug, Clone)]
pub struct Texture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl Texture {
    pub fn from_rgba8(
        ctx: &GraphicsContext,
        data: &[u8],
        width: u32,
        height: u32,
        label: &str,
    ) -> Self {
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }

    pub fn from_path(ctx: &GraphicsContext, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading texture: {:?}", path);
        let bytes = std::fs::read(path)?;
        let (rgba, width, height) = decode_rgba8(&bytes)?;
        Ok(Self::from_rgba8(
            ctx,
            &rgba,
            width,
            height,
            &path.to_string_lossy(),
        ))
    }

    pub fn white(ctx: &GraphicsContext) -> Self {
        Self::from_rgba8(ctx, &[255, 255, 255, 255], 1, 1, "WhiteTexture")
    }

    /// Two-tone checkerboard, `cells` squares per side.
    pub fn checker(ctx: &GraphicsContext, size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = (size / cells.max(1)).max(1);
        let data: Vec<u8> = (0..size * size)
            .flat_map(|i| {
                let (x, y) = (i % size, i / size);
                if ((x / cell) + (y / cell)) % 2 == 0 {
                    a
                } else {
                    b
                }
            })
            .collect();
        Self::from_rgba8(ctx, &data, size, size, "CheckerTexture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_png_roundtrip_dimensions() {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        let mut encoded = std::io::Cursor::new(Vec::new());
        img.write_to(&mut encoded, image::ImageFormat::Png)
            .expect("encode png");

        let (rgba, width, height) = decode_rgba8(encoded.get_ref()).expect("decode");
        assert_eq!((width, height), (3, 2));
        assert_eq!(rgba.len(), 3 * 2 * 4);
        assert_eq!(&rgba[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            decode_rgba8(&[1, 2, 3, 4]),
            Err(RenderError::Texture(_))
        ));
    }

    #[test]
    fn half_texels_decode() {
        let one = half::f16::from_f32(1.0).to_le_bytes();
        let half_value = half::f16::from_f32(0.5).to_le_bytes();
        let texel = [one, half_value, one, half_value].concat();
        assert_eq!(
            decode_texel(&texel, wgpu::TextureFormat::Rgba16Float),
            [1.0, 0.5, 1.0, 0.5]
        );
    }

    #[test]
    fn storage_usage_only_for_storage_formats() {
        assert!(color_usages(wgpu::TextureFormat::Rgba16Float)
            .contains(wgpu::TextureUsages::STORAGE_BINDING));
        assert!(!color_usages(wgpu::TextureFormat::Rgba8UnormSrgb)
            .contains(wgpu::TextureUsages::STORAGE_BINDING));
    }

    #[test]
    fn render_target_keys_compare_by_value() {
        let a = RenderTargetKey::new(4, 4, &[wgpu::TextureFormat::Rgba16Float], true);
        let b = RenderTargetKey::new(4, 4, &[wgpu::TextureFormat::Rgba16Float], true);
        let c = RenderTargetKey::new(4, 4, &[wgpu::TextureFormat::Rgba16Float], false);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(RenderTargetKey::new(0, 0, &[], false).width, 1);
    }
}
