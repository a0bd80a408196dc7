// renderer/shader.rs

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{RenderError, Result};

/// Pipeline stages a shader bundle may provide.
///
/// WGSL only has vertex, fragment and compute entry points, so the hull,
/// domain and geometry stages are always the "not used" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 6] = [
        ShaderStage::Vertex,
        ShaderStage::Hull,
        ShaderStage::Domain,
        ShaderStage::Geometry,
        ShaderStage::Pixel,
        ShaderStage::Compute,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn entry_point(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Hull => "hs_main",
            ShaderStage::Domain => "ds_main",
            ShaderStage::Geometry => "gs_main",
            ShaderStage::Pixel => "fs_main",
            ShaderStage::Compute => "cs_main",
        }
    }

    /// Stages whose absence only means the shader does not use them.
    pub const fn is_optional(self) -> bool {
        matches!(
            self,
            ShaderStage::Hull | ShaderStage::Domain | ShaderStage::Geometry
        )
    }

    pub const fn mask(self) -> StageMask {
        match self {
            ShaderStage::Vertex => StageMask::VERTEX,
            ShaderStage::Hull => StageMask::HULL,
            ShaderStage::Domain => StageMask::DOMAIN,
            ShaderStage::Geometry => StageMask::GEOMETRY,
            ShaderStage::Pixel => StageMask::PIXEL,
            ShaderStage::Compute => StageMask::COMPUTE,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StageMask: u32 {
        const VERTEX = 1 << 0;
        const HULL = 1 << 1;
        const DOMAIN = 1 << 2;
        const GEOMETRY = 1 << 3;
        const PIXEL = 1 << 4;
        const COMPUTE = 1 << 5;
        const GRAPHICS = Self::VERTEX.bits() | Self::PIXEL.bits();
    }
}

impl StageMask {
    pub fn visibility(self) -> wgpu::ShaderStages {
        let mut stages = wgpu::ShaderStages::NONE;
        if self.intersects(StageMask::VERTEX | StageMask::HULL | StageMask::DOMAIN | StageMask::GEOMETRY) {
            stages |= wgpu::ShaderStages::VERTEX;
        }
        if self.contains(StageMask::PIXEL) {
            stages |= wgpu::ShaderStages::FRAGMENT;
        }
        if self.contains(StageMask::COMPUTE) {
            stages |= wgpu::ShaderStages::COMPUTE;
        }
        stages
    }
}

/// Load arguments of a shader: source path plus textual defines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    pub path: String,
    pub defines: Vec<(String, String)>,
}

impl ShaderKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            defines: Vec::new(),
        }
    }

    /// Replace every `{{name}}` in the source with `value`.
    pub fn with_define(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.defines.push((name.into(), value.to_string()));
        self
    }

    pub fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for ShaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for (name, value) in &self.defines {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

pub fn apply_defines(source: &str, defines: &[(String, String)]) -> String {
    defines
        .iter()
        .fold(source.to_owned(), |acc, (name, value)| {
            acc.replace(&format!("{{{{{name}}}}}"), value)
        })
}

/// Stages whose entry point function is defined in `source`.
pub fn detect_stages(source: &str) -> StageMask {
    ShaderStage::ALL
        .iter()
        .filter(|stage| defines_function(source, stage.entry_point()))
        .fold(StageMask::empty(), |mask, stage| mask | stage.mask())
}

fn defines_function(source: &str, name: &str) -> bool {
    source.match_indices("fn ").any(|(at, _)| {
        let rest = source[at + 3..].trim_start();
        rest.strip_prefix(name)
            .is_some_and(|tail| tail.trim_start().starts_with('('))
    })
}

/// Source of shader text.
pub trait FileSystem {
    fn read(&self, path: &str) -> Result<String>;
}

pub struct DiskFileSystem {
    root: PathBuf,
}

impl DiskFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSystem for DiskFileSystem {
    fn read(&self, path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.root.join(path))?)
    }
}

/// The WGSL shipped with the crate.
pub struct EmbeddedFileSystem;

impl EmbeddedFileSystem {
    const SOURCES: &'static [(&'static str, &'static str)] = &[
        ("gbuffer.wgsl", include_str!("../../shader/gbuffer.wgsl")),
        ("shadow.wgsl", include_str!("../../shader/shadow.wgsl")),
        ("blur.wgsl", include_str!("../../shader/blur.wgsl")),
        ("direct_light.wgsl", include_str!("../../shader/direct_light.wgsl")),
        ("voxelize.wgsl", include_str!("../../shader/voxelize.wgsl")),
        ("inject_light.wgsl", include_str!("../../shader/inject_light.wgsl")),
        ("sh_filter.wgsl", include_str!("../../shader/sh_filter.wgsl")),
        ("sh_convert.wgsl", include_str!("../../shader/sh_convert.wgsl")),
        ("cone_trace.wgsl", include_str!("../../shader/cone_trace.wgsl")),
        ("composite.wgsl", include_str!("../../shader/composite.wgsl")),
        ("voxel_debug.wgsl", include_str!("../../shader/voxel_debug.wgsl")),
        ("bright_pass.wgsl", include_str!("../../shader/bright_pass.wgsl")),
        ("scale.wgsl", include_str!("../../shader/scale.wgsl")),
        ("tonemap.wgsl", include_str!("../../shader/tonemap.wgsl")),
        ("luminance.wgsl", include_str!("../../shader/luminance.wgsl")),
    ];

    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::SOURCES.iter().map(|(name, _)| *name)
    }
}

impl FileSystem for EmbeddedFileSystem {
    fn read(&self, path: &str) -> Result<String> {
        Self::SOURCES
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, source)| (*source).to_owned())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no embedded shader '{path}'")).into()
            })
    }
}

/// Compiled module plus the stages it provides. Shared by every pipeline and
/// material built from it.
pub struct CompiledShader {
    key: ShaderKey,
    module: wgpu::ShaderModule,
    stages: StageMask,
}

impl CompiledShader {
    pub fn key(&self) -> &ShaderKey {
        &self.key
    }

    pub fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }

    pub fn stages(&self) -> StageMask {
        self.stages
    }

    pub fn entry(&self, stage: ShaderStage) -> Option<&'static str> {
        self.stages
            .contains(stage.mask())
            .then(|| stage.entry_point())
    }

    pub fn require(&self, stage: ShaderStage) -> Result<&'static str> {
        self.entry(stage).ok_or_else(|| RenderError::MissingEntryPoint {
            key: self.key.to_string(),
            stage,
        })
    }
}

/// Check that every mandatory stage is present. Missing optional stages are
/// skipped.
pub fn check_stages(key: &ShaderKey, found: StageMask, mandatory: StageMask) -> Result<()> {
    for stage in ShaderStage::ALL {
        if found.contains(stage.mask()) {
            continue;
        }
        if stage.is_optional() {
            log::debug!("{key}: no {stage:?} stage, skipping");
        } else if mandatory.contains(stage.mask()) {
            return Err(RenderError::MissingEntryPoint {
                key: key.to_string(),
                stage,
            });
        }
    }
    Ok(())
}

/// Compiles shaders through a [`FileSystem`] and caches them by the hash of
/// their load arguments.
pub struct ShaderLibrary {
    files: Box<dyn FileSystem>,
    cache: HashMap<u64, Arc<CompiledShader>>,
}

impl ShaderLibrary {
    pub fn new(files: Box<dyn FileSystem>) -> Self {
        Self {
            files,
            cache: HashMap::new(),
        }
    }

    pub fn embedded() -> Self {
        Self::new(Box::new(EmbeddedFileSystem))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn load(
        &mut self,
        device: &wgpu::Device,
        key: &ShaderKey,
        mandatory: StageMask,
    ) -> Result<Arc<CompiledShader>> {
        let cache_key = key.cache_key();
        if let Some(shader) = self.cache.get(&cache_key) {
            return Ok(Arc::clone(shader));
        }

        let source = apply_defines(&self.files.read(&key.path)?, &key.defines);
        let stages = detect_stages(&source);
        check_stages(key, stages, mandatory)?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&key.path),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RenderError::ShaderCompilation {
                key: key.to_string(),
                message: err.to_string(),
            });
        }

        log::debug!("Compiled shader {key} ({stages:?})");
        let shader = Arc::new(CompiledShader {
            key: key.clone(),
            module,
            stages,
        });
        self.cache.insert(cache_key, Arc::clone(&shader));
        Ok(shader)
    }

    pub fn graphics(&mut self, device: &wgpu::Device, key: &ShaderKey) -> Result<Arc<CompiledShader>> {
        self.load(device, key, StageMask::GRAPHICS)
    }

    pub fn compute(&mut self, device: &wgpu::Device, key: &ShaderKey) -> Result<Arc<CompiledShader>> {
        self.load(device, key, StageMask::COMPUTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_entry_points() {
        let source = "@vertex\nfn vs_main(@builtin(vertex_index) i: u32) {}\n@fragment fn fs_main () {}";
        assert_eq!(detect_stages(source), StageMask::GRAPHICS);

        let compute = "@compute @workgroup_size(8) fn cs_main() {}\nfn vs_main_helper() {}";
        assert_eq!(detect_stages(compute), StageMask::COMPUTE);
    }

    #[test]
    fn missing_optional_stage_is_not_an_error() {
        let key = ShaderKey::new("a.wgsl");
        assert!(check_stages(&key, StageMask::GRAPHICS, StageMask::GRAPHICS).is_ok());
    }

    #[test]
    fn missing_mandatory_stage_is_reported() {
        let key = ShaderKey::new("a.wgsl");
        let err = check_stages(&key, StageMask::VERTEX, StageMask::GRAPHICS).unwrap_err();
        assert!(matches!(
            err,
            RenderError::MissingEntryPoint {
                stage: ShaderStage::Pixel,
                ..
            }
        ));
    }

    #[test]
    fn defines_change_cache_key() {
        let plain = ShaderKey::new("blur.wgsl");
        let half = ShaderKey::new("blur.wgsl").with_define("FORMAT", "rgba16float");
        let full = ShaderKey::new("blur.wgsl").with_define("FORMAT", "rgba32float");
        assert_ne!(plain.cache_key(), half.cache_key());
        assert_ne!(half.cache_key(), full.cache_key());
        assert_eq!(
            half.cache_key(),
            ShaderKey::new("blur.wgsl")
                .with_define("FORMAT", "rgba16float")
                .cache_key()
        );
    }

    #[test]
    fn defines_are_substituted() {
        let defines = vec![("FORMAT".to_owned(), "rgba16float".to_owned())];
        assert_eq!(
            apply_defines("texture_storage_2d<{{FORMAT}}, write>", &defines),
            "texture_storage_2d<rgba16float, write>"
        );
    }

    #[test]
    fn embedded_shaders_declare_their_stages() {
        let files = EmbeddedFileSystem;
        for name in EmbeddedFileSystem::names() {
            let source = files.read(name).expect("embedded source");
            let stages = detect_stages(&source);
            assert!(
                stages.contains(StageMask::COMPUTE) || stages.contains(StageMask::GRAPHICS),
                "{name} has no usable entry point"
            );
        }
        assert!(matches!(files.read("nope.wgsl"), Err(RenderError::Io(_))));
    }

    #[test]
    fn stage_visibility() {
        assert_eq!(StageMask::GRAPHICS.visibility(), wgpu::ShaderStages::VERTEX_FRAGMENT);
        assert_eq!(StageMask::COMPUTE.visibility(), wgpu::ShaderStages::COMPUTE);
    }
}
