use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub present_mode: PresentModeSetting,
    #[serde(default = "RenderSettings::default_enable_global_illumination")]
    pub enable_global_illumination: bool,
    #[serde(default)]
    pub voxel: VoxelSettings,
    #[serde(default)]
    pub shadows: ShadowSettings,
    #[serde(default)]
    pub light_overflow: LightOverflowPolicy,
    #[serde(default)]
    pub postprocess: PostProcessSettings,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            present_mode: PresentModeSetting::default(),
            enable_global_illumination: Self::default_enable_global_illumination(),
            voxel: VoxelSettings::default(),
            shadows: ShadowSettings::default(),
            light_overflow: LightOverflowPolicy::default(),
            postprocess: PostProcessSettings::default(),
        }
    }
}

impl RenderSettings {
    pub fn load() -> Self {
        Self::load_from_path("settings.json")
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|err| {
                warn!(
                    "Failed to parse {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        let settings = serde_json::from_str::<RenderSettings>(contents)?;
        info!("Parsed render settings");
        Ok(settings.validate())
    }

    pub fn validate(mut self) -> Self {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        self.voxel = self.voxel.validate();
        self.shadows = self.shadows.validate();
        self.postprocess = self.postprocess.validate();
        self
    }

    pub fn present_mode(&self, available: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        let desired = self.present_mode.to_wgpu();
        if available.contains(&desired) {
            return desired;
        }

        warn!(
            "Requested present mode {:?} is not supported. Falling back to FIFO.",
            desired
        );

        if available.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            available
                .first()
                .copied()
                .unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    const fn default_enable_global_illumination() -> bool {
        true
    }
}

/// Voxel clipmap dimensions. The resolution is rounded up to a power of two
/// when the clipmap is built, so non power of two values are accepted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelSettings {
    #[serde(default = "VoxelSettings::default_voxel_size")]
    pub voxel_size: f32,
    #[serde(default = "VoxelSettings::default_resolution")]
    pub resolution: u32,
    #[serde(default = "VoxelSettings::default_cascades")]
    pub cascades: u32,
}

impl Default for VoxelSettings {
    fn default() -> Self {
        Self {
            voxel_size: Self::default_voxel_size(),
            resolution: Self::default_resolution(),
            cascades: Self::default_cascades(),
        }
    }
}

impl VoxelSettings {
    fn validate(mut self) -> Self {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            warn!("Voxel size must be positive. Using default value.");
            self.voxel_size = Self::default_voxel_size();
        }

        if self.resolution == 0 {
            warn!("Voxel resolution must be greater than zero. Using default value.");
            self.resolution = Self::default_resolution();
        }

        if self.cascades > 8 {
            warn!("At most 8 voxel cascades are supported. Clamping {}.", self.cascades);
            self.cascades = 8;
        }

        self
    }

    const fn default_voxel_size() -> f32 {
        0.25
    }

    const fn default_resolution() -> u32 {
        64
    }

    const fn default_cascades() -> u32 {
        3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowSettings {
    #[serde(default = "ShadowSettings::default_map_size")]
    pub map_size: u32,
    #[serde(default = "ShadowSettings::default_atlas_pages")]
    pub atlas_pages: u32,
    #[serde(default)]
    pub full_precision: bool,
    #[serde(default = "ShadowSettings::default_blur_sigma")]
    pub blur_sigma: f32,
    #[serde(default = "ShadowSettings::default_blur_radius")]
    pub blur_radius: u32,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            map_size: Self::default_map_size(),
            atlas_pages: Self::default_atlas_pages(),
            full_precision: false,
            blur_sigma: Self::default_blur_sigma(),
            blur_radius: Self::default_blur_radius(),
        }
    }
}

impl ShadowSettings {
    fn validate(mut self) -> Self {
        if self.map_size < 4 {
            warn!("Shadow map size must be at least 4. Using default value.");
            self.map_size = Self::default_map_size();
        }

        if self.atlas_pages == 0 {
            warn!("Shadow atlas needs at least one page. Using default value.");
            self.atlas_pages = Self::default_atlas_pages();
        }

        if !(self.blur_sigma.is_finite() && self.blur_sigma > 0.0) {
            warn!("Shadow blur sigma must be positive. Using default value.");
            self.blur_sigma = Self::default_blur_sigma();
        }

        if self.blur_radius > crate::renderer::postprocess::MAX_BLUR_RADIUS {
            warn!(
                "Shadow blur radius {} exceeds {}. Clamping.",
                self.blur_radius,
                crate::renderer::postprocess::MAX_BLUR_RADIUS
            );
            self.blur_radius = crate::renderer::postprocess::MAX_BLUR_RADIUS;
        }

        self
    }

    const fn default_map_size() -> u32 {
        2048
    }

    const fn default_atlas_pages() -> u32 {
        8
    }

    const fn default_blur_sigma() -> f32 {
        1.67
    }

    const fn default_blur_radius() -> u32 {
        2
    }
}

/// What happens to lights that do not fit into the fixed light arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightOverflowPolicy {
    /// Keep the lights closest to the camera.
    #[default]
    DropFarthest,
    /// Keep lights in traversal order and drop the rest.
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessSettings {
    #[serde(default = "PostProcessSettings::default_vignette")]
    pub vignette: f32,
    #[serde(default = "PostProcessSettings::default_bloom_threshold")]
    pub bloom_threshold: f32,
    #[serde(default = "PostProcessSettings::default_bloom_strength")]
    pub bloom_strength: f32,
    #[serde(default = "PostProcessSettings::default_bloom_blur_sigma")]
    pub bloom_blur_sigma: f32,
    #[serde(default = "PostProcessSettings::default_key_value")]
    pub key_value: f32,
    #[serde(default = "PostProcessSettings::default_min_luminance")]
    pub min_luminance: f32,
    #[serde(default = "PostProcessSettings::default_max_luminance")]
    pub max_luminance: f32,
    #[serde(default = "PostProcessSettings::default_low_percentage")]
    pub low_percentage: f32,
    #[serde(default = "PostProcessSettings::default_high_percentage")]
    pub high_percentage: f32,
    #[serde(default = "PostProcessSettings::default_min_adaptation")]
    pub min_adaptation: f32,
    #[serde(default = "PostProcessSettings::default_max_adaptation")]
    pub max_adaptation: f32,
    #[serde(default = "PostProcessSettings::default_adaptation_rate")]
    pub adaptation_rate: f32,
    #[serde(default = "PostProcessSettings::default_luminance_downscale")]
    pub luminance_downscale: u32,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            vignette: Self::default_vignette(),
            bloom_threshold: Self::default_bloom_threshold(),
            bloom_strength: Self::default_bloom_strength(),
            bloom_blur_sigma: Self::default_bloom_blur_sigma(),
            key_value: Self::default_key_value(),
            min_luminance: Self::default_min_luminance(),
            max_luminance: Self::default_max_luminance(),
            low_percentage: Self::default_low_percentage(),
            high_percentage: Self::default_high_percentage(),
            min_adaptation: Self::default_min_adaptation(),
            max_adaptation: Self::default_max_adaptation(),
            adaptation_rate: Self::default_adaptation_rate(),
            luminance_downscale: Self::default_luminance_downscale(),
        }
    }
}

impl PostProcessSettings {
    fn validate(mut self) -> Self {
        if !(self.min_luminance > 0.0 && self.max_luminance > self.min_luminance) {
            warn!("Luminance range must be positive and non-empty. Using default range.");
            self.min_luminance = Self::default_min_luminance();
            self.max_luminance = Self::default_max_luminance();
        }

        if !(0.0..=1.0).contains(&self.low_percentage)
            || !(0.0..=1.0).contains(&self.high_percentage)
            || self.low_percentage > self.high_percentage
        {
            warn!("Histogram percentages must satisfy 0 <= low <= high <= 1. Using defaults.");
            self.low_percentage = Self::default_low_percentage();
            self.high_percentage = Self::default_high_percentage();
        }

        if self.min_adaptation > self.max_adaptation {
            warn!("Minimum adaptation exceeds maximum. Using default adaptation range.");
            self.min_adaptation = Self::default_min_adaptation();
            self.max_adaptation = Self::default_max_adaptation();
        }

        if !(self.bloom_blur_sigma.is_finite() && self.bloom_blur_sigma > 0.0) {
            warn!("Bloom blur sigma must be positive. Using default value.");
            self.bloom_blur_sigma = Self::default_bloom_blur_sigma();
        }

        self
    }

    const fn default_vignette() -> f32 {
        0.5
    }

    const fn default_bloom_threshold() -> f32 {
        1.0
    }

    const fn default_bloom_strength() -> f32 {
        0.5
    }

    const fn default_bloom_blur_sigma() -> f32 {
        1.67
    }

    const fn default_key_value() -> f32 {
        0.4
    }

    const fn default_min_luminance() -> f32 {
        0.0156
    }

    const fn default_max_luminance() -> f32 {
        64.0
    }

    const fn default_low_percentage() -> f32 {
        0.85
    }

    const fn default_high_percentage() -> f32 {
        0.95
    }

    const fn default_min_adaptation() -> f32 {
        0.2
    }

    const fn default_max_adaptation() -> f32 {
        1.0
    }

    const fn default_adaptation_rate() -> f32 {
        0.75
    }

    const fn default_luminance_downscale() -> u32 {
        2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    #[default]
    Fifo,
    FifoRelaxed,
    Immediate,
    Mailbox,
    AutoVsync,
    AutoNoVsync,
}

impl PresentModeSetting {
    fn to_wgpu(&self) -> wgpu::PresentMode {
        match self {
            PresentModeSetting::Fifo => wgpu::PresentMode::Fifo,
            PresentModeSetting::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
            PresentModeSetting::Immediate => wgpu::PresentMode::Immediate,
            PresentModeSetting::Mailbox => wgpu::PresentMode::Mailbox,
            PresentModeSetting::AutoVsync => wgpu::PresentMode::AutoVsync,
            PresentModeSetting::AutoNoVsync => wgpu::PresentMode::AutoNoVsync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let mut settings = RenderSettings::default();
        settings.resolution = Resolution {
            width: 0,
            height: 0,
        };
        settings.voxel.voxel_size = -1.0;
        settings.voxel.resolution = 0;
        settings.shadows.atlas_pages = 0;
        settings.postprocess.low_percentage = 0.99;
        settings.postprocess.high_percentage = 0.5;

        let validated = settings.validate();

        assert_eq!(validated.resolution.width, Resolution::default().width);
        assert_eq!(validated.voxel.voxel_size, VoxelSettings::default().voxel_size);
        assert_eq!(validated.voxel.resolution, VoxelSettings::default().resolution);
        assert_eq!(
            validated.shadows.atlas_pages,
            ShadowSettings::default().atlas_pages
        );
        assert_eq!(validated.postprocess.low_percentage, 0.85);
        assert_eq!(validated.postprocess.high_percentage, 0.95);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let mut valid = RenderSettings::default();
        valid.voxel.resolution = 48;
        valid.voxel.cascades = 2;
        valid.shadows.full_precision = true;

        let validated = valid.clone().validate();

        // Rounding to a power of two happens when the clipmap is built.
        assert_eq!(validated.voxel.resolution, 48);
        assert_eq!(validated.voxel.cascades, 2);
        assert!(validated.shadows.full_precision);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings = RenderSettings::from_json(
            r#"{ "enable_global_illumination": false, "voxel": { "cascades": 1 } }"#,
        )
        .expect("valid json");

        assert!(!settings.enable_global_illumination);
        assert_eq!(settings.voxel.cascades, 1);
        assert_eq!(settings.voxel.resolution, 64);
        assert_eq!(settings.light_overflow, LightOverflowPolicy::DropFarthest);
        assert_eq!(settings.postprocess.key_value, 0.4);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings = RenderSettings::load_from_path("does/not/exist/settings.json");
        assert!(settings.enable_global_illumination);
        assert_eq!(settings.shadows.map_size, 2048);
    }

    #[test]
    fn present_mode_falls_back_to_fifo_when_desired_missing() {
        let settings = RenderSettings {
            present_mode: PresentModeSetting::Mailbox,
            ..RenderSettings::default()
        };

        let available = [wgpu::PresentMode::Fifo, wgpu::PresentMode::Immediate];

        assert_eq!(settings.present_mode(&available), wgpu::PresentMode::Fifo);
    }
}
