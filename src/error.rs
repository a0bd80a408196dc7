use thiserror::Error;

use crate::renderer::shader::ShaderStage;

/// Errors surfaced by renderer construction and frame production.
///
/// Construction and shader compilation failures abort the caller; there is no
/// retry. The "nothing to draw" case is not an error and is reported as
/// `Ok(None)` by [`crate::renderer::DeferredRenderer::draw`].
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("No compatible graphics adapter available")]
    AdapterUnavailable,

    #[error("Device request failed: {0}")]
    DeviceRequest(String),

    #[error("Shader '{key}' failed to compile: {message}")]
    ShaderCompilation { key: String, message: String },

    #[error("Shader '{key}' is missing mandatory {stage:?} entry point")]
    MissingEntryPoint { key: String, stage: ShaderStage },

    #[error("Buffer '{0}' is already locked")]
    BufferAlreadyLocked(String),

    #[error("Buffer '{0}' is not locked")]
    BufferNotLocked(String),

    #[error("Voxel resolution {0} is invalid")]
    InvalidVoxelResolution(u32),

    #[error("Unsupported camera projection: {0}")]
    UnsupportedProjection(String),

    #[error("GPU read-back failed: {0}")]
    ReadbackFailed(String),

    #[error("Texture load failed: {0}")]
    Texture(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Surface(#[from] wgpu::SurfaceError),
}

pub type Result<T> = std::result::Result<T, RenderError>;
