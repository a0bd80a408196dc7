pub mod buffer;
pub mod cache;
pub mod context;
pub mod deferred;
pub mod draw;
pub mod lighting;
pub mod lights;
pub mod material;
pub mod pipeline_builder;
pub mod postprocess;
pub mod shader;
pub mod shadow;
pub mod texture;
pub mod uniforms;
pub mod vertex;
pub mod voxel;

pub use buffer::{DynamicUniforms, ScratchArray, StructuredBuffer};
pub use cache::{Pooled, ResourcePool, SurfaceAllocator};
pub use context::{Capabilities, GraphicsContext};
pub use deferred::{DeferredRenderer, FrameInfo, FrameOutput};
pub use lighting::{LightAccumulator, LightingPass, LightingPlan, LightingReport, LightingResult};
pub use material::{Material, MaterialInput, MaterialTemplate};
pub use pipeline_builder::PipelineBuilder;
pub use postprocess::PostProcess;
pub use shader::{ShaderKey, ShaderLibrary, ShaderStage};
pub use shadow::ShadowAtlas;
pub use texture::{GpTexture, PooledGpTexture, PooledTarget, RenderTarget, Texture};
pub use vertex::Vertex;
pub use voxel::{VoxelLayout, Voxelization};
