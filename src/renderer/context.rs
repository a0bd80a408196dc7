use crate::error::{RenderError, Result};

/// Optional adapter capabilities detected at device creation.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// `Rgba32Float` may be sampled with a filtering sampler.
    pub float32_filterable: bool,
    pub min_uniform_buffer_offset_alignment: u32,
    pub max_storage_buffer_binding_size: u32,
}

/// Device, queue and capabilities, passed explicitly to everything that
/// creates or records GPU work.
pub struct GraphicsContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub capabilities: Capabilities,
}

impl GraphicsContext {
    pub fn create_instance() -> wgpu::Instance {
        wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        })
    }

    /// Device without a presentation surface (tests, offline rendering).
    pub async fn new_headless() -> Result<Self> {
        let instance = Self::create_instance();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RenderError::AdapterUnavailable)?;
        Self::from_adapter(instance, adapter).await
    }

    pub async fn for_surface(
        instance: wgpu::Instance,
        surface: &wgpu::Surface<'_>,
    ) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(surface),
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| RenderError::AdapterUnavailable)?;
        Self::from_adapter(instance, adapter).await
    }

    async fn from_adapter(instance: wgpu::Instance, adapter: wgpu::Adapter) -> Result<Self> {
        let info = adapter.get_info();
        log::info!("Using adapter: {} ({:?})", info.name, info.backend);

        let adapter_features = adapter.features();
        let adapter_limits = adapter.limits();

        let mut required_features = wgpu::Features::empty();
        let float32_filterable = adapter_features.contains(wgpu::Features::FLOAT32_FILTERABLE);
        if float32_filterable {
            required_features |= wgpu::Features::FLOAT32_FILTERABLE;
        } else {
            log::warn!("FLOAT32_FILTERABLE not supported; full precision shadows disabled");
        }

        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            max_storage_buffers_per_shader_stage: adapter_limits
                .max_storage_buffers_per_shader_stage
                .min(16),
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("GILibDevice"),
                required_features,
                required_limits: limits.clone(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|err| RenderError::DeviceRequest(err.to_string()))?;

        let capabilities = Capabilities {
            float32_filterable,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
        };
        log::info!("Device capabilities: {:?}", capabilities);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            capabilities,
        })
    }

    /// Block until all submitted work has completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|err| RenderError::ReadbackFailed(err.to_string()))
    }
}
