use std::marker::PhantomData;
use std::mem;
use std::num::NonZeroU64;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};

use crate::error::{RenderError, Result};
use crate::renderer::GraphicsContext;

/// CPU side contents of a GPU buffer with write-discard lock semantics.
///
/// `lock` hands out a zeroed slice (previous contents are discarded),
/// `unlock` ends the write window. A second `lock` before `unlock` is an
/// error, and a buffer that was never locked has nothing to upload.
#[derive(Debug)]
pub struct Staging<T: Pod> {
    label: String,
    data: Vec<T>,
    locked: bool,
    dirty: bool,
}

impl<T: Pod> Staging<T> {
    pub fn new(label: impl Into<String>, len: usize) -> Self {
        Self {
            label: label.into(),
            data: vec![T::zeroed(); len.max(1)],
            locked: false,
            dirty: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn lock(&mut self) -> Result<&mut [T]> {
        if self.locked {
            return Err(RenderError::BufferAlreadyLocked(self.label.clone()));
        }
        self.locked = true;
        self.dirty = true;
        self.data.fill(T::zeroed());
        Ok(&mut self.data)
    }

    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(RenderError::BufferNotLocked(self.label.clone()));
        }
        self.locked = false;
        Ok(())
    }

    /// Contents to upload, or `None` when nothing was written since the last
    /// commit. Committing inside a lock window is an error.
    pub fn take_upload(&mut self) -> Result<Option<&[T]>> {
        if self.locked {
            return Err(RenderError::BufferAlreadyLocked(self.label.clone()));
        }
        if !self.dirty {
            return Ok(None);
        }
        self.dirty = false;
        Ok(Some(&self.data))
    }
}

/// Typed GPU buffer written through a [`Staging`] copy: a constant buffer
/// when created with [`StructuredBuffer::constant`], a read-only structured
/// array when created with [`StructuredBuffer::array`].
pub struct StructuredBuffer<T: Pod> {
    buffer: wgpu::Buffer,
    staging: Staging<T>,
}

impl<T: Pod> StructuredBuffer<T> {
    pub fn constant(device: &wgpu::Device, label: &str) -> Self {
        Self::with_usage(device, label, 1, wgpu::BufferUsages::UNIFORM)
    }

    pub fn array(device: &wgpu::Device, label: &str, capacity: usize) -> Self {
        Self::with_usage(device, label, capacity, wgpu::BufferUsages::STORAGE)
    }

    fn with_usage(
        device: &wgpu::Device,
        label: &str,
        len: usize,
        usage: wgpu::BufferUsages,
    ) -> Self {
        let staging = Staging::new(label, len);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (staging.len() * mem::size_of::<T>()) as u64,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self { buffer, staging }
    }

    pub fn capacity(&self) -> usize {
        self.staging.len()
    }

    pub fn lock(&mut self) -> Result<&mut [T]> {
        self.staging.lock()
    }

    /// Lock a constant buffer and return its single element.
    pub fn lock_one(&mut self) -> Result<&mut T> {
        let slice = self.staging.lock()?;
        Ok(&mut slice[0])
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.staging.unlock()
    }

    /// Upload the staged contents. Returns whether an upload happened.
    pub fn commit(&mut self, queue: &wgpu::Queue) -> Result<bool> {
        match self.staging.take_upload()? {
            Some(data) => {
                queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lock, write every element with `fill`, unlock and commit.
    pub fn write_with(
        &mut self,
        queue: &wgpu::Queue,
        fill: impl FnOnce(&mut [T]),
    ) -> Result<()> {
        fill(self.lock()?);
        self.unlock()?;
        self.commit(queue)?;
        Ok(())
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }
}

/// GPU written array with a system memory copy for random access reads.
///
/// [`ScratchArray::refresh`] copies the GPU contents to a mappable staging
/// buffer and blocks until the copy is visible, so it stalls the pipeline.
pub struct ScratchArray<T: Pod> {
    label: String,
    buffer: wgpu::Buffer,
    readback: wgpu::Buffer,
    system: Vec<T>,
}

impl<T: Pod> ScratchArray<T> {
    pub fn new(device: &wgpu::Device, label: &str, len: usize) -> Self {
        let size = (len.max(1) * mem::size_of::<T>()) as u64;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}Readback")),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            label: label.to_owned(),
            buffer,
            readback,
            system: vec![T::zeroed(); len.max(1)],
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    pub fn clear(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.buffer, 0, None);
    }

    /// Copy the GPU contents into system memory. Work recorded in `encoder`
    /// is submitted first so the copy observes it.
    pub fn refresh(&mut self, ctx: &GraphicsContext, mut encoder: wgpu::CommandEncoder) -> Result<()> {
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &self.readback, 0, self.buffer.size());
        ctx.queue.submit(Some(encoder.finish()));

        let slice = self.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.wait_idle()?;

        rx.recv()
            .map_err(|err| RenderError::ReadbackFailed(format!("{}: {err}", self.label)))?
            .map_err(|err| RenderError::ReadbackFailed(format!("{}: {err}", self.label)))?;

        {
            let view = slice.get_mapped_range();
            self.system.copy_from_slice(bytemuck::cast_slice(&view[..]));
        }
        self.readback.unmap();
        Ok(())
    }

    pub fn element_at(&self, index: usize) -> Option<&T> {
        self.system.get(index)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.system
    }
}

/// Round `size` up to a multiple of `alignment`.
pub fn aligned_stride(size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    size.div_ceil(alignment) * alignment
}

/// Uniform buffer holding many `T`s addressed with dynamic offsets, one entry
/// per draw. Entries pushed during a frame keep distinct offsets until
/// [`DynamicUniforms::clear`].
pub struct DynamicUniforms<T: Pod> {
    label: String,
    buffer: wgpu::Buffer,
    stride: u64,
    capacity: u32,
    generation: u64,
    scratch: Vec<u8>,
    count: u32,
    _marker: PhantomData<T>,
}

impl<T: Pod> DynamicUniforms<T> {
    pub fn new(ctx: &GraphicsContext, label: &str, capacity: u32) -> Self {
        let stride = aligned_stride(
            mem::size_of::<T>() as u64,
            ctx.capabilities.min_uniform_buffer_offset_alignment as u64,
        );
        let capacity = capacity.max(1);
        Self {
            label: label.to_owned(),
            buffer: Self::create_buffer(&ctx.device, label, stride, capacity),
            stride,
            capacity,
            generation: 0,
            scratch: Vec::new(),
            count: 0,
            _marker: PhantomData,
        }
    }

    fn create_buffer(device: &wgpu::Device, label: &str, stride: u64, capacity: u32) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub fn clear(&mut self) {
        self.scratch.clear();
        self.count = 0;
    }

    /// Stage a value and return its dynamic offset.
    pub fn push(&mut self, value: T) -> u32 {
        let offset = self.count as u64 * self.stride;
        self.scratch.resize(offset as usize, 0);
        self.scratch.extend_from_slice(bytemuck::bytes_of(&value));
        self.count += 1;
        offset as u32
    }

    /// Upload everything staged so far, growing the buffer when needed.
    /// Bind groups must be rebuilt when [`Self::generation`] changes.
    pub fn flush(&mut self, ctx: &GraphicsContext) {
        if self.count > self.capacity {
            let new_capacity = self.count.max(self.capacity * 2);
            log::info!(
                "Growing {} uniform buffer: {} -> {}",
                self.label,
                self.capacity,
                new_capacity
            );
            self.buffer = Self::create_buffer(&ctx.device, &self.label, self.stride, new_capacity);
            self.capacity = new_capacity;
            self.generation += 1;
        }

        if !self.scratch.is_empty() {
            ctx.queue.write_buffer(&self.buffer, 0, &self.scratch);
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.buffer,
            offset: 0,
            size: NonZeroU64::new(mem::size_of::<T>() as u64),
        })
    }

    pub fn layout_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: NonZeroU64::new(mem::size_of::<T>() as u64),
            },
            count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_lock_is_rejected() {
        let mut staging = Staging::<u32>::new("Lights", 4);
        staging.lock().expect("first lock");
        let err = staging.lock().expect_err("second lock must fail");
        assert!(matches!(err, RenderError::BufferAlreadyLocked(label) if label == "Lights"));
    }

    #[test]
    fn unlock_without_lock_is_rejected() {
        let mut staging = Staging::<u32>::new("Params", 1);
        assert!(matches!(
            staging.unlock(),
            Err(RenderError::BufferNotLocked(_))
        ));
    }

    #[test]
    fn lock_discards_previous_contents() {
        let mut staging = Staging::<u32>::new("Array", 3);
        staging.lock().expect("lock").copy_from_slice(&[7, 8, 9]);
        staging.unlock().expect("unlock");
        staging.take_upload().expect("commit");

        let data = staging.lock().expect("relock");
        assert_eq!(data, &[0, 0, 0]);
    }

    #[test]
    fn commit_skips_untouched_buffers() {
        let mut staging = Staging::<f32>::new("Constants", 1);
        assert!(staging.take_upload().expect("commit").is_none());

        staging.lock().expect("lock")[0] = 2.5;
        assert!(staging.take_upload().is_err(), "commit inside lock window");
        staging.unlock().expect("unlock");

        assert_eq!(staging.take_upload().expect("commit"), Some(&[2.5f32][..]));
        assert!(staging.take_upload().expect("commit").is_none());
    }

    #[test]
    fn stride_respects_alignment() {
        assert_eq!(aligned_stride(192, 256), 256);
        assert_eq!(aligned_stride(256, 256), 256);
        assert_eq!(aligned_stride(257, 256), 512);
        assert_eq!(aligned_stride(12, 0), 12);
    }
}
