mod gpu_image;
mod kernel_cache;

use std::sync::Arc;

use parking_lot::Mutex;

pub use self::gpu_image::{BufferAccess, GpuImage, ReadBuffer, WriteBuffer};
pub use self::kernel_cache::KernelCache;

use crate::common::{Error, Result};

/// The compute gateway: a single logical broker for all device-side work.
///
/// Every operation that touches the device (kernel dispatch, buffer
/// read/write/copy, the map/unmap service behind [`GpuImage`]) is blocking
/// and globally serialized by one internal mutex, so at most one device
/// command is in flight at any time across all callers. Construct once at
/// startup and hand clones to every component that needs device access.
#[derive(Debug, Clone)]
pub struct Gpu {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    command_lock: Arc<Mutex<()>>,
}

impl Gpu {
    /// Creates a new GPU context, initializing wgpu with default settings.
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::Gpu(format!("failed to find suitable GPU adapter: {}", e)))?;

        let (device, queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
                .map_err(|e| Error::Gpu(format!("failed to create device: {}", e)))?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            command_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Returns a reference to the wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Returns a reference to the wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Submits a finished encoder and blocks until the device is idle.
    pub fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) -> Result<()> {
        let _serialized = self.command_lock.lock();
        self.queue.submit(std::iter::once(encoder.finish()));
        self.wait_locked()
    }

    /// Blocking buffer upload.
    pub fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0);

        let _serialized = self.command_lock.lock();
        self.queue.write_buffer(buffer, offset, data);
        self.queue.submit(std::iter::empty());
        self.wait_locked()
    }

    /// Blocking buffer download of `size` bytes (must be 4-byte aligned).
    pub fn read_buffer(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        debug_assert!(size % wgpu::COPY_BUFFER_ALIGNMENT == 0);

        let _serialized = self.command_lock.lock();

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gateway_read_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gateway_read_encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.wait_locked()?;

        rx.recv()
            .map_err(|_| Error::Gpu("map callback never fired".to_string()))?
            .map_err(|e| Error::Gpu(format!("buffer map failed: {}", e)))?;

        let data = slice.get_mapped_range();
        let bytes = data.to_vec();
        drop(data);
        staging.unmap();

        Ok(bytes)
    }

    /// Blocking device-side buffer copy.
    pub fn copy_buffer(&self, src: &wgpu::Buffer, dst: &wgpu::Buffer, size: u64) -> Result<()> {
        self.copy_buffer_region(src, 0, dst, 0, size)
    }

    /// Blocking device-side buffer copy between offsets.
    pub fn copy_buffer_region(
        &self,
        src: &wgpu::Buffer,
        src_offset: u64,
        dst: &wgpu::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        debug_assert!(size % wgpu::COPY_BUFFER_ALIGNMENT == 0);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gateway_copy_encoder"),
            });
        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
        self.submit_and_wait(encoder)
    }

    /// Records a single compute pass and blocks until it completes.
    pub fn dispatch(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: (u32, u32, u32),
    ) -> Result<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
        }

        self.submit_and_wait(encoder)
    }

    /// Compiles a compute kernel, reporting build failures with the
    /// backend's validation log.
    pub fn compile_kernel(
        &self,
        name: &str,
        source: &str,
        layout: &wgpu::PipelineLayout,
    ) -> Result<wgpu::ComputePipeline> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Kernel {
                name: name.to_string(),
                log: err.to_string(),
            });
        }

        Ok(pipeline)
    }

    fn wait_locked(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Gpu(format!("device poll failed: {}", e)))?;
        Ok(())
    }
}

/// Rounds a byte count up to the device copy alignment.
pub(crate) fn padded_size(bytes: usize) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    ((bytes + align - 1) / align * align) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_context_creation() {
        let result = Gpu::new();
        if let Err(e) = &result {
            eprintln!(
                "GPU context creation failed (expected on headless systems): {}",
                e
            );
            return;
        }
        let _ctx = result.unwrap();
    }

    #[test]
    fn padded_size_rounds_up() {
        assert_eq!(padded_size(0), 0);
        assert_eq!(padded_size(1), 4);
        assert_eq!(padded_size(4), 4);
        assert_eq!(padded_size(6), 8);
        assert_eq!(padded_size(16), 16);
    }
}
