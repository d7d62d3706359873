use common::parallel::{try_for_each_row, RowTaskFailure};
use wgpu::util::DeviceExt;

use super::{padded_size, Gpu};
use crate::common::Result;
use crate::image::{Image, ImageDesc};

/// Allocation flags for device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferAccess {
    /// Kernels read, host uploads.
    ReadOnly,
    /// Kernels write, host downloads.
    WriteOnly,
    /// Kernels read and write.
    #[default]
    ReadWrite,
    /// Like `ReadWrite`, plus the buffer may be mapped for host access.
    HostMappable,
}

impl BufferAccess {
    fn usages(self) -> wgpu::BufferUsages {
        match self {
            BufferAccess::ReadOnly => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            BufferAccess::WriteOnly => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            BufferAccess::ReadWrite | BufferAccess::HostMappable => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
        }
    }

    fn mappable(self) -> bool {
        matches!(self, BufferAccess::ReadWrite | BufferAccess::HostMappable)
    }
}

/// Wrapper for read-only buffer access.
#[derive(Debug)]
pub struct ReadBuffer<'a>(pub(crate) &'a wgpu::Buffer);

impl ReadBuffer<'_> {
    /// Returns the entire buffer as a binding resource.
    pub fn as_entire_binding(&self) -> wgpu::BindingResource<'_> {
        self.0.as_entire_binding()
    }

    /// Returns a reference to the underlying buffer for copy sources.
    pub fn buffer(&self) -> &wgpu::Buffer {
        self.0
    }
}

/// Wrapper for writable buffer access.
#[derive(Debug)]
pub struct WriteBuffer<'a>(pub(crate) &'a wgpu::Buffer);

impl WriteBuffer<'_> {
    /// Returns the entire buffer as a binding resource.
    pub fn as_entire_binding(&self) -> wgpu::BindingResource<'_> {
        self.0.as_entire_binding()
    }

    /// Returns a reference to the underlying buffer for queue operations.
    pub fn buffer(&self) -> &wgpu::Buffer {
        self.0
    }
}

/// Image data stored on the device as an opaque storage buffer.
///
/// All transfers go through the serialized gateway. While the buffer is
/// mapped for host access it must not be the source or target of any
/// device-side command; that misuse is a programming error and asserts.
#[derive(Debug)]
pub struct GpuImage {
    buffer: wgpu::Buffer,
    desc: ImageDesc,
    access: BufferAccess,
    /// Host staging region; `Some` exactly while the buffer is mapped.
    staging: Option<Vec<u8>>,
}

impl GpuImage {
    /// Creates a new device image from host image data.
    pub fn from_image(gpu: &Gpu, image: &Image) -> Self {
        let desc = *image.desc();
        let logical = desc.size_in_bytes();
        let padded = padded_size(logical) as usize;

        let buffer = if padded == logical {
            gpu.device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("gpu_image_buffer"),
                    contents: image.bytes(),
                    usage: BufferAccess::ReadWrite.usages(),
                })
        } else {
            let mut bytes = vec![0u8; padded];
            bytes[..logical].copy_from_slice(image.bytes());
            gpu.device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("gpu_image_buffer"),
                    contents: &bytes,
                    usage: BufferAccess::ReadWrite.usages(),
                })
        };

        Self {
            buffer,
            desc,
            access: BufferAccess::ReadWrite,
            staging: None,
        }
    }

    /// Creates an empty device image with the given descriptor and flags.
    pub fn new_empty(gpu: &Gpu, desc: ImageDesc, access: BufferAccess) -> Self {
        let buffer = gpu.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_image_buffer"),
            size: padded_size(desc.size_in_bytes()),
            usage: access.usages(),
            mapped_at_creation: false,
        });

        Self {
            buffer,
            desc,
            access,
            staging: None,
        }
    }

    /// Returns the image descriptor.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn access(&self) -> BufferAccess {
        self.access
    }

    pub fn is_mapped(&self) -> bool {
        self.staging.is_some()
    }

    /// Downloads the device image to a host image. Blocking.
    pub fn to_image(&self, gpu: &Gpu) -> Result<Image> {
        assert!(!self.is_mapped(), "cannot read a mapped buffer");

        let logical = self.desc.size_in_bytes();
        let mut bytes = gpu.read_buffer(&self.buffer, padded_size(logical))?;
        bytes.truncate(logical);

        Image::new_with_data(self.desc, bytes)
    }

    /// Downloads the device image into an existing host image of the same
    /// descriptor, avoiding a fresh allocation. Blocking.
    pub fn read_into(&self, gpu: &Gpu, target: &mut Image) -> Result<()> {
        assert!(!self.is_mapped(), "cannot read a mapped buffer");
        assert_eq!(&self.desc, target.desc(), "descriptor mismatch");

        let logical = self.desc.size_in_bytes();
        let bytes = gpu.read_buffer(&self.buffer, padded_size(logical))?;
        target.bytes_mut().copy_from_slice(&bytes[..logical]);
        Ok(())
    }

    /// Uploads host image data into this device image. Blocking.
    pub fn write_from(&mut self, gpu: &Gpu, image: &Image) -> Result<()> {
        assert!(!self.is_mapped(), "cannot write a mapped buffer");
        assert_eq!(&self.desc, image.desc(), "descriptor mismatch");

        let logical = self.desc.size_in_bytes();
        let padded = padded_size(logical) as usize;
        if padded == logical {
            gpu.write_buffer(&self.buffer, 0, image.bytes())
        } else {
            let mut bytes = vec![0u8; padded];
            bytes[..logical].copy_from_slice(image.bytes());
            gpu.write_buffer(&self.buffer, 0, &bytes)
        }
    }

    /// Device-side copy from another image of the same descriptor. Blocking.
    pub fn copy_from(&mut self, gpu: &Gpu, src: &GpuImage) -> Result<()> {
        assert!(
            !self.is_mapped() && !src.is_mapped(),
            "cannot copy a mapped buffer"
        );
        assert_eq!(self.desc, src.desc, "descriptor mismatch");

        gpu.copy_buffer(
            &src.buffer,
            &self.buffer,
            padded_size(self.desc.size_in_bytes()),
        )
    }

    /// Creates a copy of this image with freshly allocated device storage.
    ///
    /// Plain struct moves never duplicate device storage; this is the
    /// explicit way to get an independent copy.
    pub fn clone_buffer(&self, gpu: &Gpu) -> Result<Self> {
        let mut clone = GpuImage::new_empty(gpu, self.desc, self.access);
        clone.copy_from(gpu, self)?;
        Ok(clone)
    }

    /// Maps the buffer for host access, returning the host-addressable bytes.
    ///
    /// The contents are downloaded into an internal staging region; writes
    /// land on the device at [`GpuImage::unmap`]. Mapping an already-mapped
    /// buffer is a programming error.
    pub fn map(&mut self, gpu: &Gpu) -> Result<&mut [u8]> {
        assert!(!self.is_mapped(), "buffer is already mapped");
        assert!(
            self.access.mappable(),
            "buffer was not allocated host-mappable"
        );

        let logical = self.desc.size_in_bytes();
        let mut bytes = gpu.read_buffer(&self.buffer, padded_size(logical))?;
        bytes.truncate(logical);

        Ok(self.staging.insert(bytes).as_mut_slice())
    }

    /// Unmaps the buffer, uploading staged host writes back to the device.
    ///
    /// Unmapping a buffer that is not mapped is a programming error.
    pub fn unmap(&mut self, gpu: &Gpu) -> Result<()> {
        let staging = self.staging.take().expect("buffer is not mapped");

        let logical = self.desc.size_in_bytes();
        let padded = padded_size(logical) as usize;
        if padded == logical {
            gpu.write_buffer(&self.buffer, 0, &staging)
        } else {
            let mut bytes = vec![0u8; padded];
            bytes[..logical].copy_from_slice(&staging);
            gpu.write_buffer(&self.buffer, 0, &bytes)
        }
    }

    /// Row-parallel host traversal of the device image.
    ///
    /// Maps the buffer, splits rows across worker threads pulling from a
    /// shared atomic cursor, then unmaps before any worker failure is
    /// reported, so a failed task can never leave the buffer mapped.
    pub fn for_each_row<F>(&mut self, gpu: &Gpu, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [u8]) -> Result<()> + Sync,
    {
        let row_bytes = self.desc.row_bytes();

        self.map(gpu)?;
        let staging = self.staging.as_mut().expect("mapped above");
        let outcome = try_for_each_row(staging, row_bytes, &f);
        self.unmap(gpu)?;

        outcome.map_err(RowTaskFailure::into_error)
    }

    /// Returns a read-only buffer wrapper for binding in kernels.
    pub fn read_buffer(&self) -> ReadBuffer<'_> {
        assert!(!self.is_mapped(), "cannot bind a mapped buffer");
        ReadBuffer(&self.buffer)
    }

    /// Returns a writable buffer wrapper for binding in kernels.
    ///
    /// Note: `&mut self` is intentional to prevent accidental writes to
    /// non-mutable buffers.
    pub fn write_buffer(&mut self) -> WriteBuffer<'_> {
        assert!(!self.is_mapped(), "cannot bind a mapped buffer");
        WriteBuffer(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PlaneFormat;

    fn test_gpu() -> Option<Gpu> {
        match Gpu::new() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                eprintln!("Skipping test - no GPU available: {}", e);
                None
            }
        }
    }

    fn gradient_image(width: u32, height: u32) -> Image {
        let desc = ImageDesc::new(width, height, PlaneFormat::GRAY_F32);
        let mut img = Image::new_empty(desc).unwrap();
        for (i, px) in img.pixels_mut::<f32>().iter_mut().enumerate() {
            *px = i as f32;
        }
        img
    }

    #[test]
    fn upload_download_roundtrip() {
        let Some(gpu) = test_gpu() else {
            return;
        };

        let image = gradient_image(61, 38);
        let gpu_image = GpuImage::from_image(&gpu, &image);
        let result = gpu_image.to_image(&gpu).unwrap();

        assert_eq!(result.desc(), image.desc());
        assert_eq!(result.bytes(), image.bytes());
    }

    #[test]
    fn device_copy_duplicates_contents() {
        let Some(gpu) = test_gpu() else {
            return;
        };

        let image = gradient_image(16, 16);
        let src = GpuImage::from_image(&gpu, &image);
        let clone = src.clone_buffer(&gpu).unwrap();

        assert_eq!(clone.to_image(&gpu).unwrap().bytes(), image.bytes());
    }

    #[test]
    fn map_unmap_writes_back() {
        let Some(gpu) = test_gpu() else {
            return;
        };

        let desc = ImageDesc::new(8, 8, PlaneFormat::GRAY_F32);
        let mut gpu_image = GpuImage::new_empty(&gpu, desc, BufferAccess::HostMappable);

        let bytes = gpu_image.map(&gpu).unwrap();
        bytes.fill(0x7f);
        gpu_image.unmap(&gpu).unwrap();

        let result = gpu_image.to_image(&gpu).unwrap();
        assert!(result.bytes().iter().all(|&b| b == 0x7f));
    }

    #[test]
    fn for_each_row_unmaps_on_failure() {
        let Some(gpu) = test_gpu() else {
            return;
        };

        let desc = ImageDesc::new(4, 4, PlaneFormat::GRAY_F32);
        let mut gpu_image = GpuImage::new_empty(&gpu, desc, BufferAccess::HostMappable);

        let result = gpu_image.for_each_row(&gpu, |y, _row| {
            if y == 2 {
                Err(crate::common::Error::InvalidPlaneFormat("forced".into()))
            } else {
                Ok(())
            }
        });

        assert!(result.is_err());
        assert!(!gpu_image.is_mapped());
    }

    #[test]
    fn double_map_panics() {
        let Some(gpu) = test_gpu() else {
            return;
        };

        let desc = ImageDesc::new(4, 4, PlaneFormat::GRAY_F32);
        let mut gpu_image = GpuImage::new_empty(&gpu, desc, BufferAccess::HostMappable);

        gpu_image.map(&gpu).unwrap();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = gpu_image.map(&gpu);
        }));
        assert!(panicked.is_err());
    }
}
