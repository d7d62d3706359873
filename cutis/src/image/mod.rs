#[cfg(test)]
mod tests;

use bytemuck::Pod;

use common::parallel::{try_for_each_row, RowTaskFailure};

use crate::common::{Error, PlaneFormat, Result};

/// Dimensions and pixel layout of an image plane.
///
/// Width and height are positive for any live image; only the moved-from
/// (default) state carries zero dimensions.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash, Default)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: PlaneFormat,
}

/// Host-resident image plane: a contiguous, directly addressable byte array.
#[derive(Clone, Debug, Default)]
pub struct Image {
    desc: ImageDesc,
    bytes: Vec<u8>,
}

impl ImageDesc {
    pub fn new(width: u32, height: u32, format: PlaneFormat) -> Self {
        assert!(width > 0 && height > 0, "image dimensions must be positive");
        Self {
            width,
            height,
            format,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes per row. Rows are tightly packed; there is no stride padding.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.byte_count() as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.pixel_count() * self.format.byte_count() as usize
    }
}

impl Image {
    pub fn new_empty(desc: ImageDesc) -> Result<Image> {
        desc.format.validate()?;
        assert!(
            desc.width > 0 && desc.height > 0,
            "image dimensions must be positive"
        );

        let bytes = vec![0; desc.size_in_bytes()];

        Ok(Image { desc, bytes })
    }

    pub fn new_with_data(desc: ImageDesc, bytes: Vec<u8>) -> Result<Image> {
        desc.format.validate()?;

        if bytes.len() != desc.size_in_bytes() {
            return Err(Error::InvalidPlaneFormat(format!(
                "bytes length {} does not match expected size {}",
                bytes.len(),
                desc.size_in_bytes()
            )));
        }

        Ok(Image { desc, bytes })
    }

    /// Returns the image descriptor.
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Returns the image bytes as a slice.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the image bytes as a mutable slice.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn take_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Moves the image out, leaving a zero-dimension, buffer-less plane behind.
    pub fn take(&mut self) -> Image {
        std::mem::take(self)
    }

    /// Typed view of the pixel data.
    pub fn pixels<T: Pod>(&self) -> &[T] {
        bytemuck::cast_slice(&self.bytes)
    }

    /// Typed mutable view of the pixel data.
    pub fn pixels_mut<T: Pod>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(&mut self.bytes)
    }

    /// Visits every row in parallel; see [`common::parallel::try_for_each_row`].
    ///
    /// Rows are claimed by worker threads through a shared atomic cursor, so
    /// each row is visited exactly once, in no particular order.
    pub fn for_each_row<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(usize, &mut [u8]) -> Result<()> + Sync,
    {
        let row_bytes = self.desc.row_bytes();
        try_for_each_row(&mut self.bytes, row_bytes, f).map_err(RowTaskFailure::into_error)
    }
}
