use crate::common::error::{Error, Result};

#[derive(Debug, Hash, PartialEq, Eq, Copy, Clone, Default)]
#[repr(u8)]
pub enum ChannelCount {
    Gray = 1,
    GrayAlpha = 2,
    #[default]
    Rgb = 3,
    Rgba = 4,
}

#[derive(Debug, Hash, PartialEq, Eq, Copy, Clone, Default)]
#[repr(u8)]
pub enum ChannelSize {
    _8bit = 1,
    _16bit = 2,
    #[default]
    _32bit = 4,
}

#[derive(Debug, Hash, PartialEq, Eq, Copy, Clone, Default)]
#[repr(u8)]
pub enum ChannelType {
    UInt,
    #[default]
    Float,
}

/// Pixel layout of an image plane: 1-4 channels of a fixed-size scalar.
#[derive(Clone, Copy, Debug, Hash, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub channel_count: ChannelCount,
    pub channel_size: ChannelSize,
    pub channel_type: ChannelType,
}

impl ChannelCount {
    pub fn channel_count(&self) -> u8 {
        *self as u8
    }
}

impl ChannelSize {
    pub fn byte_count(&self) -> u8 {
        *self as u8
    }
}

/// The formats the pipeline actually moves through its stages.
///
/// Raw camera planes arrive as `GRAY_U16`, the working composite is
/// `RGB_F32`, likelihood maps and masks are `GRAY_F32`.
pub const PIPELINE_FORMATS: &[PlaneFormat] = &[
    PlaneFormat::GRAY_U16,
    PlaneFormat::GRAY_F32,
    PlaneFormat::RGB_F32,
    PlaneFormat::RGBA_F32,
];

impl PlaneFormat {
    pub const GRAY_U16: PlaneFormat = PlaneFormat {
        channel_count: ChannelCount::Gray,
        channel_size: ChannelSize::_16bit,
        channel_type: ChannelType::UInt,
    };
    pub const GRAY_F32: PlaneFormat = PlaneFormat {
        channel_count: ChannelCount::Gray,
        channel_size: ChannelSize::_32bit,
        channel_type: ChannelType::Float,
    };
    pub const RGB_F32: PlaneFormat = PlaneFormat {
        channel_count: ChannelCount::Rgb,
        channel_size: ChannelSize::_32bit,
        channel_type: ChannelType::Float,
    };
    pub const RGBA_F32: PlaneFormat = PlaneFormat {
        channel_count: ChannelCount::Rgba,
        channel_size: ChannelSize::_32bit,
        channel_type: ChannelType::Float,
    };

    /// Bytes per pixel.
    pub fn byte_count(&self) -> u8 {
        self.channel_count.channel_count() * self.channel_size.byte_count()
    }

    pub fn is_float(&self) -> bool {
        self.channel_type == ChannelType::Float
    }

    pub fn is_supported(&self) -> bool {
        PIPELINE_FORMATS.contains(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(Error::InvalidPlaneFormat(format!(
                "{} is not a pipeline format",
                self
            )))
        }
    }
}

impl std::fmt::Display for PlaneFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = match self.channel_count {
            ChannelCount::Gray => "GRAY",
            ChannelCount::GrayAlpha => "GRAY_ALPHA",
            ChannelCount::Rgb => "RGB",
            ChannelCount::Rgba => "RGBA",
        };
        let scalar = match (self.channel_type, self.channel_size) {
            (ChannelType::UInt, ChannelSize::_8bit) => "U8",
            (ChannelType::UInt, ChannelSize::_16bit) => "U16",
            (ChannelType::UInt, ChannelSize::_32bit) => "U32",
            (ChannelType::Float, _) => "F32",
        };
        write!(f, "{}_{}", channels, scalar)
    }
}
