pub(crate) mod error;
pub(crate) mod plane_format;

// Public API
pub use error::{Error, Result};
pub use plane_format::{ChannelCount, ChannelSize, ChannelType, PlaneFormat, PIPELINE_FORMATS};
