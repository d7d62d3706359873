use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Device or driver failure, wrapping the backend's message.
    Gpu(String),
    /// Kernel compilation failure, including the backend's build log.
    Kernel { name: String, log: String },
    /// An operation required a GPU but none is available.
    NoGpuContext,
    /// Waiting for the next frame expired before data arrived.
    FrameTimeout,
    /// A buffer or plane did not match the format contract of an operation.
    InvalidPlaneFormat(String),
    /// The pipeline has been closed and no longer accepts work.
    PipelineClosed,
    /// A frame was requested from a source that is not started.
    SourceStopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Gpu(msg) => write!(f, "GPU error: {}", msg),
            Error::Kernel { name, log } => {
                write!(f, "kernel '{}' failed to build: {}", name, log)
            }
            Error::NoGpuContext => write!(f, "GPU context not available"),
            Error::FrameTimeout => write!(f, "timed out waiting for the next frame"),
            Error::InvalidPlaneFormat(msg) => write!(f, "invalid plane format: {}", msg),
            Error::PipelineClosed => write!(f, "pipeline is closed"),
            Error::SourceStopped => write!(f, "frame source is not started"),
        }
    }
}

impl std::error::Error for Error {}

impl From<bytemuck::PodCastError> for Error {
    fn from(e: bytemuck::PodCastError) -> Self {
        Error::InvalidPlaneFormat(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
