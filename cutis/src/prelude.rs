// Plane formats
pub use crate::common::{ChannelCount, ChannelSize, ChannelType, PlaneFormat, PIPELINE_FORMATS};

// Error handling
pub use crate::common::{Error, Result};

// Image types
pub use crate::image::{Image, ImageDesc};

// Context and smart buffers
pub use crate::processing_context::{
    GpuContext, GpuPipeline, ImageBuffer, ProcessingContext, Storage,
};

// GPU gateway
pub use crate::gpu::{BufferAccess, Gpu, GpuImage, KernelCache, ReadBuffer, WriteBuffer};

// Filters
pub use crate::filters::{
    AverageFilter, BarrelFilter, ChainWorker, ColorAdjustFilter, CropFilter, Filter, FilterChain,
    FilterWorker, SharpeningFilter, SmoothingFilter, TransformationFilter, WhiteCalibrationFilter,
    MAX_SAMPLE_COUNT, MAX_SMOOTHING_RADIUS, MIN_SAMPLE_COUNT, MIN_SMOOTHING_RADIUS,
};

// Skin classification
pub use crate::skin::{
    normalized_diff, sample_statistics, Classification, SkinClassifier, SkinClassifierWorker,
    SkinMethod, NORMALIZED_DIFF_EPSILON,
};

// Frame pool
pub use crate::frame::{Frame, FrameData, FramePool, FrameWriter};

// Pipeline
pub use crate::pipeline::{
    ErrorListener, FrameListener, FrameSource, Pipeline, PipelineConfig, PlaneSet, ReplaySource,
    MAX_WORKER_THREADS, MIN_WORKER_THREADS,
};
