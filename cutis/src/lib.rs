mod common;
mod filters;
mod frame;
mod gpu;
mod image;
mod pipeline;
mod processing_context;
mod skin;

pub mod prelude;

pub use prelude::*;
