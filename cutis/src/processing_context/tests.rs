use crate::common::PlaneFormat;
use crate::image::{Image, ImageDesc};
use crate::prelude::*;
use crate::processing_context::{ImageBuffer, ProcessingContext};

fn gradient_rgb(width: u32, height: u32) -> Image {
    let desc = ImageDesc::new(width, height, PlaneFormat::RGB_F32);
    let mut img = Image::new_empty(desc).unwrap();
    for (i, px) in img.pixels_mut::<f32>().iter_mut().enumerate() {
        *px = (i % 97) as f32 / 97.0;
    }
    img
}

#[test]
fn cpu_only_context_has_no_gpu() {
    let ctx = ProcessingContext::cpu_only();
    assert!(!ctx.has_gpu());
    assert!(ctx.gpu().is_none());
    assert!(matches!(ctx.require_gpu(), Err(Error::NoGpuContext)));
}

#[test]
fn empty_buffer_materializes_cpu_storage_on_demand() {
    let ctx = ProcessingContext::cpu_only();
    let desc = ImageDesc::new(8, 8, PlaneFormat::GRAY_F32);

    let buffer = ImageBuffer::new_empty(desc);
    assert!(buffer.is_empty());

    let cpu = buffer.make_cpu(&ctx).unwrap();
    assert_eq!(cpu.desc(), &desc);
    assert!(cpu.bytes().iter().all(|&b| b == 0));
    drop(cpu);
    assert!(buffer.is_cpu());
}

#[test]
fn gpu_unavailable_makes_make_gpu_fail() {
    let ctx = ProcessingContext::cpu_only();
    let buffer = ImageBuffer::from_cpu(gradient_rgb(4, 4));
    assert!(matches!(buffer.make_gpu(&ctx), Err(Error::NoGpuContext)));
}

#[test]
fn buffer_round_trips_through_the_device() {
    let mut ctx = ProcessingContext::new();
    if !ctx.has_gpu() {
        eprintln!("Skipping test - no GPU available");
        return;
    }

    let image = gradient_rgb(31, 17);
    let buffer = ImageBuffer::from_cpu(image.clone());
    assert!(buffer.is_cpu());

    // Migrate to the device and back; contents survive bit-exact.
    buffer.make_gpu(&ctx).unwrap();
    assert!(buffer.is_gpu());

    let cpu = buffer.make_cpu(&ctx).unwrap();
    assert_eq!(cpu.bytes(), image.bytes());
    drop(cpu);
    assert!(buffer.is_cpu());

    // Pipeline cache hands out the same pipeline object across calls.
    let gpu_ctx = ctx.gpu_context().unwrap();
    let first = gpu_ctx
        .get_or_create(crate::filters::GpuRemapPipeline::new)
        .unwrap();
    let second = gpu_ctx
        .get_or_create(crate::filters::GpuRemapPipeline::new)
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}
