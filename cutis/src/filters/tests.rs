use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use glam::Mat3;
use parking_lot::Mutex;

use super::*;
use crate::common::PlaneFormat;
use crate::image::{Image, ImageDesc};
use crate::processing_context::{ImageBuffer, ProcessingContext};

// -------------------------------------------------------------------------
// Broadcast mechanics (no GPU required)
// -------------------------------------------------------------------------

struct RecordingSink {
    applied: Mutex<Vec<i32>>,
}

impl ParamSink<i32> for RecordingSink {
    fn apply(&self, params: &i32) {
        self.applied.lock().push(*params);
    }
}

#[test]
fn set_params_broadcasts_to_all_registered_sinks() {
    let core = FilterCore::new("test", 0i32);

    let first = Arc::new(RecordingSink {
        applied: Mutex::new(Vec::new()),
    });
    let second = Arc::new(RecordingSink {
        applied: Mutex::new(Vec::new()),
    });

    let binding_a = WorkerBinding::bind(core.clone(), first.clone());
    let binding_b = WorkerBinding::bind(core.clone(), second.clone());

    core.set_params(7);
    core.set_params(9);

    // Each sink saw the initial value at bind time plus both updates.
    assert_eq!(*first.applied.lock(), vec![0, 7, 9]);
    assert_eq!(*second.applied.lock(), vec![0, 7, 9]);

    drop(binding_a);
    core.set_params(11);
    assert_eq!(*first.applied.lock(), vec![0, 7, 9]);
    assert_eq!(*second.applied.lock(), vec![0, 7, 9, 11]);

    drop(binding_b);
    assert_eq!(core.live_sink_count(), 0);
}

#[test]
fn dropping_worker_unregisters_it() {
    let core = FilterCore::new("test", 0i32);
    let sink = Arc::new(RecordingSink {
        applied: Mutex::new(Vec::new()),
    });

    let binding = WorkerBinding::bind(core.clone(), sink.clone());
    assert_eq!(core.live_sink_count(), 1);

    drop(binding);
    assert_eq!(core.live_sink_count(), 0);
}

// -------------------------------------------------------------------------
// Chain composition (host-side mock filters)
// -------------------------------------------------------------------------

/// Adds a constant to every element; enough to observe composition order
/// and the enabled-subset rule without a device.
struct AddConstFilter {
    value: f32,
    enabled: AtomicBool,
    runs: Arc<AtomicUsize>,
}

impl AddConstFilter {
    fn new(value: f32) -> Arc<Self> {
        Arc::new(Self {
            value,
            enabled: AtomicBool::new(true),
            runs: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Filter for AddConstFilter {
    fn name(&self) -> &str {
        "add_const"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn create_worker(&self, _ctx: &mut ProcessingContext) -> crate::common::Result<Box<dyn FilterWorker>> {
        Ok(Box::new(AddConstWorker {
            value: self.value,
            runs: self.runs.clone(),
        }))
    }
}

struct AddConstWorker {
    value: f32,
    runs: Arc<AtomicUsize>,
}

impl FilterWorker for AddConstWorker {
    fn run(
        &mut self,
        ctx: &ProcessingContext,
        input: &ImageBuffer,
        output: &mut ImageBuffer,
    ) -> crate::common::Result<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);

        let src = input.make_cpu(ctx)?;
        let mut dst = output.make_cpu_mut(ctx)?;

        let src_px = src.pixels::<f32>();
        for (out, &v) in dst.pixels_mut::<f32>().iter_mut().zip(src_px) {
            *out = v + self.value;
        }
        Ok(())
    }
}

fn gradient_buffer(desc: ImageDesc) -> ImageBuffer {
    let mut img = Image::new_empty(desc).unwrap();
    for (i, px) in img.pixels_mut::<f32>().iter_mut().enumerate() {
        *px = i as f32 * 0.25;
    }
    ImageBuffer::from_cpu(img)
}

#[test]
fn zero_enabled_filters_copy_input_verbatim() {
    let ctx = ProcessingContext::cpu_only();
    let desc = ImageDesc::new(8, 8, PlaneFormat::GRAY_F32);

    let filter = AddConstFilter::new(1.0);
    filter.set_enabled(false);

    let chain = FilterChain::new(vec![filter.clone() as Arc<dyn Filter>]);
    let mut worker = chain.create_worker(&mut ProcessingContext::cpu_only()).unwrap();

    let input = gradient_buffer(desc);
    let mut output = ImageBuffer::new_empty(desc);

    worker.run(&ctx, &input, &mut output).unwrap();

    let input_cpu = input.make_cpu(&ctx).unwrap();
    let output_cpu = output.make_cpu(&ctx).unwrap();
    assert_eq!(input_cpu.bytes(), output_cpu.bytes());
    assert_eq!(filter.runs.load(Ordering::Relaxed), 0);
}

#[test]
fn chain_runs_only_the_enabled_subset_in_insertion_order() {
    let ctx = ProcessingContext::cpu_only();
    let desc = ImageDesc::new(8, 8, PlaneFormat::GRAY_F32);

    let first = AddConstFilter::new(1.0);
    let second = AddConstFilter::new(2.0);
    let third = AddConstFilter::new(4.0);
    second.set_enabled(false);

    let chain = FilterChain::new(vec![
        first.clone() as Arc<dyn Filter>,
        second.clone() as Arc<dyn Filter>,
        third.clone() as Arc<dyn Filter>,
    ]);
    let mut worker = chain.create_worker(&mut ProcessingContext::cpu_only()).unwrap();

    let input = gradient_buffer(desc);
    let mut output = ImageBuffer::new_empty(desc);

    worker.run(&ctx, &input, &mut output).unwrap();

    let input_cpu = input.make_cpu(&ctx).unwrap();
    let output_cpu = output.make_cpu(&ctx).unwrap();
    for (out, inp) in output_cpu
        .pixels::<f32>()
        .iter()
        .zip(input_cpu.pixels::<f32>())
    {
        assert_eq!(*out, inp + 5.0);
    }

    assert_eq!(first.runs.load(Ordering::Relaxed), 1);
    assert_eq!(second.runs.load(Ordering::Relaxed), 0);
    assert_eq!(third.runs.load(Ordering::Relaxed), 1);
}

#[test]
fn chain_with_many_stages_matches_sequential_composition() {
    let ctx = ProcessingContext::cpu_only();
    let desc = ImageDesc::new(4, 4, PlaneFormat::GRAY_F32);

    let values = [1.0, 2.0, 4.0, 8.0, 16.0];
    let filters: Vec<Arc<dyn Filter>> = values
        .iter()
        .map(|&v| AddConstFilter::new(v) as Arc<dyn Filter>)
        .collect();

    let chain = FilterChain::new(filters);
    let mut worker = chain.create_worker(&mut ProcessingContext::cpu_only()).unwrap();

    let input = gradient_buffer(desc);
    let mut output = ImageBuffer::new_empty(desc);

    worker.run(&ctx, &input, &mut output).unwrap();

    let expected: f32 = values.iter().sum();
    let input_cpu = input.make_cpu(&ctx).unwrap();
    let output_cpu = output.make_cpu(&ctx).unwrap();
    for (out, inp) in output_cpu
        .pixels::<f32>()
        .iter()
        .zip(input_cpu.pixels::<f32>())
    {
        assert_eq!(*out, inp + expected);
    }
}

// -------------------------------------------------------------------------
// GPU filter semantics (skipped without an adapter)
// -------------------------------------------------------------------------

fn gpu_context() -> Option<ProcessingContext> {
    let ctx = ProcessingContext::new();
    if ctx.has_gpu() {
        Some(ctx)
    } else {
        eprintln!("Skipping test - no GPU available");
        None
    }
}

fn rgb_test_image(width: u32, height: u32) -> Image {
    let desc = ImageDesc::new(width, height, PlaneFormat::RGB_F32);
    let mut img = Image::new_empty(desc).unwrap();
    for (i, px) in img.pixels_mut::<f32>().iter_mut().enumerate() {
        *px = ((i * 37) % 256) as f32 / 255.0;
    }
    img
}

fn run_single(
    ctx: &mut ProcessingContext,
    filter: &dyn Filter,
    input: &Image,
) -> crate::common::Result<Image> {
    let mut worker = filter.create_worker(ctx)?;

    let input_buffer = ImageBuffer::from_cpu(input.clone());
    let mut output_buffer = ImageBuffer::new_empty(*input.desc());

    worker.run(ctx, &input_buffer, &mut output_buffer)?;
    output_buffer.to_cpu(ctx)
}

#[test]
fn barrel_factor_zero_is_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(31, 23);
    let filter = BarrelFilter::new();
    filter.set_factor(0);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn barrel_nonzero_factor_changes_the_image() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(32, 32);
    let filter = BarrelFilter::new();
    filter.set_factor(50);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_ne!(output.bytes(), input.bytes());
}

#[test]
fn crop_zero_margins_is_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(40, 30);
    let filter = CropFilter::new(40, 30);
    filter.set_margins(0, 0, 0, 0);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn transformation_identity_matrix_is_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(24, 24);
    let filter = TransformationFilter::new();
    filter.set_matrix(Mat3::IDENTITY);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn color_adjust_neutral_settings_are_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(16, 16);
    let filter = ColorAdjustFilter::new();
    filter.set_brightness(0);
    filter.set_contrast(0);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn white_calibration_unit_gains_are_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(16, 16);
    let filter = WhiteCalibrationFilter::new();
    filter.set_gains([1.0, 1.0, 1.0]);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn smoothing_preserves_a_constant_image() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let desc = ImageDesc::new(16, 16, PlaneFormat::RGB_F32);
    let mut input = Image::new_empty(desc).unwrap();
    input.pixels_mut::<f32>().fill(0.5);

    let filter = SmoothingFilter::new();
    filter.set_radius(3);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    for &v in output.pixels::<f32>() {
        assert!((v - 0.5).abs() < 1e-5, "got {}", v);
    }
}

#[test]
fn sharpening_zero_amount_is_bit_identical() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(16, 16);
    let filter = SharpeningFilter::new();
    filter.set_amount(0.0);
    filter.set_threshold(0.0);

    let output = run_single(&mut ctx, &filter, &input).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn average_of_identical_frames_is_the_frame() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(16, 16);
    let filter = AverageFilter::new();
    filter.set_sample_count(4);

    let mut worker = filter.create_worker(&mut ctx).unwrap();
    let input_buffer = ImageBuffer::from_cpu(input.clone());
    let mut output_buffer = ImageBuffer::new_empty(*input.desc());

    for _ in 0..4 {
        worker.run(&ctx, &input_buffer, &mut output_buffer).unwrap();
    }

    let output = output_buffer.make_cpu(&ctx).unwrap();
    assert_eq!(output.bytes(), input.bytes());
}

#[test]
fn average_refills_after_sample_count_change() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let desc = ImageDesc::new(8, 8, PlaneFormat::RGB_F32);
    let mut first = Image::new_empty(desc).unwrap();
    first.pixels_mut::<f32>().fill(0.25);
    let mut second = Image::new_empty(desc).unwrap();
    second.pixels_mut::<f32>().fill(0.75);

    let filter = AverageFilter::new();
    filter.set_sample_count(2);

    let mut worker = filter.create_worker(&mut ctx).unwrap();
    let first_buffer = ImageBuffer::from_cpu(first);
    let second_buffer = ImageBuffer::from_cpu(second.clone());
    let mut output_buffer = ImageBuffer::new_empty(desc);

    worker.run(&ctx, &first_buffer, &mut output_buffer).unwrap();
    worker.run(&ctx, &first_buffer, &mut output_buffer).unwrap();

    // Count change: every slot must take the next incoming frame, so the
    // very next output equals that frame with no trace of the old samples.
    filter.set_sample_count(4);
    worker.run(&ctx, &second_buffer, &mut output_buffer).unwrap();

    let output = output_buffer.make_cpu(&ctx).unwrap();
    assert_eq!(output.bytes(), second.bytes());
}

#[test]
fn gpu_chain_matches_single_filter_composition() {
    let Some(mut ctx) = gpu_context() else {
        return;
    };

    let input = rgb_test_image(32, 24);

    let color = Arc::new(ColorAdjustFilter::new());
    color.set_brightness(10);
    let white = Arc::new(WhiteCalibrationFilter::new());
    white.set_gains([1.1, 1.0, 0.9]);

    // Chain output...
    let chain = FilterChain::new(vec![
        color.clone() as Arc<dyn Filter>,
        white.clone() as Arc<dyn Filter>,
    ]);
    let mut chain_worker = chain.create_worker(&mut ctx).unwrap();
    let input_buffer = ImageBuffer::from_cpu(input.clone());
    let mut chain_output = ImageBuffer::new_empty(*input.desc());
    chain_worker
        .run(&ctx, &input_buffer, &mut chain_output)
        .unwrap();

    // ...must equal the sequential composition of the two filters.
    let after_color = run_single(&mut ctx, color.as_ref(), &input).unwrap();
    let expected = run_single(&mut ctx, white.as_ref(), &after_color).unwrap();

    let chain_cpu = chain_output.to_cpu(&ctx).unwrap();
    assert_eq!(chain_cpu.bytes(), expected.bytes());
}
