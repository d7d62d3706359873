//! Runs the full pipeline against a synthetic replay source and prints the
//! skin ratio of each published frame.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use cutis::prelude::*;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

/// Synthesizes a capture where a centered square region carries a
/// skin-like spectral signature and the rest of the frame does not.
fn synthetic_planes(frame_index: usize) -> Result<PlaneSet> {
    let mut planes = PlaneSet::allocate(WIDTH, HEIGHT)?;

    let dark = 400u16;
    planes.dark.pixels_mut::<u16>().fill(dark);

    let wobble = (frame_index as u16 % 8) * 64;
    for (plane, inside, outside) in [
        (&mut planes.channel0, 24000 + wobble, 30000 + wobble),
        (&mut planes.channel1, 24000 + wobble, 12000),
        (&mut planes.channel2, 24000 + wobble, 6000),
    ] {
        let pixels = plane.pixels_mut::<u16>();
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let in_square = (WIDTH / 4..3 * WIDTH / 4).contains(&x)
                    && (HEIGHT / 4..3 * HEIGHT / 4).contains(&y);
                pixels[(y * WIDTH + x) as usize] =
                    dark + if in_square { inside } else { outside };
            }
        }
    }

    Ok(planes)
}

fn main() -> Result<()> {
    common::setup_logging("info");

    let gpu = Gpu::new()?;

    let frames = (0..8).map(synthetic_planes).collect::<Result<Vec<_>>>()?;
    let mut source = ReplaySource::new(frames);
    source.set_refresh_rate(30)?;

    // A chain with every filter constructed; only a calibrated subset
    // starts enabled.
    let barrel = Arc::new(BarrelFilter::new());
    barrel.set_enabled(false);
    let crop = Arc::new(CropFilter::new(WIDTH, HEIGHT));
    crop.set_enabled(false);
    let average = Arc::new(AverageFilter::new());
    average.set_sample_count(2);
    let smoothing = Arc::new(SmoothingFilter::new());
    smoothing.set_radius(2);
    let sharpening = Arc::new(SharpeningFilter::new());
    sharpening.set_enabled(false);
    let color = Arc::new(ColorAdjustFilter::new());
    color.set_contrast(10);
    let white = Arc::new(WhiteCalibrationFilter::new());
    white.set_enabled(false);
    let transformation = Arc::new(TransformationFilter::new());
    transformation.set_enabled(false);

    let chain = Arc::new(FilterChain::new(vec![
        barrel as Arc<dyn Filter>,
        crop,
        average,
        smoothing,
        sharpening,
        color,
        white,
        transformation,
    ]));

    // Inside the square all three channels match: normalized differences
    // sit at zero, which is where this classifier centers its model.
    let classifier = Arc::new(SkinClassifier::new());
    classifier.set_method(SkinMethod::GaussianThreshold);
    classifier.set_mean([0.0, 0.0, 0.0]);
    classifier.set_variance([0.02, 0.02, 0.02]);
    classifier.set_threshold(0.5);

    let config = PipelineConfig {
        width: WIDTH,
        height: HEIGHT,
        worker_threads: 2,
        frame_timeout: Duration::from_millis(500),
        pool_capacity: 8,
    };

    let mut pipeline = Pipeline::open(
        config,
        gpu,
        Box::new(source),
        chain,
        classifier,
        Box::new(|frame| {
            let data = frame.data();
            println!(
                "frame {:>4}  skin ratio {:.3}",
                data.sequence, data.skin_ratio
            );
        }),
        Box::new(|message| eprintln!("pipeline error: {}", message)),
    )?;

    std::thread::sleep(Duration::from_secs(2));
    pipeline.close();

    Ok(())
}
