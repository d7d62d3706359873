use std::time::{Duration, Instant};

use crate::common::{Error, PlaneFormat, Result};
use crate::image::{Image, ImageDesc};

/// The four raw 16-bit planes of one captured frame.
#[derive(Debug)]
pub struct PlaneSet {
    pub dark: Image,
    pub channel0: Image,
    pub channel1: Image,
    pub channel2: Image,
}

impl PlaneSet {
    pub fn allocate(width: u32, height: u32) -> Result<Self> {
        let desc = ImageDesc::new(width, height, PlaneFormat::GRAY_U16);
        Ok(Self {
            dark: Image::new_empty(desc)?,
            channel0: Image::new_empty(desc)?,
            channel1: Image::new_empty(desc)?,
            channel2: Image::new_empty(desc)?,
        })
    }

    pub fn desc(&self) -> &ImageDesc {
        self.dark.desc()
    }
}

/// Upstream frame-source contract.
///
/// Camera hardware and file replay are interchangeable implementations;
/// `next_frame` blocks until the next frame is captured into the four
/// supplied planes, with an implementation-internal timeout.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    fn min_refresh_rate(&self) -> u32;
    fn max_refresh_rate(&self) -> u32;
    fn refresh_rate(&self) -> u32;
    /// Sets the refresh rate, clamped to the supported range.
    fn set_refresh_rate(&mut self, hz: u32) -> Result<()>;

    fn next_frame(
        &mut self,
        dark: &mut Image,
        channel0: &mut Image,
        channel1: &mut Image,
        channel2: &mut Image,
    ) -> Result<()>;
}

const REPLAY_MIN_RATE: u32 = 1;
const REPLAY_MAX_RATE: u32 = 60;

/// Replays a recorded sequence of plane sets at a configured rate,
/// cycling when it reaches the end.
pub struct ReplaySource {
    frames: Vec<PlaneSet>,
    index: usize,
    rate: u32,
    running: bool,
    last_emit: Option<Instant>,
}

impl ReplaySource {
    pub fn new(frames: Vec<PlaneSet>) -> Self {
        assert!(!frames.is_empty(), "replay source needs at least one frame");
        Self {
            frames,
            index: 0,
            rate: 30,
            running: false,
            last_emit: None,
        }
    }
}

impl FrameSource for ReplaySource {
    fn start(&mut self) -> Result<()> {
        self.running = true;
        self.last_emit = None;
        tracing::info!(frames = self.frames.len(), rate = self.rate, "replay started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        tracing::info!("replay stopped");
        Ok(())
    }

    fn min_refresh_rate(&self) -> u32 {
        REPLAY_MIN_RATE
    }

    fn max_refresh_rate(&self) -> u32 {
        REPLAY_MAX_RATE
    }

    fn refresh_rate(&self) -> u32 {
        self.rate
    }

    fn set_refresh_rate(&mut self, hz: u32) -> Result<()> {
        self.rate = hz.clamp(REPLAY_MIN_RATE, REPLAY_MAX_RATE);
        Ok(())
    }

    fn next_frame(
        &mut self,
        dark: &mut Image,
        channel0: &mut Image,
        channel1: &mut Image,
        channel2: &mut Image,
    ) -> Result<()> {
        if !self.running {
            return Err(Error::SourceStopped);
        }

        // Pace playback to the configured rate.
        let interval = Duration::from_secs_f64(1.0 / self.rate as f64);
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());

        let frame = &self.frames[self.index];
        self.index = (self.index + 1) % self.frames.len();

        for (dst, src) in [
            (dark, &frame.dark),
            (channel0, &frame.channel0),
            (channel1, &frame.channel1),
            (channel2, &frame.channel2),
        ] {
            if dst.desc() != src.desc() {
                return Err(Error::InvalidPlaneFormat(format!(
                    "replay plane is {}x{}, destination is {}x{}",
                    src.desc().width,
                    src.desc().height,
                    dst.desc().width,
                    dst.desc().height
                )));
            }
            dst.bytes_mut().copy_from_slice(src.bytes());
        }

        Ok(())
    }
}
