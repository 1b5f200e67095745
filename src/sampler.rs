//! 1 Hz camera frame sampler
//!
//! On every tick the latest camera frame is downscaled, JPEG-encoded and sent
//! to the open session. Disabling the camera keeps the timer running but makes
//! each tick a no-op.

use crate::media::{DeviceStream, MediaBlob, MediaSink, JPEG_MIME};
use base64::engine::general_purpose;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};
use std::rc::Rc;
use tracing::{debug, trace};

/// Error encoding a sampled frame
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("frame has zero width or height")]
    EmptyFrame,

    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Scale both sides by one factor: `scale`, raised so the shorter side
/// reaches `min_dim`, never above 1.0. `None` for a zero-sized source.
pub fn scaled_dimensions(width: u32, height: u32, scale: f32, min_dim: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let shorter = width.min(height) as f32;
    let factor = scale.max(min_dim as f32 / shorter).min(1.0);
    let side = |source: u32| ((source as f32 * factor).round() as u32).clamp(1, source);
    Some((side(width), side(height)))
}

/// Downscale and JPEG-encode one frame.
pub fn encode_sample(frame: &RgbImage, scale: f32, quality: u8, min_dim: u32) -> Result<MediaBlob, SampleError> {
    let (width, height) =
        scaled_dimensions(frame.width(), frame.height(), scale, min_dim).ok_or(SampleError::EmptyFrame)?;
    let scaled = imageops::resize(frame, width, height, FilterType::Triangle);

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode(scaled.as_raw(), width, height, ExtendedColorType::Rgb8)?;

    Ok(MediaBlob {
        mime_type: JPEG_MIME.to_string(),
        data: general_purpose::STANDARD.encode(&jpeg),
    })
}

/// Mirrored, downscaled RGB copy of a camera frame for the self view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major
    pub pixels: Vec<u8>,
}

/// Shrink `frame` to at most `max_width` wide and flip it horizontally.
pub fn preview_frame(frame: &RgbImage, max_width: u32) -> Option<PreviewFrame> {
    if frame.width() == 0 || frame.height() == 0 || max_width == 0 {
        return None;
    }
    let mirrored = if frame.width() > max_width {
        let height = ((frame.height() as u64 * max_width as u64) / frame.width() as u64).max(1) as u32;
        let mut scaled = imageops::resize(frame, max_width, height, FilterType::Triangle);
        imageops::flip_horizontal_in_place(&mut scaled);
        scaled
    } else {
        imageops::flip_horizontal(frame)
    };
    Some(PreviewFrame {
        width: mirrored.width(),
        height: mirrored.height(),
        pixels: mirrored.into_raw(),
    })
}

/// Periodic camera sampler.
pub struct FrameSampler {
    active: bool,
    scale: f32,
    quality: u8,
    min_dim: u32,
    sink: Option<Rc<dyn MediaSink>>,
    frames_sent: u64,
}

impl FrameSampler {
    pub fn new(scale: f32, quality: u8, min_dim: u32) -> Self {
        Self {
            active: true,
            scale,
            quality,
            min_dim,
            sink: None,
            frames_sent: 0,
        }
    }

    /// Enable or disable output without touching the timer.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn bind(&mut self, sink: Rc<dyn MediaSink>) {
        self.sink = Some(sink);
    }

    pub fn unbind(&mut self) {
        self.sink = None;
    }

    /// Handle one timer tick. Returns whether a frame went out.
    pub fn tick(&mut self, stream: &mut dyn DeviceStream) -> bool {
        if !self.active {
            return false;
        }
        let Some(sink) = &self.sink else {
            return false;
        };
        let Some(frame) = stream.snapshot() else {
            trace!("No camera frame available yet");
            return false;
        };

        let blob = match encode_sample(&frame, self.scale, self.quality, self.min_dim) {
            Ok(blob) => blob,
            Err(e) => {
                debug!("Skipping frame: {}", e);
                return false;
            }
        };
        match sink.send_realtime_input(blob) {
            Ok(()) => {
                self.frames_sent += 1;
                true
            }
            Err(e) => {
                debug!("Dropped video frame: {}", e);
                false
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}
