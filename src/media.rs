//! Media boundary
//!
//! Traits for everything the session controller drives but does not own the
//! implementation of: capture/playback hardware and the remote duplex channel.
//! The local PulseAudio/camera backend and the Gemini client implement these;
//! tests substitute in-memory fakes.

use crate::playback::PlaybackUnit;
use image::RgbImage;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// MIME descriptor for outbound microphone audio
pub const PCM_INPUT_MIME: &str = "audio/pcm;rate=16000";
/// MIME descriptor for outbound camera stills
pub const JPEG_MIME: &str = "image/jpeg";

/// One base64-encoded media payload for the remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

impl MediaBlob {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Error when a realtime send cannot be delivered
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("session channel is not open")]
    NotOpen,

    #[error("failed to encode realtime input: {0}")]
    Encode(String),
}

/// Error raised by local media devices
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("camera unavailable: {0}")]
    Camera(String),

    #[error("audio output unavailable: {0}")]
    Output(String),

    #[error("PulseAudio error: {0}")]
    Pulse(String),

    #[error("device resource already released")]
    Released,
}

/// Outbound send capability shared by the capture pipeline and frame sampler.
///
/// Sends are fire-and-forget: a failed send is never queued or retried.
pub trait MediaSink {
    fn send_realtime_input(&self, media: MediaBlob) -> Result<(), SendError>;
}

/// An open duplex session with the remote service.
pub trait SessionHandle: MediaSink {
    fn close(&self) -> Result<(), crate::gemini::LiveError>;
}

/// Inbound notifications from the remote session, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Base64 PCM16, 24 kHz mono; one contiguous playback unit
    Audio(String),
    /// Remote closed the channel, gracefully or not
    Closed(Option<String>),
    /// Transport or protocol failure mid-session
    Error(String),
}

/// Establishes remote sessions.
#[allow(async_fn_in_trait)]
pub trait LiveConnector {
    type Session: SessionHandle + 'static;

    /// Connect and complete the handshake. Inbound events are delivered on
    /// `events` until the session closes.
    async fn connect(
        &mut self,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Self::Session, crate::gemini::LiveError>;
}

/// What the controller asks for when acquiring devices
#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio_sample_rate: u32,
    pub video: bool,
}

/// A block-oriented reader over a microphone track.
pub trait SampleSource: Send {
    /// Wait up to `timeout` for the next block of samples. `Ok(None)` means
    /// nothing arrived in time; `Err(DeviceError::Released)` means the track ended.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, DeviceError>;
}

/// Combined microphone + camera stream exclusively owned by one session.
pub trait DeviceStream {
    /// Open a reader on the audio track.
    fn audio_source(&mut self) -> Result<Box<dyn SampleSource>, DeviceError>;
    /// Latest camera frame, if the video track is live and enabled.
    fn snapshot(&mut self) -> Option<RgbImage>;
    fn set_video_enabled(&mut self, enabled: bool);
    /// Stop every track, releasing the hardware.
    fn stop_tracks(&mut self) -> Result<(), DeviceError>;
}

/// The audio-processing node delivering capture callbacks.
pub trait CaptureNode {
    fn disconnect(&mut self) -> Result<(), DeviceError>;
}

/// Capture-rate audio context.
pub trait InputContext {
    fn sample_rate(&self) -> u32;

    /// Attach a processing node that delivers fixed windows of `window` samples
    /// to `callback`.
    fn create_processor(
        &mut self,
        source: Box<dyn SampleSource>,
        window: usize,
        callback: UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureNode>, DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Playback-rate audio context with its own monotonic clock.
pub trait OutputContext {
    fn sample_rate(&self) -> u32;
    /// Seconds since the context was opened
    fn current_time(&self) -> f64;
    /// Queue a unit for playback at `unit.start_time`.
    fn play(&mut self, unit: PlaybackUnit) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Factory for the local media resources a session needs.
#[allow(async_fn_in_trait)]
pub trait MediaBackend {
    fn create_input_context(&mut self, sample_rate: u32) -> Result<Box<dyn InputContext>, DeviceError>;

    fn create_output_context(&mut self, sample_rate: u32) -> Result<Box<dyn OutputContext>, DeviceError>;

    /// Acquire the combined audio+video stream. Nothing is retained on failure.
    async fn acquire(&mut self, constraints: MediaConstraints) -> Result<Box<dyn DeviceStream>, DeviceError>;
}
