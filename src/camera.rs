//! Camera track
//!
//! Opens a camera with `nokhwa` on a dedicated thread and keeps the most
//! recent decoded RGB frame available for the 1 Hz sampler and the self view.
//! Disabling the track closes the device stream until it is enabled again.

use crate::media::DeviceError;
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::{Camera, NokhwaError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DISABLED_POLL: Duration = Duration::from_millis(100);

type LatestFrame = Arc<Mutex<Option<RgbImage>>>;

/// A running camera capture.
pub struct CameraTrack {
    stop: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    latest: LatestFrame,
    name: String,
}

impl CameraTrack {
    /// Open camera `index` and wait for the stream to start.
    pub async fn open(index: u32) -> Result<Self, DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let enabled = Arc::new(AtomicBool::new(true));
        let latest: LatestFrame = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let thread_enabled = enabled.clone();
        let thread_latest = latest.clone();
        std::thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || capture_loop(index, thread_stop, thread_enabled, thread_latest, ready_tx))
            .map_err(|e| DeviceError::Camera(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(name)) => {
                info!("Camera open: {}", name);
                Ok(Self {
                    stop,
                    enabled,
                    latest,
                    name,
                })
            }
            Ok(Err(e)) => Err(DeviceError::Camera(e)),
            Err(_) => Err(DeviceError::Camera("camera thread exited".to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest frame, or `None` while disabled or before the first frame.
    pub fn latest(&self) -> Option<RgbImage> {
        if !self.enabled.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst) {
            return None;
        }
        self.latest.lock().ok().and_then(|frame| frame.clone())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            if let Ok(mut frame) = self.latest.lock() {
                frame.take();
            }
        }
    }

    /// Signal the capture thread to release the camera.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop.store(true, Ordering::SeqCst);
        let mut frame = self
            .latest
            .lock()
            .map_err(|_| DeviceError::Camera("frame lock poisoned".to_string()))?;
        frame.take();
        Ok(())
    }
}

impl Drop for CameraTrack {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn capture_loop(
    index: u32,
    stop: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    latest: LatestFrame,
    ready: oneshot::Sender<Result<String, String>>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(CameraIndex::Index(index), requested) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(e.to_string()));
        return;
    }
    if ready.send(Ok(camera.info().human_name())).is_err() {
        let _ = camera.stop_stream();
        return;
    }

    let mut streaming = true;
    while !stop.load(Ordering::SeqCst) {
        let wanted = enabled.load(Ordering::SeqCst);
        streaming = sync_stream(&mut camera, streaming, wanted);
        if !streaming || !wanted {
            std::thread::sleep(DISABLED_POLL);
            continue;
        }

        let decoded = match camera.frame() {
            Ok(frame) => match frame.decode_image::<RgbFormat>() {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!("Camera decode error: {}", e);
                    continue;
                }
            },
            Err(e) => {
                warn!("Camera frame error: {}", e);
                std::thread::sleep(DISABLED_POLL);
                continue;
            }
        };

        let (width, height) = (decoded.width(), decoded.height());
        let Some(rgb) = RgbImage::from_raw(width, height, decoded.into_raw()) else {
            debug!("Camera frame size mismatch");
            continue;
        };
        if let Ok(mut frame) = latest.lock() {
            *frame = Some(rgb);
        }
    }

    if streaming {
        if let Err(e) = camera.stop_stream() {
            debug!("Failed to stop camera stream: {}", e);
        }
    }
    debug!("Camera thread exiting");
}

/// Device stream switch, so a disabled camera releases the sensor.
trait StreamControl {
    fn resume(&mut self) -> Result<(), NokhwaError>;
    fn pause(&mut self) -> Result<(), NokhwaError>;
}

impl StreamControl for Camera {
    fn resume(&mut self) -> Result<(), NokhwaError> {
        self.open_stream()
    }

    fn pause(&mut self) -> Result<(), NokhwaError> {
        self.stop_stream()
    }
}

/// Bring the device stream in line with the enabled flag. Returns whether
/// the stream is open afterwards.
fn sync_stream<S: StreamControl>(camera: &mut S, streaming: bool, wanted: bool) -> bool {
    if streaming == wanted {
        return streaming;
    }
    let result = if wanted { camera.resume() } else { camera.pause() };
    match result {
        Ok(()) => {
            info!("Camera stream {}", if wanted { "resumed" } else { "paused" });
            wanted
        }
        Err(e) => {
            warn!("Failed to {} camera stream: {}", if wanted { "resume" } else { "pause" }, e);
            streaming
        }
    }
}
