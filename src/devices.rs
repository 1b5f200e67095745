//! Local hardware backend
//!
//! Ties the PulseAudio microphone and speaker with the `nokhwa` camera into
//! the [`MediaBackend`] the session controller drives.

use crate::audio::{MicrophoneTrack, PulseInputContext};
use crate::camera::CameraTrack;
use crate::config::SessionConfig;
use crate::media::{
    DeviceError, DeviceStream, InputContext, MediaBackend, MediaConstraints, OutputContext, SampleSource,
};
use crate::speaker::PulseOutputContext;
use image::RgbImage;
use tracing::{info, warn};

/// PulseAudio + camera backend.
pub struct LocalDevices {
    config: SessionConfig,
}

impl LocalDevices {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl MediaBackend for LocalDevices {
    fn create_input_context(&mut self, sample_rate: u32) -> Result<Box<dyn InputContext>, DeviceError> {
        Ok(Box::new(PulseInputContext::new(sample_rate)))
    }

    fn create_output_context(&mut self, sample_rate: u32) -> Result<Box<dyn OutputContext>, DeviceError> {
        Ok(Box::new(PulseOutputContext::open(&self.config.app_name, sample_rate)?))
    }

    async fn acquire(&mut self, constraints: MediaConstraints) -> Result<Box<dyn DeviceStream>, DeviceError> {
        let microphone = MicrophoneTrack::open(
            &self.config.app_name,
            self.config.microphone.clone(),
            constraints.audio_sample_rate,
        );

        if !constraints.video {
            let microphone = microphone.await?;
            return Ok(Box::new(LocalDeviceStream::new(Some(microphone), None)));
        }

        let (microphone, camera) = tokio::join!(microphone, CameraTrack::open(self.config.camera_index));
        match (microphone, camera) {
            (Ok(microphone), Ok(camera)) => {
                info!("Acquired microphone and camera '{}'", camera.name());
                Ok(Box::new(LocalDeviceStream::new(Some(microphone), Some(camera))))
            }
            (Ok(mut microphone), Err(e)) => {
                if let Err(stop_err) = microphone.stop() {
                    warn!("Failed to release microphone: {}", stop_err);
                }
                Err(e)
            }
            (Err(e), Ok(mut camera)) => {
                if let Err(stop_err) = camera.stop() {
                    warn!("Failed to release camera: {}", stop_err);
                }
                Err(e)
            }
            (Err(e), Err(camera_err)) => {
                warn!("Camera also unavailable: {}", camera_err);
                Err(e)
            }
        }
    }
}

/// The combined microphone + camera stream of one session.
pub struct LocalDeviceStream {
    microphone: Option<MicrophoneTrack>,
    camera: Option<CameraTrack>,
}

impl LocalDeviceStream {
    pub fn new(microphone: Option<MicrophoneTrack>, camera: Option<CameraTrack>) -> Self {
        Self { microphone, camera }
    }
}

impl DeviceStream for LocalDeviceStream {
    fn audio_source(&mut self) -> Result<Box<dyn SampleSource>, DeviceError> {
        let microphone = self.microphone.as_ref().ok_or(DeviceError::Released)?;
        Ok(Box::new(microphone.source()?))
    }

    fn snapshot(&mut self) -> Option<RgbImage> {
        self.camera.as_ref().and_then(|camera| camera.latest())
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        if let Some(camera) = &self.camera {
            camera.set_enabled(enabled);
        }
    }

    /// Stops both tracks even if the first fails; reports the first failure.
    fn stop_tracks(&mut self) -> Result<(), DeviceError> {
        let microphone = self.microphone.take().map(|mut track| track.stop());
        let camera = self.camera.take().map(|mut track| track.stop());
        for result in [microphone, camera].into_iter().flatten() {
            result?;
        }
        Ok(())
    }
}
