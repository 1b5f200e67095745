//! Lists the local audio sources and cameras and tries to open the defaults.

use anyhow::Context as _;
use nokhwa::utils::ApiBackend;
use springbloom_live::audio::{list_devices, DeviceType, MicrophoneTrack};
use springbloom_live::camera::CameraTrack;
use springbloom_live::media::SampleSource;
use springbloom_live::SessionConfig;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SessionConfig::default();

    println!("Audio sources:");
    let devices = list_devices(DeviceType::Any).context("listing PulseAudio sources")?;
    if devices.is_empty() {
        println!("  none found");
    }
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  {}: {} ({})",
            i + 1,
            device.description,
            if device.is_monitor { "Monitor" } else { "Microphone" }
        );
        println!("     Name: {}", device.name);
        println!("     Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
    }

    println!("\nCameras:");
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) if cameras.is_empty() => println!("  none found"),
        Ok(cameras) => {
            for camera in cameras {
                println!("  {}: {}", camera.index(), camera.human_name());
            }
        }
        Err(e) => warn!("Failed to query cameras: {}", e),
    }

    println!("\nOpening default microphone at {} Hz...", config.input_sample_rate);
    match MicrophoneTrack::open(&config.app_name, config.microphone.clone(), config.input_sample_rate).await {
        Ok(mut microphone) => {
            let mut source = microphone.source().context("tapping microphone")?;
            let block = tokio::task::spawn_blocking(move || source.next_block(Duration::from_secs(1)))
                .await
                .context("microphone reader")?;
            match block {
                Ok(Some(samples)) => {
                    let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
                    info!(
                        "Microphone '{}' OK: {} samples, peak {:.3}",
                        microphone.device().unwrap_or("default source"),
                        samples.len(),
                        peak
                    );
                }
                Ok(None) => warn!("Microphone opened but delivered no audio within 1s"),
                Err(e) => warn!("Microphone read failed: {}", e),
            }
            microphone.stop().context("releasing microphone")?;
        }
        Err(e) => warn!("Microphone unavailable: {}", e),
    }

    println!("\nOpening camera {}...", config.camera_index);
    match CameraTrack::open(config.camera_index).await {
        Ok(mut camera) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match camera.latest() {
                Some(frame) => info!("Camera '{}' OK: {}x{}", camera.name(), frame.width(), frame.height()),
                None => warn!("Camera '{}' opened but produced no frame yet", camera.name()),
            }
            camera.stop().context("releasing camera")?;
        }
        Err(e) => warn!("Camera unavailable: {}", e),
    }

    Ok(())
}
