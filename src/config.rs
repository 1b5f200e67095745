//! Configuration for the live companion session
//!
//! `LiveConfig` describes the remote endpoint, `SessionConfig` the local media
//! pipeline. Both carry defaults; secrets come from the environment.

use std::time::Duration;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Error raised while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {name} is not set: {source}")]
    MissingVar {
        name: &'static str,
        #[source]
        source: std::env::VarError,
    },

    #[error("environment variable {name} is empty")]
    EmptyVar { name: &'static str },
}

/// Remote session configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    /// Prebuilt voice used for spoken replies
    pub voice: String,
    pub system_instruction: Option<String>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice: "Kore".to_string(),
            system_instruction: Some(
                "You are SpringBloom, a warm and observant companion for parents. \
                 Keep replies short and natural, like a video call. You are not a doctor."
                    .to_string(),
            ),
        }
    }
}

impl LiveConfig {
    /// Build a configuration for the given API key.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            ..Default::default()
        }
    }

    /// Read `GEMINI_API_KEY` plus the optional `SPRINGBLOOM_LIVE_MODEL` and
    /// `SPRINGBLOOM_VOICE` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|source| ConfigError::MissingVar {
            name: "GEMINI_API_KEY",
            source,
        })?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::EmptyVar { name: "GEMINI_API_KEY" });
        }

        let mut config = Self::from_api_key(api_key.trim());
        if let Ok(model) = std::env::var("SPRINGBLOOM_LIVE_MODEL") {
            if !model.trim().is_empty() {
                config.model = normalize_model(model.trim());
            }
        }
        if let Ok(voice) = std::env::var("SPRINGBLOOM_VOICE") {
            if !voice.trim().is_empty() {
                config.voice = voice.trim().to_string();
            }
        }
        Ok(config)
    }
}

/// The setup message expects fully qualified `models/...` ids.
fn normalize_model(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

/// Local media pipeline configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application name reported to PulseAudio
    pub app_name: String,
    /// Capture rate sent upstream
    pub input_sample_rate: u32,
    /// Rate of the audio the remote sends back
    pub output_sample_rate: u32,
    /// Samples per capture callback
    pub capture_window: usize,
    pub frame_interval: Duration,
    /// Linear downscale applied to camera frames
    pub frame_scale: f32,
    pub jpeg_quality: u8,
    /// Lower bound for each side of a scaled frame
    pub min_frame_dimension: u32,
    pub camera_index: u32,
    /// Refresh period of the local self view
    pub preview_interval: Duration,
    /// Width the self view is downscaled to
    pub preview_width: u32,
    /// PulseAudio source name; `None` uses the default source
    pub microphone: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_name: "springbloom-live".to_string(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            capture_window: 4096,
            frame_interval: Duration::from_secs(1),
            frame_scale: 0.2,
            jpeg_quality: 50,
            min_frame_dimension: 32,
            camera_index: 0,
            preview_interval: Duration::from_millis(100),
            preview_width: 240,
            microphone: None,
        }
    }
}
