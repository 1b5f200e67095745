//! SpringBloom Live - real-time voice and video calls with a Gemini Live model
//!
//! The session controller in [`session`] streams microphone audio (16 kHz
//! PCM16) and 1 Hz camera snapshots (JPEG) to the model over a WebSocket and
//! plays the spoken replies back gaplessly at 24 kHz.

pub mod audio;
pub mod camera;
pub mod capture;
pub mod config;
pub mod devices;
pub mod gemini;
pub mod media;
pub mod pcm;
pub mod playback;
pub mod sampler;
pub mod session;
pub mod speaker;
pub mod ui;

pub use config::{LiveConfig, SessionConfig};
pub use devices::LocalDevices;
pub use gemini::{LiveClient, LiveError};
pub use session::{ConnectionState, LiveSession, SessionSnapshot, SessionStatus};
pub use ui::{launch_ui, ShellCommand};
