//! Playback-rate audio output
//!
//! `PulseOutputContext` owns a PulseAudio playback stream on its own thread.
//! The context clock starts when the context is created; units are written so
//! that each begins at its scheduled start time on that clock.

use crate::media::{DeviceError, OutputContext};
use crate::playback::PlaybackUnit;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const QUEUE_POLL: Duration = Duration::from_millis(50);
/// Server-side playback buffer target
const TARGET_LATENCY: Duration = Duration::from_millis(150);

/// Tracks how far the output stream has been written, in context seconds.
#[derive(Debug, Default)]
pub struct OutputTimeline {
    written_until: f64,
}

impl OutputTimeline {
    /// Seconds of silence to write before `unit` so that it starts on time.
    /// An underrun (written position behind `now`) restarts from `now`.
    pub fn place(&mut self, unit: &PlaybackUnit, now: f64) -> f64 {
        if self.written_until < now {
            self.written_until = now;
        }
        let pad = (unit.start_time - self.written_until).max(0.0);
        self.written_until += pad + unit.duration();
        pad
    }

    pub fn written_until(&self) -> f64 {
        self.written_until
    }
}

/// 24 kHz mono output context backed by PulseAudio.
pub struct PulseOutputContext {
    sample_rate: u32,
    opened: Instant,
    queue: Option<std_mpsc::Sender<PlaybackUnit>>,
    stop: Arc<AtomicBool>,
}

impl PulseOutputContext {
    /// Start the playback thread. Connection failures surface on the first
    /// `play` call once the thread has exited.
    pub fn open(app_name: &str, sample_rate: u32) -> Result<Self, DeviceError> {
        let (tx, rx) = std_mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let opened = Instant::now();

        let thread_stop = stop.clone();
        let app_name = app_name.to_string();
        std::thread::Builder::new()
            .name("speaker".to_string())
            .spawn(move || playback_loop(app_name, sample_rate, opened, rx, thread_stop))
            .map_err(|e| DeviceError::Output(e.to_string()))?;

        Ok(Self {
            sample_rate,
            opened,
            queue: Some(tx),
            stop,
        })
    }
}

impl OutputContext for PulseOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.opened.elapsed().as_secs_f64()
    }

    fn play(&mut self, unit: PlaybackUnit) -> Result<(), DeviceError> {
        let Some(queue) = &self.queue else {
            return Err(DeviceError::Released);
        };
        queue
            .send(unit)
            .map_err(|_| DeviceError::Output("playback stream is not running".to_string()))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.stop.store(true, Ordering::SeqCst);
        match self.queue.take() {
            Some(_) => Ok(()),
            None => Err(DeviceError::Released),
        }
    }
}

impl Drop for PulseOutputContext {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Low-latency playback buffering. `prebuf` of zero starts playback on the
/// first write, so a short reply is heard without waiting for a full buffer.
fn playback_buffer_attr(sample_rate: u32) -> BufferAttr {
    let bytes_per_second = sample_rate as u64 * std::mem::size_of::<f32>() as u64;
    let tlength = (bytes_per_second * TARGET_LATENCY.as_millis() as u64 / 1000) as u32;
    BufferAttr {
        maxlength: u32::MAX,
        tlength,
        prebuf: 0,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    }
}

fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn playback_loop(
    app_name: String,
    sample_rate: u32,
    opened: Instant,
    queue: std_mpsc::Receiver<PlaybackUnit>,
    stop: Arc<AtomicBool>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };
    let buffer_attr = playback_buffer_attr(sample_rate);
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Playback,
        None,
        "assistant voice",
        &spec,
        None,
        Some(&buffer_attr),
    ) {
        Ok(simple) => simple,
        Err(e) => {
            error!("Failed to open playback stream: {}", e);
            return;
        }
    };
    info!("Playback stream open at {} Hz", sample_rate);

    let mut timeline = OutputTimeline::default();
    while !stop.load(Ordering::SeqCst) {
        let unit = match queue.recv_timeout(QUEUE_POLL) {
            Ok(unit) => unit,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let pad = timeline.place(&unit, opened.elapsed().as_secs_f64());
        let silence = (pad * sample_rate as f64).round() as usize;
        if silence > 0 {
            if let Err(e) = simple.write(&samples_to_bytes(&vec![0.0; silence])) {
                error!("Playback write failed: {}", e);
                break;
            }
        }
        // blocks while the server buffer is full
        if let Err(e) = simple.write(&samples_to_bytes(&unit.samples)) {
            error!("Playback write failed: {}", e);
            break;
        }
    }

    // discard anything still buffered so audio stops with the session
    if let Err(e) = simple.flush() {
        debug!("Playback flush failed: {}", e);
    }
    debug!("Speaker thread exiting");
}
