//! Microphone capture module
//!
//! Records mono float samples from PulseAudio on a dedicated thread using the
//! simple API. The server resamples from the device's native rate to the
//! requested capture rate. `PulseInputContext` frames the recorded blocks into
//! fixed capture windows for the session controller.

use crate::media::{CaptureNode, DeviceError, InputContext, SampleSource};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Blocks per second read from the record stream
const BLOCKS_PER_SECOND: u32 = 10;
const PROCESSOR_POLL: Duration = Duration::from_millis(50);

/// Represents an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Is this device a monitor (system playback) or a microphone
    pub is_monitor: bool,
}

/// Audio device type for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

impl DeviceType {
    fn includes(self, is_monitor: bool) -> bool {
        match self {
            DeviceType::Microphone => !is_monitor,
            DeviceType::Monitor => is_monitor,
            DeviceType::Any => true,
        }
    }
}

/// List PulseAudio sources of the given type.
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, DeviceError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist =
        Proplist::new().ok_or_else(|| DeviceError::Pulse("Failed to create proplist".to_string()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "springbloom-device-lister")
        .map_err(|()| DeviceError::Pulse("Failed to set application name".to_string()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| DeviceError::Pulse("Failed to create mainloop".to_string()))?;
    let mut context = Context::new_with_proplist(&mainloop, "springbloom-context", &proplist)
        .ok_or_else(|| DeviceError::Pulse("Failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| DeviceError::Pulse(format!("Failed to connect: {}", e)))?;

    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(DeviceError::Pulse("Connection failed".to_string()));
            }
            _ => {}
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(source_info) => {
            let is_monitor = source_info.monitor_of_sink.is_some()
                || source_info
                    .name
                    .as_ref()
                    .map(|name| name.contains("monitor"))
                    .unwrap_or(false);
            if !device_type.includes(is_monitor) {
                return;
            }
            if let (Some(name), Some(description)) = (
                source_info.name.as_ref().map(|s| s.to_string()),
                source_info.description.as_ref().map(|s| s.to_string()),
            ) {
                if let Ok(mut devices) = devices_clone.lock() {
                    devices.push(AudioDevice {
                        name,
                        description,
                        sample_rate: source_info.sample_spec.rate,
                        channels: source_info.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_clone.store(true, Ordering::SeqCst),
        ListResult::Error => {
            error!("Error listing audio devices");
            done_clone.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        iterate(&mut mainloop)?;
    }

    let result = devices
        .lock()
        .map(|devices| devices.clone())
        .map_err(|_| DeviceError::Pulse("Failed to access devices list".to_string()));

    context.disconnect();
    mainloop.quit(Retval(0));
    result
}

fn iterate(mainloop: &mut Mainloop) -> Result<(), DeviceError> {
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(DeviceError::Pulse("Mainloop iterate failed".to_string()))
        }
        IterateResult::Success(_) => Ok(()),
    }
}

/// Decode `F32le` record bytes. A partial trailing sample is ignored.
pub(crate) fn f32_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

type Tap = Arc<Mutex<Option<std_mpsc::Sender<Vec<f32>>>>>;

/// A live microphone recording on its own OS thread.
///
/// Blocks are delivered to at most one subscriber (the tap). With no
/// subscriber they are read and discarded so the stream never overruns.
pub struct MicrophoneTrack {
    stop: Arc<AtomicBool>,
    tap: Tap,
    device: Option<String>,
}

impl MicrophoneTrack {
    /// Start recording and wait until PulseAudio accepted the stream.
    pub async fn open(app_name: &str, device: Option<String>, sample_rate: u32) -> Result<Self, DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let tap: Tap = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let thread_tap = tap.clone();
        let app_name = app_name.to_string();
        let thread_device = device.clone();
        std::thread::Builder::new()
            .name("microphone".to_string())
            .spawn(move || record_loop(app_name, thread_device, sample_rate, thread_stop, thread_tap, ready_tx))
            .map_err(|e| DeviceError::Microphone(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Microphone open: {}", device.as_deref().unwrap_or("default source"));
                Ok(Self { stop, tap, device })
            }
            Ok(Err(e)) => Err(DeviceError::Microphone(e)),
            Err(_) => Err(DeviceError::Microphone("capture thread exited".to_string())),
        }
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Subscribe to recorded blocks, replacing any previous subscriber.
    pub fn source(&self) -> Result<MicrophoneSource, DeviceError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeviceError::Released);
        }
        let (tx, rx) = std_mpsc::channel();
        let mut tap = self
            .tap
            .lock()
            .map_err(|_| DeviceError::Microphone("tap lock poisoned".to_string()))?;
        *tap = Some(tx);
        Ok(MicrophoneSource { rx })
    }

    /// Signal the record thread to exit and end the current subscription.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop.store(true, Ordering::SeqCst);
        let mut tap = self
            .tap
            .lock()
            .map_err(|_| DeviceError::Microphone("tap lock poisoned".to_string()))?;
        tap.take();
        Ok(())
    }
}

impl Drop for MicrophoneTrack {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn record_loop(
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
    stop: Arc<AtomicBool>,
    tap: Tap,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Record,
        device.as_deref(),
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(e) => {
            let _ = ready.send(Err(format!("{}", e)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let block_samples = (sample_rate / BLOCKS_PER_SECOND).max(1) as usize;
    let mut buffer = vec![0u8; block_samples * 4];

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = simple.read(&mut buffer) {
            error!("Microphone read failed: {}", e);
            break;
        }
        let Ok(mut tap) = tap.lock() else {
            break;
        };
        if let Some(tx) = tap.as_ref() {
            if tx.send(f32_samples(&buffer)).is_err() {
                tap.take();
            }
        }
    }

    if let Ok(mut tap) = tap.lock() {
        tap.take();
    }
    debug!("Microphone thread exiting");
}

/// Receiving end of a microphone subscription.
pub struct MicrophoneSource {
    rx: std_mpsc::Receiver<Vec<f32>>,
}

impl SampleSource for MicrophoneSource {
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, DeviceError> {
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Ok(Some(block)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Released),
        }
    }
}

/// Splits a sample stream into fixed-size windows.
#[derive(Debug)]
pub struct WindowFramer {
    window: usize,
    pending: Vec<f32>,
}

impl WindowFramer {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            pending: Vec::with_capacity(window * 2),
        }
    }

    /// Append samples and return every completed window.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut windows = Vec::new();
        while self.pending.len() >= self.window {
            windows.push(self.pending.drain(..self.window).collect());
        }
        windows
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Capture-rate context. Each processor runs on its own thread and delivers
/// windows to the controller's event loop.
pub struct PulseInputContext {
    sample_rate: u32,
    nodes: Vec<Arc<AtomicBool>>,
    closed: bool,
}

impl PulseInputContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            nodes: Vec::new(),
            closed: false,
        }
    }
}

impl InputContext for PulseInputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_processor(
        &mut self,
        mut source: Box<dyn SampleSource>,
        window: usize,
        callback: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureNode>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Released);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        std::thread::Builder::new()
            .name("capture-processor".to_string())
            .spawn(move || {
                let mut framer = WindowFramer::new(window);
                while !thread_stop.load(Ordering::SeqCst) {
                    match source.next_block(PROCESSOR_POLL) {
                        Ok(Some(block)) => {
                            for window in framer.push(&block) {
                                if callback.send(window).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("Capture source ended: {}", e);
                            return;
                        }
                    }
                }
            })
            .map_err(|e| DeviceError::Microphone(e.to_string()))?;

        self.nodes.push(stop.clone());
        Ok(Box::new(ProcessorNode { stop }))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            warn!("Input context already closed");
            return Ok(());
        }
        self.closed = true;
        for node in self.nodes.drain(..) {
            node.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct ProcessorNode {
    stop: Arc<AtomicBool>,
}

impl CaptureNode for ProcessorNode {
    fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.stop.store(true, Ordering::SeqCst);
        Ok(())
    }
}
