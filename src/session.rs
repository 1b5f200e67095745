//! Live session controller
//!
//! Drives one duplex call: acquires devices, performs the remote handshake,
//! wires capture, sampling and playback to the open channel, and tears all of
//! it down in a fixed order. Everything runs on a single cooperative event
//! loop, so no locking is involved.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed
//!            |                    ^
//!            +--------------------+  (device or handshake failure)
//! ```

use crate::capture::CapturePipeline;
use crate::config::SessionConfig;
use crate::media::{
    CaptureNode, DeviceError, DeviceStream, InputContext, LiveConnector, MediaBackend, MediaConstraints, MediaSink,
    OutputContext, SessionEvent, SessionHandle,
};
use crate::playback::{self, PlaybackScheduler};
use crate::sampler::{self, FrameSampler, PreviewFrame};
use crate::ui::ShellCommand;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const ELAPSED_TICK: Duration = Duration::from_secs(1);

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Terminal for one call; a new call may start from here
    Closed,
}

impl ConnectionState {
    pub fn is_idle_equivalent(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Closed)
    }
}

/// User-visible status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Ready,
    WarmingUp,
    Connected,
    CallEnded,
    /// Microphone/camera permission denied or unavailable
    DeviceError(String),
    /// The remote session could not be established
    HandshakeError(String),
    /// Remote error mid-session
    ConnectionLost(String),
}

impl SessionStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionStatus::DeviceError(_) | SessionStatus::HandshakeError(_) | SessionStatus::ConnectionLost(_)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Ready => write!(f, "Ready to talk"),
            SessionStatus::WarmingUp => write!(f, "Warming up..."),
            SessionStatus::Connected => write!(f, "Connected"),
            SessionStatus::CallEnded => write!(f, "Call ended"),
            SessionStatus::DeviceError(e) => write!(f, "Please allow camera and microphone access ({})", e),
            SessionStatus::HandshakeError(e) => write!(f, "Could not connect ({})", e),
            SessionStatus::ConnectionLost(e) => write!(f, "Connection lost ({})", e),
        }
    }
}

/// State published to the UI shell
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub status: SessionStatus,
    pub muted: bool,
    pub camera_enabled: bool,
    /// Whole seconds since the session opened; kept after the call ends
    pub elapsed_secs: u64,
}

impl SessionSnapshot {
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed_secs)
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            status: SessionStatus::Ready,
            muted: false,
            camera_enabled: true,
            elapsed_secs: 0,
        }
    }
}

/// `mm:ss`
pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Teardown actions, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    SamplerTimer,
    Processor,
    Tracks,
    InputContext,
    OutputContext,
    RemoteSession,
    ElapsedTimer,
    Scheduler,
}

/// Failures observed during one teardown. Failures never stop later steps.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<(TeardownStep, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, step: TeardownStep) -> bool {
        self.failures.iter().any(|(s, _)| *s == step)
    }

    fn record<E: fmt::Display>(&mut self, step: TeardownStep, result: Result<(), E>) {
        if let Err(e) = result {
            warn!("Teardown step {:?} failed: {}", step, e);
            self.failures.push((step, e.to_string()));
        }
    }
}

/// Resources held by one call. All of them are released by `teardown`.
struct Resources<S> {
    input: Option<Box<dyn InputContext>>,
    output: Option<Box<dyn OutputContext>>,
    stream: Option<Box<dyn DeviceStream>>,
    processor: Option<Box<dyn CaptureNode>>,
    session: Option<Rc<S>>,
    sample_timer: Option<Interval>,
    preview_timer: Option<Interval>,
    elapsed_timer: Option<Interval>,
    capture_rx: Option<UnboundedReceiver<Vec<f32>>>,
    events_rx: Option<UnboundedReceiver<SessionEvent>>,
}

impl<S> Default for Resources<S> {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            stream: None,
            processor: None,
            session: None,
            sample_timer: None,
            preview_timer: None,
            elapsed_timer: None,
            capture_rx: None,
            events_rx: None,
        }
    }
}

impl<S> Resources<S> {
    fn is_empty(&self) -> bool {
        self.input.is_none()
            && self.output.is_none()
            && self.stream.is_none()
            && self.processor.is_none()
            && self.session.is_none()
            && self.sample_timer.is_none()
            && self.preview_timer.is_none()
            && self.elapsed_timer.is_none()
    }
}

/// Commands observed while awaiting device acquisition or the handshake.
#[derive(Debug, Default, Clone, Copy)]
struct Interruption {
    stop: bool,
    shutdown: bool,
}

/// The live call controller.
pub struct LiveSession<B: MediaBackend, C: LiveConnector> {
    config: SessionConfig,
    backend: B,
    connector: C,
    state: ConnectionState,
    status: SessionStatus,
    muted: bool,
    camera_enabled: bool,
    elapsed_secs: u64,
    capture: CapturePipeline,
    sampler: FrameSampler,
    scheduler: PlaybackScheduler,
    resources: Resources<C::Session>,
    snapshots: watch::Sender<SessionSnapshot>,
    previews: watch::Sender<Option<PreviewFrame>>,
}

impl<B: MediaBackend, C: LiveConnector> LiveSession<B, C> {
    pub fn new(config: SessionConfig, backend: B, connector: C) -> Self {
        let sampler = FrameSampler::new(config.frame_scale, config.jpeg_quality, config.min_frame_dimension);
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let (previews, _) = watch::channel(None);
        Self {
            config,
            backend,
            connector,
            state: ConnectionState::Idle,
            status: SessionStatus::Ready,
            muted: false,
            camera_enabled: true,
            elapsed_secs: 0,
            capture: CapturePipeline::new(),
            sampler,
            scheduler: PlaybackScheduler::new(),
            resources: Resources::default(),
            snapshots,
            previews,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.camera_enabled
    }

    /// Start time the next remote audio unit would get, on the output clock
    pub fn next_playback_start(&self) -> f64 {
        self.scheduler.next_start()
    }

    /// Whether any device, context, timer or channel is still held
    pub fn holds_resources(&self) -> bool {
        !self.resources.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status.clone(),
            muted: self.muted,
            camera_enabled: self.camera_enabled,
            elapsed_secs: self.elapsed_secs,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Mirrored self-view frames; `None` while there is nothing to show.
    pub fn subscribe_preview(&self) -> watch::Receiver<Option<PreviewFrame>> {
        self.previews.subscribe()
    }

    fn clear_preview(&self) {
        self.previews.send_if_modified(|preview| preview.take().is_some());
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Start a call. Failures end in `Closed` with an error status.
    pub async fn start(&mut self) {
        self.start_with(None).await;
    }

    /// Start a call while still reading `commands`, so a stop or shutdown
    /// issued during `Connecting` is honoured once the pending step settles.
    /// Returns true if shutdown was requested meanwhile.
    async fn start_with(&mut self, mut commands: Option<&mut UnboundedReceiver<ShellCommand>>) -> bool {
        if !self.state.is_idle_equivalent() {
            debug!("Ignoring start in state {:?}", self.state);
            return false;
        }

        self.scheduler.reset();
        self.state = ConnectionState::Connecting;
        self.status = SessionStatus::WarmingUp;
        self.publish();
        info!("Starting live session");

        match self.backend.create_input_context(self.config.input_sample_rate) {
            Ok(input) => self.resources.input = Some(input),
            Err(e) => {
                self.fail(SessionStatus::DeviceError(e.to_string()));
                return false;
            }
        }
        match self.backend.create_output_context(self.config.output_sample_rate) {
            Ok(output) => self.resources.output = Some(output),
            Err(e) => {
                self.fail(SessionStatus::DeviceError(e.to_string()));
                return false;
            }
        }

        let mut interruption = Interruption::default();
        let constraints = MediaConstraints {
            audio_sample_rate: self.config.input_sample_rate,
            video: true,
        };
        let acquired = await_or_interrupt(
            self.backend.acquire(constraints),
            commands.as_deref_mut(),
            &mut interruption,
        )
        .await;
        match acquired {
            Ok(mut stream) => {
                stream.set_video_enabled(self.camera_enabled);
                self.resources.stream = Some(stream);
            }
            Err(e) => {
                warn!("Device acquisition failed: {}", e);
                self.fail(SessionStatus::DeviceError(e.to_string()));
                return interruption.shutdown;
            }
        }
        if interruption.stop {
            self.abort_connecting();
            return interruption.shutdown;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected =
            await_or_interrupt(self.connector.connect(events_tx), commands.as_deref_mut(), &mut interruption).await;
        let session = match connected {
            Ok(session) => Rc::new(session),
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.fail(SessionStatus::HandshakeError(e.to_string()));
                return interruption.shutdown;
            }
        };
        self.resources.session = Some(session.clone());
        self.resources.events_rx = Some(events_rx);
        if interruption.stop {
            self.abort_connecting();
            return interruption.shutdown;
        }

        if let Err(e) = self.open(session) {
            self.fail(SessionStatus::DeviceError(e.to_string()));
        }
        interruption.shutdown
    }

    /// Connecting -> Open: wire capture, sampler and timers to the channel.
    fn open(&mut self, session: Rc<C::Session>) -> Result<(), DeviceError> {
        let (stream, input) = match (self.resources.stream.as_mut(), self.resources.input.as_mut()) {
            (Some(stream), Some(input)) => (stream, input),
            _ => return Err(DeviceError::Released),
        };

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let source = stream.audio_source()?;
        let processor = input.create_processor(source, self.config.capture_window, capture_tx)?;
        self.resources.processor = Some(processor);
        self.resources.capture_rx = Some(capture_rx);

        let sink: Rc<dyn MediaSink> = session;
        self.capture.set_muted(self.muted);
        self.capture.bind(sink.clone());
        self.sampler.set_active(self.camera_enabled);
        self.sampler.bind(sink);

        let now = Instant::now();
        let mut sample_timer = interval_at(now + self.config.frame_interval, self.config.frame_interval);
        sample_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut preview_timer = interval_at(now, self.config.preview_interval);
        preview_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut elapsed_timer = interval_at(now + ELAPSED_TICK, ELAPSED_TICK);
        elapsed_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.resources.sample_timer = Some(sample_timer);
        self.resources.preview_timer = Some(preview_timer);
        self.resources.elapsed_timer = Some(elapsed_timer);
        self.elapsed_secs = 0;

        self.state = ConnectionState::Open;
        self.status = SessionStatus::Connected;
        self.publish();
        info!("Live session open");
        Ok(())
    }

    fn abort_connecting(&mut self) {
        info!("Stop requested while connecting");
        self.teardown();
        self.state = ConnectionState::Closed;
        self.status = SessionStatus::CallEnded;
        self.publish();
    }

    fn fail(&mut self, status: SessionStatus) {
        self.teardown();
        self.state = ConnectionState::Closed;
        self.status = status;
        self.publish();
    }

    /// End the call. Safe from any state; repeated calls are no-ops.
    pub fn stop(&mut self) -> TeardownReport {
        if self.state == ConnectionState::Connecting {
            // the pending start observes stop through its command stream
            debug!("Stop while connecting is handled by the pending start");
            return TeardownReport::default();
        }
        let was_open = self.state == ConnectionState::Open;
        let report = self.teardown();
        if was_open {
            info!("Live session ended");
            self.state = ConnectionState::Closed;
            self.status = SessionStatus::CallEnded;
        }
        self.publish();
        report
    }

    /// Release everything in order. Every step runs regardless of earlier failures.
    fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let resources = &mut self.resources;

        resources.sample_timer = None;
        resources.preview_timer = None;

        if let Some(mut processor) = resources.processor.take() {
            report.record(TeardownStep::Processor, processor.disconnect());
        }
        if let Some(mut stream) = resources.stream.take() {
            report.record(TeardownStep::Tracks, stream.stop_tracks());
        }
        if let Some(mut input) = resources.input.take() {
            report.record(TeardownStep::InputContext, input.close());
        }
        if let Some(mut output) = resources.output.take() {
            report.record(TeardownStep::OutputContext, output.close());
        }
        if let Some(session) = resources.session.take() {
            report.record(TeardownStep::RemoteSession, session.close());
        }

        resources.elapsed_timer = None;
        self.scheduler.reset();

        self.capture.unbind();
        self.sampler.unbind();
        resources.capture_rx = None;
        resources.events_rx = None;
        self.clear_preview();

        if !report.is_clean() {
            warn!("Teardown finished with {} failed step(s)", report.failures.len());
        }
        report
    }

    /// Toggle mute. Only valid while open.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        if self.state != ConnectionState::Open {
            debug!("Ignoring mute toggle in state {:?}", self.state);
            return false;
        }
        self.muted = muted;
        self.capture.set_muted(muted);
        self.publish();
        true
    }

    /// Toggle the camera. Only valid while open; the sampling timer keeps running.
    pub fn set_camera_enabled(&mut self, enabled: bool) -> bool {
        if self.state != ConnectionState::Open {
            debug!("Ignoring camera toggle in state {:?}", self.state);
            return false;
        }
        self.camera_enabled = enabled;
        self.sampler.set_active(enabled);
        if let Some(stream) = self.resources.stream.as_mut() {
            stream.set_video_enabled(enabled);
        }
        if !enabled {
            self.clear_preview();
        }
        self.publish();
        true
    }

    /// One capture callback worth of microphone samples.
    pub fn on_capture(&mut self, window: &[f32]) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        self.capture.process(window)
    }

    /// One tick of the 1 Hz sampling timer.
    pub fn on_sample_tick(&mut self) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        match self.resources.stream.as_mut() {
            Some(stream) => self.sampler.tick(stream.as_mut()),
            None => false,
        }
    }

    /// Refresh the self view from the latest camera frame.
    pub fn on_preview_tick(&mut self) -> bool {
        if self.state != ConnectionState::Open || !self.camera_enabled {
            return false;
        }
        let Some(frame) = self.resources.stream.as_mut().and_then(|stream| stream.snapshot()) else {
            return false;
        };
        match sampler::preview_frame(&frame, self.config.preview_width) {
            Some(preview) => {
                self.previews.send_replace(Some(preview));
                true
            }
            None => false,
        }
    }

    fn on_elapsed_tick(&mut self) {
        self.elapsed_secs += 1;
        self.publish();
    }

    /// Handle one inbound notification from the remote session.
    pub fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio(payload) => self.play_remote_audio(&payload),
            SessionEvent::Closed(reason) => {
                if self.state != ConnectionState::Open {
                    return;
                }
                info!("Remote closed the session: {}", reason.as_deref().unwrap_or("no reason"));
                self.teardown();
                self.state = ConnectionState::Closed;
                self.status = SessionStatus::CallEnded;
                self.publish();
            }
            SessionEvent::Error(e) => {
                if self.state != ConnectionState::Open {
                    return;
                }
                warn!("Remote session error: {}", e);
                self.fail(SessionStatus::ConnectionLost(e));
            }
        }
    }

    fn play_remote_audio(&mut self, payload: &str) {
        if self.state != ConnectionState::Open {
            return;
        }
        let Some(output) = self.resources.output.as_mut() else {
            return;
        };
        let mut unit = match playback::decode_unit(payload, output.sample_rate()) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("Dropping undecodable audio: {}", e);
                return;
            }
        };
        self.scheduler.schedule_unit(&mut unit, output.current_time());
        if let Err(e) = output.play(unit) {
            warn!("Playback failed: {}", e);
        }
    }

    /// Event loop: shell commands, capture callbacks, remote events and timers.
    /// Returns after `Shutdown` or when the command channel closes, with the
    /// session torn down.
    pub async fn run(&mut self, mut commands: UnboundedReceiver<ShellCommand>) {
        info!("Session controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ShellCommand::Start) => {
                        if self.start_with(Some(&mut commands)).await {
                            break;
                        }
                    }
                    Some(ShellCommand::Stop) => {
                        self.stop();
                    }
                    Some(ShellCommand::SetMuted(muted)) => {
                        self.set_muted(muted);
                    }
                    Some(ShellCommand::SetCameraEnabled(enabled)) => {
                        self.set_camera_enabled(enabled);
                    }
                    Some(ShellCommand::Shutdown) | None => break,
                },
                window = recv_opt(self.resources.capture_rx.as_mut()) => match window {
                    Some(window) => {
                        self.on_capture(&window);
                    }
                    None => {
                        debug!("Capture processor ended");
                        self.resources.capture_rx = None;
                    }
                },
                event = recv_opt(self.resources.events_rx.as_mut()) => {
                    let event = event.unwrap_or(SessionEvent::Closed(None));
                    self.on_session_event(event);
                }
                _ = tick_opt(self.resources.sample_timer.as_mut()) => {
                    self.on_sample_tick();
                }
                _ = tick_opt(self.resources.preview_timer.as_mut()) => {
                    self.on_preview_tick();
                }
                _ = tick_opt(self.resources.elapsed_timer.as_mut()) => {
                    self.on_elapsed_tick();
                }
            }
        }
        self.stop();
        info!("Session controller shutting down");
    }
}

impl<B: MediaBackend, C: LiveConnector> Drop for LiveSession<B, C> {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            self.teardown();
        }
    }
}

/// Await `fut` while recording stop/shutdown commands. Other commands are dropped.
async fn await_or_interrupt<F: Future>(
    fut: F,
    mut commands: Option<&mut UnboundedReceiver<ShellCommand>>,
    interruption: &mut Interruption,
) -> F::Output {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            output = &mut fut => return output,
            command = recv_opt(commands.as_deref_mut()) => match command {
                Some(ShellCommand::Stop) => interruption.stop = true,
                Some(ShellCommand::Shutdown) => {
                    interruption.stop = true;
                    interruption.shutdown = true;
                }
                Some(other) => debug!("Ignoring {:?} while connecting", other),
                None => {
                    interruption.stop = true;
                    interruption.shutdown = true;
                    commands = None;
                }
            },
        }
    }
}

async fn recv_opt<T>(rx: Option<&mut UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(timer: Option<&mut Interval>) -> Instant {
    match timer {
        Some(timer) => timer.tick().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::LiveError;
    use crate::media::{MediaBlob, SampleSource, SendError};
    use crate::playback::PlaybackUnit;
    use image::RgbImage;
    use std::cell::{Cell, RefCell};
    use tokio::sync::mpsc::UnboundedSender;

    type Journal = Rc<RefCell<Vec<&'static str>>>;

    #[derive(Default)]
    struct Shared {
        journal: Journal,
        sent: Rc<RefCell<Vec<MediaBlob>>>,
        played: Rc<RefCell<Vec<PlaybackUnit>>>,
        clock: Rc<Cell<f64>>,
        capture_callback: Rc<RefCell<Option<UnboundedSender<Vec<f32>>>>>,
        remote_events: Rc<RefCell<Option<UnboundedSender<SessionEvent>>>>,
    }

    impl Shared {
        fn entries(&self) -> Vec<&'static str> {
            self.journal.borrow().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.journal
                .borrow()
                .iter()
                .position(|e| *e == entry)
                .unwrap_or_else(|| panic!("{} missing from {:?}", entry, self.journal.borrow()))
        }

        fn audio_sent(&self) -> usize {
            self.sent.borrow().iter().filter(|b| b.is_audio()).count()
        }

        fn video_sent(&self) -> usize {
            self.sent.borrow().iter().filter(|b| b.mime_type == "image/jpeg").count()
        }
    }

    #[derive(Default)]
    struct Faults {
        acquire_delay: Option<Duration>,
        acquire: bool,
        stop_tracks: bool,
        connect: bool,
        close: bool,
    }

    struct FakeBackend {
        shared: Rc<Shared>,
        faults: Rc<Faults>,
    }

    struct FakeInput {
        journal: Journal,
        callback: Rc<RefCell<Option<UnboundedSender<Vec<f32>>>>>,
    }

    struct FakeNode {
        journal: Journal,
    }

    struct FakeOutput {
        journal: Journal,
        played: Rc<RefCell<Vec<PlaybackUnit>>>,
        clock: Rc<Cell<f64>>,
    }

    struct FakeStream {
        journal: Journal,
        video_enabled: bool,
        fail_stop: bool,
    }

    struct SilentSource;

    impl SampleSource for SilentSource {
        fn next_block(&mut self, _timeout: Duration) -> Result<Option<Vec<f32>>, DeviceError> {
            Ok(None)
        }
    }

    impl CaptureNode for FakeNode {
        fn disconnect(&mut self) -> Result<(), DeviceError> {
            self.journal.borrow_mut().push("processor.disconnect");
            Ok(())
        }
    }

    impl InputContext for FakeInput {
        fn sample_rate(&self) -> u32 {
            16_000
        }

        fn create_processor(
            &mut self,
            _source: Box<dyn SampleSource>,
            window: usize,
            callback: UnboundedSender<Vec<f32>>,
        ) -> Result<Box<dyn CaptureNode>, DeviceError> {
            assert_eq!(window, 4096);
            self.journal.borrow_mut().push("processor.create");
            *self.callback.borrow_mut() = Some(callback);
            Ok(Box::new(FakeNode {
                journal: self.journal.clone(),
            }))
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.journal.borrow_mut().push("input.close");
            Ok(())
        }
    }

    impl OutputContext for FakeOutput {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        fn current_time(&self) -> f64 {
            self.clock.get()
        }

        fn play(&mut self, unit: PlaybackUnit) -> Result<(), DeviceError> {
            self.played.borrow_mut().push(unit);
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.journal.borrow_mut().push("output.close");
            Ok(())
        }
    }

    impl DeviceStream for FakeStream {
        fn audio_source(&mut self) -> Result<Box<dyn SampleSource>, DeviceError> {
            Ok(Box::new(SilentSource))
        }

        fn snapshot(&mut self) -> Option<RgbImage> {
            self.video_enabled.then(|| RgbImage::new(320, 240))
        }

        fn set_video_enabled(&mut self, enabled: bool) {
            self.video_enabled = enabled;
        }

        fn stop_tracks(&mut self) -> Result<(), DeviceError> {
            self.journal.borrow_mut().push("tracks.stop");
            if self.fail_stop {
                return Err(DeviceError::Camera("track refused to stop".to_string()));
            }
            Ok(())
        }
    }

    impl MediaBackend for FakeBackend {
        fn create_input_context(&mut self, sample_rate: u32) -> Result<Box<dyn InputContext>, DeviceError> {
            assert_eq!(sample_rate, 16_000);
            self.shared.journal.borrow_mut().push("input.create");
            Ok(Box::new(FakeInput {
                journal: self.shared.journal.clone(),
                callback: self.shared.capture_callback.clone(),
            }))
        }

        fn create_output_context(&mut self, sample_rate: u32) -> Result<Box<dyn OutputContext>, DeviceError> {
            assert_eq!(sample_rate, 24_000);
            self.shared.journal.borrow_mut().push("output.create");
            Ok(Box::new(FakeOutput {
                journal: self.shared.journal.clone(),
                played: self.shared.played.clone(),
                clock: self.shared.clock.clone(),
            }))
        }

        async fn acquire(&mut self, constraints: MediaConstraints) -> Result<Box<dyn DeviceStream>, DeviceError> {
            assert!(constraints.video);
            self.shared.journal.borrow_mut().push("acquire");
            if let Some(delay) = self.faults.acquire_delay {
                tokio::time::sleep(delay).await;
            }
            if self.faults.acquire {
                return Err(DeviceError::Camera("permission denied".to_string()));
            }
            Ok(Box::new(FakeStream {
                journal: self.shared.journal.clone(),
                video_enabled: true,
                fail_stop: self.faults.stop_tracks,
            }))
        }
    }

    struct FakeSession {
        journal: Journal,
        sent: Rc<RefCell<Vec<MediaBlob>>>,
        open: Cell<bool>,
        fail_close: bool,
    }

    impl MediaSink for FakeSession {
        fn send_realtime_input(&self, media: MediaBlob) -> Result<(), SendError> {
            if !self.open.get() {
                return Err(SendError::NotOpen);
            }
            self.sent.borrow_mut().push(media);
            Ok(())
        }
    }

    impl SessionHandle for FakeSession {
        fn close(&self) -> Result<(), LiveError> {
            self.journal.borrow_mut().push("session.close");
            self.open.set(false);
            if self.fail_close {
                return Err(LiveError::ChannelClosed);
            }
            Ok(())
        }
    }

    struct FakeConnector {
        shared: Rc<Shared>,
        faults: Rc<Faults>,
        delay: Option<Duration>,
    }

    impl LiveConnector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&mut self, events: UnboundedSender<SessionEvent>) -> Result<FakeSession, LiveError> {
            self.shared.journal.borrow_mut().push("connect");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.faults.connect {
                return Err(LiveError::SetupNotComplete("rejected".to_string()));
            }
            *self.shared.remote_events.borrow_mut() = Some(events);
            Ok(FakeSession {
                journal: self.shared.journal.clone(),
                sent: self.shared.sent.clone(),
                open: Cell::new(true),
                fail_close: self.faults.close,
            })
        }
    }

    fn session_with(faults: Faults, delay: Option<Duration>) -> (LiveSession<FakeBackend, FakeConnector>, Rc<Shared>) {
        let shared = Rc::new(Shared::default());
        let faults = Rc::new(faults);
        let backend = FakeBackend {
            shared: shared.clone(),
            faults: faults.clone(),
        };
        let connector = FakeConnector {
            shared: shared.clone(),
            faults,
            delay,
        };
        (LiveSession::new(SessionConfig::default(), backend, connector), shared)
    }

    fn session() -> (LiveSession<FakeBackend, FakeConnector>, Rc<Shared>) {
        session_with(Faults::default(), None)
    }

    fn one_second_payload() -> String {
        crate::pcm::encode_audio_blob(&vec![0.1; 24_000]).data
    }

    #[tokio::test]
    async fn start_acquires_then_connects_then_opens() {
        let (mut live, shared) = session();
        let snapshots = live.subscribe();

        live.start().await;

        assert_eq!(live.state(), ConnectionState::Open);
        assert_eq!(live.status(), &SessionStatus::Connected);
        assert!(shared.position("acquire") < shared.position("connect"));
        assert!(shared.position("connect") < shared.position("processor.create"));
        assert_eq!(snapshots.borrow().state, ConnectionState::Open);
        assert_eq!(snapshots.borrow().status.to_string(), "Connected");
    }

    #[tokio::test]
    async fn muted_capture_sends_nothing() {
        let (mut live, shared) = session();
        live.start().await;
        let window = vec![0.2f32; 4096];

        assert!(live.set_muted(true));
        for _ in 0..8 {
            live.on_capture(&window);
        }
        assert_eq!(shared.audio_sent(), 0);

        assert!(live.set_muted(false));
        for _ in 0..8 {
            live.on_capture(&window);
        }
        assert_eq!(shared.audio_sent(), 8);
    }

    #[tokio::test]
    async fn camera_off_ticks_send_nothing_until_reenabled() {
        let (mut live, shared) = session();
        live.start().await;

        assert!(live.set_camera_enabled(false));
        for _ in 0..3 {
            live.on_sample_tick();
        }
        assert_eq!(shared.video_sent(), 0);

        assert!(live.set_camera_enabled(true));
        assert!(live.on_sample_tick());
        assert_eq!(shared.video_sent(), 1);
        assert_eq!(live.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn toggles_are_ignored_unless_open() {
        let (mut live, _shared) = session();
        assert!(!live.set_muted(true));
        assert!(!live.set_camera_enabled(false));
        assert!(!live.is_muted());
        assert!(live.is_camera_enabled());
    }

    #[tokio::test]
    async fn remote_audio_is_scheduled_gaplessly() {
        let (mut live, shared) = session();
        live.start().await;

        live.on_session_event(SessionEvent::Audio(one_second_payload()));
        live.on_session_event(SessionEvent::Audio(one_second_payload()));
        shared.clock.set(5.0);
        live.on_session_event(SessionEvent::Audio(one_second_payload()));

        let starts: Vec<f64> = shared.played.borrow().iter().map(|u| u.start_time).collect();
        assert_eq!(starts, vec![0.0, 1.0, 5.0]);
        assert_eq!(live.next_playback_start(), 6.0);

        // undecodable payloads are skipped
        live.on_session_event(SessionEvent::Audio("***".to_string()));
        assert_eq!(shared.played.borrow().len(), 3);
    }

    #[tokio::test]
    async fn teardown_is_total_when_steps_fail() {
        let (mut live, shared) = session_with(
            Faults {
                stop_tracks: true,
                close: true,
                ..Default::default()
            },
            None,
        );
        live.start().await;
        live.on_session_event(SessionEvent::Audio(one_second_payload()));
        assert!(live.next_playback_start() > 0.0);

        let report = live.stop();

        assert!(report.failed(TeardownStep::Tracks));
        assert!(report.failed(TeardownStep::RemoteSession));
        assert_eq!(report.failures.len(), 2);
        let order = [
            "processor.disconnect",
            "tracks.stop",
            "input.close",
            "output.close",
            "session.close",
        ];
        let positions: Vec<usize> = order.iter().map(|e| shared.position(e)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", shared.entries());
        assert_eq!(live.next_playback_start(), 0.0);
        assert!(!live.holds_resources());
        assert_eq!(live.state(), ConnectionState::Closed);
        assert_eq!(live.status(), &SessionStatus::CallEnded);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut live, shared) = session();
        assert!(live.stop().is_clean());
        assert_eq!(live.state(), ConnectionState::Idle);

        live.start().await;
        assert!(live.stop().is_clean());
        assert!(live.stop().is_clean());
        assert!(live.state().is_idle_equivalent());
        let closes = shared.entries().iter().filter(|e| **e == "session.close").count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn closed_session_can_restart() {
        let (mut live, shared) = session();
        live.start().await;
        live.stop();
        live.start().await;

        assert_eq!(live.state(), ConnectionState::Open);
        let connects = shared.entries().iter().filter(|e| **e == "connect").count();
        assert_eq!(connects, 2);
    }

    #[tokio::test]
    async fn start_while_open_is_ignored() {
        let (mut live, shared) = session();
        live.start().await;
        live.start().await;
        let acquires = shared.entries().iter().filter(|e| **e == "acquire").count();
        assert_eq!(acquires, 1);
    }

    #[tokio::test]
    async fn device_error_releases_contexts_and_never_connects() {
        let (mut live, shared) = session_with(
            Faults {
                acquire: true,
                ..Default::default()
            },
            None,
        );
        live.start().await;

        assert_eq!(live.state(), ConnectionState::Closed);
        assert!(matches!(live.status(), SessionStatus::DeviceError(_)));
        assert!(!shared.entries().contains(&"connect"));
        assert!(shared.entries().contains(&"input.close"));
        assert!(shared.entries().contains(&"output.close"));
        assert!(!live.holds_resources());
    }

    #[tokio::test]
    async fn handshake_error_releases_devices() {
        let (mut live, shared) = session_with(
            Faults {
                connect: true,
                ..Default::default()
            },
            None,
        );
        live.start().await;

        assert_eq!(live.state(), ConnectionState::Closed);
        assert!(matches!(live.status(), SessionStatus::HandshakeError(_)));
        assert!(shared.entries().contains(&"tracks.stop"));
        assert!(!live.holds_resources());
    }

    #[tokio::test]
    async fn remote_close_tears_down() {
        let (mut live, shared) = session();
        live.start().await;

        live.on_session_event(SessionEvent::Closed(None));

        assert_eq!(live.state(), ConnectionState::Closed);
        assert_eq!(live.status(), &SessionStatus::CallEnded);
        assert!(shared.entries().contains(&"tracks.stop"));
        assert!(!live.holds_resources());
    }

    #[tokio::test]
    async fn remote_error_reports_connection_lost() {
        let (mut live, _shared) = session();
        live.start().await;

        live.on_session_event(SessionEvent::Error("reset by peer".to_string()));

        assert_eq!(live.state(), ConnectionState::Closed);
        assert_eq!(live.status(), &SessionStatus::ConnectionLost("reset by peer".to_string()));
        assert!(live.status().is_error());
    }

    #[tokio::test]
    async fn drop_releases_everything() {
        let (mut live, shared) = session();
        live.start().await;
        drop(live);

        for entry in ["processor.disconnect", "tracks.stop", "input.close", "output.close", "session.close"] {
            assert!(shared.entries().contains(&entry), "{} missing", entry);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_handshake_tears_down_after_it_completes() {
        let (mut live, shared) = session_with(Faults::default(), Some(Duration::from_secs(10)));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ShellCommand::Start).unwrap();
        tx.send(ShellCommand::Stop).unwrap();
        tx.send(ShellCommand::Shutdown).unwrap();

        live.run(rx).await;

        assert!(shared.position("connect") < shared.position("session.close"));
        assert!(!shared.entries().contains(&"processor.create"));
        assert_eq!(live.state(), ConnectionState::Closed);
        assert_eq!(live.status(), &SessionStatus::CallEnded);
        assert!(!live.holds_resources());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_device_acquisition_never_connects() {
        let faults = Faults {
            acquire_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (mut live, shared) = session_with(faults, None);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ShellCommand::Start).unwrap();
        tx.send(ShellCommand::Stop).unwrap();
        tx.send(ShellCommand::Shutdown).unwrap();

        live.run(rx).await;

        let entries = shared.entries();
        assert!(!entries.contains(&"connect"));
        assert!(!entries.contains(&"session.close"));
        assert!(shared.position("acquire") < shared.position("tracks.stop"));
        assert!(shared.position("tracks.stop") < shared.position("input.close"));
        assert!(shared.position("input.close") < shared.position("output.close"));
        assert_eq!(live.state(), ConnectionState::Closed);
        assert_eq!(live.status(), &SessionStatus::CallEnded);
        assert!(!live.holds_resources());
    }

    #[tokio::test]
    async fn self_view_follows_camera_and_session() {
        let (mut live, _shared) = session();
        let previews = live.subscribe_preview();
        assert!(!live.on_preview_tick());

        live.start().await;
        assert!(live.on_preview_tick());
        {
            let preview = previews.borrow();
            let preview = preview.as_ref().unwrap();
            // fake camera is 320x240
            assert_eq!((preview.width, preview.height), (240, 180));
        }

        live.set_camera_enabled(false);
        assert!(previews.borrow().is_none());
        assert!(!live.on_preview_tick());

        live.set_camera_enabled(true);
        assert!(live.on_preview_tick());
        live.stop();
        assert!(previews.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_drives_capture_sampling_and_elapsed_time() {
        let (mut live, shared) = session();
        let snapshots = live.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ShellCommand::Start).unwrap();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let callback = shared.capture_callback.borrow().clone().unwrap();
            callback.send(vec![0.1; 4096]).unwrap();
            callback.send(vec![0.1; 4096]).unwrap();

            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send(ShellCommand::Shutdown).unwrap();
        };
        tokio::join!(live.run(rx), driver);

        assert_eq!(shared.audio_sent(), 2);
        assert_eq!(shared.video_sent(), 3);
        assert_eq!(snapshots.borrow().elapsed_secs, 3);
        assert_eq!(snapshots.borrow().elapsed_display(), "00:03");
        assert_eq!(live.state(), ConnectionState::Closed);
    }

    #[test]
    fn elapsed_formats_as_minutes_and_seconds() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(65), "01:05");
        assert_eq!(format_elapsed(3600), "60:00");
    }
}
