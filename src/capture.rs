//! Outbound microphone pipeline
//!
//! Each capture callback hands over one fixed window of 16 kHz mono float
//! samples. The window is encoded and sent immediately unless muted.

use crate::media::MediaSink;
use crate::pcm;
use std::rc::Rc;
use tracing::debug;

/// Encodes capture windows and forwards them to the open session.
#[derive(Default)]
pub struct CapturePipeline {
    muted: bool,
    sink: Option<Rc<dyn MediaSink>>,
    chunks_sent: u64,
    chunks_dropped: u64,
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Route future windows to `sink`.
    pub fn bind(&mut self, sink: Rc<dyn MediaSink>) {
        self.sink = Some(sink);
    }

    pub fn unbind(&mut self) {
        self.sink = None;
    }

    pub fn is_bound(&self) -> bool {
        self.sink.is_some()
    }

    /// Handle one capture callback. Returns whether a chunk went out.
    ///
    /// Muted windows are discarded before encoding.
    pub fn process(&mut self, window: &[f32]) -> bool {
        if self.muted || window.is_empty() {
            return false;
        }
        let Some(sink) = &self.sink else {
            return false;
        };

        match sink.send_realtime_input(pcm::encode_audio_blob(window)) {
            Ok(()) => {
                self.chunks_sent += 1;
                true
            }
            Err(e) => {
                self.chunks_dropped += 1;
                debug!("Dropped audio chunk: {}", e);
                false
            }
        }
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaBlob, SendError};
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct RecordingSink {
        open: Cell<bool>,
        sent: RefCell<Vec<MediaBlob>>,
    }

    impl MediaSink for RecordingSink {
        fn send_realtime_input(&self, media: MediaBlob) -> Result<(), SendError> {
            if !self.open.get() {
                return Err(SendError::NotOpen);
            }
            self.sent.borrow_mut().push(media);
            Ok(())
        }
    }

    fn open_sink() -> Rc<RecordingSink> {
        let sink = Rc::new(RecordingSink::default());
        sink.open.set(true);
        sink
    }

    #[test]
    fn muted_ticks_send_nothing() {
        let sink = open_sink();
        let mut pipeline = CapturePipeline::new();
        pipeline.bind(sink.clone());
        let window = vec![0.25f32; 4096];

        pipeline.set_muted(true);
        assert!(pipeline.is_muted());
        for _ in 0..10 {
            assert!(!pipeline.process(&window));
        }
        assert!(sink.sent.borrow().is_empty());

        pipeline.set_muted(false);
        for _ in 0..10 {
            assert!(pipeline.process(&window));
        }
        assert_eq!(sink.sent.borrow().len(), 10);
        assert_eq!(pipeline.chunks_sent(), 10);
    }

    #[test]
    fn each_chunk_is_pcm16_of_the_window() {
        let sink = open_sink();
        let mut pipeline = CapturePipeline::new();
        pipeline.bind(sink.clone());

        pipeline.process(&[0.5, -0.5]);
        let sent = sink.sent.borrow();
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=16000");
        assert_eq!(sent[0], pcm::encode_audio_blob(&[0.5, -0.5]));
    }

    #[test]
    fn closed_channel_drops_without_queueing() {
        let sink = Rc::new(RecordingSink::default());
        let mut pipeline = CapturePipeline::new();
        pipeline.bind(sink.clone());

        assert!(!pipeline.process(&[0.1; 16]));
        assert!(!pipeline.process(&[0.1; 16]));
        assert_eq!(pipeline.chunks_dropped(), 2);

        // reopening does not replay dropped chunks
        sink.open.set(true);
        assert!(pipeline.process(&[0.1; 16]));
        assert_eq!(sink.sent.borrow().len(), 1);
    }

    #[test]
    fn unbound_pipeline_is_silent() {
        let mut pipeline = CapturePipeline::new();
        assert!(!pipeline.is_bound());
        assert!(!pipeline.process(&[0.3; 8]));
        assert_eq!(pipeline.chunks_dropped(), 0);

        let sink = open_sink();
        pipeline.bind(sink.clone());
        assert!(pipeline.is_bound());
        pipeline.unbind();
        assert!(!pipeline.is_bound());
        assert!(!pipeline.process(&[0.3; 8]));
        assert!(sink.sent.borrow().is_empty());
    }
}
