//! Gemini Live API module
//!
//! WebSocket client for the bidirectional Live endpoint. The client performs
//! the setup handshake, then splits the socket into a writer task fed by the
//! session handle and a reader task that turns server frames into
//! [`SessionEvent`]s.

use crate::config::LiveConfig;
use crate::media::{LiveConnector, MediaBlob, MediaSink, SendError, SessionEvent, SessionHandle};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Error type for Live API operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete: {0}")]
    SetupNotComplete(String),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, LiveError>;

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

/// Base64 payload tagged with its MIME type
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

impl BidiGenerateContentSetup {
    /// Audio-only replies in the configured prebuilt voice.
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            }),
            system_instruction: config.system_instruction.as_deref().map(Content::text),
        }
    }
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

impl From<MediaBlob> for RealtimeInput {
    fn from(media: MediaBlob) -> Self {
        let is_audio = media.is_audio();
        let blob = Blob {
            mime_type: media.mime_type,
            data: media.data,
        };
        if is_audio {
            Self { audio: Some(blob), video: None }
        } else {
            Self { audio: None, video: Some(blob) }
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<Content>,
    pub turn_complete: Option<bool>,
    pub interrupted: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

/// Server -> client message. Exactly one field is normally present.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

/// Parse a text or binary frame. Control frames yield `None`.
pub fn parse_frame(message: &Message) -> Option<Result<ServerMessage>> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text.as_str()),
        Message::Binary(bytes) => serde_json::from_slice::<ServerMessage>(bytes),
        _ => return None,
    };
    Some(parsed.map_err(LiveError::Serialization))
}

/// Inline audio parts of a server message, in order, as playback events.
pub fn events_from_server_message(message: &ServerMessage) -> Vec<SessionEvent> {
    let Some(content) = &message.server_content else {
        return Vec::new();
    };
    let Some(turn) = &content.model_turn else {
        return Vec::new();
    };
    turn.parts
        .iter()
        .filter_map(|part| part.inline_data.as_ref())
        .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
        .filter(|blob| !blob.data.is_empty())
        .map(|blob| SessionEvent::Audio(blob.data.clone()))
        .collect()
}

/// Connects to the Live endpoint.
pub struct LiveClient {
    config: LiveConfig,
}

impl LiveClient {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }

    async fn handshake(&self, ws: &mut WsStream) -> Result<()> {
        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&self.config));
        ws.send(Message::text(serde_json::to_string(&setup)?)).await?;
        debug!("Sent setup for {}", self.config.model);

        // No timeout: an unresponsive server leaves the session connecting
        // until the caller gives up.
        while let Some(frame) = ws.next().await {
            let frame = frame?;
            if let Message::Close(close) = &frame {
                let reason = close
                    .as_ref()
                    .map(|c| c.reason.as_str().to_string())
                    .unwrap_or_else(|| "closed during setup".to_string());
                return Err(LiveError::SetupNotComplete(reason));
            }
            match parse_frame(&frame) {
                Some(Ok(message)) if message.setup_complete.is_some() => return Ok(()),
                Some(Ok(_)) => debug!("Ignoring message received before setupComplete"),
                Some(Err(e)) => warn!("Unparseable frame during setup: {}", e),
                None => {}
            }
        }
        Err(LiveError::ConnectionClosed)
    }
}

impl LiveConnector for LiveClient {
    type Session = LiveSessionHandle;

    async fn connect(&mut self, events: UnboundedSender<SessionEvent>) -> Result<LiveSessionHandle> {
        info!("Connecting to Gemini Live API");
        let (mut ws, _resp) = connect_async(self.config.url.as_str()).await?;
        self.handshake(&mut ws).await?;
        info!("Gemini session setup complete");

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(stream, events, open.clone()));

        Ok(LiveSessionHandle {
            outbound: outbound_tx,
            open,
        })
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("WebSocket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    debug!("Writer task finished");
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: UnboundedSender<SessionEvent>, open: Arc<AtomicBool>) {
    let last = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break SessionEvent::Error(e.to_string()),
            None => break SessionEvent::Closed(None),
        };

        if let Message::Close(close) = &frame {
            info!("WebSocket closed: {:?}", close);
            let reason = close.as_ref().map(|c| c.reason.as_str().to_string()).filter(|r| !r.is_empty());
            break SessionEvent::Closed(reason);
        }

        match parse_frame(&frame) {
            Some(Ok(message)) => {
                if let Some(go_away) = &message.go_away {
                    info!("Server going away, time left: {:?}", go_away.time_left);
                }
                if let Some(content) = &message.server_content {
                    if content.interrupted == Some(true) {
                        debug!("Model turn interrupted");
                    }
                }
                for event in events_from_server_message(&message) {
                    if events.send(event).is_err() {
                        // session torn down locally
                        open.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
            Some(Err(e)) => error!("Failed to parse server message: {}", e),
            None => {}
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events.send(last);
}

/// Handle to an open Live session.
pub struct LiveSessionHandle {
    outbound: UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl LiveSessionHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

impl MediaSink for LiveSessionHandle {
    fn send_realtime_input(&self, media: MediaBlob) -> std::result::Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        let json = serde_json::to_string(&ClientMessage::RealtimeInput(media.into()))
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.outbound.send(Message::text(json)).map_err(|_| SendError::NotOpen)
    }
}

impl SessionHandle for LiveSessionHandle {
    fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.outbound
            .send(Message::Close(None))
            .map_err(|_| LiveError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config_for(url: String) -> LiveConfig {
        LiveConfig {
            url,
            ..Default::default()
        }
    }

    #[test]
    fn setup_message_serialization() {
        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(&LiveConfig::default()));
        let parsed: Value = serde_json::to_value(&setup).unwrap();

        assert_eq!(parsed["setup"]["model"], "models/gemini-2.5-flash-native-audio-preview-12-2025");
        assert_eq!(parsed["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            parsed["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert!(parsed["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("SpringBloom"));
    }

    #[test]
    fn realtime_input_routes_by_mime() {
        let audio = ClientMessage::RealtimeInput(
            MediaBlob {
                mime_type: "audio/pcm;rate=16000".to_string(),
                data: "AAAA".to_string(),
            }
            .into(),
        );
        let parsed = serde_json::to_value(&audio).unwrap();
        assert_eq!(parsed, json!({"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}}}));

        let video = ClientMessage::RealtimeInput(
            MediaBlob {
                mime_type: "image/jpeg".to_string(),
                data: "/9j/".to_string(),
            }
            .into(),
        );
        let parsed = serde_json::to_value(&video).unwrap();
        assert_eq!(parsed["realtimeInput"]["video"]["mimeType"], "image/jpeg");
        assert!(parsed["realtimeInput"].get("audio").is_none());
    }

    #[test]
    fn audio_parts_become_events_in_order() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQID"}},
                        {"text": "thinking"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BAUG"}}
                    ]
                }
            }
        });
        let message: ServerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            events_from_server_message(&message),
            vec![SessionEvent::Audio("AQID".to_string()), SessionEvent::Audio("BAUG".to_string())]
        );
    }

    #[test]
    fn binary_frames_are_parsed_as_json() {
        let frame = Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        let message = parse_frame(&frame).unwrap().unwrap();
        assert!(message.setup_complete.is_some());

        let turn_complete = Message::text(r#"{"serverContent":{"turnComplete":true}}"#);
        let message = parse_frame(&turn_complete).unwrap().unwrap();
        assert!(events_from_server_message(&message).is_empty());

        assert!(parse_frame(&Message::Ping(Vec::new().into())).is_none());
    }

    #[tokio::test]
    async fn session_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            let setup: Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");

            ws.send(Message::text(r#"{"setupComplete":{}}"#)).await.unwrap();
            ws.send(Message::text(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}}}"#,
            ))
            .await
            .unwrap();

            let input = ws.next().await.unwrap().unwrap();
            let input: Value = serde_json::from_str(input.to_text().unwrap()).unwrap();
            assert_eq!(input["realtimeInput"]["audio"]["data"], "AAAA");

            ws.close(None).await.unwrap();
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config_for(format!("ws://{}", addr)));
        let session = client.connect(events_tx).await.unwrap();

        assert_eq!(events_rx.recv().await, Some(SessionEvent::Audio("AAA=".to_string())));

        session
            .send_realtime_input(MediaBlob {
                mime_type: "audio/pcm;rate=16000".to_string(),
                data: "AAAA".to_string(),
            })
            .unwrap();

        assert!(matches!(events_rx.recv().await, Some(SessionEvent::Closed(_))));
        assert!(!session.is_open());
        assert_eq!(
            session.send_realtime_input(MediaBlob {
                mime_type: "image/jpeg".to_string(),
                data: String::new(),
            }),
            Err(SendError::NotOpen)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_during_setup_is_a_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _setup = ws.next().await;
            let _ = ws.close(None).await;
        });

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut client = LiveClient::new(config_for(format!("ws://{}", addr)));
        let result = client.connect(events_tx).await;
        assert!(matches!(result, Err(LiveError::SetupNotComplete(_))));
    }

    #[test]
    fn close_is_sent_once() {
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let handle = LiveSessionHandle {
            outbound,
            open: Arc::new(AtomicBool::new(true)),
        };

        handle.close().unwrap();
        handle.close().unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Close(None))));
        assert!(rx.try_recv().is_err());
    }
}
