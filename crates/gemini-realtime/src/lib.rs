//! Client for the Gemini Live (BidiGenerateContent) WebSocket API.
//!
//! `connect` performs the setup handshake and splits the socket into a
//! `LiveSender` for microphone audio and a `LiveReceiver` that decodes server
//! messages into `ServerEvent`s.

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

const LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(Setup),
        RealtimeInput(RealtimeInput),
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Setup {
        pub model: String,
        pub generation_config: GenerationConfig,
        pub system_instruction: Content,
        pub input_audio_transcription: Empty,
        pub output_audio_transcription: Empty,
    }

    #[derive(Serialize, Default)]
    pub(super) struct Empty {}

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<ResponseModality>,
        pub speech_config: SpeechConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub(super) enum ResponseModality {
        Audio,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct SpeechConfig {
        pub voice_config: VoiceConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct VoiceConfig {
        pub prebuilt_voice_config: PrebuiltVoiceConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct PrebuiltVoiceConfig {
        pub voice_name: String,
    }

    #[derive(Serialize)]
    pub(super) struct Content {
        pub parts: Vec<Part>,
    }

    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }

    #[derive(Serialize)]
    pub(super) struct RealtimeInput {
        pub audio: Blob,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        pub setup_complete: Option<serde_json::Value>,
        pub server_content: Option<ServerContent>,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerContent {
        pub model_turn: Option<ServerTurn>,
        pub input_transcription: Option<Transcription>,
        pub output_transcription: Option<Transcription>,
        pub interrupted: Option<bool>,
        pub turn_complete: Option<bool>,
    }

    #[derive(Deserialize, Debug, Default)]
    pub(super) struct ServerTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        pub inline_data: Option<ServerBlob>,
    }

    #[derive(Deserialize, Debug, Default)]
    pub(super) struct ServerBlob {
        pub data: String,
    }

    #[derive(Deserialize, Debug, Default)]
    pub(super) struct Transcription {
        #[serde(default)]
        pub text: String,
    }
}

/// Parameters for opening a live session.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

/// A decoded message from the Live API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    InputTranscription(String),
    OutputTranscription(String),
    /// 24kHz PCM16 mono samples.
    Audio(Vec<i16>),
    Interrupted,
    TurnComplete,
}

fn setup_message(config: &LiveConfig) -> wire::ClientMessage {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };
    wire::ClientMessage::Setup(wire::Setup {
        model,
        generation_config: wire::GenerationConfig {
            response_modalities: vec![wire::ResponseModality::Audio],
            speech_config: wire::SpeechConfig {
                voice_config: wire::VoiceConfig {
                    prebuilt_voice_config: wire::PrebuiltVoiceConfig {
                        voice_name: config.voice_name.clone(),
                    },
                },
            },
        },
        system_instruction: wire::Content {
            parts: vec![wire::Part {
                text: config.system_instruction.clone(),
            }],
        },
        input_audio_transcription: wire::Empty::default(),
        output_audio_transcription: wire::Empty::default(),
    })
}

fn audio_message(samples: &[i16]) -> wire::ClientMessage {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    wire::ClientMessage::RealtimeInput(wire::RealtimeInput {
        audio: wire::Blob {
            mime_type: INPUT_MIME_TYPE.to_string(),
            data: STANDARD.encode(bytes),
        },
    })
}

fn decode_pcm16(data: &str) -> Result<Vec<i16>> {
    let bytes = STANDARD
        .decode(data)
        .context("Audio payload was not valid base64")?;
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Decodes one server message into zero or more events, in the order the
/// application should apply them.
pub fn parse_server_message(text: &str) -> Result<Vec<ServerEvent>> {
    let message: wire::ServerMessage =
        serde_json::from_str(text).context("Malformed Live API message")?;
    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }
    let Some(content) = message.server_content else {
        return Ok(events);
    };
    if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
        events.push(ServerEvent::InputTranscription(t.text));
    }
    if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
        events.push(ServerEvent::OutputTranscription(t.text));
    }
    if let Some(turn) = content.model_turn {
        for blob in turn.parts.into_iter().filter_map(|p| p.inline_data) {
            match decode_pcm16(&blob.data) {
                Ok(samples) => events.push(ServerEvent::Audio(samples)),
                Err(e) => warn!(error = %e, "Skipping undecodable audio chunk"),
            }
        }
    }
    if content.interrupted == Some(true) {
        events.push(ServerEvent::Interrupted);
    }
    if content.turn_complete == Some(true) {
        events.push(ServerEvent::TurnComplete);
    }
    Ok(events)
}

/// Events of one text frame. A frame that does not parse is logged and skipped.
fn message_events(text: &str) -> Vec<ServerEvent> {
    parse_server_message(text).unwrap_or_else(|e| {
        warn!(error = %e, "Skipping unparseable Live API message");
        debug!(raw = %text, "Unparseable message body");
        Vec::new()
    })
}

/// Writing half of a live session.
pub struct LiveSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl LiveSender {
    /// Sends one frame of 16kHz PCM16 microphone audio.
    pub async fn send_audio(&mut self, samples: &[i16]) -> Result<()> {
        let payload = serde_json::to_string(&audio_message(samples))?;
        self.sink.send(WsMessage::Text(payload.into())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.send(WsMessage::Close(None)).await?;
        Ok(())
    }
}

/// Reading half of a live session.
pub struct LiveReceiver {
    stream: SplitStream<WsStream>,
    pending: VecDeque<ServerEvent>,
}

impl LiveReceiver {
    /// Returns the next event, or `None` once the server closed the connection.
    pub async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            let text = match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => text.to_string(),
                Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        warn!(len = data.len(), "Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Live session closed by server");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            self.pending.extend(message_events(&text));
        }
    }
}

/// Connects and sends the session setup. The caller should wait for
/// `ServerEvent::SetupComplete` before streaming audio.
pub async fn connect(config: &LiveConfig) -> Result<(LiveSender, LiveReceiver)> {
    let url = format!("{LIVE_URL}?key={}", config.api_key);
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to the Live API")?;
    info!(model = %config.model, voice = %config.voice_name, "Connected to Gemini Live");
    let (mut sink, stream) = ws_stream.split();

    let setup = serde_json::to_string(&setup_message(config))?;
    sink.send(WsMessage::Text(setup.into())).await?;

    Ok((
        LiveSender { sink },
        LiveReceiver {
            stream,
            pending: VecDeque::new(),
        },
    ))
}
