//! Gemini REST client.
//!
//! Chat replies are streamed over server-sent events with Google Search
//! grounding enabled. Structured output and speech synthesis use the plain
//! `generateContent` endpoint.

use crate::llm_client::{
    ChatSession, MentorClient, MentorStream, ModelSet, StreamChunk, record_reply,
};
use crate::models::{ImageAttachment, MentorVoice, Source};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user(text: &str, image: Option<&ImageAttachment>) -> Self {
        let mut parts = vec![Part::text(text)];
        if let Some(image) = image {
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.data.clone(),
                }),
            });
        }
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    fn model(text: String) -> Self {
        Self {
            role: Some("model".to_string()),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    generation_config: serde_json::Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

impl GenerateContentResponse {
    fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }

    fn text(&self) -> String {
        self.first_parts()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect()
    }

    fn sources(&self) -> Vec<Source> {
        self.candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|meta| {
                meta.grounding_chunks
                    .iter()
                    .filter_map(|chunk| chunk.web.as_ref())
                    .filter_map(|web| {
                        let uri = web.uri.clone()?;
                        let title = web.title.clone().unwrap_or_else(|| uri.clone());
                        Some(Source { uri, title })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Incremental decoder for a `text/event-stream` body. Yields the `data`
/// payload of each complete event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                self.data.push(payload.trim_start().to_string());
            }
        }
        events
    }

    /// Flushes an event left unterminated at end of body.
    pub fn finish(&mut self) -> Option<String> {
        let _ = self.push(b"\n");
        if self.data.is_empty() {
            None
        } else {
            let event = self.data.join("\n");
            self.data.clear();
            Some(event)
        }
    }
}

fn parse_stream_payload(payload: &str) -> Result<StreamChunk> {
    let response: GenerateContentResponse =
        serde_json::from_str(payload).context("Malformed stream event")?;
    Ok(StreamChunk {
        text: response.text(),
        sources: response.sources(),
    })
}

/// Decodes a streamed SSE body into non-empty chat chunks. A transport error
/// is yielded once and ends the stream.
fn chunk_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamChunk>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    futures::stream::unfold(
        (
            Box::pin(bytes),
            SseDecoder::default(),
            VecDeque::<String>::new(),
            false,
        ),
        |(mut bytes, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(payload) = pending.pop_front() {
                    let chunk = parse_stream_payload(&payload);
                    return Some((chunk, (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(chunk.as_ref())),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e.into()), (bytes, decoder, pending, done)));
                    }
                    None => {
                        done = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .try_filter(|chunk| {
        futures::future::ready(!chunk.text.is_empty() || !chunk.sources.is_empty())
    })
}

fn decode_speech(response: &GenerateContentResponse) -> Result<Vec<u8>> {
    let data = response
        .first_parts()
        .iter()
        .find_map(|p| p.inline_data.as_ref())
        .context("No audio in speech response")?;
    STANDARD
        .decode(&data.data)
        .context("Speech payload was not valid base64")
}

/// Connection details shared by the client and its chat sessions.
#[derive(Debug, Clone)]
struct Endpoint {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Endpoint {
    async fn post(
        &self,
        model: &str,
        method: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(format!("{}/models/{}:{}", self.base_url, model, method))
            .header("x-goog-api-key", &self.api_key)
            .json(body);
        if method == "streamGenerateContent" {
            request = request.query(&[("alt", "sse")]);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Gemini {method} failed with {status}: {body}");
        }
        Ok(response)
    }

    async fn generate(
        &self,
        model: &str,
        body: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let response = self.post(model, "generateContent", body).await?;
        Ok(response.json().await?)
    }
}

/// An implementation of `MentorClient` for the Gemini API.
pub struct GeminiClient {
    endpoint: Endpoint,
    models: ModelSet,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, models: ModelSet) -> Self {
        Self::with_base_url(api_key, models, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        models: ModelSet,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: Endpoint {
                http: reqwest::Client::new(),
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key: api_key.into(),
            },
            models,
        }
    }
}

struct GeminiChatSession {
    endpoint: Endpoint,
    model: String,
    system_instruction: String,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiChatSession {
    fn request(&self, contents: Vec<Content>) -> GenerateContentRequest {
        GenerateContentRequest {
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text(self.system_instruction.clone())],
            }),
            contents,
            generation_config: json!({ "temperature": 0.8 }),
            tools: vec![json!({ "googleSearch": {} })],
        }
    }
}

#[async_trait]
impl ChatSession for GeminiChatSession {
    async fn send_stream(
        &self,
        text: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<MentorStream> {
        let contents = {
            let mut history = self
                .history
                .lock()
                .map_err(|_| anyhow!("Chat history lock poisoned"))?;
            history.push(Content::user(text, image));
            history.clone()
        };
        let body = self.request(contents);
        let response = self
            .endpoint
            .post(&self.model, "streamGenerateContent", &body)
            .await?;

        let events = chunk_stream(response.bytes_stream());

        let history = self.history.clone();
        Ok(record_reply(events, move |reply| {
            if let Ok(mut history) = history.lock() {
                history.push(Content::model(reply));
            }
        }))
    }
}

#[async_trait]
impl MentorClient for GeminiClient {
    fn open_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession> {
        Arc::new(GeminiChatSession {
            endpoint: self.endpoint.clone(),
            model: self.models.chat.clone(),
            system_instruction: system_instruction.to_string(),
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn generate_json(
        &self,
        prompt: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body = structured_request(prompt, schema);
        let response = self.endpoint.generate(&self.models.structured, &body).await?;
        let text = response.text();
        debug!(len = text.len(), "Structured response received");
        serde_json::from_str(&text).context("Structured response was not valid JSON")
    }

    async fn synthesize_speech(&self, text: &str, voice: MentorVoice) -> Result<Vec<u8>> {
        let body = speech_request(text, voice);
        let response = self.endpoint.generate(&self.models.speech, &body).await?;
        decode_speech(&response)
    }
}

fn structured_request(prompt: &str, schema: serde_json::Value) -> GenerateContentRequest {
    GenerateContentRequest {
        system_instruction: None,
        contents: vec![Content::user(prompt, None)],
        generation_config: json!({
            "responseMimeType": "application/json",
            "responseJsonSchema": schema,
        }),
        tools: Vec::new(),
    }
}

fn speech_request(text: &str, voice: MentorVoice) -> GenerateContentRequest {
    GenerateContentRequest {
        system_instruction: None,
        contents: vec![Content {
            role: None,
            parts: vec![Part::text(format!("Say naturally: {text}"))],
        }],
        generation_config: json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice.name() } }
            }
        }),
        tools: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_handles_split_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\r\n").is_empty());
        let events = decoder.push(b"\r\ndata: {\"b\":2}\n\n: comment\n");
        assert_eq!(events, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_chunk_stream_decodes_split_body() {
        let body: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Mar".to_vec()),
            Ok(b"gin\"}]}}]}\n\ndata: {\"usageMetadata\":{}}\n\n".to_vec()),
            Ok(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"s.\"}]}}]}".to_vec()),
        ];
        let chunks: Vec<StreamChunk> = chunk_stream(futures::stream::iter(body))
            .try_collect()
            .await
            .unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Margin", "s."]);
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_after_transport_error() {
        let body: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n".to_vec()),
            Err(std::io::Error::other("reset")),
            Ok(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lost\"}]}}]}\n\n".to_vec()),
        ];
        let items: Vec<Result<StreamChunk>> =
            chunk_stream(futures::stream::iter(body)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "Hi");
        assert!(items[1].is_err());
    }

    #[test]
    fn test_sse_decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn test_parse_stream_payload_with_grounding() {
        let payload = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Markup is "}, {"text": "added cost."}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://rbi.org.in", "title": "RBI"}},
                    {"web": {"uri": "https://nse.in"}},
                    {"retrievedContext": {}}
                ]}
            }]
        }"#;
        let chunk = parse_stream_payload(payload).unwrap();
        assert_eq!(chunk.text, "Markup is added cost.");
        assert_eq!(chunk.sources.len(), 2);
        assert_eq!(chunk.sources[1].title, "https://nse.in");
    }

    #[test]
    fn test_parse_stream_payload_without_candidates() {
        let chunk = parse_stream_payload(r#"{"usageMetadata": {}}"#).unwrap();
        assert_eq!(chunk, StreamChunk::default());
        assert!(parse_stream_payload("not json").is_err());
    }

    #[test]
    fn test_chat_request_shape() {
        let session = GeminiChatSession {
            endpoint: Endpoint {
                http: reqwest::Client::new(),
                base_url: DEFAULT_BASE_URL.to_string(),
                api_key: "key".to_string(),
            },
            model: "gemini-3-flash-preview".to_string(),
            system_instruction: "You are Mr. M".to_string(),
            history: Arc::new(Mutex::new(Vec::new())),
        };
        let image = ImageAttachment {
            data: "aGk=".to_string(),
            mime_type: "image/jpeg".to_string(),
        };
        let body = session.request(vec![Content::user("Solve this", Some(&image))]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are Mr. M");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(json["tools"][0], json!({"googleSearch": {}}));
        assert_eq!(json["generationConfig"]["temperature"], 0.8);
    }

    #[test]
    fn test_structured_and_speech_requests() {
        let body = structured_request("recommend", json!({"type": "object"}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["generationConfig"]["responseMimeType"], "application/json");
        assert!(json.get("tools").is_none());
        assert!(json.get("systemInstruction").is_none());

        let body = speech_request("Hello", MentorVoice::Charon);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Charon"
        );
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Say naturally: Hello");
    }

    #[test]
    fn test_decode_speech() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"AAEC"}}]}}]}"#,
        )
        .unwrap();
        assert_eq!(decode_speech(&response).unwrap(), vec![0, 1, 2]);
        assert!(decode_speech(&GenerateContentResponse::default()).is_err());
    }
}
