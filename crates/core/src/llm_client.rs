use crate::models::{ImageAttachment, MentorVoice, Profile, Recommendations, Source};
use crate::profile::recommendation_prompt;
use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, CreateSpeechRequestArgs, ImageUrlArgs, ResponseFormat,
        ResponseFormatJsonSchema, SpeechModel, SpeechResponseFormat, Voice,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// One increment of a streamed model reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub sources: Vec<Source>,
}

/// A stream of reply increments from the provider.
pub type MentorStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Model identifiers used for the different kinds of request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSet {
    /// Streaming chat model.
    pub chat: String,
    /// Model used for schema-constrained JSON output.
    pub structured: String,
    /// Text-to-speech model.
    pub speech: String,
}

/// A conversation held with the provider. The history lives inside the
/// session; callers only send the new turn.
#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn send_stream(
        &self,
        text: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<MentorStream>;
}

/// Entry point to a generative provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MentorClient: Send + Sync {
    /// Opens a fresh chat session with the given system instruction.
    fn open_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession>;

    /// Requests JSON output constrained by `schema`.
    async fn generate_json(
        &self,
        prompt: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Synthesizes speech and returns raw 24kHz mono PCM16 bytes.
    async fn synthesize_speech(&self, text: &str, voice: MentorVoice) -> Result<Vec<u8>>;
}

/// Wraps a reply stream so the full reply text is handed to `on_complete`
/// once the stream is exhausted.
pub(crate) fn record_reply<S, F>(stream: S, on_complete: F) -> MentorStream
where
    S: Stream<Item = Result<StreamChunk>> + Send + 'static,
    F: FnOnce(String) + Send + 'static,
{
    let reply = Arc::new(Mutex::new(String::new()));
    let collected = reply.clone();
    let body = stream.inspect(move |item| {
        if let Ok(chunk) = item {
            if let Ok(mut text) = collected.lock() {
                text.push_str(&chunk.text);
            }
        }
    });
    let finish = futures::stream::once(async move {
        let text = reply.lock().map(|t| t.clone()).unwrap_or_default();
        on_complete(text);
    })
    .filter_map(|()| futures::future::ready(None));
    Box::pin(body.chain(finish))
}

/// JSON schema of the recommendation payload.
pub fn recommendations_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Recommendations)).unwrap_or_default()
}

/// Asks the structured-output model for career and skill recommendations.
///
/// Failures are logged and yield empty recommendations, which leave the
/// profile unchanged when merged.
pub async fn fetch_recommendations(client: &dyn MentorClient, profile: &Profile) -> Recommendations {
    let prompt = recommendation_prompt(profile);
    let result = client
        .generate_json(&prompt, recommendations_schema())
        .await
        .and_then(|value| {
            serde_json::from_value::<Recommendations>(value)
                .context("Recommendation payload did not match schema")
        });
    match result {
        Ok(recs) => recs,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch recommendations");
            Recommendations::default()
        }
    }
}

/// An implementation of `MentorClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    models: ModelSet,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `models` - The model identifiers to use for chat, structured output and speech.
    pub fn new(config: OpenAIConfig, models: ModelSet) -> Self {
        Self {
            client: Client::with_config(config),
            models,
        }
    }
}

struct OpenAIChatSession {
    client: Client<OpenAIConfig>,
    model: String,
    history: Arc<Mutex<Vec<ChatCompletionRequestMessage>>>,
}

fn user_message(
    text: &str,
    image: Option<&ImageAttachment>,
) -> Result<ChatCompletionRequestMessage> {
    let message = match image {
        None => ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()?,
        Some(image) => {
            let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
                ChatCompletionRequestMessageContentPartTextArgs::default()
                    .text(text)
                    .build()?
                    .into(),
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(
                        ImageUrlArgs::default()
                            .url(format!("data:{};base64,{}", image.mime_type, image.data))
                            .build()?,
                    )
                    .build()?
                    .into(),
            ];
            ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()?
        }
    };
    Ok(message.into())
}

#[async_trait]
impl ChatSession for OpenAIChatSession {
    async fn send_stream(
        &self,
        text: &str,
        image: Option<&ImageAttachment>,
    ) -> Result<MentorStream> {
        let messages = {
            let mut history = self
                .history
                .lock()
                .map_err(|_| anyhow!("Chat history lock poisoned"))?;
            history.push(user_message(text, image)?);
            history.clone()
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.8)
            .stream(true)
            .build()?;
        let stream = self.client.chat().create_stream(request).await?;

        let chunks = stream.filter_map(|result| async move {
            match result {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .filter(|content| !content.is_empty())
                    .map(|text| {
                        Ok(StreamChunk {
                            text,
                            sources: Vec::new(),
                        })
                    }),
                Err(e) => Some(Err(e.into())),
            }
        });

        let history = self.history.clone();
        Ok(record_reply(chunks, move |reply| {
            let Ok(message) = ChatCompletionRequestAssistantMessageArgs::default()
                .content(reply)
                .build()
            else {
                return;
            };
            if let Ok(mut history) = history.lock() {
                history.push(message.into());
            }
        }))
    }
}

fn openai_voice(voice: MentorVoice) -> Voice {
    match voice {
        MentorVoice::Kore => Voice::Nova,
        MentorVoice::Puck => Voice::Fable,
        MentorVoice::Charon => Voice::Onyx,
        MentorVoice::Fenrir => Voice::Echo,
        MentorVoice::Zephyr => Voice::Alloy,
    }
}

#[async_trait]
impl MentorClient for OpenAICompatibleClient {
    fn open_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession> {
        let mut history = Vec::new();
        match ChatCompletionRequestSystemMessageArgs::default()
            .content(system_instruction)
            .build()
        {
            Ok(system) => history.push(system.into()),
            Err(e) => tracing::warn!(error = %e, "Failed to build system message"),
        }
        Arc::new(OpenAIChatSession {
            client: self.client.clone(),
            model: self.models.chat.clone(),
            history: Arc::new(Mutex::new(history)),
        })
    }

    async fn generate_json(
        &self,
        prompt: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.models.structured)
            .messages(vec![
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: "structured_output".to_string(),
                    schema: Some(schema),
                    strict: None,
                },
            })
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_deref()
            .context("No content in LLM response")?;
        serde_json::from_str(content).context("Structured response was not valid JSON")
    }

    async fn synthesize_speech(&self, text: &str, voice: MentorVoice) -> Result<Vec<u8>> {
        let request = CreateSpeechRequestArgs::default()
            .model(SpeechModel::Other(self.models.speech.clone()))
            .input(text)
            .voice(openai_voice(voice))
            .response_format(SpeechResponseFormat::Pcm)
            .build()?;
        let response = self.client.audio().speech(request).await?;
        Ok(response.bytes.to_vec())
    }
}
