//! Conversation Orchestrator
//!
//! `Mentor` owns the message log, the task list, the notes and the lesson
//! archive. It drives streamed exchanges with the provider, runs the tag
//! extractor on completed turns and folds the results back into its state.
//!
//! The handle is cheap to clone. Speech synthesis and recommendation refreshes
//! run as spawned tasks on a clone, so a new `send` never waits for them.
//! Messages are addressed by id, so interleaved sends each update only their
//! own placeholder.

use crate::error::MentorError;
use crate::extractor::{self, Extraction};
use crate::llm_client::{ChatSession, MentorClient, StreamChunk, fetch_recommendations};
use crate::models::{
    AcademicMode, ImageAttachment, Lesson, Message, MentorVoice, Note, Profile, Quiz, Source,
    Task, TaskKind,
};
use crate::profile::{ProfileStore, RefreshPolicy};
use crate::prompts;
use crate::storage::{
    KEY_MESSAGES, KEY_NOTES, KEY_PROFILE, KEY_TASKS, KEY_VAULT, SessionStore,
};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc::UnboundedSender};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// State changes pushed to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    MessageAppended(Message),
    TextDelta { id: Uuid, delta: String },
    SourcesUpdated { id: Uuid, sources: Vec<Source> },
    /// The stream behind a model message ended, successfully or not.
    MessageFinalized { id: Uuid },
    QuizAttached { id: Uuid, quiz: Quiz },
    AudioAttached { id: Uuid },
    LessonArchived(Lesson),
    TasksChanged { pending: usize },
    ProfileChanged(Profile),
    /// The whole message log was replaced (mode selection, reset).
    HistoryReplaced(Vec<Message>),
    ModeChanged(Option<AcademicMode>),
}

/// An open provider session bound to a track and a voice.
#[derive(Clone)]
pub struct SessionHandle {
    pub mode: AcademicMode,
    pub voice: MentorVoice,
    chat: Arc<dyn ChatSession>,
}

impl SessionHandle {
    /// Same chat session, different voice.
    fn with_voice(&self, voice: MentorVoice) -> Self {
        Self {
            voice,
            ..self.clone()
        }
    }
}

#[derive(Clone, Default)]
pub enum SessionState {
    #[default]
    AwaitingMode,
    Ready(SessionHandle),
}

impl SessionState {
    pub fn mode(&self) -> Option<AcademicMode> {
        match self {
            SessionState::AwaitingMode => None,
            SessionState::Ready(handle) => Some(handle.mode),
        }
    }
}

/// Result of answering a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuizOutcome {
    pub correct: bool,
    /// A recommendation refresh was started in the background.
    pub refresh_requested: bool,
}

#[derive(Default)]
struct MentorState {
    session: SessionState,
    messages: Vec<Message>,
    notes: Vec<Note>,
    tasks: Vec<Task>,
    vault: Vec<Lesson>,
    dark_mode: bool,
    voice: MentorVoice,
    profile: ProfileStore,
}

impl MentorState {
    fn message_mut(&mut self, id: Uuid) -> Result<&mut Message, MentorError> {
        self.messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(MentorError::MessageNotFound(id))
    }

    fn pending_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.completed).count()
    }
}

#[derive(Clone)]
pub struct Mentor {
    inner: Arc<Mutex<MentorState>>,
    client: Arc<dyn MentorClient>,
    store: SessionStore,
    events: Option<UnboundedSender<ConversationEvent>>,
    policy: RefreshPolicy,
}

impl Mentor {
    /// A mentor with empty state, waiting for a mode.
    pub fn new(client: Arc<dyn MentorClient>, store: SessionStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MentorState::default())),
            client,
            store,
            events: None,
            policy: RefreshPolicy::default(),
        }
    }

    pub fn with_events(mut self, events: UnboundedSender<ConversationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restores a mentor from persistence. A stored mode reopens its session,
    /// greeting the learner when there is no history to show.
    pub async fn load(
        client: Arc<dyn MentorClient>,
        store: SessionStore,
        events: Option<UnboundedSender<ConversationEvent>>,
        policy: RefreshPolicy,
    ) -> Result<Self, MentorError> {
        let snapshot = store.load_snapshot().await?;
        let mentor = Self {
            events,
            policy,
            ..Self::new(client, store)
        };

        let mut guard = mentor.inner.lock().await;
        let state = &mut *guard;
        let profile = snapshot.profile.unwrap_or_default();
        state.voice = snapshot.voice.unwrap_or(profile.preferred_voice);
        state.profile = ProfileStore::new(profile);
        state.messages = snapshot.messages;
        state.notes = snapshot.notes;
        state.tasks = snapshot.tasks;
        state.vault = snapshot.vault;
        state.dark_mode = snapshot.dark_mode;

        if let Some(mode) = snapshot.mode {
            state.session = SessionState::Ready(mentor.open_session(mode, state.voice));
            if state.messages.is_empty() {
                state
                    .messages
                    .push(Message::model(prompts::welcome_back_greeting(mode)));
                mentor.store.save(KEY_MESSAGES, &state.messages).await?;
            }
        }
        info!(
            mode = ?state.session.mode(),
            messages = state.messages.len(),
            tasks = state.tasks.len(),
            lessons = state.vault.len(),
            "Session restored"
        );
        drop(guard);
        Ok(mentor)
    }

    fn emit(&self, event: ConversationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn open_session(&self, mode: AcademicMode, voice: MentorVoice) -> SessionHandle {
        SessionHandle {
            mode,
            voice,
            chat: self.client.open_chat(&prompts::system_instruction(mode)),
        }
    }

    /// Opens a fresh session for `mode` and replaces the history with the
    /// activation greeting.
    pub async fn select_mode(&self, mode: AcademicMode) -> Result<(), MentorError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.session = SessionState::Ready(self.open_session(mode, state.voice));
        state.profile.set_grade(mode.label());
        state.messages = vec![Message::model(prompts::activation_greeting(mode))];

        self.store.save_mode(mode).await?;
        self.store.save(KEY_MESSAGES, &state.messages).await?;
        self.store.save(KEY_PROFILE, state.profile.profile()).await?;
        info!(%mode, "Mode selected");

        self.emit(ConversationEvent::ModeChanged(Some(mode)));
        self.emit(ConversationEvent::HistoryReplaced(state.messages.clone()));
        self.emit(ConversationEvent::ProfileChanged(state.profile.profile().clone()));
        Ok(())
    }

    /// Closes the active session. History stays.
    pub async fn switch_mode(&self) {
        self.inner.lock().await.session = SessionState::AwaitingMode;
        self.emit(ConversationEvent::ModeChanged(None));
    }

    /// Changes the voice. The chat session and its history are kept.
    pub async fn set_voice(&self, voice: MentorVoice) -> Result<(), MentorError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.voice = voice;
        if let SessionState::Ready(handle) = &state.session {
            state.session = SessionState::Ready(handle.with_voice(voice));
        }
        state.profile.set_voice(voice);

        self.store.save_voice(voice).await?;
        self.store.save(KEY_PROFILE, state.profile.profile()).await?;
        self.emit(ConversationEvent::ProfileChanged(state.profile.profile().clone()));
        Ok(())
    }

    /// Sends a learner turn and streams the reply into a new model message.
    ///
    /// Returns the id of the model message. Fails only with `NoActiveSession`.
    /// Provider failures are logged and the message keeps whatever text
    /// arrived; failed writes are logged too.
    #[instrument(skip(self, text, image), fields(len = text.len(), image = image.is_some()))]
    pub async fn send(
        &self,
        text: &str,
        image: Option<ImageAttachment>,
        silent: bool,
    ) -> Result<Uuid, MentorError> {
        let (chat, id) = {
            let mut state = self.inner.lock().await;
            let SessionState::Ready(handle) = &state.session else {
                return Err(MentorError::NoActiveSession);
            };
            let chat = handle.chat.clone();
            if !silent {
                let message = Message::user(text);
                state.messages.push(message.clone());
                self.emit(ConversationEvent::MessageAppended(message));
            }
            let placeholder = Message::placeholder();
            let id = placeholder.id;
            state.messages.push(placeholder.clone());
            self.emit(ConversationEvent::MessageAppended(placeholder));
            (chat, id)
        };

        if !self.stream_reply(chat.as_ref(), id, text, image.as_ref()).await {
            let mut state = self.inner.lock().await;
            if let Ok(message) = state.message_mut(id) {
                message.finalized = true;
                self.emit(ConversationEvent::MessageFinalized { id });
            }
            self.persist_messages(&state).await;
            return Ok(id);
        }

        let Some(reply) = self.complete_turn(id).await else {
            return Ok(id);
        };
        let speech = extractor::speech_text(&reply);
        if !speech.is_empty() {
            let mentor = self.clone();
            tokio::spawn(async move { mentor.attach_speech(id, speech).await });
        }
        Ok(id)
    }

    /// Applies every chunk of the reply. Returns `false` if the exchange failed.
    async fn stream_reply(
        &self,
        chat: &dyn ChatSession,
        id: Uuid,
        text: &str,
        image: Option<&ImageAttachment>,
    ) -> bool {
        let mut stream = match chat.send_stream(text, image).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(%id, error = %e, "Failed to open reply stream");
                return false;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => self.apply_chunk(id, chunk).await,
                Err(e) => {
                    error!(%id, error = %e, "Reply stream failed");
                    return false;
                }
            }
        }
        true
    }

    async fn apply_chunk(&self, id: Uuid, chunk: StreamChunk) {
        let mut state = self.inner.lock().await;
        let Ok(message) = state.message_mut(id) else {
            warn!(%id, "Dropping chunk for a message that no longer exists");
            return;
        };
        message.text.push_str(&chunk.text);
        let sources_changed = message.merge_sources(&chunk.sources);
        let sources = message.sources.clone();

        if !chunk.text.is_empty() {
            self.emit(ConversationEvent::TextDelta {
                id,
                delta: chunk.text,
            });
        }
        if sources_changed {
            self.emit(ConversationEvent::SourcesUpdated { id, sources });
        }
    }

    /// Finalizes a streamed message and folds in its artifacts. Returns the
    /// full text, or `None` if the message was removed meanwhile. Persistence
    /// failures are logged.
    async fn complete_turn(&self, id: Uuid) -> Option<String> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Ok(message) = state.message_mut(id) else {
            warn!(%id, "Reply finished for a message that no longer exists");
            return None;
        };
        message.finalized = true;
        let text = message.text.clone();
        self.emit(ConversationEvent::MessageFinalized { id });

        let extraction = extractor::extract(&text);
        if let Err(e) = self.fold_extraction(state, id, extraction).await {
            warn!(%id, error = %e, "Failed to persist extracted artifacts");
        }
        self.persist_messages(state).await;
        Some(text)
    }

    async fn persist_messages(&self, state: &MentorState) {
        if let Err(e) = self.store.save(KEY_MESSAGES, &state.messages).await {
            warn!(error = %e, "Failed to persist conversation");
        }
    }

    /// Attaches a quiz to message `id` and archives lessons and tasks.
    async fn fold_extraction(
        &self,
        state: &mut MentorState,
        id: Uuid,
        extraction: Extraction,
    ) -> Result<(), MentorError> {
        let Extraction {
            quiz,
            lesson,
            tasks,
        } = extraction;

        if let Some(quiz) = quiz {
            state.message_mut(id)?.quiz = Some(quiz.clone());
            self.emit(ConversationEvent::QuizAttached { id, quiz });
        }
        let archived = lesson.is_some();
        if let Some(mut lesson) = lesson {
            lesson.assign_track(state.session.mode());
            debug!(topic = %lesson.topic, "Archiving lesson");
            state.vault.insert(0, lesson.clone());
            self.emit(ConversationEvent::LessonArchived(lesson));
        }
        let added_tasks = !tasks.is_empty();
        if added_tasks {
            debug!(count = tasks.len(), "Adding extracted tasks");
            state.tasks.splice(0..0, tasks);
            self.emit(ConversationEvent::TasksChanged {
                pending: state.pending_tasks(),
            });
        }

        // State is updated in full before anything is written.
        if archived {
            self.store.save(KEY_VAULT, &state.vault).await?;
        }
        if added_tasks {
            self.store.save(KEY_TASKS, &state.tasks).await?;
        }
        Ok(())
    }

    async fn attach_speech(&self, id: Uuid, text: String) {
        let voice = self.inner.lock().await.voice;
        let audio = match self.client.synthesize_speech(&text, voice).await {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => {
                warn!(%id, "Speech synthesis returned no audio");
                return;
            }
            Err(e) => {
                error!(%id, error = %e, "Speech synthesis failed");
                return;
            }
        };

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match state.message_mut(id) {
            Ok(message) => message.audio = Some(audio),
            Err(_) => return,
        }
        if let Err(e) = self.store.save(KEY_MESSAGES, &state.messages).await {
            error!(error = %e, "Failed to persist synthesized speech");
        }
        self.emit(ConversationEvent::AudioAttached { id });
    }

    /// Starts a deep-dive on a curriculum concept without showing the prompt as a user turn.
    pub async fn select_concept(&self, concept: &str) -> Result<Uuid, MentorError> {
        {
            let mut state = self.inner.lock().await;
            if state.session.mode().is_none() {
                return Err(MentorError::NoActiveSession);
            }
            if state.profile.add_interest(concept) {
                self.store.save(KEY_PROFILE, state.profile.profile()).await?;
                self.emit(ConversationEvent::ProfileChanged(state.profile.profile().clone()));
            }
        }
        self.send(&prompts::concept_prompt(concept), None, true).await
    }

    /// Records the learner's answer. A quiz can be answered once.
    pub async fn answer_quiz(
        &self,
        message_id: Uuid,
        answer: usize,
    ) -> Result<QuizOutcome, MentorError> {
        let outcome = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let quiz = state
                .message_mut(message_id)?
                .quiz
                .as_mut()
                .ok_or(MentorError::NoQuiz(message_id))?;
            if quiz.is_answered() {
                return Err(MentorError::QuizAlreadyAnswered(message_id));
            }
            if answer >= quiz.options.len() {
                return Err(MentorError::AnswerOutOfRange {
                    index: answer,
                    options: quiz.options.len(),
                });
            }
            quiz.user_answer = Some(answer);
            let correct = answer == quiz.correct_index;
            let topic = quiz.topic.clone();

            let profile = state.profile.record_quiz_result(&topic, correct).clone();
            let refresh_requested = self.policy.should_refresh(&profile);
            info!(%topic, correct, progress = profile.progress, "Quiz answered");

            self.store.save(KEY_MESSAGES, &state.messages).await?;
            self.store.save(KEY_PROFILE, &profile).await?;
            self.emit(ConversationEvent::ProfileChanged(profile));
            QuizOutcome {
                correct,
                refresh_requested,
            }
        };

        if outcome.refresh_requested {
            let mentor = self.clone();
            tokio::spawn(async move {
                if let Err(e) = mentor.refresh_recommendations().await {
                    error!(error = %e, "Recommendation refresh failed");
                }
            });
        }
        Ok(outcome)
    }

    /// Fetches recommendations for the current profile and merges them.
    pub async fn refresh_recommendations(&self) -> Result<Profile, MentorError> {
        let snapshot = self.inner.lock().await.profile.profile().clone();
        let recs = fetch_recommendations(self.client.as_ref(), &snapshot).await;

        let mut state = self.inner.lock().await;
        let profile = state.profile.merge_recommendations(recs).clone();
        self.store.save(KEY_PROFILE, &profile).await?;
        self.emit(ConversationEvent::ProfileChanged(profile.clone()));
        Ok(profile)
    }

    /// Appends a completed live-voice turn and extracts artifacts from the
    /// mentor's side. Returns the id of the model message.
    pub async fn record_voice_exchange(
        &self,
        user_text: &str,
        model_text: &str,
    ) -> Result<Uuid, MentorError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let user = Message::user(user_text);
        let model = Message::model(model_text);
        let id = model.id;
        state.messages.push(user.clone());
        state.messages.push(model.clone());
        self.emit(ConversationEvent::MessageAppended(user));
        self.emit(ConversationEvent::MessageAppended(model));

        self.fold_extraction(state, id, extractor::extract(model_text))
            .await?;
        self.store.save(KEY_MESSAGES, &state.messages).await?;
        Ok(id)
    }

    pub async fn add_task(
        &self,
        title: &str,
        description: &str,
        kind: TaskKind,
    ) -> Result<Task, MentorError> {
        let task = Task::new(title, description, kind);
        let mut state = self.inner.lock().await;
        state.tasks.insert(0, task.clone());
        self.store.save(KEY_TASKS, &state.tasks).await?;
        self.emit(ConversationEvent::TasksChanged {
            pending: state.pending_tasks(),
        });
        Ok(task)
    }

    /// Flips completion and returns the new flag.
    pub async fn toggle_task(&self, id: Uuid) -> Result<bool, MentorError> {
        let mut state = self.inner.lock().await;
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(MentorError::TaskNotFound(id))?;
        task.completed = !task.completed;
        let completed = task.completed;
        self.store.save(KEY_TASKS, &state.tasks).await?;
        self.emit(ConversationEvent::TasksChanged {
            pending: state.pending_tasks(),
        });
        Ok(completed)
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), MentorError> {
        let mut state = self.inner.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != id);
        if state.tasks.len() == before {
            return Err(MentorError::TaskNotFound(id));
        }
        self.store.save(KEY_TASKS, &state.tasks).await?;
        self.emit(ConversationEvent::TasksChanged {
            pending: state.pending_tasks(),
        });
        Ok(())
    }

    pub async fn pending_task_count(&self) -> usize {
        self.inner.lock().await.pending_tasks()
    }

    pub async fn add_note(
        &self,
        title: &str,
        content: &str,
        category: &str,
    ) -> Result<Note, MentorError> {
        let note = Note {
            id: Uuid::new_v4(),
            title: title.to_string(),
            content: content.to_string(),
            category: category.to_string(),
            date: Utc::now(),
        };
        let mut state = self.inner.lock().await;
        state.notes.insert(0, note.clone());
        self.store.save(KEY_NOTES, &state.notes).await?;
        Ok(note)
    }

    pub async fn set_dark_mode(&self, dark_mode: bool) -> Result<(), MentorError> {
        self.inner.lock().await.dark_mode = dark_mode;
        self.store.save_theme(dark_mode).await?;
        Ok(())
    }

    /// Clears every stored key and starts over from mode selection.
    pub async fn reset(&self) -> Result<(), MentorError> {
        let mut state = self.inner.lock().await;
        self.store.clear().await?;
        *state = MentorState::default();
        info!("Session reset");
        self.emit(ConversationEvent::ModeChanged(None));
        self.emit(ConversationEvent::HistoryReplaced(Vec::new()));
        self.emit(ConversationEvent::ProfileChanged(state.profile.profile().clone()));
        self.emit(ConversationEvent::TasksChanged { pending: 0 });
        Ok(())
    }

    pub async fn mode(&self) -> Option<AcademicMode> {
        self.inner.lock().await.session.mode()
    }

    pub async fn voice(&self) -> MentorVoice {
        self.inner.lock().await.voice
    }

    pub async fn dark_mode(&self) -> bool {
        self.inner.lock().await.dark_mode
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn message(&self, id: Uuid) -> Option<Message> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// The most recent message carrying an unanswered quiz.
    pub async fn pending_quiz(&self) -> Option<Message> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .rev()
            .find(|m| m.quiz.as_ref().is_some_and(|q| !q.is_answered()))
            .cloned()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.lock().await.tasks.clone()
    }

    pub async fn notes(&self) -> Vec<Note> {
        self.inner.lock().await.notes.clone()
    }

    pub async fn vault(&self) -> Vec<Lesson> {
        self.inner.lock().await.vault.clone()
    }

    pub async fn profile(&self) -> Profile {
        self.inner.lock().await.profile.profile().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{MentorStream, MockMentorClient};
    use crate::storage::{KEY_MODE, KeyValueStore, MemoryStore, StorageError};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    type Script = Vec<Result<StreamChunk, String>>;

    /// A chat session that replays scripted replies in order.
    #[derive(Default)]
    struct ScriptedChat {
        replies: StdMutex<VecDeque<Result<Script, String>>>,
        sent: StdMutex<Vec<(String, bool)>>,
    }

    impl ScriptedChat {
        fn with_replies(replies: Vec<Result<Script, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies.into()),
                sent: StdMutex::default(),
            })
        }

        fn sent(&self) -> Vec<(String, bool)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ChatSession for ScriptedChat {
        async fn send_stream(
            &self,
            text: &str,
            image: Option<&ImageAttachment>,
        ) -> anyhow::Result<MentorStream> {
            self.sent
                .lock()
                .unwrap()
                .push((text.to_string(), image.is_some()));
            let script = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
                .map_err(|e| anyhow!(e))?;
            let items: Vec<anyhow::Result<StreamChunk>> = script
                .into_iter()
                .map(|item| item.map_err(|e| anyhow!(e)))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn text(t: &str) -> Result<StreamChunk, String> {
        Ok(StreamChunk {
            text: t.to_string(),
            sources: Vec::new(),
        })
    }

    fn source(uri: &str) -> Source {
        Source {
            uri: uri.to_string(),
            title: uri.to_string(),
        }
    }

    fn mock_client(chat: Arc<ScriptedChat>, speech: Option<Vec<u8>>) -> MockMentorClient {
        let mut client = MockMentorClient::new();
        client
            .expect_open_chat()
            .returning(move |_| chat.clone() as Arc<dyn ChatSession>);
        match speech {
            Some(audio) => {
                client
                    .expect_synthesize_speech()
                    .returning(move |_, _| Ok(audio.clone()));
            }
            None => {
                client.expect_synthesize_speech().never();
            }
        }
        client
    }

    fn new_mentor(client: MockMentorClient) -> (Mentor, UnboundedReceiver<ConversationEvent>, Arc<MemoryStore>) {
        let kv = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let mentor = Mentor::new(Arc::new(client), SessionStore::new(kv.clone()))
            .with_events(tx)
            .with_refresh_policy(RefreshPolicy::Never);
        (mentor, rx, kv)
    }

    async fn wait_for(
        rx: &mut UnboundedReceiver<ConversationEvent>,
        matches: impl Fn(&ConversationEvent) -> bool,
    ) -> ConversationEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    const LESSON_REPLY: &str = "[LESSON_TITLE] Pricing Strategy\nMarkup adds a margin to cost.\n[FACT: Markup is based on cost]\n[TASK] Draft Memo: Write a one-page summary\n[QUIZ_START]\n[QUIZ_TOPIC]: Pricing\n[QUIZ_QUESTION]: What is markup?\n[QUIZ_OPTION]: A\n[QUIZ_OPTION]: B\n[QUIZ_CORRECT]: 1\n[QUIZ_EXPLANATION]: B is right.\n[QUIZ_END]";

    #[tokio::test]
    async fn test_send_without_mode_is_rejected() {
        let chat = ScriptedChat::with_replies(vec![]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat.clone(), None));
        let err = mentor.send("Hello", None, false).await.unwrap_err();
        assert!(matches!(err, MentorError::NoActiveSession));
        assert!(mentor.messages().await.is_empty());
        assert!(chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_select_mode_replaces_history_with_greeting() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text("Hi")])]);
        let (mentor, _rx, kv) = new_mentor(mock_client(chat, Some(vec![1])));
        mentor.select_mode(AcademicMode::Bba).await.unwrap();
        mentor.send("Hello", None, false).await.unwrap();
        assert_eq!(mentor.messages().await.len(), 3);

        mentor.select_mode(AcademicMode::Mba).await.unwrap();
        let messages = mentor.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.starts_with("Mode Activated: MBA."));
        assert_eq!(mentor.profile().await.grade, "MBA");
        assert_eq!(kv.get(KEY_MODE).await.unwrap().as_deref(), Some("MBA"));
    }

    #[tokio::test]
    async fn test_send_streams_and_extracts_artifacts() {
        let (head, tail) = LESSON_REPLY.split_at(40);
        let chat = ScriptedChat::with_replies(vec![Ok(vec![
            Ok(StreamChunk {
                text: head.to_string(),
                sources: vec![source("https://a.example")],
            }),
            Ok(StreamChunk {
                text: tail.to_string(),
                sources: vec![source("https://a.example"), source("https://b.example")],
            }),
        ])]);
        let (mentor, mut rx, kv) = new_mentor(mock_client(chat.clone(), Some(vec![7, 7])));
        mentor.select_mode(AcademicMode::Twelfth).await.unwrap();

        let id = mentor.send("Teach me pricing", None, false).await.unwrap();
        let message = mentor.message(id).await.unwrap();
        assert_eq!(message.text, LESSON_REPLY);
        assert!(message.finalized);
        assert_eq!(message.sources.len(), 2);
        let quiz = message.quiz.unwrap();
        assert_eq!(quiz.options, vec!["A", "B"]);
        assert_eq!(quiz.correct_index, 1);

        let vault = mentor.vault().await;
        assert_eq!(vault.len(), 1);
        assert_eq!(vault[0].topic, "Pricing Strategy");
        assert_eq!(vault[0].subject, "12th");
        let tasks = mentor.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Draft Memo");

        let messages = mentor.messages().await;
        assert_eq!(messages[1].text, "Teach me pricing");
        assert_eq!(chat.sent(), vec![("Teach me pricing".to_string(), false)]);
        let stored = kv.get(KEY_VAULT).await.unwrap().unwrap();
        assert!(stored.contains("Pricing Strategy"));

        wait_for(&mut rx, |e| matches!(e, ConversationEvent::AudioAttached { id: a } if *a == id)).await;
        assert_eq!(mentor.message(id).await.unwrap().audio, Some(vec![7, 7]));
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_text() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![
            text("[TASK] Half: done"),
            Err("connection reset".to_string()),
            text(" never arrives"),
        ])]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, None));
        mentor.select_mode(AcademicMode::Eleventh).await.unwrap();

        let id = mentor.send("Go", None, false).await.unwrap();
        let message = mentor.message(id).await.unwrap();
        assert_eq!(message.text, "[TASK] Half: done");
        assert!(message.finalized);
        assert!(mentor.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_open_failure_leaves_empty_placeholder() {
        let chat = ScriptedChat::with_replies(vec![Err("unauthorized".to_string())]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, None));
        mentor.select_mode(AcademicMode::Eleventh).await.unwrap();
        let id = mentor.send("Go", None, false).await.unwrap();
        assert_eq!(mentor.message(id).await.unwrap().text, "");
        assert_eq!(mentor.messages().await.len(), 3);
    }

    /// Replies with five chunks tagged by the prompt's first letter, pausing
    /// between chunks.
    struct SlowChat;

    #[async_trait::async_trait]
    impl ChatSession for SlowChat {
        async fn send_stream(
            &self,
            text: &str,
            _image: Option<&ImageAttachment>,
        ) -> anyhow::Result<MentorStream> {
            let tag = text.chars().next().unwrap_or('?');
            let chunks = (0..5).map(move |i| format!("{tag}{i} "));
            Ok(Box::pin(futures::stream::iter(chunks).then(|text| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(StreamChunk {
                    text,
                    sources: Vec::new(),
                })
            })))
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_keep_their_own_text() {
        let mut client = MockMentorClient::new();
        client
            .expect_open_chat()
            .returning(|_| Arc::new(SlowChat) as Arc<dyn ChatSession>);
        client
            .expect_synthesize_speech()
            .returning(|_, _| Ok(vec![1]));
        let (mentor, _rx, _) = new_mentor(client);
        mentor.select_mode(AcademicMode::Mba).await.unwrap();

        let (a, b) = tokio::join!(
            mentor.send("Alpha", None, false),
            mentor.send("Beta", None, false)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let first = mentor.message(a).await.unwrap();
        let second = mentor.message(b).await.unwrap();
        assert_eq!(first.text, "A0 A1 A2 A3 A4 ");
        assert_eq!(second.text, "B0 B1 B2 B3 B4 ");
        assert!(first.finalized && second.finalized);
        assert_eq!(mentor.messages().await.len(), 5);
    }

    /// A memory store whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.set(key, value).await
        }

        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_send_survives_failed_writes() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text(LESSON_REPLY)])]);
        let kv = Arc::new(FlakyStore::default());
        let mentor = Mentor::new(
            Arc::new(mock_client(chat, Some(vec![1]))),
            SessionStore::new(kv.clone()),
        )
        .with_refresh_policy(RefreshPolicy::Never);
        mentor.select_mode(AcademicMode::Bba).await.unwrap();
        kv.failing.store(true, Ordering::SeqCst);

        let id = mentor.send("Teach me pricing", None, false).await.unwrap();
        let message = mentor.message(id).await.unwrap();
        assert!(message.finalized);
        assert!(message.quiz.is_some());
        assert_eq!(mentor.vault().await.len(), 1);
        assert_eq!(mentor.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_select_concept_sends_silently() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text("Markets match buyers.")])]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat.clone(), Some(vec![1])));
        mentor.select_mode(AcademicMode::Twelfth).await.unwrap();

        mentor.select_concept("Financial Markets").await.unwrap();
        let messages = mentor.messages().await;
        assert_eq!(messages.len(), 2, "greeting and reply only");
        assert_eq!(messages[1].text, "Markets match buyers.");
        assert!(chat.sent()[0].0.contains("\"Financial Markets\""));
        assert!(mentor.profile().await.interests.contains("Financial Markets"));
    }

    #[tokio::test]
    async fn test_answer_quiz_once() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text(LESSON_REPLY)])]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, Some(vec![1])));
        mentor.select_mode(AcademicMode::Twelfth).await.unwrap();
        let id = mentor.send("Quiz me", None, false).await.unwrap();
        assert_eq!(mentor.pending_quiz().await.map(|m| m.id), Some(id));

        let err = mentor.answer_quiz(id, 5).await.unwrap_err();
        assert!(matches!(err, MentorError::AnswerOutOfRange { index: 5, options: 2 }));

        let outcome = mentor.answer_quiz(id, 1).await.unwrap();
        assert!(outcome.correct);
        assert!(!outcome.refresh_requested);
        let profile = mentor.profile().await;
        assert!(profile.mastered_topics.contains("Pricing"));
        assert_eq!(profile.progress, 17);
        assert!(mentor.pending_quiz().await.is_none());

        let err = mentor.answer_quiz(id, 0).await.unwrap_err();
        assert!(matches!(err, MentorError::QuizAlreadyAnswered(_)));
        assert_eq!(mentor.message(id).await.unwrap().quiz.unwrap().user_answer, Some(1));
    }

    #[tokio::test]
    async fn test_answer_without_quiz() {
        let chat = ScriptedChat::with_replies(vec![]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, None));
        mentor.select_mode(AcademicMode::Twelfth).await.unwrap();
        let greeting = mentor.messages().await[0].id;
        assert!(matches!(
            mentor.answer_quiz(greeting, 0).await,
            Err(MentorError::NoQuiz(_))
        ));
        assert!(matches!(
            mentor.answer_quiz(Uuid::new_v4(), 0).await,
            Err(MentorError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_answer_triggers_refresh_under_policy() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text(LESSON_REPLY)])]);
        let mut client = mock_client(chat, Some(vec![1]));
        client.expect_generate_json().times(1).returning(|_, _| {
            Ok(serde_json::json!({"recommendedSkills": ["Excel", "Tally", "Negotiation"]}))
        });
        let (mentor, mut rx, _) = new_mentor(client);
        let mentor = mentor.with_refresh_policy(RefreshPolicy::EvenMasteredCount);
        mentor.select_mode(AcademicMode::Eleventh).await.unwrap();
        let id = mentor.send("Quiz me", None, false).await.unwrap();

        let outcome = mentor.answer_quiz(id, 0).await.unwrap();
        assert!(!outcome.correct);
        assert!(outcome.refresh_requested);

        wait_for(&mut rx, |e| {
            matches!(e, ConversationEvent::ProfileChanged(p) if !p.recommended_skills.is_empty())
        })
        .await;
        let profile = mentor.profile().await;
        assert!(profile.struggling_topics.contains("Pricing"));
        assert_eq!(profile.recommended_skills.len(), 3);
        assert_eq!(profile.progress, 15);
    }

    #[tokio::test]
    async fn test_record_voice_exchange_extracts_from_model_side() {
        let chat = ScriptedChat::with_replies(vec![]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, None));
        let id = mentor
            .record_voice_exchange(
                "Give me homework [TASK] Fake: ignored",
                "Sure.\n[CHALLENGE] Audit Drill: Reconcile three ledgers",
            )
            .await
            .unwrap();
        let messages = mentor.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, id);
        let tasks = mentor.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Challenge);
    }

    #[tokio::test]
    async fn test_task_operations() {
        let chat = ScriptedChat::with_replies(vec![]);
        let (mentor, _rx, _) = new_mentor(mock_client(chat, None));
        let first = mentor.add_task("Read", "Chapter 2", TaskKind::Task).await.unwrap();
        let second = mentor.add_task("Plan", "Weekly goals", TaskKind::Goal).await.unwrap();
        assert_eq!(mentor.tasks().await[0].id, second.id);
        assert_eq!(mentor.pending_task_count().await, 2);

        assert!(mentor.toggle_task(first.id).await.unwrap());
        assert_eq!(mentor.pending_task_count().await, 1);
        assert!(!mentor.toggle_task(first.id).await.unwrap());

        mentor.delete_task(first.id).await.unwrap();
        assert!(matches!(
            mentor.delete_task(first.id).await,
            Err(MentorError::TaskNotFound(_))
        ));
        assert_eq!(mentor.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_set_voice_keeps_chat_session() {
        let chat = ScriptedChat::with_replies(vec![Ok(vec![text("one")]), Ok(vec![text("two")])]);
        let mut client = MockMentorClient::new();
        let session = chat.clone();
        client
            .expect_open_chat()
            .times(1)
            .returning(move |_| session.clone() as Arc<dyn ChatSession>);
        client
            .expect_synthesize_speech()
            .returning(|_, _| Ok(vec![1]));
        let (mentor, _rx, _) = new_mentor(client);
        mentor.select_mode(AcademicMode::Bba).await.unwrap();
        mentor.send("first", None, false).await.unwrap();
        mentor.set_voice(MentorVoice::Zephyr).await.unwrap();
        mentor.send("second", None, false).await.unwrap();

        assert_eq!(chat.sent().len(), 2);
        assert_eq!(mentor.voice().await, MentorVoice::Zephyr);
        assert_eq!(mentor.profile().await.preferred_voice, MentorVoice::Zephyr);
    }

    #[tokio::test]
    async fn test_load_restores_session_and_greets() {
        let kv = Arc::new(MemoryStore::new());
        let store = SessionStore::new(kv.clone());
        store.save_mode(AcademicMode::Mba).await.unwrap();
        store.save_voice(MentorVoice::Puck).await.unwrap();
        store
            .save(KEY_TASKS, &vec![Task::new("Saved", "From before", TaskKind::Goal)])
            .await
            .unwrap();

        let chat = ScriptedChat::with_replies(vec![]);
        let mentor = Mentor::load(
            Arc::new(mock_client(chat, None)),
            store.clone(),
            None,
            RefreshPolicy::default(),
        )
        .await
        .unwrap();

        assert_eq!(mentor.mode().await, Some(AcademicMode::Mba));
        assert_eq!(mentor.voice().await, MentorVoice::Puck);
        assert_eq!(mentor.tasks().await.len(), 1);
        let messages = mentor.messages().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.starts_with("Welcome back."));
        assert!(kv.get(KEY_MESSAGES).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_without_mode_awaits_selection() {
        let mut client = MockMentorClient::new();
        client.expect_open_chat().never();
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let mentor = Mentor::load(Arc::new(client), store, None, RefreshPolicy::default())
            .await
            .unwrap();
        assert_eq!(mentor.mode().await, None);
        assert!(mentor.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let chat = ScriptedChat::with_replies(vec![]);
        let (mentor, _rx, kv) = new_mentor(mock_client(chat, None));
        mentor.select_mode(AcademicMode::Bba).await.unwrap();
        mentor.add_task("Read", "Chapter 2", TaskKind::Task).await.unwrap();
        mentor.add_note("Ledger", "Debit the receiver", "Accounts").await.unwrap();
        mentor.set_dark_mode(true).await.unwrap();

        mentor.reset().await.unwrap();
        assert_eq!(mentor.mode().await, None);
        assert!(mentor.messages().await.is_empty());
        assert!(mentor.tasks().await.is_empty());
        assert!(mentor.notes().await.is_empty());
        assert!(!mentor.dark_mode().await);
        assert_eq!(mentor.profile().await, Profile::default());
        assert_eq!(kv.get(KEY_MODE).await.unwrap(), None);
        assert!(matches!(
            mentor.send("Hi", None, false).await,
            Err(MentorError::NoActiveSession)
        ));
    }
}
