use crate::models::MentorVoice;

/// Generic configuration for opening a live voice session with any provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSessionConfig {
    pub voice: MentorVoice,
    pub instructions: String,
}

/// Generic events that a live voice provider emits back to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// The provider acknowledged the session setup.
    SetupComplete,
    /// A transcription delta of the learner's speech.
    InputTranscript(String),
    /// A transcription delta of the mentor's speech.
    OutputTranscript(String),
    /// A frame of spoken audio from the mentor, 24kHz PCM16 mono.
    Audio(Vec<i16>),
    /// The learner spoke over the mentor; queued playback must stop.
    Interrupted,
    /// The mentor finished its turn.
    TurnComplete,
    /// An error from the provider.
    Error(String),
    /// The connection was closed.
    Closed,
}
