//! Core logic of the Mr. M commerce mentor: the domain model, the tag
//! extractor, the learner profile, the conversation orchestrator and the
//! live voice adapter. Providers are reached through the traits in
//! `llm_client` so everything here can be driven without a network.

pub mod curriculum;
pub mod error;
pub mod extractor;
pub mod gemini_client;
pub mod generic_types;
pub mod live;
pub mod llm_client;
pub mod models;
pub mod orchestrator;
pub mod profile;
pub mod prompts;
pub mod storage;

pub use error::MentorError;
pub use orchestrator::{ConversationEvent, Mentor, QuizOutcome};
