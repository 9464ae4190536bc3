use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the conversation orchestrator to its caller.
///
/// Provider failures during a streamed exchange are not part of this type:
/// they are logged and leave the partial message in place.
#[derive(Debug, Error)]
pub enum MentorError {
    #[error("No academic mode selected; choose a mode to open a session")]
    NoActiveSession,
    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("Message {0} has no quiz")]
    NoQuiz(Uuid),
    #[error("Quiz on message {0} was already answered")]
    QuizAlreadyAnswered(Uuid),
    #[error("Answer {index} is out of range for a quiz with {options} options")]
    AnswerOutOfRange { index: usize, options: usize },
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
