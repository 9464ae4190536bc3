//! Response Tag Extraction
//!
//! The mentor embeds bracketed sentinels in its free-form answers
//! (`[QUIZ_START]`, `[LESSON_TITLE]`, `[TASK]`, ...). This module turns those
//! sentinels into typed artifacts. Extraction is total: anything missing or
//! malformed degrades to defaults or to an absent artifact, never to an error.
//!
//! The grammar is applied in two passes. The first complete quiz block is
//! parsed and every complete quiz block is carved out of the text; lesson and
//! task matching then run on the remainder, so option lines inside a quiz can
//! never be mistaken for tasks.

use crate::models::{CaseStudy, Lesson, Quiz, Task, TaskKind, Tone};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_QUIZ_TOPIC: &str = "Concept Check";
const DEFAULT_QUIZ_QUESTION: &str = "Analyze the scenario...";
const DEFAULT_QUIZ_EXPLANATION: &str = "Great insight.";
const DEFAULT_LESSON_TITLE: &str = "New Lesson";
const LESSON_TITLE_TAG: &str = "[LESSON_TITLE]";
const CASE_STUDY_START: &str = "[CASE_STUDY_START]";
const CASE_STUDY_END: &str = "[CASE_STUDY_END]";

static QUIZ_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[QUIZ_START\](.*?)\[QUIZ_END\]").unwrap());
static QUIZ_TOPIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[QUIZ_TOPIC\]:[ \t]*(.*)").unwrap());
static QUIZ_QUESTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[QUIZ_QUESTION\]:[ \t]*(.*)").unwrap());
static QUIZ_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[QUIZ_OPTION\]:[ \t]*(.*)").unwrap());
static QUIZ_CORRECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[QUIZ_CORRECT\]:[ \t]*(\d+)").unwrap());
static QUIZ_EXPLANATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[QUIZ_EXPLANATION\]:[ \t]*(.*)").unwrap());
static LESSON_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[LESSON_TITLE\][ \t]*:?([^\n]*)").unwrap());
static FACT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[FACT:\s*([^\]]+)\]").unwrap());
static SENTINEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]+\]").unwrap());
static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\[(TASK|CHALLENGE|GOAL)\][ \t]*([^:\n]+):[ \t]*([^\n]+)").unwrap()
});
static SPEECH_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|###|\*\*").unwrap());

/// Everything recognized in a single model turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub quiz: Option<Quiz>,
    pub lesson: Option<Lesson>,
    pub tasks: Vec<Task>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.quiz.is_none() && self.lesson.is_none() && self.tasks.is_empty()
    }
}

/// Extracts all artifacts from `text`, stamping lessons with the current time.
pub fn extract(text: &str) -> Extraction {
    extract_at(text, Utc::now())
}

/// Extracts all artifacts from `text`, stamping lessons with `now`.
pub fn extract_at(text: &str, now: DateTime<Utc>) -> Extraction {
    let quiz = QUIZ_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|block| parse_quiz(block.as_str()));
    let remainder = strip_quiz_blocks(text);

    Extraction {
        quiz,
        lesson: parse_lesson(&remainder, now),
        tasks: parse_tasks(&remainder),
    }
}

/// Removes every complete quiz block, leaving the prose around it.
pub fn strip_quiz_blocks(text: &str) -> String {
    QUIZ_BLOCK.replace_all(text, "").trim().to_string()
}

/// Text suitable for speech synthesis: sentinels and markdown emphasis removed.
pub fn speech_text(text: &str) -> String {
    SPEECH_NOISE.replace_all(text, "").trim().to_string()
}

fn capture_line(re: &Regex, block: &str) -> Option<String> {
    re.captures(block)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_quiz(block: &str) -> Option<Quiz> {
    let options: Vec<String> = QUIZ_OPTION
        .captures_iter(block)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();
    let correct_index = QUIZ_CORRECT
        .captures(block)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(0);

    // An unanswerable quiz is dropped rather than shown.
    if options.is_empty() {
        debug!("Discarding quiz block without options");
        return None;
    }
    if correct_index >= options.len() {
        debug!(
            correct_index,
            options = options.len(),
            "Discarding quiz block with out-of-range answer"
        );
        return None;
    }

    Some(Quiz {
        topic: capture_line(&QUIZ_TOPIC, block).unwrap_or_else(|| DEFAULT_QUIZ_TOPIC.into()),
        question: capture_line(&QUIZ_QUESTION, block)
            .unwrap_or_else(|| DEFAULT_QUIZ_QUESTION.into()),
        options,
        correct_index,
        explanation: capture_line(&QUIZ_EXPLANATION, block)
            .unwrap_or_else(|| DEFAULT_QUIZ_EXPLANATION.into()),
        user_answer: None,
    })
}

fn parse_lesson(text: &str, now: DateTime<Utc>) -> Option<Lesson> {
    if !text.contains(LESSON_TITLE_TAG) {
        return None;
    }
    let title = capture_line(&LESSON_TITLE, text).unwrap_or_else(|| DEFAULT_LESSON_TITLE.into());
    let facts = FACT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();

    let mut lesson = Lesson {
        id: Uuid::new_v4(),
        subject: String::new(),
        class: String::new(),
        chapter: "Session Archive".to_string(),
        topic: title,
        content: SENTINEL.replace_all(text, "").trim().to_string(),
        case_study: parse_case_study(text),
        facts,
        date: now,
        tone: Tone::SemiFormal,
    };
    lesson.assign_track(None);
    Some(lesson)
}

fn parse_case_study(text: &str) -> Option<CaseStudy> {
    let start = text.find(CASE_STUDY_START)? + CASE_STUDY_START.len();
    let end = text.find(CASE_STUDY_END)?;
    if end < start {
        return None;
    }
    let content = text[start..end].trim();
    if content.is_empty() {
        return None;
    }
    Some(CaseStudy {
        title: "Case Insight".to_string(),
        content: content.to_string(),
    })
}

fn parse_tasks(text: &str) -> Vec<Task> {
    TASK_LINE
        .captures_iter(text)
        .filter_map(|caps| {
            let kind = caps.get(1)?.as_str().parse::<TaskKind>().ok()?;
            let title = caps.get(2)?.as_str().trim();
            let description = caps.get(3)?.as_str().trim();
            if title.is_empty() {
                return None;
            }
            Some(Task::new(title, description, kind))
        })
        .collect()
}
