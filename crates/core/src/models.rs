//! Domain Model
//!
//! The data structures shared by the extractor, the profile store and the
//! conversation orchestrator. Everything here is persisted as camelCase JSON,
//! with dates written as RFC 3339 strings.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a label cannot be parsed into one of the fixed enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

/// The academic track the mentor is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcademicMode {
    #[serde(rename = "11th")]
    Eleventh,
    #[serde(rename = "12th")]
    Twelfth,
    #[serde(rename = "BBA")]
    Bba,
    #[serde(rename = "MBA")]
    Mba,
}

impl AcademicMode {
    pub const ALL: [AcademicMode; 4] = [
        AcademicMode::Eleventh,
        AcademicMode::Twelfth,
        AcademicMode::Bba,
        AcademicMode::Mba,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            AcademicMode::Eleventh => "11th",
            AcademicMode::Twelfth => "12th",
            AcademicMode::Bba => "BBA",
            AcademicMode::Mba => "MBA",
        }
    }
}

impl fmt::Display for AcademicMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AcademicMode {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AcademicMode::ALL
            .into_iter()
            .find(|mode| mode.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLabelError {
                kind: "academic mode",
                value: s.to_string(),
            })
    }
}

/// Prebuilt voices the mentor can speak with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MentorVoice {
    #[default]
    Kore,
    Puck,
    Charon,
    Fenrir,
    Zephyr,
}

impl MentorVoice {
    pub const ALL: [MentorVoice; 5] = [
        MentorVoice::Kore,
        MentorVoice::Puck,
        MentorVoice::Charon,
        MentorVoice::Fenrir,
        MentorVoice::Zephyr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MentorVoice::Kore => "Kore",
            MentorVoice::Puck => "Puck",
            MentorVoice::Charon => "Charon",
            MentorVoice::Fenrir => "Fenrir",
            MentorVoice::Zephyr => "Zephyr",
        }
    }
}

impl fmt::Display for MentorVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MentorVoice {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MentorVoice::ALL
            .into_iter()
            .find(|voice| voice.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseLabelError {
                kind: "voice",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

/// A web reference the provider grounded its answer on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

/// A single-answer multiple choice question extracted from a model turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub topic: String,
    pub question: String,
    pub options: Vec<String>,
    pub correct_index: usize,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<usize>,
}

impl Quiz {
    pub fn is_answered(&self) -> bool {
        self.user_answer.is_some()
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Synthesized speech for this turn, raw 24kHz PCM16.
    #[serde(
        default,
        rename = "audioData",
        with = "base64_audio",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz: Option<Quiz>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default = "finalized_default")]
    pub finalized: bool,
}

fn finalized_default() -> bool {
    true
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::finished(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::finished(Role::Model, text)
    }

    /// An empty model turn that is about to receive streamed text.
    pub fn placeholder() -> Self {
        Self {
            finalized: false,
            ..Self::finished(Role::Model, "")
        }
    }

    fn finished(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            audio: None,
            quiz: None,
            sources: Vec::new(),
            finalized: true,
        }
    }

    /// Adds sources not already present, comparing by URI.
    pub fn merge_sources(&mut self, incoming: &[Source]) -> bool {
        let mut changed = false;
        for source in incoming {
            if !self.sources.iter().any(|s| s.uri == source.uri) {
                self.sources.push(source.clone());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseStudy {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tone {
    Formal,
    Informal,
    #[default]
    SemiFormal,
}

/// An archived deep-dive produced from a model turn carrying a lesson title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: Uuid,
    pub subject: String,
    pub class: String,
    pub chapter: String,
    pub topic: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_study: Option<CaseStudy>,
    #[serde(default)]
    pub facts: Vec<String>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub tone: Tone,
}

impl Lesson {
    /// Labels the lesson with the track it was produced under.
    pub fn assign_track(&mut self, mode: Option<AcademicMode>) {
        match mode {
            Some(mode) => {
                self.subject = mode.label().to_string();
                self.class = mode.label().to_string();
            }
            None => {
                self.subject = "General Commerce".to_string();
                self.class = "Advanced".to_string();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Task,
    Challenge,
    Goal,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Task => write!(f, "task"),
            TaskKind::Challenge => write!(f, "challenge"),
            TaskKind::Goal => write!(f, "goal"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(TaskKind::Task),
            "challenge" => Ok(TaskKind::Challenge),
            "goal" => Ok(TaskKind::Goal),
            _ => Err(ParseLabelError {
                kind: "task type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            kind,
            completed: false,
            due_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CareerPath {
    pub title: String,
    pub description: String,
    pub relevance: String,
    pub salary_potential: String,
}

/// Structured output of the recommendation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    #[serde(default)]
    pub suggested_career_paths: Vec<CareerPath>,
    /// Three to five professional, software or soft skills.
    #[serde(default)]
    pub recommended_skills: Vec<String>,
}

/// The learner's profile. A topic is never in both `mastered_topics` and
/// `struggling_topics`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub grade: String,
    pub focus_area: String,
    pub progress: u8,
    #[serde(default)]
    pub preferred_voice: MentorVoice,
    #[serde(default)]
    pub interests: BTreeSet<String>,
    #[serde(default)]
    pub mastered_topics: BTreeSet<String>,
    #[serde(default)]
    pub struggling_topics: BTreeSet<String>,
    #[serde(default)]
    pub suggested_career_paths: Vec<CareerPath>,
    #[serde(default)]
    pub recommended_skills: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "Aspirant".to_string(),
            grade: "Executive Path".to_string(),
            focus_area: "Commerce".to_string(),
            progress: 15,
            preferred_voice: MentorVoice::Kore,
            interests: BTreeSet::new(),
            mastered_topics: BTreeSet::new(),
            struggling_topics: BTreeSet::new(),
            suggested_career_paths: Vec::new(),
            recommended_skills: Vec::new(),
        }
    }
}

/// An image attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    /// Base64 encoded image bytes.
    pub data: String,
    pub mime_type: String,
}

mod base64_audio {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(audio: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match audio {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded
            .map(|data| STANDARD.decode(data).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_academic_mode_parsing() {
        assert_eq!("11th".parse::<AcademicMode>(), Ok(AcademicMode::Eleventh));
        assert_eq!("mba".parse::<AcademicMode>(), Ok(AcademicMode::Mba));
        assert_eq!(" BBA ".parse::<AcademicMode>(), Ok(AcademicMode::Bba));
        assert!("PhD".parse::<AcademicMode>().is_err());
        assert_eq!(AcademicMode::Twelfth.to_string(), "12th");
    }

    #[test]
    fn test_academic_mode_serializes_as_label() {
        let json = serde_json::to_string(&AcademicMode::Twelfth).unwrap();
        assert_eq!(json, "\"12th\"");
        let mode: AcademicMode = serde_json::from_str("\"BBA\"").unwrap();
        assert_eq!(mode, AcademicMode::Bba);
    }

    #[test]
    fn test_voice_parsing_and_default() {
        assert_eq!(MentorVoice::default(), MentorVoice::Kore);
        assert_eq!("puck".parse::<MentorVoice>(), Ok(MentorVoice::Puck));
        let err = "Alloy".parse::<MentorVoice>().unwrap_err();
        assert_eq!(err.to_string(), "unknown voice: 'Alloy'");
    }

    #[test]
    fn test_task_kind_serialization() {
        let task = Task::new("Draft Memo", "Write a summary", TaskKind::Challenge);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "challenge");
        assert_eq!(json["completed"], false);
        assert!(json.get("dueDate").is_none());
    }

    #[test]
    fn test_message_merge_sources_dedupes_by_uri() {
        let mut msg = Message::placeholder();
        let a = Source {
            uri: "https://a.example".into(),
            title: "A".into(),
        };
        let b = Source {
            uri: "https://b.example".into(),
            title: "B".into(),
        };
        assert!(msg.merge_sources(&[a.clone(), b.clone()]));
        let renamed = Source {
            uri: a.uri.clone(),
            title: "A again".into(),
        };
        assert!(!msg.merge_sources(&[renamed]));
        assert_eq!(msg.sources, vec![a, b]);
    }

    #[test]
    fn test_message_dates_and_audio_survive_persistence() {
        let mut msg = Message::model("Hello");
        msg.timestamp = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        msg.audio = Some(vec![0, 1, 2, 255]);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"timestamp\":\"2024-01-15T10:30:00Z\""));
        assert!(json.contains("\"audioData\":\"AAEC/w==\""));

        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_message_without_finalized_field_loads_as_finalized() {
        let json = r#"{"id":"550e8400-e29b-41d4-a716-446655440000","role":"model","text":"Hi","timestamp":"2024-01-15T10:30:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.finalized);
        assert!(msg.audio.is_none());
        assert!(msg.sources.is_empty());
    }

    #[test]
    fn test_profile_defaults() {
        let profile = Profile::default();
        assert_eq!(profile.name, "Aspirant");
        assert_eq!(profile.grade, "Executive Path");
        assert_eq!(profile.progress, 15);
        assert_eq!(profile.preferred_voice, MentorVoice::Kore);
        assert!(profile.mastered_topics.is_empty());
    }

    #[test]
    fn test_recommendations_tolerate_missing_fields() {
        let recs: Recommendations = serde_json::from_str(r#"{"recommendedSkills":["Excel"]}"#).unwrap();
        assert!(recs.suggested_career_paths.is_empty());
        assert_eq!(recs.recommended_skills, vec!["Excel".to_string()]);
    }

    #[test]
    fn test_lesson_assign_track() {
        let mut lesson = Lesson {
            id: Uuid::new_v4(),
            subject: String::new(),
            class: String::new(),
            chapter: "Session Archive".into(),
            topic: "Pricing".into(),
            content: String::new(),
            case_study: None,
            facts: vec![],
            date: Utc::now(),
            tone: Tone::SemiFormal,
        };
        lesson.assign_track(Some(AcademicMode::Mba));
        assert_eq!(lesson.subject, "MBA");
        lesson.assign_track(None);
        assert_eq!(lesson.subject, "General Commerce");
        assert_eq!(lesson.class, "Advanced");
        assert_eq!(serde_json::to_value(lesson.tone).unwrap(), "semi-formal");
    }
}
