//! Session Profile Store
//!
//! Owns the learner profile and the transitions applied to it by quiz answers,
//! concept selection and recommendation refreshes.

use crate::models::{MentorVoice, Profile, Recommendations};
use std::fmt::Write;

/// Progress gained for every correctly answered quiz.
pub const PROGRESS_STEP: u8 = 2;
pub const MAX_PROGRESS: u8 = 100;

/// Decides when a quiz answer should trigger a recommendation refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Refresh whenever the mastered-topic count is even after the update.
    #[default]
    EvenMasteredCount,
    EveryAnswer,
    Never,
}

impl RefreshPolicy {
    pub fn should_refresh(&self, profile: &Profile) -> bool {
        match self {
            RefreshPolicy::EvenMasteredCount => profile.mastered_topics.len() % 2 == 0,
            RefreshPolicy::EveryAnswer => true,
            RefreshPolicy::Never => false,
        }
    }
}

/// Moves `topic` between the mastered and struggling sets. The last result wins.
pub fn apply_quiz_result(mut profile: Profile, topic: &str, correct: bool) -> Profile {
    if correct {
        profile.struggling_topics.remove(topic);
        profile.mastered_topics.insert(topic.to_string());
        profile.progress = profile
            .progress
            .saturating_add(PROGRESS_STEP)
            .min(MAX_PROGRESS);
    } else {
        profile.mastered_topics.remove(topic);
        profile.struggling_topics.insert(topic.to_string());
    }
    profile
}

/// Merges fetched recommendations. Empty lists never clear what is already there.
pub fn apply_recommendations(mut profile: Profile, recs: Recommendations) -> Profile {
    if !recs.suggested_career_paths.is_empty() {
        profile.suggested_career_paths = recs.suggested_career_paths;
    }
    if !recs.recommended_skills.is_empty() {
        profile.recommended_skills = recs.recommended_skills;
    }
    profile
}

/// Builds the prompt sent to the structured-output model.
pub fn recommendation_prompt(profile: &Profile) -> String {
    let join = |set: &std::collections::BTreeSet<String>| {
        set.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    let mut prompt = String::from(
        "Based on this student profile, provide personalized career and skill recommendations.\n\n",
    );
    let _ = writeln!(prompt, "Student Name: {}", profile.name);
    let _ = writeln!(prompt, "Current Mode: {}", profile.grade);
    let _ = writeln!(prompt, "Interests Identified: {}", join(&profile.interests));
    let _ = writeln!(
        prompt,
        "Mastered Topics (Aced Quizzes): {}",
        join(&profile.mastered_topics)
    );
    let _ = writeln!(
        prompt,
        "Struggling Topics (Missed Quizzes): {}",
        join(&profile.struggling_topics)
    );
    prompt.push_str(
        "\nReturn a JSON object with:\n\
         1. suggestedCareerPaths: Array of objects {title, description, relevance, salaryPotential}\n\
         2. recommendedSkills: Array of 3-5 strings (professional skills, software, or soft skills)\n",
    );
    prompt
}

/// Exclusive owner of the learner profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profile: Profile,
}

impl ProfileStore {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn record_quiz_result(&mut self, topic: &str, correct: bool) -> &Profile {
        self.profile = apply_quiz_result(std::mem::take(&mut self.profile), topic, correct);
        &self.profile
    }

    pub fn merge_recommendations(&mut self, recs: Recommendations) -> &Profile {
        self.profile = apply_recommendations(std::mem::take(&mut self.profile), recs);
        &self.profile
    }

    /// Returns `true` if the concept was not yet an interest.
    pub fn add_interest(&mut self, concept: &str) -> bool {
        self.profile.interests.insert(concept.to_string())
    }

    pub fn set_voice(&mut self, voice: MentorVoice) {
        self.profile.preferred_voice = voice;
    }

    pub fn set_grade(&mut self, grade: impl Into<String>) {
        self.profile.grade = grade.into();
    }
}
