//! Terminal rendering of conversation events and session state.

use mentor_core::ConversationEvent;
use mentor_core::curriculum::CurriculumSection;
use mentor_core::extractor::strip_quiz_blocks;
use mentor_core::models::{Lesson, Message, Profile, Quiz, Role, Source, Task};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const QUIZ_START: &str = "[QUIZ_START]";
const QUIZ_END: &str = "[QUIZ_END]";

/// Hides quiz blocks from streamed text. Text that might be the start of a
/// tag is held back until the next delta settles it.
#[derive(Debug, Default)]
pub struct DisplayFilter {
    buffer: String,
    in_quiz: bool,
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| {
            n <= text.len()
                && text.is_char_boundary(text.len() - n)
                && tag.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}

impl DisplayFilter {
    pub fn push(&mut self, delta: &str) -> String {
        self.buffer.push_str(delta);
        let mut shown = String::new();
        loop {
            if self.in_quiz {
                match self.buffer.find(QUIZ_END) {
                    Some(end) => {
                        self.buffer.drain(..end + QUIZ_END.len());
                        self.in_quiz = false;
                    }
                    None => {
                        let keep = partial_tag_len(&self.buffer, QUIZ_END);
                        self.buffer.drain(..self.buffer.len() - keep);
                        return shown;
                    }
                }
            } else {
                match self.buffer.find(QUIZ_START) {
                    Some(start) => {
                        shown.push_str(&self.buffer[..start]);
                        self.buffer.drain(..start + QUIZ_START.len());
                        self.in_quiz = true;
                    }
                    None => {
                        let keep = partial_tag_len(&self.buffer, QUIZ_START);
                        let cut = self.buffer.len() - keep;
                        shown.push_str(&self.buffer[..cut]);
                        self.buffer.drain(..cut);
                        return shown;
                    }
                }
            }
        }
    }

    /// Releases held-back text once the stream has ended.
    pub fn finish(&mut self) -> String {
        if self.in_quiz {
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }
}

pub fn format_message(message: &Message) -> String {
    match message.role {
        Role::User => format!("You: {}", message.text),
        Role::Model => format!("Mr. M: {}", strip_quiz_blocks(&message.text).trim()),
    }
}

pub fn format_quiz(quiz: &Quiz) -> String {
    let mut out = format!("\n📝 {}: {}\n", quiz.topic, quiz.question);
    for (i, option) in quiz.options.iter().enumerate() {
        let _ = writeln!(out, "   {}. {}", i + 1, option);
    }
    out.push_str("   Answer with /answer <number>");
    out
}

pub fn format_tasks(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks yet.".to_string();
    }
    let mut out = String::new();
    for (i, task) in tasks.iter().enumerate() {
        let mark = if task.completed { "x" } else { " " };
        let _ = writeln!(
            out,
            "{:>2}. [{}] ({}) {}: {}",
            i + 1,
            mark,
            task.kind,
            task.title,
            task.description
        );
    }
    out.trim_end().to_string()
}

pub fn format_vault(lessons: &[Lesson]) -> String {
    if lessons.is_empty() {
        return "The vault is empty.".to_string();
    }
    let mut out = String::new();
    for lesson in lessons {
        let _ = writeln!(
            out,
            "📚 {} [{} · {}] {} facts, {}",
            lesson.topic,
            lesson.subject,
            lesson.chapter,
            lesson.facts.len(),
            lesson.date.format("%Y-%m-%d")
        );
        if let Some(case) = &lesson.case_study {
            let _ = writeln!(out, "   {}: {}", case.title, case.content);
        }
    }
    out.trim_end().to_string()
}

fn join_or_dash<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let joined = items.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() { "-".to_string() } else { joined }
}

pub fn format_profile(profile: &Profile) -> String {
    let mut out = format!(
        "{} · {} · {}\nProgress: {}%  Voice: {}\n",
        profile.name, profile.grade, profile.focus_area, profile.progress, profile.preferred_voice
    );
    let _ = writeln!(out, "Interests:  {}", join_or_dash(&profile.interests));
    let _ = writeln!(out, "Mastered:   {}", join_or_dash(&profile.mastered_topics));
    let _ = writeln!(out, "Struggling: {}", join_or_dash(&profile.struggling_topics));
    let _ = writeln!(out, "Skills:     {}", join_or_dash(&profile.recommended_skills));
    for path in &profile.suggested_career_paths {
        let _ = writeln!(
            out,
            "🎯 {} ({}) {} [{}]",
            path.title, path.salary_potential, path.description, path.relevance
        );
    }
    out.trim_end().to_string()
}

pub fn format_roadmap(sections: &[&CurriculumSection]) -> String {
    let mut out = String::new();
    for section in sections {
        let _ = writeln!(out, "{}", section.category);
        for concept in section.concepts {
            let _ = writeln!(out, "  • {}: {}", concept.name, concept.description);
        }
    }
    out.trim_end().to_string()
}

/// Prints events as they arrive until every sender is gone.
pub async fn print_events(mut events: UnboundedReceiver<ConversationEvent>) {
    let mut filters: HashMap<Uuid, DisplayFilter> = HashMap::new();
    let mut sources: HashMap<Uuid, Vec<Source>> = HashMap::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ConversationEvent::MessageAppended(message) => {
                if message.role == Role::Model && !message.finalized {
                    filters.insert(message.id, DisplayFilter::default());
                    print!("Mr. M: ");
                } else if message.role == Role::Model {
                    println!("{}", format_message(&message));
                }
            }
            ConversationEvent::TextDelta { id, delta } => {
                if let Some(filter) = filters.get_mut(&id) {
                    print!("{}", filter.push(&delta));
                }
            }
            ConversationEvent::MessageFinalized { id } => {
                if let Some(mut filter) = filters.remove(&id) {
                    println!("{}", filter.finish());
                }
                for source in sources.remove(&id).unwrap_or_default() {
                    println!("   🔗 {} <{}>", source.title, source.uri);
                }
            }
            ConversationEvent::SourcesUpdated { id, sources: latest } => {
                sources.insert(id, latest);
            }
            ConversationEvent::QuizAttached { quiz, .. } => println!("{}", format_quiz(&quiz)),
            ConversationEvent::AudioAttached { .. } => println!("🔊 Voice note ready (/play)"),
            ConversationEvent::LessonArchived(lesson) => {
                println!("📚 Saved to vault: {}", lesson.topic)
            }
            ConversationEvent::TasksChanged { pending } => println!("✅ {pending} pending task(s)"),
            ConversationEvent::HistoryReplaced(messages) => {
                for message in &messages {
                    println!("{}", format_message(message));
                }
            }
            ConversationEvent::ModeChanged(Some(mode)) => println!("🎓 Track: {mode}"),
            ConversationEvent::ModeChanged(None) => {
                println!("Choose a track with /mode <11th|12th|BBA|MBA>")
            }
            ConversationEvent::ProfileChanged(_) => {}
        }
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentor_core::models::TaskKind;

    fn push_all(filter: &mut DisplayFilter, deltas: &[&str]) -> String {
        let mut shown: String = deltas.iter().map(|d| filter.push(d)).collect();
        shown.push_str(&filter.finish());
        shown
    }

    #[test]
    fn test_filter_passes_plain_text() {
        let mut filter = DisplayFilter::default();
        assert_eq!(filter.push("Margins "), "Margins ");
        assert_eq!(filter.push("matter."), "matter.");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn test_filter_hides_quiz_split_across_deltas() {
        let mut filter = DisplayFilter::default();
        let shown = push_all(
            &mut filter,
            &["Intro. [QUI", "Z_START]\n[QUIZ_QUESTION]: Why?\n[QUIZ_E", "ND] Outro."],
        );
        assert_eq!(shown, "Intro.  Outro.");
    }

    #[test]
    fn test_filter_holds_back_partial_tag_only() {
        let mut filter = DisplayFilter::default();
        assert_eq!(filter.push("See [QU"), "See ");
        assert_eq!(filter.push("OTE] here"), "[QUOTE] here");
    }

    #[test]
    fn test_filter_drops_unterminated_quiz() {
        let mut filter = DisplayFilter::default();
        assert_eq!(push_all(&mut filter, &["Text [QUIZ_START] half a quiz"]), "Text ");
    }

    #[test]
    fn test_format_message_strips_quiz_block() {
        let message = Message::model("Lesson body.\n[QUIZ_START]\n[QUIZ_END]");
        assert_eq!(format_message(&message), "Mr. M: Lesson body.");
        assert_eq!(format_message(&Message::user("hi")), "You: hi");
    }

    #[test]
    fn test_format_quiz_numbers_options_from_one() {
        let quiz = Quiz {
            topic: "GST".into(),
            question: "Which is indirect?".into(),
            options: vec!["Income tax".into(), "GST".into()],
            correct_index: 1,
            explanation: String::new(),
            user_answer: None,
        };
        let text = format_quiz(&quiz);
        assert!(text.contains("1. Income tax"));
        assert!(text.contains("2. GST"));
    }

    #[test]
    fn test_format_tasks() {
        assert_eq!(format_tasks(&[]), "No tasks yet.");
        let mut task = Task::new("Read", "Chapter 2", TaskKind::Goal);
        task.completed = true;
        assert_eq!(format_tasks(&[task]), " 1. [x] (goal) Read: Chapter 2");
    }

    #[test]
    fn test_format_profile_marks_empty_lists() {
        let text = format_profile(&Profile::default());
        assert!(text.contains("Progress: 15%"));
        assert!(text.contains("Mastered:   -"));
    }
}
