//! Interactive Chat Loop
//!
//! Plain lines are sent to the mentor; lines starting with `/` are commands.
//! Replies are printed by the event printer in `display`, so this loop only
//! prints direct answers to commands.

use crate::audio::play_clip;
use crate::audio_utils::pcm16_from_le_bytes;
use crate::config::Config;
use crate::display::{format_message, format_profile, format_roadmap, format_tasks, format_vault};
use crate::input::{Input, LineReader};
use crate::voice::run_voice_session;
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use mentor_core::curriculum::{filter_by_category, find_concept};
use mentor_core::Mentor;
use mentor_core::models::{AcademicMode, ImageAttachment, MentorVoice, ParseLabelError, TaskKind};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const DEFAULT_IMAGE_PROMPT: &str = "Analyze this image in a business context.";
const DEFAULT_NOTE_CATEGORY: &str = "General";
const HISTORY_ON_START: usize = 6;
const INPUT_HISTORY_FILE: &str = "input_history.txt";
const PROMPT: &str = "› ";

pub const HELP: &str = "\
Commands:
  /mode <11th|12th|BBA|MBA>       start a track (replaces the conversation)
  /switch                         leave the current track
  /voice <Kore|Puck|Charon|Fenrir|Zephyr>
  /concept <name>                 deep-dive into a curriculum concept
  /answer <n>                     answer the open quiz
  /tasks                          list tasks
  /task add [task|challenge|goal] <title>: <description>
  /task done <n>                  toggle task n
  /task rm <n>                    delete task n
  /note <title>: <content>        save a note
  /vault                          archived lessons
  /profile                        progress and recommendations
  /roadmap [category]             the curriculum of the current track
  /refresh                        refresh career recommendations
  /play                           play the latest voice note
  /image <path> [prompt]          send an image
  /live                           live voice session (Enter hangs up)
  /theme [dark|light]             toggle or set the theme
  /reset                          wipe all stored data
  /help, /quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Mode(AcademicMode),
    Switch,
    Voice(MentorVoice),
    Concept(String),
    /// Zero-based option index.
    Answer(usize),
    Tasks,
    AddTask {
        kind: TaskKind,
        title: String,
        description: String,
    },
    /// Zero-based positions in the task list.
    ToggleTask(usize),
    DeleteTask(usize),
    Note {
        title: String,
        content: String,
    },
    Vault,
    Profile,
    Roadmap(Option<String>),
    Refresh,
    Play,
    Image {
        path: PathBuf,
        prompt: String,
    },
    Live,
    Theme(Option<bool>),
    Reset,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command '/{0}'. Type /help for the list.")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Label(#[from] ParseLabelError),
}

/// Parses a one-based position.
fn position(arg: &str, usage: &'static str) -> Result<usize, CommandError> {
    match arg.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => Err(CommandError::Usage(usage)),
    }
}

/// Splits `title: body`. Without a colon the whole text is the title.
fn split_titled(text: &str) -> (String, String) {
    match text.split_once(':') {
        Some((title, body)) => (title.trim().to_string(), body.trim().to_string()),
        None => (text.trim().to_string(), String::new()),
    }
}

fn required<'a>(arg: &'a str, usage: &'static str) -> Result<&'a str, CommandError> {
    if arg.is_empty() {
        Err(CommandError::Usage(usage))
    } else {
        Ok(arg)
    }
}

fn parse_task(args: &str) -> Result<Command, CommandError> {
    const USAGE: &str = "/task add|done|rm ...";
    let (sub, rest) = args.split_once(' ').unwrap_or((args, ""));
    let rest = rest.trim();
    match sub {
        "add" => {
            let (kind, text) = match rest.split_once(' ') {
                Some((first, text)) => match first.parse::<TaskKind>() {
                    Ok(kind) => (kind, text),
                    Err(_) => (TaskKind::Task, rest),
                },
                None => (TaskKind::Task, rest),
            };
            let (title, description) = split_titled(text);
            if title.is_empty() {
                return Err(CommandError::Usage(
                    "/task add [task|challenge|goal] <title>: <description>",
                ));
            }
            Ok(Command::AddTask {
                kind,
                title,
                description,
            })
        }
        "done" => Ok(Command::ToggleTask(position(rest, "/task done <n>")?)),
        "rm" => Ok(Command::DeleteTask(position(rest, "/task rm <n>")?)),
        _ => Err(CommandError::Usage(USAGE)),
    }
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };
    let (name, args) = command.split_once(' ').unwrap_or((command, ""));
    let args = args.trim();

    let parsed = match name.to_ascii_lowercase().as_str() {
        "mode" => Command::Mode(required(args, "/mode <11th|12th|BBA|MBA>")?.parse()?),
        "switch" => Command::Switch,
        "voice" => Command::Voice(required(args, "/voice <name>")?.parse()?),
        "concept" => Command::Concept(required(args, "/concept <name>")?.to_string()),
        "answer" => Command::Answer(position(args, "/answer <n>")?),
        "tasks" => Command::Tasks,
        "task" => parse_task(args)?,
        "note" => {
            let (title, content) = split_titled(args);
            if title.is_empty() || content.is_empty() {
                return Err(CommandError::Usage("/note <title>: <content>"));
            }
            Command::Note { title, content }
        }
        "vault" => Command::Vault,
        "profile" => Command::Profile,
        "roadmap" => Command::Roadmap((!args.is_empty()).then(|| args.to_string())),
        "refresh" => Command::Refresh,
        "play" => Command::Play,
        "image" => {
            let (path, prompt) = required(args, "/image <path> [prompt]")?
                .split_once(' ')
                .unwrap_or((args, ""));
            let prompt = match prompt.trim() {
                "" => DEFAULT_IMAGE_PROMPT.to_string(),
                p => p.to_string(),
            };
            Command::Image {
                path: PathBuf::from(path),
                prompt,
            }
        }
        "live" => Command::Live,
        "theme" => match args.to_ascii_lowercase().as_str() {
            "" => Command::Theme(None),
            "dark" => Command::Theme(Some(true)),
            "light" => Command::Theme(Some(false)),
            _ => return Err(CommandError::Usage("/theme [dark|light]")),
        },
        "reset" => Command::Reset,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(parsed))
}

/// MIME type for an image file, judged by its extension.
pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

pub async fn load_image(path: &Path) -> Result<ImageAttachment> {
    let mime_type = image_mime_type(path)
        .with_context(|| format!("Unsupported image type: {}", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(ImageAttachment {
        data: STANDARD.encode(bytes),
        mime_type: mime_type.to_string(),
    })
}

enum Flow {
    Continue,
    Quit,
}

async fn handle(
    mentor: &Mentor,
    config: &Config,
    input: &mut LineReader,
    command: Command,
) -> Result<Flow> {
    match command {
        Command::Send(text) => {
            mentor.send(&text, None, false).await?;
        }
        Command::Mode(mode) => mentor.select_mode(mode).await?,
        Command::Switch => mentor.switch_mode().await,
        Command::Voice(voice) => {
            mentor.set_voice(voice).await?;
            println!("🗣  Voice set to {voice}");
        }
        Command::Concept(query) => {
            let mode = mentor.mode().await;
            let concept = mode
                .and_then(|mode| find_concept(mode, &query))
                .map(|c| c.name.to_string())
                .unwrap_or(query);
            mentor.select_concept(&concept).await?;
        }
        Command::Answer(index) => {
            let Some(message) = mentor.pending_quiz().await else {
                println!("There is no open quiz.");
                return Ok(Flow::Continue);
            };
            let outcome = mentor.answer_quiz(message.id, index).await?;
            let explanation = message
                .quiz
                .map(|quiz| quiz.explanation)
                .unwrap_or_default();
            if outcome.correct {
                println!("✅ Correct. {explanation}");
            } else {
                println!("❌ Not quite. {explanation}");
            }
            if outcome.refresh_requested {
                println!("🔄 Updating your career recommendations...");
            }
        }
        Command::Tasks => println!("{}", format_tasks(&mentor.tasks().await)),
        Command::AddTask {
            kind,
            title,
            description,
        } => {
            mentor.add_task(&title, &description, kind).await?;
        }
        Command::ToggleTask(index) => match mentor.tasks().await.get(index) {
            Some(task) => {
                mentor.toggle_task(task.id).await?;
            }
            None => println!("No task #{}", index + 1),
        },
        Command::DeleteTask(index) => match mentor.tasks().await.get(index) {
            Some(task) => mentor.delete_task(task.id).await?,
            None => println!("No task #{}", index + 1),
        },
        Command::Note { title, content } => {
            mentor
                .add_note(&title, &content, DEFAULT_NOTE_CATEGORY)
                .await?;
            println!("🗒  Note saved");
        }
        Command::Vault => println!("{}", format_vault(&mentor.vault().await)),
        Command::Profile => println!("{}", format_profile(&mentor.profile().await)),
        Command::Roadmap(category) => match mentor.mode().await {
            Some(mode) => println!(
                "{}",
                format_roadmap(&filter_by_category(mode, category.as_deref()))
            ),
            None => println!("Choose a track first with /mode."),
        },
        Command::Refresh => {
            let profile = mentor.refresh_recommendations().await?;
            println!("{}", format_profile(&profile));
        }
        Command::Play => {
            let audio = mentor
                .messages()
                .await
                .into_iter()
                .rev()
                .find_map(|m| m.audio);
            match audio {
                Some(bytes) => play_clip(&pcm16_from_le_bytes(&bytes)).await?,
                None => println!("No voice note to play yet."),
            }
        }
        Command::Image { path, prompt } => {
            let image = load_image(&path).await?;
            mentor.send(&prompt, Some(image), false).await?;
        }
        Command::Live => run_voice_session(mentor, config, input).await?,
        Command::Theme(choice) => {
            let dark = choice.unwrap_or(!mentor.dark_mode().await);
            mentor.set_dark_mode(dark).await?;
            println!("Theme: {}", if dark { "dark" } else { "light" });
        }
        Command::Reset => mentor.reset().await?,
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// Runs the chat until `/quit` or end of input.
pub async fn run(mentor: &Mentor, config: &Config, mode: Option<AcademicMode>) -> Result<()> {
    match (mode, mentor.mode().await) {
        (Some(requested), current) if current != Some(requested) => {
            mentor.select_mode(requested).await?
        }
        (_, Some(current)) => {
            println!("🎓 Track: {current}");
            let messages = mentor.messages().await;
            let skip = messages.len().saturating_sub(HISTORY_ON_START);
            for message in &messages[skip..] {
                println!("{}", format_message(message));
            }
        }
        (_, None) => println!("Welcome! Choose a track with /mode <11th|12th|BBA|MBA>."),
    }
    println!("Type /help for commands.");

    if let Err(e) = tokio::fs::create_dir_all(&config.data_dir).await {
        warn!(error = %e, "Input history will not be saved");
    }
    let mut input = LineReader::spawn(Some(config.data_dir.join(INPUT_HISTORY_FILE)))?;
    loop {
        let line = match input.read_line(PROMPT).await {
            Input::Line(line) => line,
            Input::Interrupted => {
                println!("Type /quit to leave.");
                continue;
            }
            Input::Eof => break,
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match handle(mentor, config, &mut input, command).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                error!(error = %e, "Command failed");
                println!("⚠️  {e:#}");
            }
        }
    }
    info!("Chat ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(parse("  What is GST? "), Command::Send("What is GST?".into()));
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn test_mode_and_voice_parse_labels() {
        assert_eq!(parse("/mode bba"), Command::Mode(AcademicMode::Bba));
        assert_eq!(parse("/MODE 11th"), Command::Mode(AcademicMode::Eleventh));
        assert_eq!(parse("/voice fenrir"), Command::Voice(MentorVoice::Fenrir));
        assert!(matches!(
            parse_line("/mode PhD"),
            Err(CommandError::Label(_))
        ));
        assert_eq!(
            parse_line("/voice"),
            Err(CommandError::Usage("/voice <name>"))
        );
    }

    #[test]
    fn test_answer_is_one_based() {
        assert_eq!(parse("/answer 2"), Command::Answer(1));
        assert!(parse_line("/answer 0").is_err());
        assert!(parse_line("/answer two").is_err());
    }

    #[test]
    fn test_task_subcommands() {
        assert_eq!(
            parse("/task add challenge Pitch deck: Draft ten slides"),
            Command::AddTask {
                kind: TaskKind::Challenge,
                title: "Pitch deck".into(),
                description: "Draft ten slides".into(),
            }
        );
        assert_eq!(
            parse("/task add Read chapter 4"),
            Command::AddTask {
                kind: TaskKind::Task,
                title: "Read chapter 4".into(),
                description: String::new(),
            }
        );
        assert_eq!(parse("/task done 3"), Command::ToggleTask(2));
        assert_eq!(parse("/task rm 1"), Command::DeleteTask(0));
        assert!(parse_line("/task add").is_err());
        assert!(parse_line("/task archive 1").is_err());
    }

    #[test]
    fn test_note_needs_title_and_content() {
        assert_eq!(
            parse("/note Break-even: fixed costs / contribution"),
            Command::Note {
                title: "Break-even".into(),
                content: "fixed costs / contribution".into(),
            }
        );
        assert!(parse_line("/note just a title").is_err());
    }

    #[test]
    fn test_image_defaults_prompt() {
        assert_eq!(
            parse("/image chart.png"),
            Command::Image {
                path: PathBuf::from("chart.png"),
                prompt: DEFAULT_IMAGE_PROMPT.into(),
            }
        );
        assert_eq!(
            parse("/image chart.png What trend is this?"),
            Command::Image {
                path: PathBuf::from("chart.png"),
                prompt: "What trend is this?".into(),
            }
        );
        assert!(parse_line("/image").is_err());
    }

    #[test]
    fn test_theme_and_roadmap_arguments() {
        assert_eq!(parse("/theme"), Command::Theme(None));
        assert_eq!(parse("/theme Dark"), Command::Theme(Some(true)));
        assert!(parse_line("/theme blue").is_err());
        assert_eq!(parse("/roadmap"), Command::Roadmap(None));
        assert_eq!(
            parse("/roadmap Finance"),
            Command::Roadmap(Some("Finance".into()))
        );
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("/switch"), Command::Switch);
        assert_eq!(parse("/tasks"), Command::Tasks);
        assert_eq!(parse("/vault"), Command::Vault);
        assert_eq!(parse("/profile"), Command::Profile);
        assert_eq!(parse("/refresh"), Command::Refresh);
        assert_eq!(parse("/play"), Command::Play);
        assert_eq!(parse("/live"), Command::Live);
        assert_eq!(parse("/reset"), Command::Reset);
        assert_eq!(parse("/help"), Command::Help);
        assert_eq!(parse("/quit"), Command::Quit);
        assert_eq!(
            parse("/concept  Working capital "),
            Command::Concept("Working capital".into())
        );
        assert_eq!(
            parse_line("/dance"),
            Err(CommandError::Unknown("dance".into()))
        );
    }

    #[test]
    fn test_image_mime_type() {
        assert_eq!(image_mime_type(Path::new("a/b.PNG")), Some("image/png"));
        assert_eq!(image_mime_type(Path::new("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(image_mime_type(Path::new("notes.txt")), None);
        assert_eq!(image_mime_type(Path::new("noext")), None);
    }

    #[tokio::test]
    async fn test_load_image_encodes_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dot.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let image = load_image(&path).await.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "AQID");
    }
}
