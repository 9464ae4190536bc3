//! Line Input
//!
//! A rustyline editor runs on its own thread and reads one line per request,
//! so the prompt is only drawn when the chat loop asks for input. History is
//! kept in a file under the data directory.

use anyhow::{Result, anyhow};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Line(String),
    /// Ctrl-C
    Interrupted,
    /// Ctrl-D, or the terminal went away.
    Eof,
}

/// Reads one line after showing a prompt. Runs on the reader thread.
trait LineSource {
    fn read(&mut self, prompt: &str) -> Input;
}

struct Editor {
    editor: DefaultEditor,
    history: Option<PathBuf>,
}

impl Editor {
    fn new(history: Option<PathBuf>) -> Result<Self> {
        let mut editor =
            DefaultEditor::new().map_err(|e| anyhow!("Failed to start the line editor: {e}"))?;
        if let Some(path) = &history {
            // Absent on first run.
            let _ = editor.load_history(path);
        }
        Ok(Self { editor, history })
    }
}

impl LineSource for Editor {
    fn read(&mut self, prompt: &str) -> Input {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                    if let Some(path) = &self.history {
                        if let Err(e) = self.editor.save_history(path) {
                            warn!(error = %e, "Failed to save input history");
                        }
                    }
                }
                Input::Line(line)
            }
            Err(ReadlineError::Interrupted) => Input::Interrupted,
            Err(ReadlineError::Eof) => Input::Eof,
            Err(e) => {
                error!(error = %e, "Failed to read input");
                Input::Eof
            }
        }
    }
}

/// Async handle to the reader thread.
pub struct LineReader {
    requests: std_mpsc::Sender<String>,
    lines: mpsc::UnboundedReceiver<Input>,
    requested: bool,
}

impl LineReader {
    /// Starts the editor thread, loading and saving history at `history`.
    pub fn spawn(history: Option<PathBuf>) -> Result<Self> {
        Self::with_source(move || Editor::new(history))
    }

    fn with_source<S, F>(make: F) -> Result<Self>
    where
        S: LineSource,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (request_tx, request_rx) = std_mpsc::channel::<String>();
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let mut source = match make() {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            for prompt in request_rx {
                if line_tx.send(source.read(&prompt)).is_err() {
                    break;
                }
            }
        });

        ready_rx
            .recv()
            .map_err(|_| anyhow!("Line editor thread exited during startup"))??;
        Ok(Self {
            requests: request_tx,
            lines: line_rx,
            requested: false,
        })
    }

    /// Shows `prompt` and waits for the next line. Cancel-safe: if the
    /// future is dropped, the line typed at that prompt is returned by the
    /// next call instead of prompting again.
    pub async fn read_line(&mut self, prompt: &str) -> Input {
        if !self.requested {
            if self.requests.send(prompt.to_string()).is_err() {
                return Input::Eof;
            }
            self.requested = true;
        }
        let input = self.lines.recv().await.unwrap_or(Input::Eof);
        self.requested = false;
        input
    }
}
