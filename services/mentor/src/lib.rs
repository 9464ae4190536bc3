//! Mentor Service Library Crate
//!
//! The terminal client for Mr. M: environment configuration, the chat loop,
//! event rendering and the microphone/speaker plumbing for live voice
//! sessions. The `mentor` binary is a thin wrapper around this library.

pub mod audio;
pub mod audio_utils;
pub mod config;
pub mod display;
pub mod input;
pub mod repl;
pub mod voice;
