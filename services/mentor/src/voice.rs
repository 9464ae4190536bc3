//! Runs a live voice session against the Gemini Live API.

use crate::audio::{MicrophoneCapture, SpeakerOutput};
use crate::audio_utils::{StreamResampler, convert_f32_to_i16};
use crate::config::Config;
use crate::input::LineReader;
use anyhow::{Context, Result};
use gemini_realtime::{LiveConfig, LiveSender, ServerEvent};
use mentor_core::generic_types::{LiveEvent, LiveSessionConfig};
use mentor_core::live::{FrameBuffer, INPUT_SAMPLE_RATE, LiveSessionAdapter, LiveStatus};
use mentor_core::{Mentor, MentorError, prompts};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Maps one receiver result onto the provider-neutral event the adapter consumes.
pub fn to_live_event(event: Option<Result<ServerEvent>>) -> LiveEvent {
    match event {
        None => LiveEvent::Closed,
        Some(Err(e)) => LiveEvent::Error(e.to_string()),
        Some(Ok(event)) => match event {
            ServerEvent::SetupComplete => LiveEvent::SetupComplete,
            ServerEvent::InputTranscription(text) => LiveEvent::InputTranscript(text),
            ServerEvent::OutputTranscription(text) => LiveEvent::OutputTranscript(text),
            ServerEvent::Audio(samples) => LiveEvent::Audio(samples),
            ServerEvent::Interrupted => LiveEvent::Interrupted,
            ServerEvent::TurnComplete => LiveEvent::TurnComplete,
        },
    }
}

/// Resolves the provider settings for a session.
pub fn live_config(config: &Config, session: LiveSessionConfig) -> Result<LiveConfig> {
    Ok(LiveConfig {
        api_key: config
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY is required for live voice sessions")?,
        model: config.live_model.clone(),
        voice_name: session.voice.name().to_string(),
        system_instruction: session.instructions,
    })
}

async fn send_frames(sender: &mut LiveSender, frames: Vec<Vec<i16>>) -> Result<()> {
    for frame in frames {
        sender.send_audio(&frame).await?;
    }
    Ok(())
}

/// Talks with the mentor until the learner presses Enter or the provider
/// closes the session. Completed turns are recorded in the conversation.
pub async fn run_voice_session(
    mentor: &Mentor,
    config: &Config,
    input: &mut LineReader,
) -> Result<()> {
    let mode = mentor.mode().await.ok_or(MentorError::NoActiveSession)?;
    let live_config = live_config(
        config,
        LiveSessionConfig {
            voice: mentor.voice().await,
            instructions: prompts::live_instruction(mode),
        },
    )?;

    let (mic_tx, mut mic_rx) = mpsc::unbounded_channel();
    let capture = MicrophoneCapture::new(mic_tx)?;
    let mut input_resampler = StreamResampler::new(capture.sample_rate(), INPUT_SAMPLE_RATE)?;
    let output = SpeakerOutput::new()?;

    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel();
    let mut adapter = LiveSessionAdapter::new(
        capture,
        output,
        Box::new(move |pair| {
            let _ = turn_tx.send(pair);
        }),
    );

    let (mut sender, mut receiver) = gemini_realtime::connect(&live_config).await?;
    info!(%mode, model = %live_config.model, "Live session connecting");
    println!("🎙  Live session with Mr. M. Press Enter to hang up.");

    let mut frames = FrameBuffer::default();
    loop {
        tokio::select! {
            event = receiver.next_event() => {
                if adapter.handle_event(to_live_event(event)) == LiveStatus::Error {
                    println!("⚠️  The live session ran into a problem.");
                }
            }
            Some(samples) = mic_rx.recv() => {
                if adapter.status() != LiveStatus::Active {
                    continue;
                }
                let pcm = convert_f32_to_i16(&input_resampler.process(&samples));
                if let Err(e) = send_frames(&mut sender, frames.push(&pcm)).await {
                    adapter.handle_event(LiveEvent::Error(e.to_string()));
                }
            }
            Some(pair) = turn_rx.recv() => {
                println!("You: {}", pair.input);
                if let Err(e) = mentor.record_voice_exchange(&pair.input, &pair.output).await {
                    error!(error = %e, "Failed to record voice exchange");
                }
            }
            _ = input.read_line("") => {
                info!("Learner ended the live session");
                break;
            }
        }
        if adapter.is_finished() {
            break;
        }
    }

    adapter.close();
    if let Err(e) = sender.close().await {
        warn!(error = %e, "Failed to close the live socket cleanly");
    }
    while let Ok(pair) = turn_rx.try_recv() {
        mentor
            .record_voice_exchange(&pair.input, &pair.output)
            .await?;
    }
    println!("📴 Live session ended.");
    Ok(())
}
