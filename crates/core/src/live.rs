//! Live Voice Session Adapter
//!
//! Drives a bidirectional voice session from provider-neutral `LiveEvent`s.
//! The adapter owns the microphone capture and the audio output for the whole
//! session and releases both when the session closes, whichever side closes it.

use crate::generic_types::LiveEvent;
use anyhow::Result;
use tracing::{error, info, warn};

/// Sample rate of microphone audio sent to the provider.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio returned by the provider.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Number of samples per captured frame.
pub const FRAME_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStatus {
    Connecting,
    Active,
    Error,
    Closed,
}

/// Microphone side of a live session.
pub trait AudioCapture {
    /// Begins delivering captured samples.
    fn start(&mut self) -> Result<()>;
}

/// Speaker side of a live session. Times are in seconds on the output clock.
pub trait AudioOutput {
    fn current_time(&self) -> f64;
    fn play_at(&mut self, samples: &[i16], start: f64);
    /// Stops everything queued or playing.
    fn stop_all(&mut self);
}

/// Queues frames back to back in arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackScheduler {
    next_start: f64,
}

impl PlaybackScheduler {
    /// Returns the start time for a frame of `duration` seconds.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start);
        self.next_start = start + duration;
        start
    }

    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

/// The learner's and the mentor's words for one completed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptPair {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptBuffer {
    input: String,
    output: String,
}

impl TranscriptBuffer {
    pub fn push_input(&mut self, delta: &str) {
        self.input.push_str(delta);
    }

    pub fn push_output(&mut self, delta: &str) {
        self.output.push_str(delta);
    }

    /// Ends the turn. Both accumulators are cleared; the pair is only
    /// returned when both sides said something.
    pub fn take_turn(&mut self) -> Option<TranscriptPair> {
        let input = std::mem::take(&mut self.input);
        let output = std::mem::take(&mut self.output);
        let (input, output) = (input.trim().to_string(), output.trim().to_string());
        if input.is_empty() || output.is_empty() {
            return None;
        }
        Some(TranscriptPair { input, output })
    }
}

/// Groups captured samples into fixed-size frames.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pending: Vec<i16>,
    frame_size: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(FRAME_SAMPLES)
    }
}

impl FrameBuffer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size),
            frame_size: frame_size.max(1),
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

pub type TurnCallback = Box<dyn FnMut(TranscriptPair)>;

pub struct LiveSessionAdapter<C: AudioCapture, O: AudioOutput> {
    status: LiveStatus,
    capture: Option<C>,
    output: Option<O>,
    scheduler: PlaybackScheduler,
    transcripts: TranscriptBuffer,
    on_turn: TurnCallback,
}

impl<C: AudioCapture, O: AudioOutput> LiveSessionAdapter<C, O> {
    pub fn new(capture: C, output: O, on_turn: TurnCallback) -> Self {
        Self {
            status: LiveStatus::Connecting,
            capture: Some(capture),
            output: Some(output),
            scheduler: PlaybackScheduler::default(),
            transcripts: TranscriptBuffer::default(),
            on_turn,
        }
    }

    pub fn status(&self) -> LiveStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, LiveStatus::Error | LiveStatus::Closed)
    }

    /// Applies one provider event and returns the resulting status.
    pub fn handle_event(&mut self, event: LiveEvent) -> LiveStatus {
        match event {
            LiveEvent::SetupComplete => self.activate(),
            LiveEvent::InputTranscript(delta) => self.transcripts.push_input(&delta),
            LiveEvent::OutputTranscript(delta) => self.transcripts.push_output(&delta),
            LiveEvent::Audio(samples) => self.enqueue(&samples),
            LiveEvent::Interrupted => {
                if let Some(output) = self.output.as_mut() {
                    output.stop_all();
                }
                self.scheduler.reset();
            }
            LiveEvent::TurnComplete => {
                if let Some(pair) = self.transcripts.take_turn() {
                    (self.on_turn)(pair);
                }
            }
            LiveEvent::Error(message) => {
                error!(%message, "Live session error");
                self.status = LiveStatus::Error;
            }
            LiveEvent::Closed => self.close(),
        }
        self.status
    }

    fn activate(&mut self) {
        if self.status != LiveStatus::Connecting {
            return;
        }
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        match capture.start() {
            Ok(()) => {
                info!("Live session active");
                self.status = LiveStatus::Active;
            }
            Err(e) => {
                error!(error = %e, "Failed to start microphone capture");
                self.status = LiveStatus::Error;
            }
        }
    }

    fn enqueue(&mut self, samples: &[i16]) {
        if self.status != LiveStatus::Active || samples.is_empty() {
            return;
        }
        let Some(output) = self.output.as_mut() else {
            warn!("Dropping audio frame without an output device");
            return;
        };
        let duration = samples.len() as f64 / OUTPUT_SAMPLE_RATE as f64;
        let start = self.scheduler.schedule(output.current_time(), duration);
        output.play_at(samples, start);
    }

    /// Stops playback and releases the microphone and the output device.
    pub fn close(&mut self) {
        self.release();
        if self.status != LiveStatus::Closed {
            info!("Live session closed");
        }
        self.status = LiveStatus::Closed;
    }

    fn release(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.stop_all();
        }
        self.capture.take();
    }
}

impl<C: AudioCapture, O: AudioOutput> Drop for LiveSessionAdapter<C, O> {
    fn drop(&mut self) {
        self.release();
    }
}
