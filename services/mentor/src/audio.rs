//! Audio Devices
//!
//! cpal-backed microphone capture and speaker output for live voice sessions.
//! Captured audio leaves the device callback as mono f32 at the device rate;
//! playback is fed through a ring buffer the output callback drains.

use crate::audio_utils::{RESAMPLER_CHUNK, StreamResampler, convert_i16_to_f32, downmix};
use anyhow::{Context, Result, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use mentor_core::live::{AudioCapture, AudioOutput, OUTPUT_SAMPLE_RATE};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

/// Seconds of audio the playback ring can hold.
const PLAYBACK_SECONDS: usize = 30;
/// Clips starting this close to the previous clip's end are contiguous.
const CONTIGUOUS_TOLERANCE: f64 = 0.001;

fn stream_error(err: cpal::StreamError) {
    error!(error = %err, "Audio stream error");
}

/// Captures the default input device and forwards mono samples over a channel.
pub struct MicrophoneCapture {
    device: cpal::Device,
    config: StreamConfig,
    format: SampleFormat,
    tx: UnboundedSender<Vec<f32>>,
    stream: Option<cpal::Stream>,
}

impl MicrophoneCapture {
    pub fn new(tx: UnboundedSender<Vec<f32>>) -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .context("No input device available")?;
        let supported = device
            .default_input_config()
            .context("Failed to read the input device configuration")?;
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = supported.sample_rate().0,
            channels = supported.channels(),
            "Using input device"
        );
        Ok(Self {
            device,
            format: supported.sample_format(),
            config: supported.config(),
            tx,
            stream: None,
        })
    }

    /// Rate of the samples sent over the channel.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let channels = self.config.channels as usize;
        let tx = self.tx.clone();
        let stream = match self.format {
            SampleFormat::F32 => self.device.build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix(data, channels));
                },
                stream_error,
                None,
            )?,
            SampleFormat::I16 => self.device.build_input_stream(
                &self.config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix(&convert_i16_to_f32(data), channels));
                },
                stream_error,
                None,
            )?,
            other => bail!("Unsupported input sample format: {other:?}"),
        };
        Ok(stream)
    }
}

impl AudioCapture for MicrophoneCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.build_stream()?;
        stream.play().context("Failed to start the microphone")?;
        self.stream = Some(stream);
        Ok(())
    }
}

/// Plays 24kHz PCM16 on the default output device.
///
/// The output callback counts every frame it renders, silence included, so
/// that count is the output clock used for scheduling.
pub struct SpeakerOutput {
    _stream: cpal::Stream,
    producer: HeapProd<f32>,
    flush: Arc<AtomicBool>,
    played: Arc<AtomicU64>,
    timeline: Timeline,
    rate: u32,
    channels: usize,
    resampler: StreamResampler,
}

impl SpeakerOutput {
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .context("No output device available")?;
        let supported = device
            .default_output_config()
            .context("Failed to read the output device configuration")?;
        if supported.sample_format() != SampleFormat::F32 {
            bail!(
                "Unsupported output sample format: {:?}",
                supported.sample_format()
            );
        }
        let config = supported.config();
        let rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let ring = HeapRb::<f32>::new(rate as usize * channels * PLAYBACK_SECONDS);
        let (producer, mut consumer) = ring.split();
        let flush = Arc::new(AtomicBool::new(false));
        let played = Arc::new(AtomicU64::new(0));

        let stream = {
            let flush = flush.clone();
            let played = played.clone();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if flush.swap(false, Ordering::AcqRel) {
                        consumer.clear();
                    }
                    let filled = consumer.pop_slice(data);
                    data[filled..].fill(0.0);
                    played.fetch_add((data.len() / channels) as u64, Ordering::Release);
                },
                stream_error,
                None,
            )?
        };
        stream.play().context("Failed to start audio output")?;
        info!(sample_rate = rate, channels, "Audio output ready");

        Ok(Self {
            _stream: stream,
            producer,
            flush,
            played,
            timeline: Timeline::new(rate),
            rate,
            channels,
            resampler: StreamResampler::new(OUTPUT_SAMPLE_RATE, rate)?,
        })
    }

    fn played_frames(&self) -> u64 {
        self.played.load(Ordering::Acquire)
    }

    fn push_frames(&mut self, interleaved: &[f32]) -> u64 {
        let pushed = self.producer.push_slice(interleaved);
        if pushed < interleaved.len() {
            warn!(
                dropped = interleaved.len() - pushed,
                "Playback buffer full, dropping samples"
            );
        }
        (pushed / self.channels) as u64
    }
}

impl AudioOutput for SpeakerOutput {
    fn current_time(&self) -> f64 {
        self.played_frames() as f64 / self.rate as f64
    }

    fn play_at(&mut self, samples: &[i16], start: f64) {
        let duration = samples.len() as f64 / OUTPUT_SAMPLE_RATE as f64;
        let gap = self.timeline.schedule(
            start,
            duration,
            self.played_frames(),
            self.resampler.pending_len(),
        );
        if gap > 0 {
            let frames = self.push_frames(&vec![0.0; gap as usize * self.channels]);
            self.timeline.wrote(frames);
        }
        let mono = self.resampler.process(&convert_i16_to_f32(samples));
        if !mono.is_empty() {
            let frames = self.push_frames(&interleave(&mono, self.channels));
            self.timeline.wrote(frames);
        }
    }

    fn stop_all(&mut self) {
        self.flush.store(true, Ordering::Release);
        self.resampler.reset();
        self.timeline.reset(self.played_frames());
    }
}

/// Maps scheduled start times (seconds on the 24kHz source clock) onto the
/// device write position.
#[derive(Debug)]
struct Timeline {
    rate: u32,
    written: u64,
    previous_end: Option<f64>,
}

impl Timeline {
    fn new(rate: u32) -> Self {
        Self {
            rate,
            written: 0,
            previous_end: None,
        }
    }

    /// Device frames of silence to write before a clip at `start` lasting
    /// `duration` seconds. `pending` counts source samples the resampler still
    /// holds from earlier clips.
    fn schedule(&mut self, start: f64, duration: f64, played: u64, pending: usize) -> u64 {
        self.written = self.written.max(played);
        let contiguous = self
            .previous_end
            .is_some_and(|end| (start - end).abs() < CONTIGUOUS_TOLERANCE);
        self.previous_end = Some(start + duration);
        if contiguous {
            return 0;
        }
        let queued =
            self.written + pending as u64 * self.rate as u64 / OUTPUT_SAMPLE_RATE as u64;
        silence_gap((start * self.rate as f64) as u64, queued)
    }

    fn wrote(&mut self, frames: u64) {
        self.written += frames;
    }

    fn reset(&mut self, played: u64) {
        self.written = played;
        self.previous_end = None;
    }
}

/// Plays a whole 24kHz PCM16 clip and returns once it has been heard.
pub async fn play_clip(pcm: &[i16]) -> Result<()> {
    let mut output = SpeakerOutput::new()?;
    // Trailing silence pushes the last partial chunk through the resampler.
    let mut padded = pcm.to_vec();
    padded.extend(std::iter::repeat_n(0, RESAMPLER_CHUNK));
    let start = output.current_time();
    output.play_at(&padded, start);
    let seconds = padded.len() as f64 / OUTPUT_SAMPLE_RATE as f64;
    tokio::time::sleep(Duration::from_secs_f64(seconds + 0.25)).await;
    Ok(())
}

/// Frames of silence needed before a frame scheduled at `start_frame`.
fn silence_gap(start_frame: u64, write_pos: u64) -> u64 {
    start_frame.saturating_sub(write_pos)
}

/// Copies mono samples to every channel.
fn interleave(mono: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return mono.to_vec();
    }
    mono.iter()
        .flat_map(|&s| std::iter::repeat_n(s, channels))
        .collect()
}
