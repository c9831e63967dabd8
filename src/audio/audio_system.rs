//! The AudioSystem owns the capture pipeline and the playback queue of one
//! client.
//!
//! Both run on std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use super::play::{AudioOutput, AudioPlayback, PlaybackItem};
use super::record::{AudioCapture, AudioFrame, CaptureError, Level, MicSource, Recording};
use crate::config::AudioConfig;

pub struct AudioSystem {
    capture: AudioCapture,
    playback: Option<AudioPlayback>,
}

impl AudioSystem {
    pub fn start(config: AudioConfig, output: Box<dyn AudioOutput>) -> Result<Self> {
        log::info!(
            "AudioSystem starting: capture: \"{}\", playback: \"{}\", rate: {}Hz, playback default: {}Hz, format: {}",
            config.capture_device,
            config.playback_device,
            config.sample_rate,
            config.playback_sample_rate,
            config.stream_format,
        );
        let playback = AudioPlayback::start(&config, output)?;
        Ok(Self {
            capture: AudioCapture::new(config),
            playback: Some(playback),
        })
    }

    pub fn start_capture(
        &mut self,
        source: Box<dyn MicSource>,
        on_frame: mpsc::Sender<AudioFrame>,
        collect: bool,
    ) -> Result<watch::Receiver<Level>, CaptureError> {
        self.capture.start(source, on_frame, collect)
    }

    pub fn stop_capture(&mut self) -> Result<Option<Recording>, CaptureError> {
        self.capture.stop()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn playback_sender(&self) -> Option<mpsc::UnboundedSender<PlaybackItem>> {
        self.playback.as_ref().and_then(|p| p.sender())
    }

    /// Stops capture and waits for queued playback to drain.
    pub fn finish(mut self) -> Result<Option<Recording>, CaptureError> {
        let recording = self.capture.stop()?;
        if let Some(playback) = self.playback.take() {
            playback.finish();
        }
        Ok(recording)
    }

    pub fn stop(&mut self) {
        if let Err(e) = self.capture.stop() {
            log::warn!("Capture teardown failed: {}", e);
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
