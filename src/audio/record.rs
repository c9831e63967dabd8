use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::config::AudioConfig;

/// Recordings shorter than this are never persisted.
pub const MIN_PERSIST_DURATION: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("a capture is already running")]
    AlreadyRunning,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture thread failed: {0}")]
    Thread(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Microphone-like source of mono float samples at its native rate.
pub trait MicSource: Send {
    fn sample_rate(&self) -> u32;
    /// Fills `buf`, returning the number of samples written; 0 means the
    /// source is exhausted.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
}

/// Plays a WAV file as if it were a microphone. Multi-channel input is mixed
/// down to mono.
pub struct WavFileSource {
    samples: Vec<f32>,
    pos: usize,
    sample_rate: u32,
    paced: bool,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>, paced: bool) -> Result<Self, CaptureError> {
        let reader = hound::WavReader::open(path.as_ref())
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {}", path.as_ref().display(), e)))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok(Self::from_samples(samples, spec.sample_rate, paced))
    }

    /// `paced` sleeps for each chunk's duration, like a real microphone.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, paced: bool) -> Self {
        Self {
            samples,
            pos: 0,
            sample_rate,
            paced,
        }
    }
}

impl MicSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        if self.paced && n > 0 {
            thread::sleep(Duration::from_secs_f64(n as f64 / self.sample_rate as f64));
        }
        Ok(n)
    }
}

/// One canonical-rate PCM16 frame handed to `on_frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Signal level of the latest native-rate tick, for visualisation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Level {
    pub rms: f32,
    pub peak: f32,
}

impl Level {
    pub fn measure(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let energy: f32 = samples.iter().map(|s| s * s).sum();
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        Self {
            rms: (energy / samples.len() as f32).sqrt(),
            peak,
        }
    }
}

/// A collected capture: WAV bytes plus wall-clock duration.
#[derive(Debug, Clone)]
pub struct Recording {
    pub wav: Vec<u8>,
    pub duration: Duration,
    pub sample_rate: u32,
}

impl Recording {
    pub fn is_persistable(&self) -> bool {
        self.duration >= MIN_PERSIST_DURATION
    }
}

/// Linear-interpolation resampler. Output length is `round(len / ratio)`.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src.floor() as usize;
            if idx < last {
                let frac = (src - idx as f64) as f32;
                input[idx] * (1.0 - frac) + input[idx + 1] * frac
            } else {
                input[idx.min(last)]
            }
        })
        .collect()
}

/// Clamps to `[-1, 1]`; negative values scale by 32768, positive by 32767.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Mono 16-bit PCM WAV with the canonical 44-byte header.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

struct ActiveCapture {
    running: Arc<AtomicBool>,
    handle: JoinHandle<(Vec<Vec<i16>>, Instant)>,
    started: Instant,
    collect: bool,
}

/// Owns at most one capture pipeline at a time.
pub struct AudioCapture {
    config: AudioConfig,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self { config, active: None }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Starts capturing from `source`. Frames go to `on_frame`; with `collect`
    /// they are also kept for the recording returned by `stop`.
    pub fn start(
        &mut self,
        source: Box<dyn MicSource>,
        on_frame: mpsc::Sender<AudioFrame>,
        collect: bool,
    ) -> Result<watch::Receiver<Level>, CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        if source.sample_rate() == 0 {
            return Err(CaptureError::DeviceUnavailable("source reports 0 Hz".to_string()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let (level_tx, level_rx) = watch::channel(Level::default());

        log::info!(
            "AudioCapture starting: native {}Hz -> {}Hz, tick={} samples, collect={}",
            source.sample_rate(),
            self.config.sample_rate,
            self.config.buffer_size,
            collect,
        );

        let handle = {
            let running = running.clone();
            let target_rate = self.config.sample_rate;
            let buffer_size = self.config.buffer_size.max(1);
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    record_thread(source, target_rate, buffer_size, collect, on_frame, level_tx, &running)
                })?
        };

        self.active = Some(ActiveCapture {
            running,
            handle,
            started: Instant::now(),
            collect,
        });
        Ok(level_rx)
    }

    /// Tears the pipeline down. Returns a recording only when collecting and
    /// at least one frame was captured.
    pub fn stop(&mut self) -> Result<Option<Recording>, CaptureError> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let stopped = Instant::now();
        active.running.store(false, Ordering::SeqCst);
        let (frames, ended) = active
            .handle
            .join()
            .map_err(|_| CaptureError::Thread(std::io::Error::other("capture thread panicked")))?;
        // 源提前耗尽时以采集线程结束时刻为准
        let duration = ended.min(stopped).saturating_duration_since(active.started);

        if !active.collect || frames.is_empty() {
            return Ok(None);
        }
        let samples: Vec<i16> = frames.concat();
        let wav = encode_wav(&samples, self.config.sample_rate)?;
        log::info!(
            "Capture stopped: {} frames, {} samples, {:.2}s",
            frames.len(),
            samples.len(),
            duration.as_secs_f32()
        );
        Ok(Some(Recording {
            wav,
            duration,
            sample_rate: self.config.sample_rate,
        }))
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.running.store(false, Ordering::SeqCst);
            let _ = active.handle.join();
        }
    }
}

fn record_thread(
    mut source: Box<dyn MicSource>,
    target_rate: u32,
    buffer_size: usize,
    collect: bool,
    on_frame: mpsc::Sender<AudioFrame>,
    level_tx: watch::Sender<Level>,
    running: &AtomicBool,
) -> (Vec<Vec<i16>>, Instant) {
    let native_rate = source.sample_rate();
    let mut read_buf = vec![0f32; buffer_size];
    let mut collected = Vec::new();

    log::info!("Recording started: rate={}, tick={}", native_rate, buffer_size);

    while running.load(Ordering::Relaxed) {
        let n = match source.read(&mut read_buf) {
            Ok(0) => {
                log::info!("Capture source exhausted");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("Capture read error: {}", e);
                break;
            }
        };
        let tick = &read_buf[..n];
        level_tx.send_replace(Level::measure(tick));

        let pcm = float_to_pcm16(&resample(tick, native_rate, target_rate));
        if pcm.is_empty() {
            continue;
        }
        if collect {
            collected.push(pcm.clone());
        }
        if on_frame.blocking_send(AudioFrame { samples: pcm }).is_err() {
            log::warn!("Frame receiver dropped, stopping capture");
            break;
        }
    }

    log::info!("Recording stopped");
    (collected, Instant::now())
}
