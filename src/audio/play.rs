use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::stream_decoder::{StreamDecoder, create_decoder};
use crate::config::AudioConfig;

/// One returned audio chunk, raw PCM16 plus its declared rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    pub pcm: Bytes,
    pub sample_rate: Option<u32>,
}

impl PlaybackItem {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: Option<u32>) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
        }
    }
}

/// Audio sink. `play` returns only once the buffer has finished sounding, which
/// is what keeps chunks from overlapping.
pub trait AudioOutput: Send {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// Output for hosts without a sound card: waits out the chunk duration.
#[derive(Debug, Default)]
pub struct PacedSilentOutput;

impl AudioOutput for PacedSilentOutput {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        if sample_rate == 0 {
            anyhow::bail!("sample rate must be non-zero");
        }
        thread::sleep(Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64));
        Ok(())
    }
}

/// Sequential playback queue served by a dedicated thread.
pub struct AudioPlayback {
    tx: Option<mpsc::UnboundedSender<PlaybackItem>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    pub fn start(config: &AudioConfig, output: Box<dyn AudioOutput>) -> Result<Self> {
        let decoder = create_decoder(&config.stream_format)?;
        let default_rate = config.playback_sample_rate;
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || play_thread(decoder, output, default_rate, rx, &running))?
        };

        Ok(Self {
            tx: Some(tx),
            running,
            handle: Some(handle),
        })
    }

    /// Handle for producers such as the controller.
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<PlaybackItem>> {
        self.tx.clone()
    }

    pub fn enqueue(&self, item: PlaybackItem) -> bool {
        match &self.tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Closes the queue and blocks until everything already queued has played.
    /// Other senders must be dropped first or this waits for them too.
    pub fn finish(mut self) {
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Stops after the chunk currently playing and joins the thread; queued
    /// chunks are discarded. Works while other senders are still alive.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tx) = self.tx.take() {
            // 空块只用来唤醒阻塞在 blocking_recv 的线程
            let _ = tx.send(PlaybackItem::new(Bytes::new(), None));
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_thread(
    mut decoder: Box<dyn StreamDecoder>,
    mut output: Box<dyn AudioOutput>,
    default_rate: u32,
    mut rx: mpsc::UnboundedReceiver<PlaybackItem>,
    running: &AtomicBool,
) {
    log::info!("Playback started: default rate={}", default_rate);

    // 一次只取一个块，播完再取下一个
    while let Some(item) = rx.blocking_recv() {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let samples = match decoder.decode(&item.pcm) {
            Ok(samples) if samples.is_empty() => continue,
            Ok(samples) => samples,
            Err(e) => {
                log::error!("Audio decode error: {}", e);
                continue;
            }
        };
        let rate = item.sample_rate.filter(|r| *r > 0).unwrap_or(default_rate);
        if let Err(e) = output.play(&samples, rate) {
            log::error!("Audio output error: {}", e);
        }
    }

    log::info!("Playback stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone)]
    struct Played {
        first_sample: f32,
        rate: u32,
        start: Instant,
        end: Instant,
    }

    struct RecordingOutput {
        log: Arc<Mutex<Vec<Played>>>,
    }

    impl AudioOutput for RecordingOutput {
        fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
            let start = Instant::now();
            thread::sleep(Duration::from_millis(15));
            self.log.lock().unwrap().push(Played {
                first_sample: samples[0],
                rate: sample_rate,
                start,
                end: Instant::now(),
            });
            Ok(())
        }
    }

    fn config() -> AudioConfig {
        crate::config::Config::default().audio
    }

    fn chunk(marker: i16) -> Bytes {
        Bytes::from(marker.to_le_bytes().repeat(8))
    }

    #[test]
    fn chunks_play_in_arrival_order_without_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let playback = AudioPlayback::start(&config(), Box::new(RecordingOutput { log: log.clone() })).unwrap();

        for i in 1..=5i16 {
            assert!(playback.enqueue(PlaybackItem::new(chunk(i * 1000), None)));
        }
        playback.finish();

        let played = log.lock().unwrap().clone();
        assert_eq!(played.len(), 5);
        for (i, p) in played.iter().enumerate() {
            let expected = ((i as i16 + 1) * 1000) as f32 / 32768.0;
            assert_eq!(p.first_sample, expected);
        }
        for pair in played.windows(2) {
            assert!(pair[1].start >= pair[0].end, "chunks overlapped");
        }
    }

    #[test]
    fn missing_rate_defaults_to_configured_rate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let playback = AudioPlayback::start(&config(), Box::new(RecordingOutput { log: log.clone() })).unwrap();
        playback.enqueue(PlaybackItem::new(chunk(1), None));
        playback.enqueue(PlaybackItem::new(chunk(1), Some(24000)));
        playback.enqueue(PlaybackItem::new(Bytes::new(), Some(8000)));
        playback.finish();

        let rates: Vec<u32> = log.lock().unwrap().iter().map(|p| p.rate).collect();
        assert_eq!(rates, vec![16000, 24000]);
    }

    #[test]
    fn stop_joins_while_other_senders_are_alive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut playback = AudioPlayback::start(&config(), Box::new(RecordingOutput { log: log.clone() })).unwrap();
        let producer = playback.sender().unwrap();
        producer.send(PlaybackItem::new(chunk(1), None)).unwrap();
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        playback.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(playback.handle.is_none());
        // 线程已退出，接收端随之释放
        assert!(producer.send(PlaybackItem::new(chunk(2), None)).is_err());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn paced_output_waits_for_chunk_duration() {
        let start = Instant::now();
        PacedSilentOutput.play(&vec![0.0; 800], 16000).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(PacedSilentOutput.play(&[0.0], 0).is_err());
    }
}
