//! ALSA PCM device wrappers for audio capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::play::AudioOutput;
use super::record::MicSource;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Mono S16LE capture device.
pub struct AlsaMic {
    pcm: PCM,
    params: AlsaParams,
    read_buf: Vec<i16>,
}

impl AlsaMic {
    pub fn open(device: &str, sample_rate: u32) -> Result<Self> {
        let (pcm, params) = open_pcm(device, Direction::Capture, sample_rate, 1, "Capture")?;
        Ok(Self {
            pcm,
            params,
            read_buf: Vec::new(),
        })
    }
}

impl MicSource for AlsaMic {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        self.read_buf.resize(buf.len(), 0);
        let io = self.pcm.io_i16()?;
        loop {
            match io.readi(&mut self.read_buf) {
                Ok(frames) => {
                    for (dst, src) in buf.iter_mut().zip(&self.read_buf[..frames]) {
                        *dst = *src as f32 / 32768.0;
                    }
                    return Ok(frames);
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    self.pcm
                        .prepare()
                        .context("Failed to recover PCM capture")?;
                }
            }
        }
    }
}

/// Mono S16LE playback device, reopened whenever the chunk rate changes.
pub struct AlsaOutput {
    device: String,
    current: Option<(PCM, AlsaParams)>,
}

impl AlsaOutput {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            current: None,
        }
    }

    fn pcm_for_rate(&mut self, sample_rate: u32) -> Result<&PCM> {
        let reopen = match &self.current {
            Some((_, params)) => params.sample_rate != sample_rate,
            None => true,
        };
        if reopen {
            self.current = None;
            let opened = open_pcm(&self.device, Direction::Playback, sample_rate, 1, "Playback")?;
            self.current = Some(opened);
        }
        self.current
            .as_ref()
            .map(|(pcm, _)| pcm)
            .context("playback device not open")
    }
}

impl AudioOutput for AlsaOutput {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let pcm = self.pcm_for_rate(sample_rate)?;
        let data: Vec<i16> = samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        let io = pcm.io_i16()?;

        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < data.len() {
            match io.writei(&data[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    // 底层持续跟不上时丢弃剩余帧
                    if retry_count >= 3 {
                        log::error!(
                            "Dropping {} unwritten frames after {} recoveries",
                            data.len() - frames_written,
                            retry_count
                        );
                        break;
                    }
                }
            }
        }

        // 等待本块播放完毕再返回，保证块与块之间不重叠
        pcm.drain()?;
        pcm.prepare()?;
        Ok(())
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
