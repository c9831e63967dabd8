//! Generic stream decoder trait for multi-format audio playback support.

use anyhow::Result;

/// Converts one received audio chunk into mono float samples in `[-1, 1]`.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>>;
}

/// Little-endian signed 16-bit PCM. A trailing odd byte is dropped.
#[derive(Debug, Default)]
pub struct Pcm16Decoder;

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>> {
        if data.len() % 2 != 0 {
            log::warn!("PCM chunk has odd length {}, dropping last byte", data.len());
        }
        Ok(data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect())
    }
}

/// Factory keyed by the configured stream format.
pub fn create_decoder(stream_format: &str) -> Result<Box<dyn StreamDecoder>> {
    match stream_format {
        "pcm_s16le" | "pcm" => Ok(Box::new(Pcm16Decoder)),
        other => anyhow::bail!("Unsupported stream format: {}", other),
    }
}
