//! audio - capture, resampling and sequential playback
//!
//! Capture and playback each run on a dedicated thread and exchange data with
//! async code over tokio channels. ALSA devices are behind the `alsa` feature;
//! without it a WAV file stands in for the microphone and playback is paced
//! silently.

#[cfg(feature = "alsa")]
mod alsa_device;
mod audio_system;
pub mod play;
pub mod record;
pub mod stream_decoder;

#[cfg(feature = "alsa")]
pub use alsa_device::{AlsaMic, AlsaOutput};
pub use audio_system::AudioSystem;
pub use play::{AudioOutput, AudioPlayback, PacedSilentOutput, PlaybackItem};
pub use record::{
    AudioCapture, AudioFrame, CaptureError, Level, MIN_PERSIST_DURATION, MicSource, Recording,
    WavFileSource, encode_wav, float_to_pcm16, resample,
};
pub use stream_decoder::{Pcm16Decoder, StreamDecoder, create_decoder};
