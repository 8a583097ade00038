//! Core types for the voice provider

use async_trait::async_trait;
use bytes::Bytes;
use parley_core::SynthesisError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Compressed audio container produced by a TTS engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioFormat {
    /// MP3 (what ElevenLabs streams by default)
    #[default]
    Mp3,
    /// WAV with a RIFF header
    Wav,
}

impl AudioFormat {
    /// File extension, used as a probe hint
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    /// MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }
}

/// Voice gender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VoiceGender {
    /// Female voice
    #[default]
    Female,
    /// Male voice
    Male,
    /// Neutral/unspecified
    Neutral,
}

/// A voice offered by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    /// Voice identifier (engine-specific)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Voice gender
    pub gender: VoiceGender,
    /// Voice description
    pub description: Option<String>,
    /// Preview URL (if available)
    pub preview_url: Option<String>,
}

/// Audio stream chunk
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Chunk data
    pub data: Bytes,
    /// Chunk index
    pub index: usize,
    /// Is this the final chunk?
    pub is_final: bool,
}

/// Audio stream receiver type
pub type AudioStream = mpsc::Receiver<Result<AudioChunk, SynthesisError>>;

/// Audio stream sender type
pub type AudioStreamSender = mpsc::Sender<Result<AudioChunk, SynthesisError>>;

/// Create an audio stream channel
pub fn create_audio_stream(buffer_size: usize) -> (AudioStreamSender, AudioStream) {
    mpsc::channel(buffer_size)
}

/// Text-to-speech collaborator
///
/// Implementations return as soon as the provider has accepted the request;
/// audio bytes then arrive on the returned stream while the provider is
/// still generating.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Whether credentials are present; speech features are disabled otherwise
    fn is_configured(&self) -> bool;

    /// Container format of the bytes [`SpeechSynthesizer::synthesize`] yields
    fn output_format(&self) -> AudioFormat {
        AudioFormat::Mp3
    }

    /// Start synthesizing `text`
    async fn synthesize(&self, text: &str) -> Result<AudioStream, SynthesisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hints() {
        assert_eq!(AudioFormat::default(), AudioFormat::Mp3);
        assert_eq!(AudioFormat::Mp3.extension(), "mp3");
        assert_eq!(AudioFormat::Wav.mime_type(), "audio/wav");
    }

    #[tokio::test]
    async fn test_audio_stream_closes_when_sender_dropped() {
        let (tx, mut rx) = create_audio_stream(4);
        tx.send(Ok(AudioChunk {
            data: Bytes::from_static(b"abc"),
            index: 0,
            is_final: false,
        }))
        .await
        .unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.data.as_ref(), b"abc");
        assert!(rx.recv().await.is_none());
    }
}
