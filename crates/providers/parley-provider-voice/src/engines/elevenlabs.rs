//! ElevenLabs TTS Engine
//!
//! Streams MP3 audio from the ElevenLabs streaming endpoint. The HTTP status
//! is checked before the stream is handed out, so credential and quota
//! failures reach the caller as a [`SynthesisError`] instead of an empty
//! audio stream.

use async_trait::async_trait;
use futures_util::StreamExt;
use parley_core::{get_env_or, get_optional_env, SynthesisError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::*;

/// ElevenLabs API base URL
const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";

/// Default voice used when none is configured
pub const DEFAULT_VOICE_ID: &str = "JBFqnCBsd6RMkjVDRZzb";

/// MP3 at 44.1 kHz / 128 kbps
const OUTPUT_FORMAT: &str = "mp3_44100_128";

/// 0 (off) to 4 (max); 3 trades a little quality for much faster first byte
const OPTIMIZE_STREAMING_LATENCY: u8 = 3;

/// Request text limit enforced by the API
const MAX_TEXT_LENGTH: usize = 5000;

/// Chunks buffered between the HTTP body and the transcoder
const STREAM_BUFFER: usize = 32;

/// ElevenLabs model ID
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ElevenLabsModel {
    /// Multilingual v2 - Best quality, supports many languages
    MultilingualV2,
    /// Turbo v2.5 - Fastest, multilingual
    #[default]
    TurboV2_5,
    /// Custom model ID
    Custom(String),
}

impl ElevenLabsModel {
    /// Get model ID string
    pub fn as_str(&self) -> &str {
        match self {
            Self::MultilingualV2 => "eleven_multilingual_v2",
            Self::TurboV2_5 => "eleven_turbo_v2_5",
            Self::Custom(id) => id,
        }
    }

    /// Parse a configured model id
    pub fn from_id(id: &str) -> Self {
        match id {
            "eleven_multilingual_v2" => Self::MultilingualV2,
            "eleven_turbo_v2_5" => Self::TurboV2_5,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// ElevenLabs engine settings
#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    /// API key; `None` disables the engine
    pub api_key: Option<String>,
    /// Voice to speak with
    pub voice_id: String,
    /// Model to use
    pub model: ElevenLabsModel,
    /// API base URL
    pub base_url: String,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model: ElevenLabsModel::default(),
            base_url: ELEVENLABS_API_BASE.to_string(),
        }
    }
}

impl ElevenLabsConfig {
    /// Read `ELEVENLABS_API_KEY`, `ELEVENLABS_VOICE_ID` and `ELEVENLABS_MODEL_ID`
    pub fn from_env() -> Self {
        Self {
            api_key: get_optional_env("ELEVENLABS_API_KEY"),
            voice_id: get_env_or("ELEVENLABS_VOICE_ID", DEFAULT_VOICE_ID),
            model: ElevenLabsModel::from_id(&get_env_or(
                "ELEVENLABS_MODEL_ID",
                ElevenLabsModel::default().as_str(),
            )),
            ..Default::default()
        }
    }
}

/// ElevenLabs voice settings
#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    use_speaker_boost: Option<bool>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            use_speaker_boost: Some(true),
        }
    }
}

/// ElevenLabs TTS request
#[derive(Debug, Serialize)]
struct ElevenLabsTTSRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

/// ElevenLabs voice info from API
#[derive(Debug, Deserialize)]
struct ElevenLabsVoiceInfo {
    voice_id: String,
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    preview_url: Option<String>,
}

/// ElevenLabs voices response
#[derive(Debug, Deserialize)]
struct ElevenLabsVoicesResponse {
    voices: Vec<ElevenLabsVoiceInfo>,
}

/// ElevenLabs voice engine
pub struct ElevenLabsVoiceEngine {
    config: ElevenLabsConfig,
    client: Client,
}

impl ElevenLabsVoiceEngine {
    /// Create new ElevenLabs voice engine
    pub fn new(config: ElevenLabsConfig) -> Self {
        if config.api_key.is_none() {
            tracing::warn!("ELEVENLABS_API_KEY is not configured. Speech features are disabled.");
        } else {
            tracing::info!(
                voice_id = %config.voice_id,
                model = %config.model.as_str(),
                "ElevenLabs engine initialized"
            );
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    /// Create from the process environment
    pub fn from_env() -> Self {
        Self::new(ElevenLabsConfig::from_env())
    }

    fn api_key(&self) -> Result<&str, SynthesisError> {
        self.config.api_key.as_deref().ok_or_else(|| {
            SynthesisError::NotConfigured(
                "ElevenLabs client not initialized - check ELEVENLABS_API_KEY".to_string(),
            )
        })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/text-to-speech/{}/stream?output_format={}&optimize_streaming_latency={}",
            self.config.base_url, self.config.voice_id, OUTPUT_FORMAT, OPTIMIZE_STREAMING_LATENCY
        )
    }

    /// Map a non-success response to the error taxonomy
    fn status_error(status: StatusCode, body: String) -> SynthesisError {
        match status.as_u16() {
            401 | 403 => SynthesisError::Authentication(body),
            429 => SynthesisError::RateLimited(body),
            code => SynthesisError::Api {
                status: code,
                message: body,
            },
        }
    }

    /// List the voices available to this account
    pub async fn available_voices(&self) -> Result<Vec<Voice>, SynthesisError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(format!("{}/voices", self.config.base_url))
            .header("xi-api-key", api_key)
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "Failed to fetch voices from ElevenLabs");
            return Err(Self::status_error(status, body));
        }

        let voices: ElevenLabsVoicesResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::Network(format!("Failed to parse voices: {}", e)))?;

        Ok(voices.voices.into_iter().map(Self::map_voice_info).collect())
    }

    /// Map API voice info to Voice struct
    fn map_voice_info(info: ElevenLabsVoiceInfo) -> Voice {
        let gender = info
            .labels
            .get("gender")
            .map(|g| match g.to_lowercase().as_str() {
                "female" => VoiceGender::Female,
                "male" => VoiceGender::Male,
                _ => VoiceGender::Neutral,
            })
            .unwrap_or(VoiceGender::Neutral);

        Voice {
            id: info.voice_id,
            name: info.name,
            gender,
            description: info.labels.get("description").cloned(),
            preview_url: info.preview_url,
        }
    }
}

/// Shorten text for log lines
fn preview(text: &str) -> String {
    const LIMIT: usize = 50;
    match text.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsVoiceEngine {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, SynthesisError> {
        let api_key = self.api_key()?;

        if text.len() > MAX_TEXT_LENGTH {
            return Err(SynthesisError::TextTooLong {
                length: text.len(),
                max: MAX_TEXT_LENGTH,
            });
        }

        tracing::info!(text = %preview(text), "Generating speech");

        let request = ElevenLabsTTSRequest {
            text,
            model_id: self.config.model.as_str(),
            voice_settings: VoiceSettings::default(),
        };

        let response = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", api_key)
            .header("Accept", self.output_format().mime_type())
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, "ElevenLabs rejected the speech request");
            return Err(Self::status_error(status, body));
        }

        let (tx, rx) = create_audio_stream(STREAM_BUFFER);
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut index = 0;
            while let Some(chunk) = body.next().await {
                let item = chunk
                    .map(|data| AudioChunk {
                        data,
                        index,
                        is_final: false,
                    })
                    .map_err(|e| SynthesisError::Network(e.to_string()));
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    tracing::debug!("Speech stream receiver dropped");
                    return;
                }
                if failed {
                    tracing::error!("Error reading ElevenLabs stream");
                    return;
                }
                index += 1;
            }

            let _ = tx
                .send(Ok(AudioChunk {
                    data: bytes::Bytes::new(),
                    index,
                    is_final: true,
                }))
                .await;
            tracing::debug!(chunks = index, "ElevenLabs speech generation completed");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(api_key: Option<&str>) -> ElevenLabsVoiceEngine {
        ElevenLabsVoiceEngine::new(ElevenLabsConfig {
            api_key: api_key.map(str::to_string),
            ..Default::default()
        })
    }

    #[test]
    fn test_model_strings() {
        assert_eq!(ElevenLabsModel::TurboV2_5.as_str(), "eleven_turbo_v2_5");
        assert_eq!(
            ElevenLabsModel::from_id("eleven_multilingual_v2"),
            ElevenLabsModel::MultilingualV2
        );
        assert_eq!(ElevenLabsModel::from_id("my_model").as_str(), "my_model");
    }

    #[test]
    fn test_configured_only_with_key() {
        assert!(!engine(None).is_configured());
        assert!(engine(Some("key")).is_configured());
    }

    #[test]
    fn test_stream_url() {
        let url = engine(Some("key")).stream_url();
        assert_eq!(
            url,
            "https://api.elevenlabs.io/v1/text-to-speech/JBFqnCBsd6RMkjVDRZzb/stream\
             ?output_format=mp3_44100_128&optimize_streaming_latency=3"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ElevenLabsVoiceEngine::status_error(StatusCode::UNAUTHORIZED, String::new()),
            SynthesisError::Authentication(_)
        ));
        assert!(matches!(
            ElevenLabsVoiceEngine::status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            SynthesisError::RateLimited(_)
        ));
        assert_eq!(
            ElevenLabsVoiceEngine::status_error(StatusCode::BAD_GATEWAY, "down".into()),
            SynthesisError::Api {
                status: 502,
                message: "down".into()
            }
        );
    }

    #[test]
    fn test_request_body() {
        let request = ElevenLabsTTSRequest {
            text: "hola",
            model_id: "eleven_turbo_v2_5",
            voice_settings: VoiceSettings::default(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["text"], "hola");
        assert_eq!(json["model_id"], "eleven_turbo_v2_5");
        assert_eq!(json["voice_settings"]["similarity_boost"], 0.75);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let text = "¡Hola! ".repeat(20);
        let short = preview(&text);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), 53);
        assert_eq!(preview("hola"), "hola");
    }

    #[tokio::test]
    async fn test_unconfigured_synthesis_fails_fast() {
        let err = engine(None).synthesize("hola").await.unwrap_err();
        assert!(matches!(err, SynthesisError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn test_text_length_limit() {
        let text = "a".repeat(MAX_TEXT_LENGTH + 1);
        let err = engine(Some("key")).synthesize(&text).await.unwrap_err();
        assert_eq!(
            err,
            SynthesisError::TextTooLong {
                length: MAX_TEXT_LENGTH + 1,
                max: MAX_TEXT_LENGTH
            }
        );
    }

    #[test]
    fn test_voice_mapping() {
        let info = ElevenLabsVoiceInfo {
            voice_id: "abc".into(),
            name: "George".into(),
            labels: HashMap::from([("gender".to_string(), "male".to_string())]),
            preview_url: None,
        };
        let voice = ElevenLabsVoiceEngine::map_voice_info(info);
        assert_eq!(voice.gender, VoiceGender::Male);
        assert_eq!(voice.name, "George");
    }
}
