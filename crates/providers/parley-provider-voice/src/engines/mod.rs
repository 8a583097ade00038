//! Speech synthesis engines

pub mod elevenlabs;

pub use elevenlabs::{ElevenLabsConfig, ElevenLabsModel, ElevenLabsVoiceEngine, DEFAULT_VOICE_ID};
