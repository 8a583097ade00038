//! Voice provider for Parley
//!
//! Turns text into audio the voice transport can play:
//! - ElevenLabs streaming TTS behind the [`SpeechSynthesizer`] trait
//! - A streaming [`Transcoder`] that decodes the synthesized MP3 as it
//!   arrives and cuts it into 20 ms, 48 kHz stereo frames

#![warn(missing_docs)]
#![warn(clippy::all)]

mod engines;
mod types;

pub mod transcode;

pub use engines::*;
pub use transcode::{AudioFrame, FrameStream, Transcoder};
pub use types::*;
