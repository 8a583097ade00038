//! Streaming transcoder: compressed speech bytes in, voice frames out
//!
//! The decoder runs on a blocking worker and talks to the async side through
//! two bounded channels. It pulls input chunks only as fast as it can hand
//! finished frames to the consumer, so memory stays bounded no matter how
//! long the utterance is.
//!
//! Output frames are 20 ms of 48 kHz stereo, interleaved `f32`, which is the
//! PCM layout the voice driver encodes to Opus.

use bytes::{Buf, Bytes};
use parley_core::TranscodeError;
use rubato::{FftFixedIn, Resampler};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AudioFormat, AudioStream};

/// Transport sample rate
pub const SAMPLE_RATE: u32 = 48_000;
/// Transport channel count
pub const CHANNELS: usize = 2;
/// Duration of one frame
pub const FRAME_DURATION_MS: u32 = 20;
/// Samples per channel in one frame
pub const SAMPLES_PER_CHANNEL: usize = (SAMPLE_RATE / 1000 * FRAME_DURATION_MS) as usize;
/// Interleaved samples in one frame
pub const FRAME_LEN: usize = SAMPLES_PER_CHANNEL * CHANNELS;

/// Frames buffered ahead of the consumer (one second of audio)
const DEFAULT_FRAME_BUFFER: usize = 50;

/// Input block handed to the resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Upper bound on silent blocks pushed through to drain the resampler
const FLUSH_ROUNDS: usize = 4;

/// One fixed-size unit of transport audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    fn new(samples: Vec<f32>) -> Self {
        debug_assert_eq!(samples.len(), FRAME_LEN);
        Self { samples }
    }

    /// Interleaved stereo samples, always [`FRAME_LEN`] long
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Little-endian byte encoding of the samples
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Output of one transcoding run
///
/// Channel closure is the end-of-stream signal. A failure is delivered as a
/// single `Err` item, after which the channel closes.
pub type FrameStream = mpsc::Receiver<Result<AudioFrame, TranscodeError>>;

/// Turns a synthesized audio stream into transport frames
#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    format: AudioFormat,
    buffer_frames: usize,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new(AudioFormat::default())
    }
}

impl Transcoder {
    /// Create a transcoder expecting input in `format`
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            buffer_frames: DEFAULT_FRAME_BUFFER,
        }
    }

    /// Change how many frames may wait for the consumer
    pub fn with_buffer(mut self, frames: usize) -> Self {
        self.buffer_frames = frames.max(1);
        self
    }

    /// Start transcoding `input`
    ///
    /// Each call consumes its input; a new playback needs a new call.
    pub fn spawn(&self, input: AudioStream) -> FrameStream {
        let (tx, rx) = mpsc::channel(self.buffer_frames);
        let format = self.format;

        tokio::task::spawn_blocking(move || {
            let result = transcode(input, format, &mut |frame| tx.blocking_send(Ok(frame)).is_ok());
            match result {
                Ok(frames) => debug!(frames, "Transcoding finished"),
                Err(e) => {
                    warn!(error = %e, "Transcoding stopped early");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        rx
    }
}

/// Decode everything `input` yields, calling `emit` per finished frame
///
/// Returns the number of frames emitted. Stops quietly when `emit` reports
/// the consumer is gone.
fn transcode(
    input: AudioStream,
    format: AudioFormat,
    emit: &mut dyn FnMut(AudioFrame) -> bool,
) -> Result<usize, TranscodeError> {
    let mut reader = ChunkReader::new(input);
    if !reader.has_data().map_err(input_error)? {
        return Ok(0);
    }

    let mss = MediaSourceStream::new(Box::new(reader), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            SymphoniaError::IoError(io) => input_error(io),
            other => TranscodeError::Unsupported(other.to_string()),
        })?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| TranscodeError::Unsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| TranscodeError::Unsupported(e.to_string()))?;

    let mut assembler = FrameAssembler::default();
    let mut emitted = 0;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            // Truncated input simply ends the stream
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::IoError(e)) => return Err(input_error(e)),
            Err(e) => return Err(TranscodeError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder
            .decode(&packet)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        let spec = *decoded.spec();
        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        assembler.push(samples.samples(), spec.rate, spec.channels.count())?;
        while let Some(frame) = assembler.next_frame() {
            if !emit(frame) {
                debug!(emitted, "Frame consumer went away");
                return Ok(emitted);
            }
            emitted += 1;
        }
    }

    assembler.finish()?;
    while let Some(frame) = assembler.next_frame() {
        if !emit(frame) {
            return Ok(emitted);
        }
        emitted += 1;
    }
    Ok(emitted)
}

fn input_error(e: io::Error) -> TranscodeError {
    TranscodeError::Input(e.to_string())
}

/// Blocking `Read` over the async chunk channel
///
/// Only ever used from the blocking worker, where `blocking_recv` is allowed.
struct ChunkReader {
    input: Mutex<AudioStream>,
    current: Bytes,
    finished: bool,
}

impl ChunkReader {
    fn new(input: AudioStream) -> Self {
        Self {
            input: Mutex::new(input),
            current: Bytes::new(),
            finished: false,
        }
    }

    /// Load the next non-empty chunk; `false` at end of input
    fn next_chunk(&mut self) -> io::Result<bool> {
        let input = self.input.get_mut().unwrap_or_else(|p| p.into_inner());
        while !self.finished {
            match input.blocking_recv() {
                None => self.finished = true,
                Some(Ok(chunk)) => {
                    self.finished = chunk.is_final;
                    if !chunk.data.is_empty() {
                        self.current = chunk.data;
                        return Ok(true);
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
                }
            }
        }
        Ok(false)
    }

    /// Whether at least one byte is available
    fn has_data(&mut self) -> io::Result<bool> {
        if !self.current.is_empty() {
            return Ok(true);
        }
        self.next_chunk()
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.has_data()? {
            return Ok(0);
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl Seek for ChunkReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "speech stream is not seekable",
        ))
    }
}

impl MediaSource for ChunkReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Collects decoded PCM of any rate/layout into fixed transport frames
#[derive(Default)]
struct FrameAssembler {
    source_rate: Option<u32>,
    resampler: Option<FftFixedIn<f32>>,
    /// Per-channel input waiting for a full resampler block
    staged: [Vec<f32>; CHANNELS],
    count: ResampleCount,
    /// Interleaved output at the transport rate
    pending: Vec<f32>,
    /// Read offset into `pending`
    cursor: usize,
}

/// Resampler bookkeeping: output is shifted by the filter delay
#[derive(Default)]
struct ResampleCount {
    /// Leading output frames still to drop
    skip: usize,
    frames_in: usize,
    frames_out: usize,
}

impl ResampleCount {
    /// Append up to `limit` frames of planar `out` to `pending` as interleaved
    fn emit(&mut self, pending: &mut Vec<f32>, out: &[Vec<f32>], limit: usize) {
        let len = out.iter().map(Vec::len).min().unwrap_or(0);
        let skipped = self.skip.min(len);
        self.skip -= skipped;
        let take = (len - skipped).min(limit);
        pending.reserve(take * CHANNELS);
        for i in skipped..skipped + take {
            pending.push(out[0][i]);
            pending.push(out.get(1).map_or(out[0][i], |c| c[i]));
        }
        self.frames_out += take;
    }
}

impl FrameAssembler {
    fn push(
        &mut self,
        interleaved: &[f32],
        rate: u32,
        channels: usize,
    ) -> Result<(), TranscodeError> {
        if channels == 0 {
            return Err(TranscodeError::Unsupported("zero channels".to_string()));
        }
        match self.source_rate {
            None => {
                self.source_rate = Some(rate);
                if rate != SAMPLE_RATE {
                    let resampler = FftFixedIn::<f32>::new(
                        rate as usize,
                        SAMPLE_RATE as usize,
                        RESAMPLE_CHUNK,
                        2,
                        CHANNELS,
                    )
                    .map_err(|e| TranscodeError::Resample(e.to_string()))?;
                    self.count.skip = resampler.output_delay();
                    self.resampler = Some(resampler);
                }
            }
            Some(known) if known != rate => {
                return Err(TranscodeError::Unsupported(format!(
                    "sample rate changed mid-stream ({} -> {})",
                    known, rate
                )));
            }
            Some(_) => {}
        }

        // Mono is duplicated; anything beyond stereo keeps the front pair
        for frame in interleaved.chunks_exact(channels) {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { frame[0] };
            if self.resampler.is_some() {
                self.staged[0].push(left);
                self.staged[1].push(right);
            } else {
                self.pending.push(left);
                self.pending.push(right);
            }
        }

        self.resample_ready()
    }

    fn resample_ready(&mut self) -> Result<(), TranscodeError> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        loop {
            let needed = resampler.input_frames_next();
            if self.staged[0].len() < needed {
                return Ok(());
            }
            let out = resampler
                .process(&[&self.staged[0][..needed], &self.staged[1][..needed]], None)
                .map_err(|e| TranscodeError::Resample(e.to_string()))?;
            for channel in &mut self.staged {
                channel.drain(..needed);
            }
            self.count.frames_in += needed;
            self.count.emit(&mut self.pending, &out, usize::MAX);
        }
    }

    /// Flush the resampler and pad the tail to a whole frame with silence
    ///
    /// Resampled output ends up exactly as long as the input's duration.
    fn finish(&mut self) -> Result<(), TranscodeError> {
        if let (Some(resampler), Some(rate)) = (self.resampler.as_mut(), self.source_rate) {
            let remaining = self.staged[0].len();
            let frames_in = self.count.frames_in + remaining;
            let expected = (frames_in as u64 * SAMPLE_RATE as u64).div_ceil(rate as u64) as usize;

            if remaining > 0 {
                let staged = [&self.staged[0][..], &self.staged[1][..]];
                let out = resampler
                    .process_partial(Some(&staged[..]), None)
                    .map_err(|e| TranscodeError::Resample(e.to_string()))?;
                self.count.frames_in = frames_in;
                let limit = expected.saturating_sub(self.count.frames_out);
                self.count.emit(&mut self.pending, &out, limit);
                for channel in &mut self.staged {
                    channel.clear();
                }
            }

            // The filter delay still holds the end of the input
            let mut rounds = 0;
            while self.count.frames_out < expected && rounds < FLUSH_ROUNDS {
                let out = resampler
                    .process_partial(None::<&[Vec<f32>]>, None)
                    .map_err(|e| TranscodeError::Resample(e.to_string()))?;
                let limit = expected - self.count.frames_out;
                self.count.emit(&mut self.pending, &out, limit);
                rounds += 1;
            }
        }

        let tail = (self.pending.len() - self.cursor) % FRAME_LEN;
        if tail != 0 {
            self.pending.resize(self.pending.len() + FRAME_LEN - tail, 0.0);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.pending.len() - self.cursor < FRAME_LEN {
            if self.cursor > 0 {
                self.pending.drain(..self.cursor);
                self.cursor = 0;
            }
            return None;
        }
        let start = self.cursor;
        self.cursor += FRAME_LEN;
        Some(AudioFrame::new(self.pending[start..self.cursor].to_vec()))
    }
}
