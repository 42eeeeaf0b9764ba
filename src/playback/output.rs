/// Audio output capability: the platform sink the engine streams PCM into.
///
/// Bindings implement [`AudioOutput`] to size and open sinks, and [`AudioSink`]
/// for the start/write/stop/release lifecycle of one opened stream.
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors reported by an output binding.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Unsupported output configuration: {message}")]
    Unsupported { message: String },

    #[cfg_attr(not(feature = "cpal"), allow(dead_code))]
    #[error("No output device available")]
    NoDevice,

    #[cfg_attr(not(feature = "cpal"), allow(dead_code))]
    #[error("Output device failure: {message}")]
    Device { message: String },

    #[error("Sink used after release")]
    Released,
}

/// Sample encoding handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleEncoding {
    /// Unsigned 8-bit PCM.
    Pcm8,
    /// Signed 16-bit little-endian PCM.
    Pcm16,
}

impl SampleEncoding {
    /// 16-bit sources get the wide encoding, everything else falls back to 8-bit.
    pub fn for_bits(bits_per_sample: u16) -> Self {
        if bits_per_sample == 16 {
            SampleEncoding::Pcm16
        } else {
            SampleEncoding::Pcm8
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Pcm8 => 1,
            SampleEncoding::Pcm16 => 2,
        }
    }
}

/// Channel configuration of the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    /// Exactly one channel is mono, any other count plays as stereo.
    pub fn for_count(channel_count: u16) -> Self {
        if channel_count == 1 {
            ChannelLayout::Mono
        } else {
            ChannelLayout::Stereo
        }
    }

    pub fn channels(self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }
}

/// Output route a sink is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamRoute {
    #[default]
    Music,
}

/// How data reaches the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Caller pushes chunks with blocking writes.
    #[default]
    Stream,
}

/// Everything needed to open a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub route: StreamRoute,
    pub sample_rate_hz: u32,
    pub layout: ChannelLayout,
    pub encoding: SampleEncoding,
    pub buffer_size: usize,
    pub mode: TransferMode,
}

impl SinkConfig {
    pub fn frame_size(&self) -> usize {
        self.layout.channels() as usize * self.encoding.bytes_per_sample()
    }
}

impl fmt::Display for SinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} {} Hz {:?} {:?}, buffer {} bytes",
            self.route, self.mode, self.sample_rate_hz, self.layout, self.encoding, self.buffer_size
        )
    }
}

/// Factory side of a platform output.
pub trait AudioOutput: Send + Sync {
    /// Smallest buffer in bytes the device accepts for this combination.
    fn min_buffer_size(&self, sample_rate_hz: u32, layout: ChannelLayout, encoding: SampleEncoding) -> Result<usize, OutputError>;

    /// Open a sink. The sink is not playing until [`AudioSink::start`].
    fn open(&self, config: SinkConfig) -> Result<Box<dyn AudioSink>, OutputError>;
}

/// One opened output stream.
///
/// Sinks live on the thread that opened them, so no `Send` bound.
pub trait AudioSink {
    fn start(&mut self) -> Result<(), OutputError>;

    /// Blocks until the device has accepted all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<(), OutputError>;

    fn stop(&mut self) -> Result<(), OutputError>;

    fn release(&mut self) -> Result<(), OutputError>;
}
