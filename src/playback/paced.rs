/// Software output device that consumes PCM at real-time speed.
///
/// Nothing is audible; each write blocks for as long as the bytes take to play,
/// which gives the engine the same backpressure a hardware sink would.
use std::ops::RangeInclusive;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::playback::output::{AudioOutput, AudioSink, ChannelLayout, OutputError, SampleEncoding, SinkConfig};

// Rates a typical mobile audio stack accepts for a track
const SUPPORTED_SAMPLE_RATES: RangeInclusive<u32> = 4_000..=192_000;

pub const DEFAULT_LATENCY_MS: u32 = 40;

#[derive(Debug, Clone)]
pub struct PacedOutput {
    latency_ms: u32,
}

impl PacedOutput {
    pub fn new(latency_ms: u32) -> Self {
        Self { latency_ms: latency_ms.max(1) }
    }
}

impl Default for PacedOutput {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_MS)
    }
}

impl AudioOutput for PacedOutput {
    fn min_buffer_size(&self, sample_rate_hz: u32, layout: ChannelLayout, encoding: SampleEncoding) -> Result<usize, OutputError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate_hz) {
            return Err(OutputError::Unsupported {
                message: format!(
                    "sample rate {sample_rate_hz} Hz outside {}..={} Hz",
                    SUPPORTED_SAMPLE_RATES.start(),
                    SUPPORTED_SAMPLE_RATES.end()
                ),
            });
        }

        let frames = (sample_rate_hz as u64 * self.latency_ms as u64).div_ceil(1000) as usize;
        let frame_size = layout.channels() as usize * encoding.bytes_per_sample();

        Ok(frames * frame_size)
    }

    fn open(&self, config: SinkConfig) -> Result<Box<dyn AudioSink>, OutputError> {
        if config.buffer_size == 0 {
            return Err(OutputError::Unsupported {
                message: "buffer size must be non-zero".to_string(),
            });
        }

        debug!("Opening paced sink: {config}");

        Ok(Box::new(PacedSink {
            bytes_per_second: config.sample_rate_hz as u64 * config.frame_size() as u64,
            playing: false,
            released: false,
        }))
    }
}

struct PacedSink {
    bytes_per_second: u64,
    playing: bool,
    released: bool,
}

impl PacedSink {
    fn ensure_open(&self) -> Result<(), OutputError> {
        if self.released {
            return Err(OutputError::Released);
        }

        Ok(())
    }

    fn play_time(&self, bytes: usize) -> Duration {
        Duration::from_micros(bytes as u64 * 1_000_000 / self.bytes_per_second)
    }
}

impl AudioSink for PacedSink {
    fn start(&mut self) -> Result<(), OutputError> {
        self.ensure_open()?;
        self.playing = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OutputError> {
        self.ensure_open()?;

        // A stopped stream only buffers, it does not drain
        if self.playing {
            let duration = self.play_time(data.len());
            trace!("Paced sink consuming {} bytes over {:?}", data.len(), duration);
            thread::sleep(duration);
        }

        Ok(())
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        self.ensure_open()?;
        self.playing = false;
        Ok(())
    }

    fn release(&mut self) -> Result<(), OutputError> {
        self.released = true;
        Ok(())
    }
}
