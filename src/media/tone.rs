/// Sine-wave WAV fixtures for exercising playback across sample rates and bit depths.
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use itertools::iproduct;
use thiserror::Error;
use tracing::info;

use crate::media::wav::{create_wav_header, AudioFormatDescriptor};

pub const FIXTURE_SAMPLE_RATES: [u32; 4] = [8000, 16000, 44100, 48000];
pub const FIXTURE_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];
pub const FIXTURE_DURATION_SECS: f64 = 5.0;
pub const FIXTURE_CHANNELS: u16 = 2;
pub const FIXTURE_FREQUENCY_HZ: f64 = 440.0; // A4

// 8-bit PCM is unsigned, centred on 128
const PCM8_CENTER: f64 = 128.0;

type Result<T> = std::result::Result<T, ToneError>;

#[derive(Debug, Error)]
pub enum ToneError {
    #[error("Unsupported bit depth {0}, choose from 8, 16, 24, 32")]
    UnsupportedBitDepth(u16),

    #[error("Invalid tone parameters: {message}")]
    InvalidParameters { message: String },

    #[error("Failed to write fixture {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parameters of a generated tone.
#[derive(Debug, Clone, Copy)]
pub struct ToneSpec {
    pub sample_rate_hz: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub duration_secs: f64,
    pub frequency_hz: f64,
}

impl ToneSpec {
    pub fn fixture(sample_rate_hz: u32, bits_per_sample: u16) -> Self {
        Self {
            sample_rate_hz,
            bits_per_sample,
            channels: FIXTURE_CHANNELS,
            duration_secs: FIXTURE_DURATION_SECS,
            frequency_hz: FIXTURE_FREQUENCY_HZ,
        }
    }

    fn validate(&self) -> Result<()> {
        if !FIXTURE_BIT_DEPTHS.contains(&self.bits_per_sample) {
            return Err(ToneError::UnsupportedBitDepth(self.bits_per_sample));
        }

        if self.sample_rate_hz == 0 || self.channels == 0 {
            return Err(ToneError::InvalidParameters {
                message: format!("sample rate {} and channels {} must be non-zero", self.sample_rate_hz, self.channels),
            });
        }

        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            return Err(ToneError::InvalidParameters {
                message: format!("duration {} must be a finite, non-negative number of seconds", self.duration_secs),
            });
        }

        Ok(())
    }

    fn frame_count(&self) -> usize {
        (self.sample_rate_hz as f64 * self.duration_secs) as usize
    }

    /// File name used by the fixture set.
    pub fn file_name(&self) -> String {
        format!("test_{}Hz_{}bit.wav", self.sample_rate_hz, self.bits_per_sample)
    }
}

/// Render a complete WAV file (header plus PCM data) for `spec`.
pub fn generate_sine_wav(spec: &ToneSpec) -> Result<Vec<u8>> {
    spec.validate()?;

    let frames = spec.frame_count();
    let bytes_per_sample = (spec.bits_per_sample / 8) as usize;
    let data_len = frames * spec.channels as usize * bytes_per_sample;
    let data_byte_length = u32::try_from(data_len).map_err(|_| ToneError::InvalidParameters {
        message: format!("{data_len} data bytes do not fit a WAV header"),
    })?;

    let format = AudioFormatDescriptor {
        sample_rate_hz: spec.sample_rate_hz,
        bits_per_sample: spec.bits_per_sample,
        channel_count: spec.channels,
        data_byte_length,
    };

    let header = create_wav_header(&format);
    let mut wav = BytesMut::with_capacity(header.len() + data_len);
    wav.put_slice(&header);

    for frame in 0..frames {
        let t = frame as f64 / spec.sample_rate_hz as f64;
        let value = (2.0 * PI * spec.frequency_hz * t).sin();

        // Same sample on every channel
        for _ in 0..spec.channels {
            put_sample(&mut wav, value, spec.bits_per_sample);
        }
    }

    Ok(wav.to_vec())
}

/// Write the full rate × bit-depth fixture matrix into `dir`.
pub fn write_fixture_set(dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).map_err(|e| ToneError::Write {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut written = Vec::with_capacity(FIXTURE_SAMPLE_RATES.len() * FIXTURE_BIT_DEPTHS.len());
    for (rate, bits) in iproduct!(FIXTURE_SAMPLE_RATES, FIXTURE_BIT_DEPTHS) {
        let spec = ToneSpec::fixture(rate, bits);
        let path = dir.join(spec.file_name());
        let wav = generate_sine_wav(&spec)?;

        std::fs::write(&path, &wav).map_err(|e| ToneError::Write { path: path.clone(), source: e })?;

        info!("Generated WAV file {:?}: {} Hz, {} bit, {} s", path, rate, bits, spec.duration_secs);
        written.push(path);
    }

    Ok(written)
}

fn put_sample(buf: &mut BytesMut, value: f64, bits_per_sample: u16) {
    match bits_per_sample {
        8 => buf.put_u8((PCM8_CENTER + value * i8::MAX as f64) as u8),
        16 => buf.put_i16_le((value * i16::MAX as f64) as i16),
        24 => {
            let sample = (value * 8_388_607.0) as i32;
            buf.put_slice(&sample.to_le_bytes()[..3]);
        }
        _ => buf.put_i32_le((value * i32::MAX as f64) as i32),
    }
}
