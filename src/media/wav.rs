/// Canonical 44-byte WAV header parsing and writing.
///
/// Only the minimal `RIFF/WAVE/fmt /data` layout is understood: the format
/// fields are read from fixed offsets and the PCM data starts at byte 44.
use std::io::{ErrorKind, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const WAV_HEADER_LEN: usize = 44;

// Field offsets inside the canonical header
const RIFF_TAG_OFFSET: usize = 0;
const WAVE_TAG_OFFSET: usize = 8;
const FMT_TAG_OFFSET: usize = 12;
const AUDIO_FORMAT_OFFSET: usize = 20;
const CHANNELS_OFFSET: usize = 22;
const SAMPLE_RATE_OFFSET: usize = 24;
const BITS_PER_SAMPLE_OFFSET: usize = 34;
const DATA_TAG_OFFSET: usize = 36;
const DATA_SIZE_OFFSET: usize = 40;

const FMT_CHUNK_SIZE_PCM: u32 = 16;
const AUDIO_FORMAT_PCM: u16 = 1;

type Result<T> = std::result::Result<T, WavHeaderError>;

/// Errors that can occur while reading a WAV header.
#[derive(Debug, Error)]
pub enum WavHeaderError {
    #[error("WAV header truncated: {available}/44 bytes available")]
    Truncated { available: usize },

    #[error("Malformed WAV container: {reason}")]
    Malformed { reason: String },

    #[error("Failed to read WAV header: {0}")]
    Io(#[from] std::io::Error),
}

/// How much of the container structure is checked besides the format fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderValidation {
    /// Read the format fields at their offsets and trust the rest.
    Lenient,
    /// Also require the chunk tags, a PCM format tag and a non-zero sample rate.
    #[default]
    Strict,
}

/// Format parameters of a PCM WAV stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormatDescriptor {
    pub sample_rate_hz: u32,
    pub bits_per_sample: u16,
    pub channel_count: u16,
    pub data_byte_length: u32,
}

impl AudioFormatDescriptor {
    /// Bytes of PCM data per second of audio.
    /// Saturates instead of overflowing for out-of-range headers.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate_hz.saturating_mul(self.block_align() as u32)
    }

    /// Bytes per frame (one sample for every channel). Saturates like `byte_rate`.
    pub fn block_align(&self) -> u16 {
        self.channel_count.saturating_mul(self.bits_per_sample.div_ceil(8))
    }
}

/// Read exactly one header from `reader` and parse it.
///
/// The reader is left positioned at the first byte of PCM data.
pub fn parse_header<R: Read + ?Sized>(reader: &mut R, validation: HeaderValidation) -> Result<AudioFormatDescriptor> {
    let mut header = [0u8; WAV_HEADER_LEN];
    let available = read_full(reader, &mut header)?;

    if available < WAV_HEADER_LEN {
        return Err(WavHeaderError::Truncated { available });
    }

    parse_header_bytes(&header, validation)
}

/// Parse a header from an in-memory block. Bytes after the first 44 are ignored.
pub fn parse_header_bytes(header: &[u8], validation: HeaderValidation) -> Result<AudioFormatDescriptor> {
    if header.len() < WAV_HEADER_LEN {
        return Err(WavHeaderError::Truncated { available: header.len() });
    }

    if validation == HeaderValidation::Strict {
        validate_container(header)?;
    }

    let format = AudioFormatDescriptor {
        sample_rate_hz: read_u32_le(header, SAMPLE_RATE_OFFSET),
        channel_count: read_u16_le(header, CHANNELS_OFFSET),
        bits_per_sample: read_u16_le(header, BITS_PER_SAMPLE_OFFSET),
        data_byte_length: read_u32_le(header, DATA_SIZE_OFFSET),
    };

    if validation == HeaderValidation::Strict && format.sample_rate_hz == 0 {
        return Err(WavHeaderError::Malformed {
            reason: "sample rate is zero".to_string(),
        });
    }

    debug!(
        "Parsed WAV header: {} Hz, {} bit, {} channel(s), {} data bytes",
        format.sample_rate_hz, format.bits_per_sample, format.channel_count, format.data_byte_length
    );

    Ok(format)
}

/// Build a canonical 44-byte header describing `format`.
pub fn create_wav_header(format: &AudioFormatDescriptor) -> Bytes {
    let mut header = BytesMut::with_capacity(WAV_HEADER_LEN);

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(36 + format.data_byte_length);
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(FMT_CHUNK_SIZE_PCM);
    header.put_u16_le(AUDIO_FORMAT_PCM);
    header.put_u16_le(format.channel_count);
    header.put_u32_le(format.sample_rate_hz);
    header.put_u32_le(format.byte_rate());
    header.put_u16_le(format.block_align());
    header.put_u16_le(format.bits_per_sample);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(format.data_byte_length);

    header.freeze()
}

fn validate_container(header: &[u8]) -> Result<()> {
    expect_tag(header, RIFF_TAG_OFFSET, b"RIFF")?;
    expect_tag(header, WAVE_TAG_OFFSET, b"WAVE")?;
    expect_tag(header, FMT_TAG_OFFSET, b"fmt ")?;
    expect_tag(header, DATA_TAG_OFFSET, b"data")?;

    let audio_format = read_u16_le(header, AUDIO_FORMAT_OFFSET);
    if audio_format != AUDIO_FORMAT_PCM {
        return Err(WavHeaderError::Malformed {
            reason: format!("audio format tag {audio_format} is not linear PCM"),
        });
    }

    Ok(())
}

fn expect_tag(header: &[u8], offset: usize, tag: &[u8; 4]) -> Result<()> {
    let found = &header[offset..offset + tag.len()];
    if found != tag {
        return Err(WavHeaderError::Malformed {
            reason: format!(
                "expected '{}' at offset {offset}, found {:?}",
                String::from_utf8_lossy(tag),
                String::from_utf8_lossy(found)
            ),
        });
    }

    Ok(())
}

fn read_u16_le(header: &[u8], offset: usize) -> u16 {
    (&header[offset..offset + 2]).get_u16_le()
}

fn read_u32_le(header: &[u8], offset: usize) -> u32 {
    (&header[offset..offset + 4]).get_u32_le()
}

/// Fill `buf` as far as the reader allows, returning how many bytes arrived.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn mono_16k() -> AudioFormatDescriptor {
        AudioFormatDescriptor {
            sample_rate_hz: 16000,
            bits_per_sample: 16,
            channel_count: 1,
            data_byte_length: 3200,
        }
    }

    #[test]
    fn test_field_offsets_without_tags() {
        // Only the format fields are set, the tags are all zero
        let mut header = [0u8; WAV_HEADER_LEN];
        header[22..24].copy_from_slice(&[0x01, 0x00]);
        header[24..28].copy_from_slice(&[0x80, 0x3E, 0x00, 0x00]);
        header[34..36].copy_from_slice(&[0x10, 0x00]);

        let format = parse_header_bytes(&header, HeaderValidation::Lenient).unwrap();
        assert_eq!(format.sample_rate_hz, 16000);
        assert_eq!(format.channel_count, 1);
        assert_eq!(format.bits_per_sample, 16);
        assert_eq!(format.data_byte_length, 0);

        // Strict mode refuses the same bytes
        let result = parse_header_bytes(&header, HeaderValidation::Strict);
        assert!(matches!(result, Err(WavHeaderError::Malformed { .. })));
    }

    #[test]
    fn test_parse_written_header() {
        let header = create_wav_header(&mono_16k());
        assert_eq!(header.len(), WAV_HEADER_LEN);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[36..40], b"data");

        let format = parse_header_bytes(&header, HeaderValidation::Strict).unwrap();
        assert_eq!(format, mono_16k());
    }

    #[test]
    fn test_truncated_header() {
        let mut reader = Cursor::new(vec![0u8; 10]);
        let result = parse_header(&mut reader, HeaderValidation::Lenient);
        assert!(matches!(result, Err(WavHeaderError::Truncated { available: 10 })));
    }

    #[test]
    fn test_reader_positioned_at_data() {
        let mut bytes = create_wav_header(&mono_16k()).to_vec();
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        let mut reader = Cursor::new(bytes);

        parse_header(&mut reader, HeaderValidation::Strict).unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_reads_are_accumulated() {
        // Reader that hands out one byte per call
        struct Trickle(Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let end = buf.len().min(1);
                self.0.read(&mut buf[..end])
            }
        }

        let mut reader = Trickle(Cursor::new(create_wav_header(&mono_16k()).to_vec()));
        let format = parse_header(&mut reader, HeaderValidation::Strict).unwrap();
        assert_eq!(format.sample_rate_hz, 16000);
    }

    #[test]
    fn test_rejects_non_pcm_and_zero_rate() {
        let mut header = create_wav_header(&mono_16k()).to_vec();
        header[20] = 3; // IEEE float
        assert!(matches!(parse_header_bytes(&header, HeaderValidation::Strict), Err(WavHeaderError::Malformed { .. })));

        let zero_rate = AudioFormatDescriptor { sample_rate_hz: 0, ..mono_16k() };
        let header = create_wav_header(&zero_rate);
        assert!(matches!(parse_header_bytes(&header, HeaderValidation::Strict), Err(WavHeaderError::Malformed { .. })));
        assert!(parse_header_bytes(&header, HeaderValidation::Lenient).is_ok());
    }

    #[test]
    fn test_block_align_and_byte_rate() {
        let stereo_8 = AudioFormatDescriptor {
            sample_rate_hz: 8000,
            bits_per_sample: 8,
            channel_count: 2,
            data_byte_length: 0,
        };
        assert_eq!(stereo_8.block_align(), 2);
        assert_eq!(stereo_8.byte_rate(), 16000);

        let stereo_24 = AudioFormatDescriptor { bits_per_sample: 24, ..stereo_8 };
        assert_eq!(stereo_24.block_align(), 6);
    }

    #[test]
    fn test_extreme_header_values_saturate() {
        let mut header = [0u8; WAV_HEADER_LEN];
        header[22..24].copy_from_slice(&u16::MAX.to_le_bytes());
        header[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        header[34..36].copy_from_slice(&32u16.to_le_bytes());

        let format = parse_header_bytes(&header, HeaderValidation::Lenient).unwrap();
        assert_eq!(format.channel_count, u16::MAX);
        assert_eq!(format.block_align(), u16::MAX);
        assert_eq!(format.byte_rate(), u32::MAX);

        // The writer still produces a full header
        assert_eq!(create_wav_header(&format).len(), WAV_HEADER_LEN);
    }
}
