/// Streaming playback: pushes the PCM region of a WAV stream into an output sink
/// one device-sized chunk at a time.
///
/// The sink write is the only blocking call in the loop, so the engine never
/// runs more than one buffer ahead of the device.
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::media::wav::{read_full, AudioFormatDescriptor, WavHeaderError};
use crate::playback::output::{AudioOutput, AudioSink, ChannelLayout, OutputError, SampleEncoding, SinkConfig, StreamRoute, TransferMode};

/// Errors that end a playback session.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Invalid WAV header: {0}")]
    Header(#[from] WavHeaderError),

    #[error("Unsupported format {sample_rate_hz} Hz {layout:?} {encoding:?}: {source}")]
    UnsupportedFormat {
        sample_rate_hz: u32,
        layout: ChannelLayout,
        encoding: SampleEncoding,
        #[source]
        source: OutputError,
    },

    #[error("Failed to open output sink: {0}")]
    SinkOpen(#[source] OutputError),

    #[error("Output sink failed: {0}")]
    Sink(#[source] OutputError),

    #[error("Failed to read PCM data: {0}")]
    Io(#[from] std::io::Error),
}

/// Session lifecycle as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Created,
    HeaderParsed,
    SinkOpened,
    Streaming,
    Completed,
    Cancelled,
    Failed,
    Released,
}

impl PlaybackState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlaybackState::Completed | PlaybackState::Cancelled | PlaybackState::Failed | PlaybackState::Released)
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    Failed(PlaybackError),
}

impl PlaybackOutcome {
    pub fn state(&self) -> PlaybackState {
        match self {
            PlaybackOutcome::Completed => PlaybackState::Completed,
            PlaybackOutcome::Cancelled => PlaybackState::Cancelled,
            PlaybackOutcome::Failed(_) => PlaybackState::Failed,
        }
    }
}

/// Summary of one playback run.
#[derive(Debug)]
pub struct PlaybackReport {
    pub outcome: PlaybackOutcome,
    pub buffer_size: usize,
    pub bytes_written: u64,
    pub chunks_written: u64,
}

impl PlaybackReport {
    pub fn failed(error: PlaybackError) -> Self {
        Self {
            outcome: PlaybackOutcome::Failed(error),
            buffer_size: 0,
            bytes_written: 0,
            chunks_written: 0,
        }
    }
}

/// Shared stop request, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum StreamEnd {
    EndOfStream,
    Cancelled,
}

#[derive(Debug, Default)]
struct Progress {
    bytes: u64,
    chunks: u64,
}

/// Owns an opened sink and the input for the duration of a run.
///
/// Stop, release and close happen exactly once, on the first call to
/// `teardown` or on drop, whichever comes first.
struct SinkGuard<R: Read> {
    sink: Box<dyn AudioSink>,
    reader: Option<R>,
}

impl<R: Read> SinkGuard<R> {
    fn new(sink: Box<dyn AudioSink>, reader: R) -> Self {
        Self { sink, reader: Some(reader) }
    }

    fn stream(&mut self, buffer: &mut [u8], cancel: &CancelFlag, progress: &mut Progress) -> Result<StreamEnd, PlaybackError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(StreamEnd::EndOfStream);
        };

        self.sink.start().map_err(PlaybackError::Sink)?;

        loop {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            let read = read_full(reader, buffer)?;
            if read == 0 {
                return Ok(StreamEnd::EndOfStream);
            }

            self.sink.write(&buffer[..read]).map_err(PlaybackError::Sink)?;
            progress.bytes += read as u64;
            progress.chunks += 1;
        }
    }

    fn teardown(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };

        if let Err(e) = self.sink.stop() {
            warn!("Failed to stop output sink: {e}");
        }
        if let Err(e) = self.sink.release() {
            warn!("Failed to release output sink: {e}");
        }

        drop(reader);
        debug!("Output sink released and input closed");
    }
}

impl<R: Read> Drop for SinkGuard<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Plays PCM streams through an [`AudioOutput`].
#[derive(Clone)]
pub struct StreamingEngine {
    output: Arc<dyn AudioOutput>,
}

impl StreamingEngine {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self { output }
    }

    /// Stream everything left in `reader` (the data region after the header) to a new sink.
    ///
    /// Never returns an error: failures are logged and reported in the
    /// [`PlaybackReport`]. `observer` sees every state from `SinkOpened` on.
    pub fn play<R: Read>(&self, reader: R, format: &AudioFormatDescriptor, cancel: &CancelFlag, mut observer: impl FnMut(PlaybackState)) -> PlaybackReport {
        let encoding = SampleEncoding::for_bits(format.bits_per_sample);
        let layout = ChannelLayout::for_count(format.channel_count);

        let buffer_size = match self.query_buffer_size(format.sample_rate_hz, layout, encoding) {
            Ok(size) => size,
            Err(e) => {
                error!("Playback aborted before opening a sink: {e}");
                drop(reader);
                observer(PlaybackState::Failed);
                observer(PlaybackState::Released);
                return PlaybackReport::failed(e);
            }
        };

        let config = SinkConfig {
            route: StreamRoute::Music,
            sample_rate_hz: format.sample_rate_hz,
            layout,
            encoding,
            buffer_size,
            mode: TransferMode::Stream,
        };

        let sink = match self.output.open(config) {
            Ok(sink) => sink,
            Err(e) => {
                error!("Failed to open output sink ({config}): {e}");
                drop(reader);
                observer(PlaybackState::Failed);
                observer(PlaybackState::Released);
                return PlaybackReport::failed(PlaybackError::SinkOpen(e));
            }
        };

        info!("Output sink opened: {config}");
        observer(PlaybackState::SinkOpened);

        let mut guard = SinkGuard::new(sink, reader);
        let mut buffer = vec![0u8; buffer_size];
        let mut progress = Progress::default();

        observer(PlaybackState::Streaming);
        let outcome = match guard.stream(&mut buffer, cancel, &mut progress) {
            Ok(StreamEnd::EndOfStream) => {
                info!("Playback completed: {} bytes in {} chunks", progress.bytes, progress.chunks);
                PlaybackOutcome::Completed
            }
            Ok(StreamEnd::Cancelled) => {
                info!("Playback cancelled after {} bytes", progress.bytes);
                PlaybackOutcome::Cancelled
            }
            Err(e) => {
                error!("Playback stopped after {} bytes: {e}", progress.bytes);
                PlaybackOutcome::Failed(e)
            }
        };

        observer(outcome.state());
        guard.teardown();
        observer(PlaybackState::Released);

        PlaybackReport {
            outcome,
            buffer_size,
            bytes_written: progress.bytes,
            chunks_written: progress.chunks,
        }
    }

    fn query_buffer_size(&self, sample_rate_hz: u32, layout: ChannelLayout, encoding: SampleEncoding) -> Result<usize, PlaybackError> {
        let unsupported = |source| PlaybackError::UnsupportedFormat {
            sample_rate_hz,
            layout,
            encoding,
            source,
        };

        match self.output.min_buffer_size(sample_rate_hz, layout, encoding) {
            Ok(0) => Err(unsupported(OutputError::Unsupported {
                message: "device reported a zero buffer size".to_string(),
            })),
            Ok(size) => Ok(size),
            Err(e) => Err(unsupported(e)),
        }
    }
}
