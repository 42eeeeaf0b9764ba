/// Default output device through CPAL.
///
/// The device pulls f32 samples from a callback thread; writes hand converted
/// chunks to that callback over a bounded channel, so `write` blocks once the
/// device is a buffer behind.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, warn};

use crate::playback::output::{AudioOutput, AudioSink, ChannelLayout, OutputError, SampleEncoding, SinkConfig};

// Chunks queued between the writer and the device callback
const QUEUED_CHUNKS: usize = 1;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct CpalOutput {
    latency_ms: u32,
}

impl CpalOutput {
    pub fn new(latency_ms: u32) -> Self {
        Self { latency_ms: latency_ms.max(1) }
    }

    fn device(&self) -> Result<cpal::Device, OutputError> {
        cpal::default_host().default_output_device().ok_or(OutputError::NoDevice)
    }
}

fn device_error(e: impl std::fmt::Display) -> OutputError {
    OutputError::Device { message: e.to_string() }
}

impl AudioOutput for CpalOutput {
    fn min_buffer_size(&self, sample_rate_hz: u32, layout: ChannelLayout, encoding: SampleEncoding) -> Result<usize, OutputError> {
        let device = self.device()?;
        let channels = layout.channels();
        let rate = cpal::SampleRate(sample_rate_hz);

        let supported = device
            .supported_output_configs()
            .map_err(device_error)?
            .filter(|range| range.channels() == channels)
            .find(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .ok_or_else(|| OutputError::Unsupported {
                message: format!("device has no {channels} channel output at {sample_rate_hz} Hz"),
            })?;

        let mut frames = (sample_rate_hz as u64 * self.latency_ms as u64).div_ceil(1000) as u32;
        if let cpal::SupportedBufferSize::Range { min, max } = supported.buffer_size() {
            frames = frames.clamp(*min, *max);
        }

        Ok(frames as usize * channels as usize * encoding.bytes_per_sample())
    }

    fn open(&self, config: SinkConfig) -> Result<Box<dyn AudioSink>, OutputError> {
        let device = self.device()?;
        let stream_config = cpal::StreamConfig {
            channels: config.layout.channels(),
            sample_rate: cpal::SampleRate(config.sample_rate_hz),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = mpsc::sync_channel::<Vec<f32>>(QUEUED_CHUNKS);
        let queued = Arc::new(AtomicUsize::new(0));
        let mut feed = CallbackFeed {
            rx,
            current: Vec::new(),
            position: 0,
            queued: queued.clone(),
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| feed.fill(data),
                |err| error!("Audio output stream error: {err}"),
                None,
            )
            .map_err(device_error)?;

        debug!("Opened CPAL stream: {config}");

        Ok(Box::new(CpalSink {
            stream: Some(stream),
            tx: Some(tx),
            queued,
            encoding: config.encoding,
            samples_per_second: config.sample_rate_hz as u64 * config.layout.channels() as u64,
            carry: None,
        }))
    }
}

/// Callback side: hands queued samples to the device, silence when starved.
struct CallbackFeed {
    rx: Receiver<Vec<f32>>,
    current: Vec<f32>,
    position: usize,
    queued: Arc<AtomicUsize>,
}

impl CallbackFeed {
    fn fill(&mut self, data: &mut [f32]) {
        let mut consumed = 0;

        for sample in data.iter_mut() {
            if self.position >= self.current.len() {
                match self.rx.try_recv() {
                    Ok(chunk) => {
                        self.current = chunk;
                        self.position = 0;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                        *sample = 0.0;
                        continue;
                    }
                }
            }

            *sample = self.current[self.position];
            self.position += 1;
            consumed += 1;
        }

        if consumed > 0 {
            self.queued.fetch_sub(consumed, Ordering::AcqRel);
        }
    }
}

struct CpalSink {
    stream: Option<cpal::Stream>,
    tx: Option<SyncSender<Vec<f32>>>,
    queued: Arc<AtomicUsize>,
    encoding: SampleEncoding,
    samples_per_second: u64,
    // Low byte of a 16-bit sample split across two writes
    carry: Option<u8>,
}

impl CpalSink {
    fn stream(&self) -> Result<&cpal::Stream, OutputError> {
        self.stream.as_ref().ok_or(OutputError::Released)
    }

    fn convert(&mut self, data: &[u8]) -> Vec<f32> {
        match self.encoding {
            SampleEncoding::Pcm8 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
            SampleEncoding::Pcm16 => {
                let mut samples = Vec::with_capacity(data.len() / 2 + 1);
                let mut bytes = data.iter().copied();

                if let Some(low) = self.carry.take() {
                    match bytes.next() {
                        Some(high) => samples.push(i16::from_le_bytes([low, high]) as f32 / 32768.0),
                        None => self.carry = Some(low),
                    }
                }

                let rest: Vec<u8> = bytes.collect();
                let mut pairs = rest.chunks_exact(2);
                samples.extend(pairs.by_ref().map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0));
                if let [low] = pairs.remainder() {
                    self.carry = Some(*low);
                }

                samples
            }
        }
    }

    /// Wait for the device to play out what is queued, bounded by its play time.
    fn drain(&self) {
        let queued = self.queued.load(Ordering::Acquire) as u64;
        let budget = Duration::from_micros(queued * 1_000_000 / self.samples_per_second.max(1)) + DRAIN_GRACE;
        let deadline = Instant::now() + budget;

        while self.queued.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                warn!("Output device did not drain {} queued samples", self.queued.load(Ordering::Acquire));
                return;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self) -> Result<(), OutputError> {
        self.stream()?.play().map_err(device_error)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), OutputError> {
        self.stream()?;
        let samples = self.convert(data);
        if samples.is_empty() {
            return Ok(());
        }

        let tx = self.tx.as_ref().ok_or(OutputError::Released)?;
        self.queued.fetch_add(samples.len(), Ordering::AcqRel);
        tx.send(samples).map_err(|_| OutputError::Device {
            message: "output callback has gone away".to_string(),
        })
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        self.drain();
        self.stream()?.pause().map_err(device_error)
    }

    fn release(&mut self) -> Result<(), OutputError> {
        self.tx = None;
        self.stream = None;
        Ok(())
    }
}
