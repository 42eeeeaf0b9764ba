/// Playback sessions: one independent blocking task per play request.
///
/// A session opens its asset, parses the header and runs the engine on the
/// blocking pool. The caller gets a [`SessionHandle`] back immediately and can
/// watch, cancel or await the session through it.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::assets::{AssetError, AssetSource, AssetStream};
use crate::media::wav::{parse_header, HeaderValidation};
use crate::playback::engine::{CancelFlag, PlaybackError, PlaybackOutcome, PlaybackReport, PlaybackState, StreamingEngine};

type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No asset source available")]
    MissingSource,

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("Session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What happens to running sessions when a new one starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Sessions are independent and their audio overlaps.
    #[default]
    Overlap,
    /// A new session cancels every session still running.
    Exclusive,
}

/// Externally visible view of a session.
///
/// `outcome` and `error` stay `None` until the session has finished streaming.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub name: String,
    pub state: PlaybackState,
    pub outcome: Option<PlaybackState>,
    pub error: Option<String>,
}

/// How a session ended, kept after the state has moved on to `Released`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub state: PlaybackState,
    pub error: Option<String>,
}

impl SessionOutcome {
    fn from_report(report: &PlaybackReport) -> Self {
        Self {
            state: report.outcome.state(),
            error: match &report.outcome {
                PlaybackOutcome::Failed(e) => Some(e.to_string()),
                _ => None,
            },
        }
    }
}

type OutcomeSlot = Arc<OnceLock<SessionOutcome>>;

/// Live view of one session: its state channel plus the outcome once known.
///
/// The outcome is always set before the state becomes `Released`.
pub struct SessionEvents {
    pub state: watch::Receiver<PlaybackState>,
    outcome: OutcomeSlot,
}

impl SessionEvents {
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.get().cloned()
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    id: Uuid,
    name: String,
    cancel: CancelFlag,
    state: watch::Receiver<PlaybackState>,
    join: JoinHandle<PlaybackReport>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to finish its teardown.
    pub async fn wait(self) -> Result<PlaybackReport> {
        Ok(self.join.await?)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

struct SessionEntry {
    name: String,
    cancel: CancelFlag,
    state: watch::Receiver<PlaybackState>,
    outcome: OutcomeSlot,
}

impl SessionEntry {
    fn status(&self, id: Uuid) -> SessionStatus {
        let outcome = self.outcome.get();
        SessionStatus {
            id,
            name: self.name.clone(),
            state: *self.state.borrow(),
            outcome: outcome.map(|o| o.state),
            error: outcome.and_then(|o| o.error.clone()),
        }
    }

    fn is_released(&self) -> bool {
        *self.state.borrow() == PlaybackState::Released
    }
}

/// Starts sessions and keeps track of the ones still alive.
pub struct SessionManager {
    source: Option<Arc<dyn AssetSource>>,
    category: String,
    engine: StreamingEngine,
    validation: HeaderValidation,
    policy: SessionPolicy,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

impl SessionManager {
    pub fn new(source: Option<Arc<dyn AssetSource>>, category: impl Into<String>, engine: StreamingEngine, validation: HeaderValidation, policy: SessionPolicy) -> Self {
        Self {
            source,
            category: category.into(),
            engine,
            validation,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    fn source(&self) -> Result<Arc<dyn AssetSource>> {
        self.source.clone().ok_or_else(|| {
            error!("No asset source configured, ignoring request");
            SessionError::MissingSource
        })
    }

    /// Names that can be played.
    pub async fn list(&self) -> Result<Vec<String>> {
        let source = self.source()?;
        let category = self.category.clone();

        let names = tokio::task::spawn_blocking(move || source.list(&category)).await??;
        Ok(names)
    }

    /// Open `name` and start playing it on a new session.
    pub async fn play(&self, name: &str) -> Result<SessionHandle> {
        let source = self.source()?;
        let category = self.category.clone();
        let asset_name = name.to_string();

        let stream = tokio::task::spawn_blocking(move || source.open(&category, &asset_name)).await??;

        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| !entry.is_released());

        if self.policy == SessionPolicy::Exclusive {
            for (id, entry) in sessions.iter().filter(|(_, entry)| !entry.state.borrow().is_terminal()) {
                info!("Stopping session {id} ({}) for new playback", entry.name);
                entry.cancel.cancel();
            }
        }

        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let (state_tx, state_rx) = watch::channel(PlaybackState::Created);
        let outcome = OutcomeSlot::default();

        let engine = self.engine.clone();
        let validation = self.validation;
        let task_cancel = cancel.clone();
        let task_outcome = outcome.clone();
        let span = info_span!("session", %id, name = %name);

        let join = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            run_session(&engine, stream, validation, &task_cancel, &state_tx, &task_outcome)
        });

        sessions.insert(
            id,
            SessionEntry {
                name: name.to_string(),
                cancel: cancel.clone(),
                state: state_rx.clone(),
                outcome,
            },
        );

        info!("Started playback session {id} for '{name}'");

        Ok(SessionHandle {
            id,
            name: name.to_string(),
            cancel,
            state: state_rx,
            join,
        })
    }

    pub async fn status(&self, id: Uuid) -> Option<SessionStatus> {
        self.sessions.lock().await.get(&id).map(|entry| entry.status(id))
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.lock().await;
        sessions.iter().map(|(id, entry)| entry.status(*id)).collect()
    }

    pub async fn events(&self, id: Uuid) -> Option<SessionEvents> {
        self.sessions.lock().await.get(&id).map(|entry| SessionEvents {
            state: entry.state.clone(),
            outcome: entry.outcome.clone(),
        })
    }

    /// Request a stop. Returns false for unknown sessions.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.sessions.lock().await.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything and wait until every sink has been released.
    pub async fn shutdown(&self) {
        let receivers: Vec<_> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .map(|entry| {
                    entry.cancel.cancel();
                    entry.state.clone()
                })
                .collect()
        };

        if receivers.is_empty() {
            return;
        }

        info!("Waiting for {} session(s) to release their sinks", receivers.len());
        join_all(receivers.into_iter().map(|mut rx| async move {
            // A dropped sender means the task is gone, which is just as final
            let _ = rx.wait_for(|state| *state == PlaybackState::Released).await;
        }))
        .await;
    }
}

/// Body of a session task. Runs on the blocking pool.
///
/// `Released` is held back until the outcome has been recorded, so anyone who
/// sees `Released` can also read how the session ended.
fn run_session(
    engine: &StreamingEngine,
    mut stream: AssetStream,
    validation: HeaderValidation,
    cancel: &CancelFlag,
    state: &watch::Sender<PlaybackState>,
    outcome: &OnceLock<SessionOutcome>,
) -> PlaybackReport {
    let report = match parse_header(&mut stream, validation) {
        Ok(format) => {
            info!(
                "Sample rate: {} Hz, bit depth: {} bits, channels: {}",
                format.sample_rate_hz, format.bits_per_sample, format.channel_count
            );
            state.send_replace(PlaybackState::HeaderParsed);

            engine.play(stream, &format, cancel, |next| {
                if next != PlaybackState::Released {
                    state.send_replace(next);
                }
            })
        }
        Err(e) => {
            error!("Cannot play asset: {e}");
            drop(stream);
            state.send_replace(PlaybackState::Failed);
            PlaybackReport::failed(PlaybackError::Header(e))
        }
    };

    if let PlaybackOutcome::Failed(e) = &report.outcome {
        warn!("Session ended with error: {e}");
    }

    let _ = outcome.set(SessionOutcome::from_report(&report));
    state.send_replace(PlaybackState::Released);

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::wav::{create_wav_header, AudioFormatDescriptor, WavHeaderError};
    use crate::playback::engine::tests::{Event, RecordingOutput, SharedLog, TrackedReader};
    use crate::playback::output::AudioOutput;
    use crate::playback::paced::PacedOutput;

    struct MemoryAssets {
        files: HashMap<String, Vec<u8>>,
        log: SharedLog,
    }

    impl AssetSource for MemoryAssets {
        fn list(&self, _category: &str) -> std::result::Result<Vec<String>, AssetError> {
            let mut names: Vec<_> = self.files.keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        fn open(&self, category: &str, name: &str) -> std::result::Result<AssetStream, AssetError> {
            let bytes = self.files.get(name).ok_or_else(|| AssetError::NotFound {
                category: category.to_string(),
                name: name.to_string(),
            })?;
            Ok(Box::new(TrackedReader::new(bytes.clone(), self.log.clone())))
        }
    }

    fn wav(rate: u32, bits: u16, channels: u16, data_len: usize) -> Vec<u8> {
        let format = AudioFormatDescriptor {
            sample_rate_hz: rate,
            bits_per_sample: bits,
            channel_count: channels,
            data_byte_length: data_len as u32,
        };
        let mut bytes = create_wav_header(&format).to_vec();
        bytes.resize(bytes.len() + data_len, 0x80);
        bytes
    }

    fn manager(output: Arc<dyn AudioOutput>, files: Vec<(&str, Vec<u8>)>, log: SharedLog, policy: SessionPolicy) -> SessionManager {
        let source = MemoryAssets {
            files: files.into_iter().map(|(name, bytes)| (name.to_string(), bytes)).collect(),
            log,
        };
        SessionManager::new(Some(Arc::new(source)), "wav_test_files", StreamingEngine::new(output), HeaderValidation::Strict, policy)
    }

    #[tokio::test]
    async fn test_session_plays_to_completion() {
        let output = Arc::new(RecordingOutput::new(400));
        let manager = manager(output.clone(), vec![("tone.wav", wav(8000, 16, 1, 1000))], output.log.clone(), SessionPolicy::Overlap);

        let handle = manager.play("tone.wav").await.unwrap();
        let id = handle.id();
        let report = handle.wait().await.unwrap();

        assert!(matches!(report.outcome, PlaybackOutcome::Completed));
        assert_eq!(output.writes(), vec![400, 400, 200]);
        assert_eq!(output.count(&Event::Close), 1);

        let status = manager.status(id).await.unwrap();
        assert_eq!(status.state, PlaybackState::Released);
        assert_eq!(status.name, "tone.wav");
        assert_eq!(status.outcome, Some(PlaybackState::Completed));
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn test_outcome_visible_once_released() {
        let output = Arc::new(RecordingOutput::new(400));
        let manager = manager(output.clone(), vec![("short.wav", vec![0u8; 10])], output.log.clone(), SessionPolicy::Overlap);

        let handle = manager.play("short.wav").await.unwrap();
        let mut events = manager.events(handle.id()).await.unwrap();
        events.state.wait_for(|s| *s == PlaybackState::Released).await.unwrap();

        let outcome = events.outcome().unwrap();
        assert_eq!(outcome.state, PlaybackState::Failed);
        assert!(outcome.error.unwrap().contains("truncated"));
        assert!(manager.events(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_fails_session() {
        let output = Arc::new(RecordingOutput::new(400));
        let manager = manager(output.clone(), vec![("short.wav", vec![0u8; 10])], output.log.clone(), SessionPolicy::Overlap);

        let handle = manager.play("short.wav").await.unwrap();
        let id = handle.id();
        let report = handle.wait().await.unwrap();

        assert!(matches!(
            report.outcome,
            PlaybackOutcome::Failed(PlaybackError::Header(WavHeaderError::Truncated { available: 10 }))
        ));
        // No sink, but the input is still closed
        assert_eq!(output.events(), vec![Event::Close]);

        let status = manager.status(id).await.unwrap();
        assert_eq!(status.state, PlaybackState::Released);
        assert_eq!(status.outcome, Some(PlaybackState::Failed));
        assert!(status.error.unwrap().contains("truncated"));
    }

    #[tokio::test]
    async fn test_missing_source_is_a_no_op() {
        let output: Arc<dyn AudioOutput> = Arc::new(RecordingOutput::new(400));
        let manager = SessionManager::new(None, "wav_test_files", StreamingEngine::new(output), HeaderValidation::Strict, SessionPolicy::Overlap);

        assert!(matches!(manager.play("tone.wav").await, Err(SessionError::MissingSource)));
        assert!(matches!(manager.list().await, Err(SessionError::MissingSource)));
        assert!(manager.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_asset() {
        let output = Arc::new(RecordingOutput::new(400));
        let manager = manager(output.clone(), vec![], output.log.clone(), SessionPolicy::Overlap);

        let result = manager.play("nope.wav").await;
        assert!(matches!(result, Err(SessionError::Asset(AssetError::NotFound { .. }))));
    }

    #[tokio::test]
    async fn test_overlapping_sessions_are_independent() {
        let output = Arc::new(RecordingOutput::new(100));
        let files = vec![("a.wav", wav(8000, 8, 1, 300)), ("b.wav", wav(8000, 8, 2, 250))];
        let manager = manager(output.clone(), files, output.log.clone(), SessionPolicy::Overlap);

        let first = manager.play("a.wav").await.unwrap();
        let second = manager.play("b.wav").await.unwrap();
        assert_ne!(first.id(), second.id());

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert!(matches!(first.outcome, PlaybackOutcome::Completed));
        assert!(matches!(second.outcome, PlaybackOutcome::Completed));
        assert_eq!(first.bytes_written + second.bytes_written, 550);
        assert_eq!(output.count(&Event::Release), 2);
        assert_eq!(output.count(&Event::Close), 2);
    }

    #[tokio::test]
    async fn test_exclusive_policy_cancels_previous() {
        // Two seconds of 8 kHz 8-bit mono through a real-time device
        let log = SharedLog::default();
        let files = vec![("long.wav", wav(8000, 8, 1, 16000)), ("short.wav", wav(8000, 8, 1, 80))];
        let manager = manager(Arc::new(PacedOutput::new(10)), files, log.clone(), SessionPolicy::Exclusive);

        let long = manager.play("long.wav").await.unwrap();
        let mut state = manager.events(long.id()).await.unwrap().state;
        state.wait_for(|s| *s == PlaybackState::Streaming).await.unwrap();

        let short = manager.play("short.wav").await.unwrap();

        let long = long.wait().await.unwrap();
        assert!(matches!(long.outcome, PlaybackOutcome::Cancelled));
        assert!(long.bytes_written < 16000);

        let short = short.wait().await.unwrap();
        assert!(matches!(short.outcome, PlaybackOutcome::Completed));
        assert_eq!(log.lock().unwrap().events.iter().filter(|e| **e == Event::Close).count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let log = SharedLog::default();
        let manager = manager(Arc::new(PacedOutput::new(10)), vec![("long.wav", wav(8000, 8, 1, 16000))], log.clone(), SessionPolicy::Overlap);

        let handle = manager.play("long.wav").await.unwrap();
        let id = handle.id();
        assert!(manager.cancel(id).await);
        assert!(!manager.cancel(Uuid::new_v4()).await);

        manager.shutdown().await;
        assert_eq!(handle.state(), PlaybackState::Released);
        assert!(matches!(handle.wait().await.unwrap().outcome, PlaybackOutcome::Cancelled));
        assert_eq!(manager.status(id).await.unwrap().outcome, Some(PlaybackState::Cancelled));
    }

    #[tokio::test]
    async fn test_list_names() {
        let output = Arc::new(RecordingOutput::new(100));
        let files = vec![("b.wav", wav(8000, 8, 1, 1)), ("a.wav", wav(8000, 8, 1, 1))];
        let manager = manager(output.clone(), files, output.log.clone(), SessionPolicy::Overlap);

        assert_eq!(manager.list().await.unwrap(), vec!["a.wav", "b.wav"]);
        assert_eq!(manager.category(), "wav_test_files");
    }
}
