use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{CallId, SessionConfig, SessionError};

/// Errors raised by the media engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("DTMF error: {0}")]
    Dtmf(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

// Capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        MediaConstraints {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<String>,
}

impl From<&SessionConfig> for PeerConnectionConfig {
    fn from(config: &SessionConfig) -> Self {
        PeerConnectionConfig {
            ice_servers: config.stun_servers.clone(),
        }
    }
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
}

pub trait DtmfSender: Send + Sync {
    fn insert_dtmf(&self, tones: &str, duration: Duration, inter_tone_gap: Duration)
    -> Result<(), MediaError>;
}

pub trait RtpSender: Send + Sync {
    fn track(&self) -> Option<Arc<dyn MediaTrack>>;
    fn dtmf(&self) -> Option<Arc<dyn DtmfSender>>;
}

/// Playback element for the remote party's audio
pub trait AudioSink: Send + Sync {
    fn remove(&self) -> Result<(), MediaError>;
}

#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

pub type TrackHandler = Box<dyn Fn(RemoteStream) + Send + Sync>;

pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<Arc<dyn RtpSender>, MediaError>;
    fn senders(&self) -> Vec<Arc<dyn RtpSender>>;
    /// Current local SDP, `None` before the first offer/answer
    fn local_description(&self) -> Option<String>;
    fn on_track(&self, handler: TrackHandler);
    fn close(&self) -> Result<(), MediaError>;
}

/// Factory for everything a session needs from the platform's media stack
pub trait MediaEngine: Send + Sync {
    fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> BoxFuture<'_, Result<Vec<Arc<dyn MediaTrack>>, MediaError>>;

    fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;

    fn create_audio_sink(&self, stream: &RemoteStream) -> Result<Arc<dyn AudioSink>, MediaError>;
}

#[derive(Default)]
struct SinkSlot {
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
    closed: AtomicBool,
}

/// Media owned by one call session: peer connection, captured tracks and
/// the remote audio sink.
pub struct SessionMedia {
    peer: Arc<dyn PeerConnection>,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    sink: Arc<SinkSlot>,
}

impl SessionMedia {
    /// Capture local audio, create the peer connection and wire remote
    /// tracks to a fresh audio sink.
    pub async fn open(
        engine: &Arc<dyn MediaEngine>,
        config: &SessionConfig,
        call_id: &CallId,
    ) -> Result<SessionMedia, SessionError> {
        let local_tracks = engine
            .get_user_media(&MediaConstraints::audio_only())
            .await
            .map_err(SessionError::MediaAcquisition)?;

        let peer = match engine.create_peer_connection(&PeerConnectionConfig::from(config)) {
            Ok(peer) => peer,
            Err(e) => {
                local_tracks.iter().for_each(|track| track.stop());
                return Err(e.into());
            }
        };

        for track in &local_tracks {
            if let Err(e) = peer.add_track(track.clone()) {
                local_tracks.iter().for_each(|track| track.stop());
                let _ = peer.close();
                return Err(e.into());
            }
        }

        let sink = Arc::new(SinkSlot::default());
        let slot = sink.clone();
        let sink_engine = engine.clone();
        let sink_call_id = call_id.clone();
        peer.on_track(Box::new(move |stream| {
            if slot.closed.load(Ordering::Acquire) {
                return;
            }
            match sink_engine.create_audio_sink(&stream) {
                Ok(new_sink) => {
                    debug!(call_id = %sink_call_id, stream = %stream.id, "Attached remote audio");
                    if let Some(old) = slot.sink.lock().replace(new_sink) {
                        if let Err(e) = old.remove() {
                            warn!(call_id = %sink_call_id, error = %e, "Failed to remove previous audio sink");
                        }
                    }
                }
                Err(e) => {
                    warn!(call_id = %sink_call_id, error = %e, "Failed to attach remote audio");
                }
            }
        }));

        Ok(SessionMedia {
            peer,
            local_tracks,
            sink,
        })
    }

    pub fn local_description(&self) -> Option<String> {
        self.peer.local_description()
    }

    pub fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.peer.senders()
    }

    pub fn local_tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.local_tracks
    }

    pub fn has_audio_sink(&self) -> bool {
        self.sink.sink.lock().is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        for track in self.senders().iter().filter_map(|sender| sender.track()) {
            track.set_enabled(!muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        let tracks: Vec<_> = self.senders().iter().filter_map(|s| s.track()).collect();
        !tracks.is_empty() && tracks.iter().all(|track| !track.is_enabled())
    }

    /// Returns false when there is no sender or it cannot carry DTMF.
    pub fn send_dtmf(
        &self,
        tones: &str,
        duration: Duration,
        inter_tone_gap: Duration,
    ) -> Result<bool, MediaError> {
        let Some(dtmf) = self.senders().first().and_then(|sender| sender.dtmf()) else {
            return Ok(false);
        };
        dtmf.insert_dtmf(tones, duration, inter_tone_gap)?;
        Ok(true)
    }

    /// Best-effort: every step runs even if an earlier one fails.
    pub fn teardown(&self, call_id: &CallId) {
        if let Err(e) = self.peer.close() {
            warn!(call_id = %call_id, error = %e, "Failed to close peer connection");
        }

        self.sink.closed.store(true, Ordering::Release);
        if let Some(sink) = self.sink.sink.lock().take() {
            if let Err(e) = sink.remove() {
                warn!(call_id = %call_id, error = %e, "Failed to remove audio sink");
            }
        }

        for track in &self.local_tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMediaEngine;

    fn call_id() -> CallId {
        CallId("media-test".to_string())
    }

    async fn open(engine: &Arc<MockMediaEngine>) -> Result<SessionMedia, SessionError> {
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        SessionMedia::open(&dyn_engine, &SessionConfig::default(), &call_id()).await
    }

    #[tokio::test]
    async fn test_open_adds_captured_tracks() {
        let engine = Arc::new(MockMediaEngine::new());
        let media = open(&engine).await.unwrap();

        assert_eq!(media.local_tracks().len(), 1);
        assert_eq!(media.senders().len(), 1);
        assert_eq!(
            engine.peer().unwrap().config().ice_servers,
            vec![crate::DEFAULT_STUN_SERVER.to_string()]
        );
        assert_eq!(engine.last_constraints(), Some(MediaConstraints::audio_only()));
    }

    #[tokio::test]
    async fn test_capture_failure_is_acquisition_error() {
        let engine = Arc::new(
            MockMediaEngine::new()
                .fail_capture(MediaError::PermissionDenied("microphone".to_string())),
        );
        let err = open(&engine).await.err().unwrap();

        assert!(matches!(err, SessionError::MediaAcquisition(MediaError::PermissionDenied(_))));
        assert!(engine.peer().is_none());
    }

    #[tokio::test]
    async fn test_peer_failure_stops_captured_tracks() {
        let engine = Arc::new(
            MockMediaEngine::new().fail_peer_connection(MediaError::PeerConnection("ice".to_string())),
        );
        let err = open(&engine).await.err().unwrap();

        assert!(matches!(err, SessionError::Media(MediaError::PeerConnection(_))));
        assert!(engine.tracks().iter().all(|track| track.stop_count() == 1));
    }

    #[tokio::test]
    async fn test_remote_track_replaces_sink() {
        let engine = Arc::new(MockMediaEngine::new());
        let media = open(&engine).await.unwrap();
        let peer = engine.peer().unwrap();

        peer.emit_track("remote-1");
        peer.emit_track("remote-2");

        let sinks = engine.sinks();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].remove_count(), 1);
        assert_eq!(sinks[1].remove_count(), 0);
        assert!(media.has_audio_sink());
    }

    #[tokio::test]
    async fn test_teardown_continues_after_failures() {
        let engine = Arc::new(MockMediaEngine::new());
        let media = open(&engine).await.unwrap();
        let peer = engine.peer().unwrap();
        peer.fail_close();
        peer.emit_track("remote");
        engine.sinks()[0].fail_remove();

        media.teardown(&call_id());

        assert_eq!(peer.close_count(), 1);
        assert_eq!(engine.sinks()[0].remove_count(), 1);
        assert!(engine.tracks().iter().all(|track| track.stop_count() == 1));
        assert!(!media.has_audio_sink());

        // Late remote tracks are ignored once torn down
        peer.emit_track("late");
        assert_eq!(engine.sinks().len(), 1);
    }

    #[tokio::test]
    async fn test_mute_and_dtmf() {
        let engine = Arc::new(MockMediaEngine::new());
        let media = open(&engine).await.unwrap();

        assert!(!media.is_muted());
        media.set_muted(true);
        assert!(media.is_muted());
        media.set_muted(false);
        assert!(!media.is_muted());

        let sent = media
            .send_dtmf("12#", Duration::from_millis(100), Duration::from_millis(70))
            .unwrap();
        assert!(sent);
        assert_eq!(
            engine.dtmf_log(),
            vec![("12#".to_string(), Duration::from_millis(100), Duration::from_millis(70))]
        );
    }

    #[tokio::test]
    async fn test_dtmf_without_sender() {
        let engine = Arc::new(MockMediaEngine::new().without_tracks());
        let media = open(&engine).await.unwrap();

        assert!(!media.is_muted());
        assert!(!media.send_dtmf("1", Duration::ZERO, Duration::ZERO).unwrap());
    }
}
