// Scripted collaborators for unit tests
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::{
    AudioSink, DtmfSender, EventBus, MediaConstraints, MediaEngine, MediaError, MediaTrack,
    PeerConnection, PeerConnectionConfig, RemoteStream, Result, RtpSender, SessionError,
    SignalingClient, SipMessage, TrackHandler, TrackKind,
};

pub const LOCAL_SDP: &str = "v=0\r\n\
                             o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
                             s=-\r\n\
                             t=0 0\r\n\
                             m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
                             c=IN IP4 0.0.0.0\r\n\
                             a=rtpmap:111 opus/48000/2\r\n\
                             a=sendrecv\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing {
    Request,
    Send,
    Reply,
}

type Responder = Box<dyn Fn(&SipMessage) -> Result<SipMessage> + Send + Sync>;
type SendHook = Box<dyn Fn(&SipMessage) -> Vec<SipMessage> + Send + Sync>;

/// Records everything a session hands to the signaling client.
///
/// `request()` answers through the responder (200 OK by default).
/// `send()` runs the send hook and publishes whatever it returns on the
/// inbound bus, simulating the far end reacting to the message.
pub struct MockSignalingClient {
    bus: Arc<EventBus>,
    log: Mutex<Vec<(Outgoing, SipMessage)>>,
    responder: Mutex<Responder>,
    send_hook: Mutex<Option<SendHook>>,
    fail_send: AtomicBool,
    hang_requests: AtomicBool,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl MockSignalingClient {
    pub fn new() -> Self {
        MockSignalingClient {
            bus: Arc::new(EventBus::new()),
            log: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|request| Ok(SipMessage::response_to(request, 200)))),
            send_hook: Mutex::new(None),
            fail_send: AtomicBool::new(false),
            hang_requests: AtomicBool::new(false),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&SipMessage) -> Result<SipMessage> + Send + Sync + 'static,
    {
        *self.responder.lock() = Box::new(responder);
    }

    pub fn on_send<F>(&self, hook: F)
    where
        F: Fn(&SipMessage) -> Vec<SipMessage> + Send + Sync + 'static,
    {
        *self.send_hook.lock() = Some(Box::new(hook));
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// `request()` never resolves; the far end stays silent
    pub fn hang_requests(&self) {
        self.hang_requests.store(true, Ordering::SeqCst);
    }

    /// Publish an inbound message to every subscribed handler
    pub fn deliver(&self, message: &SipMessage) {
        self.bus.emit(message);
    }

    pub fn outgoing(&self) -> Vec<(Outgoing, SipMessage)> {
        self.log.lock().clone()
    }

    pub fn of_kind(&self, kind: Outgoing) -> Vec<SipMessage> {
        self.log
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn record(&self, kind: Outgoing, message: &SipMessage) -> Result<()> {
        self.log.lock().push((kind, message.clone()));
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SessionError::transport("socket closed"));
        }
        Ok(())
    }
}

impl SignalingClient for MockSignalingClient {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, message: SipMessage) -> Result<SipMessage> {
        self.record(Outgoing::Request, &message)?;
        if self.hang_requests.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        (self.responder.lock())(&message)
    }

    async fn send(&self, message: SipMessage) -> Result<()> {
        self.record(Outgoing::Send, &message)?;
        let inbound = match self.send_hook.lock().as_ref() {
            Some(hook) => hook(&message),
            None => Vec::new(),
        };
        for reaction in &inbound {
            self.bus.emit(reaction);
        }
        Ok(())
    }

    async fn reply(&self, message: SipMessage) -> Result<()> {
        self.record(Outgoing::Reply, &message)
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn messages(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

pub struct MockTrack {
    id: String,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl MockTrack {
    pub fn new(id: &str) -> Self {
        MockTrack {
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub type DtmfLog = Arc<Mutex<Vec<(String, Duration, Duration)>>>;

struct MockDtmf {
    log: DtmfLog,
}

impl DtmfSender for MockDtmf {
    fn insert_dtmf(
        &self,
        tones: &str,
        duration: Duration,
        inter_tone_gap: Duration,
    ) -> std::result::Result<(), MediaError> {
        self.log
            .lock()
            .push((tones.to_string(), duration, inter_tone_gap));
        Ok(())
    }
}

struct MockSender {
    track: Arc<dyn MediaTrack>,
    dtmf: Option<Arc<dyn DtmfSender>>,
}

impl RtpSender for MockSender {
    fn track(&self) -> Option<Arc<dyn MediaTrack>> {
        Some(self.track.clone())
    }

    fn dtmf(&self) -> Option<Arc<dyn DtmfSender>> {
        self.dtmf.clone()
    }
}

pub struct MockAudioSink {
    removes: AtomicUsize,
    fail_remove: AtomicBool,
}

impl MockAudioSink {
    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }
}

impl AudioSink for MockAudioSink {
    fn remove(&self) -> std::result::Result<(), MediaError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(MediaError::Other("sink already detached".to_string()));
        }
        Ok(())
    }
}

pub struct MockPeerConnection {
    config: PeerConnectionConfig,
    local_description: Mutex<Option<String>>,
    senders: Mutex<Vec<Arc<dyn RtpSender>>>,
    track_handler: Mutex<Option<TrackHandler>>,
    with_dtmf: bool,
    dtmf_log: DtmfLog,
    closes: AtomicUsize,
    fail_close: AtomicBool,
}

impl MockPeerConnection {
    pub fn config(&self) -> &PeerConnectionConfig {
        &self.config
    }

    pub fn set_local_description(&self, sdp: Option<&str>) {
        *self.local_description.lock() = sdp.map(str::to_string);
    }

    /// Simulate a remote track arriving
    pub fn emit_track(&self, stream_id: &str) {
        let stream = RemoteStream {
            id: stream_id.to_string(),
            tracks: vec![Arc::new(MockTrack::new(stream_id))],
        };
        if let Some(handler) = self.track_handler.lock().as_ref() {
            handler(stream);
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }
}

impl PeerConnection for MockPeerConnection {
    fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> std::result::Result<Arc<dyn RtpSender>, MediaError> {
        let dtmf: Option<Arc<dyn DtmfSender>> = if self.with_dtmf {
            Some(Arc::new(MockDtmf {
                log: self.dtmf_log.clone(),
            }))
        } else {
            None
        };
        let sender: Arc<dyn RtpSender> = Arc::new(MockSender { track, dtmf });
        self.senders.lock().push(sender.clone());
        Ok(sender)
    }

    fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders.lock().clone()
    }

    fn local_description(&self) -> Option<String> {
        self.local_description.lock().clone()
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(handler);
    }

    fn close(&self) -> std::result::Result<(), MediaError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(MediaError::PeerConnection("already closed".to_string()));
        }
        Ok(())
    }
}

/// Media engine whose peer connection starts with [`LOCAL_SDP`] as its
/// local description and one captured audio track with DTMF support.
pub struct MockMediaEngine {
    capture_error: Option<MediaError>,
    peer_error: Option<MediaError>,
    track_count: usize,
    with_dtmf: bool,
    yield_on_capture: bool,
    local_description: Option<String>,
    last_constraints: Mutex<Option<MediaConstraints>>,
    tracks: Mutex<Vec<Arc<MockTrack>>>,
    peer: Mutex<Option<Arc<MockPeerConnection>>>,
    sinks: Mutex<Vec<Arc<MockAudioSink>>>,
    dtmf_log: DtmfLog,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        MockMediaEngine {
            capture_error: None,
            peer_error: None,
            track_count: 1,
            with_dtmf: true,
            yield_on_capture: false,
            local_description: Some(LOCAL_SDP.to_string()),
            last_constraints: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            dtmf_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fail_capture(mut self, error: MediaError) -> Self {
        self.capture_error = Some(error);
        self
    }

    pub fn fail_peer_connection(mut self, error: MediaError) -> Self {
        self.peer_error = Some(error);
        self
    }

    pub fn without_tracks(mut self) -> Self {
        self.track_count = 0;
        self
    }

    pub fn without_dtmf(mut self) -> Self {
        self.with_dtmf = false;
        self
    }

    /// Capture suspends once before completing
    pub fn yield_on_capture(mut self) -> Self {
        self.yield_on_capture = true;
        self
    }

    pub fn without_local_description(mut self) -> Self {
        self.local_description = None;
        self
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        *self.last_constraints.lock()
    }

    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        self.tracks.lock().clone()
    }

    pub fn peer(&self) -> Option<Arc<MockPeerConnection>> {
        self.peer.lock().clone()
    }

    pub fn sinks(&self) -> Vec<Arc<MockAudioSink>> {
        self.sinks.lock().clone()
    }

    pub fn dtmf_log(&self) -> Vec<(String, Duration, Duration)> {
        self.dtmf_log.lock().clone()
    }
}

impl MediaEngine for MockMediaEngine {
    fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> BoxFuture<'_, std::result::Result<Vec<Arc<dyn MediaTrack>>, MediaError>> {
        *self.last_constraints.lock() = Some(*constraints);
        Box::pin(async move {
            if self.yield_on_capture {
                tokio::task::yield_now().await;
            }
            if let Some(error) = &self.capture_error {
                return Err(error.clone());
            }
            let captured: Vec<Arc<MockTrack>> = (0..self.track_count)
                .map(|i| Arc::new(MockTrack::new(&format!("mic-{}", i))))
                .collect();
            self.tracks.lock().extend(captured.iter().cloned());
            Ok(captured
                .into_iter()
                .map(|track| track as Arc<dyn MediaTrack>)
                .collect())
        })
    }

    fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
    ) -> std::result::Result<Arc<dyn PeerConnection>, MediaError> {
        if let Some(error) = &self.peer_error {
            return Err(error.clone());
        }
        let peer = Arc::new(MockPeerConnection {
            config: config.clone(),
            local_description: Mutex::new(self.local_description.clone()),
            senders: Mutex::new(Vec::new()),
            track_handler: Mutex::new(None),
            with_dtmf: self.with_dtmf,
            dtmf_log: self.dtmf_log.clone(),
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        });
        *self.peer.lock() = Some(peer.clone());
        Ok(peer)
    }

    fn create_audio_sink(
        &self,
        _stream: &RemoteStream,
    ) -> std::result::Result<Arc<dyn AudioSink>, MediaError> {
        let sink = Arc::new(MockAudioSink {
            removes: AtomicUsize::new(0),
            fail_remove: AtomicBool::new(false),
        });
        self.sinks.lock().push(sink.clone());
        Ok(sink)
    }
}
