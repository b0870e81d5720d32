use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    CSeqHeader, CallCommand, CallDirection, CallId, CallParkResult, CallState, CommandChannel,
    CommandRequest, EventBus, HeaderName, JSON_CONTENT_TYPE, MediaDirection, MediaEngine,
    MessageStream, Result, SessionConfig, SessionDescription, SessionError, SessionEvent,
    SessionMedia, SignalingClient, SipMessage, SipMessageBuilder, SipMethod, ViaHeader,
    extract_address, generate_branch, generate_call_id,
};

/// NOTIFY body that ends a transfer
pub const TRANSFER_SUCCESS_BODY: &str = "SIP/2.0 200 OK";

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Signaling and media state of one two-party call leg.
///
/// Inbound and outbound calls share this type; `direction` only decides
/// how the call id and the local/remote peers are derived at construction.
pub struct CallSession<C> {
    id: CallId,
    direction: CallDirection,
    local_peer: String,
    remote_peer: String,
    state: RwLock<CallState>,
    events: Arc<EventBus>,
    cseq_counter: AtomicU32,
    // Highest SDP session version sent or seen
    sdp_version: AtomicU64,
    // Held until the ACK is out; one re-INVITE at a time
    renegotiation: tokio::sync::Mutex<()>,
    // Held across media acquisition so only one init can capture
    setup: tokio::sync::Mutex<()>,
    commands: CommandChannel,
    media: Mutex<Option<SessionMedia>>,
    transfers: Mutex<Vec<JoinHandle<()>>>,
    config: Arc<SessionConfig>,
    client: Arc<C>,
    engine: Arc<dyn MediaEngine>,
    created_at: DateTime<Utc>,
    answered_at: Mutex<Option<DateTime<Utc>>>,
    disposed_at: Mutex<Option<DateTime<Utc>>>,
}

impl<C: SignalingClient + Sync + 'static> CallSession<C> {
    /// Session for a call we place; the call id is generated here, once.
    pub fn outbound(
        client: Arc<C>,
        engine: Arc<dyn MediaEngine>,
        config: Arc<SessionConfig>,
        local_peer: &str,
        remote_peer: &str,
    ) -> Self {
        let id = CallId(generate_call_id());
        debug!(call_id = %id, remote = remote_peer, "Created outbound call session");
        Self::new(
            id,
            CallDirection::Outbound,
            local_peer.to_string(),
            remote_peer.to_string(),
            client,
            engine,
            config,
        )
    }

    /// Session for a call offered to us by `invite`.
    pub fn inbound(
        client: Arc<C>,
        engine: Arc<dyn MediaEngine>,
        config: Arc<SessionConfig>,
        invite: &SipMessage,
    ) -> Result<Self> {
        let call_id = invite
            .get_call_id()
            .ok_or(SessionError::MissingHeader("Call-ID"))?;
        let local_peer = invite.get_to().ok_or(SessionError::MissingHeader("To"))?;
        let remote_peer = invite
            .get_from()
            .ok_or(SessionError::MissingHeader("From"))?;

        let session = Self::new(
            CallId(call_id.clone()),
            CallDirection::Inbound,
            local_peer.clone(),
            remote_peer.clone(),
            client,
            engine,
            config,
        );

        // Our first re-offer must beat the caller's version too
        if is_sdp(invite) {
            if let Err(e) = session.observe_remote_description(invite.body_str()) {
                debug!(call_id = %session.id, error = %e, "Ignoring unparsable offer SDP");
            }
        }

        debug!(call_id = %session.id, remote = %session.remote_peer, "Created inbound call session");
        Ok(session)
    }

    fn new(
        id: CallId,
        direction: CallDirection,
        local_peer: String,
        remote_peer: String,
        client: Arc<C>,
        engine: Arc<dyn MediaEngine>,
        config: Arc<SessionConfig>,
    ) -> Self {
        CallSession {
            commands: CommandChannel::new(id.clone()),
            id,
            direction,
            local_peer,
            remote_peer,
            state: RwLock::new(CallState::Init),
            events: Arc::new(EventBus::new()),
            cseq_counter: AtomicU32::new(1),
            sdp_version: AtomicU64::new(0),
            renegotiation: tokio::sync::Mutex::new(()),
            setup: tokio::sync::Mutex::new(()),
            media: Mutex::new(None),
            transfers: Mutex::new(Vec::new()),
            config,
            client,
            engine,
            created_at: Utc::now(),
            answered_at: Mutex::new(None),
            disposed_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    pub fn state(&self) -> CallState {
        *self.state.read()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == CallState::Disposed
    }

    /// Lifecycle events for this session only
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sdp_version(&self) -> u64 {
        self.sdp_version.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        *self.answered_at.lock()
    }

    pub fn disposed_at(&self) -> Option<DateTime<Utc>> {
        *self.disposed_at.lock()
    }

    /// Time spent answered, up to disposal or now
    pub fn duration(&self) -> Option<chrono::Duration> {
        let answered = self.answered_at()?;
        let end = self.disposed_at().unwrap_or_else(Utc::now);
        Some(end - answered)
    }

    pub fn next_cseq(&self) -> u32 {
        self.cseq_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Acquire local audio and build the peer connection.
    ///
    /// Capture failure leaves the session in `init` with no media.
    pub async fn init(&self) -> Result<()> {
        self.ensure_active()?;
        let _setup = self.setup.lock().await;
        self.ensure_active()?;
        if self.media.lock().is_some() {
            return Err(SessionError::InvalidState(format!(
                "Call session {} already initialized",
                self.id
            )));
        }

        let media = SessionMedia::open(&self.engine, &self.config, &self.id).await?;

        let mut slot = self.media.lock();
        if self.is_disposed() {
            drop(slot);
            media.teardown(&self.id);
            return Err(SessionError::Disposed(self.id.clone()));
        }
        *slot = Some(media);

        info!(call_id = %self.id, direction = ?self.direction, "Call media initialized");
        Ok(())
    }

    pub fn mark_ringing(&self) -> Result<()> {
        self.set_state(CallState::Ringing)
    }

    pub fn mark_answered(&self) -> Result<()> {
        self.set_state(CallState::Answered)
    }

    /// Move the call forward. Repeating the current state is a no-op;
    /// moving backward is rejected and leaves the state untouched.
    pub fn set_state(&self, next: CallState) -> Result<()> {
        if next == CallState::Disposed {
            self.dispose();
            return Ok(());
        }

        {
            let mut state = self.state.write();
            if *state == next {
                return Ok(());
            }
            if !state.can_advance_to(next) {
                return Err(SessionError::InvalidTransition { from: *state, to: next });
            }
            *state = next;
        }

        info!(call_id = %self.id, state = %next, "Call state changed");
        match next {
            CallState::Ringing => self.events.emit(&SessionEvent::Ringing),
            CallState::Answered => {
                *self.answered_at.lock() = Some(Utc::now());
                self.events.emit(&SessionEvent::Answered);
            }
            CallState::Init | CallState::Disposed => {}
        }
        Ok(())
    }

    /// Release everything the session owns. Safe to call any number of times.
    pub fn dispose(&self) {
        {
            let mut state = self.state.write();
            if *state == CallState::Disposed {
                return;
            }
            *state = CallState::Disposed;
        }
        *self.disposed_at.lock() = Some(Utc::now());

        for watcher in self.transfers.lock().drain(..) {
            watcher.abort();
        }
        self.commands.cancel_all();

        if let Some(media) = self.media.lock().take() {
            media.teardown(&self.id);
        }

        info!(call_id = %self.id, "Call session disposed");
        self.events.emit(&SessionEvent::Disposed);
    }

    pub async fn hold(&self) -> Result<()> {
        self.toggle_receive(false).await
    }

    pub async fn unhold(&self) -> Result<()> {
        self.toggle_receive(true).await
    }

    /// Re-offer the local SDP, `sendonly` when `to_receive` is false.
    ///
    /// Returns once the ACK for the reply has been handed to the client.
    pub async fn toggle_receive(&self, to_receive: bool) -> Result<()> {
        self.ensure_active()?;
        let _renegotiating = self.renegotiation.lock().await;
        self.ensure_active()?;

        let Some(local_sdp) = self.local_description() else {
            debug!(call_id = %self.id, "No local description yet, skipping re-INVITE");
            return Ok(());
        };

        let mut sdp = SessionDescription::parse(&local_sdp)?;
        if !to_receive {
            sdp.replace_direction(MediaDirection::SendRecv, MediaDirection::SendOnly);
        }
        let version = self.claim_sdp_version(sdp.session_version());
        sdp.set_session_version(version);

        let uri = format!("sip:{}", extract_address(&self.remote_peer));
        let invite = self
            .request_builder(SipMethod::Invite, &uri)
            .body(SDP_CONTENT_TYPE, sdp.to_sdp().into_bytes())
            .build()?;

        info!(call_id = %self.id, hold = !to_receive, sdp_version = version, "Sending re-INVITE");
        let reply = with_deadline(
            "re-INVITE",
            self.config.request_timeout(),
            self.client.request(invite),
        )
        .await?;

        match reply.status_code() {
            Some(code) if (200..300).contains(&code) => {}
            code => warn!(call_id = %self.id, status = ?code, "re-INVITE not accepted"),
        }

        if is_sdp(&reply) {
            if let Err(e) = self.observe_remote_description(reply.body_str()) {
                debug!(call_id = %self.id, error = %e, "Ignoring unparsable answer SDP");
            }
        }

        let ack = self.ack_for(&reply, &uri)?;
        self.client.send(ack).await
    }

    /// Raise the version floor to a session version the far end declared.
    pub fn observe_remote_description(&self, sdp: &str) -> Result<()> {
        let remote = SessionDescription::parse(sdp)?.session_version();
        self.sdp_version.fetch_max(remote, Ordering::SeqCst);
        Ok(())
    }

    fn claim_sdp_version(&self, declared: u64) -> u64 {
        let floor = declared.saturating_add(1);
        let next = |current: u64| current.saturating_add(1).max(floor);
        let previous = self
            .sdp_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| Some(next(current)))
            .unwrap_or_else(|current| current);
        next(previous)
    }

    fn ack_for(&self, reply: &SipMessage, uri: &str) -> Result<SipMessage> {
        let vias = reply.headers.get_all(HeaderName::VIA);
        if vias.is_empty() {
            return Err(SessionError::MissingHeader("Via"));
        }
        let cseq = reply.get_cseq().ok_or(SessionError::MissingHeader("CSeq"))?;

        let mut builder = SipMessageBuilder::new()
            .request(SipMethod::Ack, uri)
            .header(HeaderName::CALL_ID, self.id.as_str())
            .header(HeaderName::FROM, &self.local_peer)
            .header(HeaderName::TO, &self.remote_peer);
        for via in vias {
            builder = builder.add_header(HeaderName::VIA, via);
        }
        builder
            .header(HeaderName::CSEQ, &cseq.with_method(SipMethod::Ack).to_string())
            .build()
    }

    /// Blind transfer of the remote party to `target`.
    ///
    /// Returns once the REFER is sent. NOTIFY progress is acknowledged in the
    /// background until the final `200 OK` sipfrag, the transfer deadline, or
    /// disposal of the session, whichever comes first.
    pub async fn transfer(&self, target: &str) -> Result<()> {
        self.ensure_active()?;

        let uri = format!("sip:{}", extract_address(&self.remote_peer));
        let refer = self
            .request_builder(SipMethod::Refer, &uri)
            .header(HeaderName::REFER_TO, &self.refer_target(target))
            .header(
                HeaderName::REFERRED_BY,
                &format!("<sip:{}>", extract_address(&self.local_peer)),
            )
            .build()?;

        // Subscribe first so a fast NOTIFY is not lost
        let call_id = self.id.clone();
        let notifications = MessageStream::new(self.client.messages(), move |message| {
            message.method() == Some(SipMethod::Notify)
                && message.get_call_id().map(String::as_str) == Some(call_id.as_str())
        });

        self.client.send(refer).await?;
        info!(call_id = %self.id, transfer_target = target, "Transfer requested");

        let watcher = TransferWatcher {
            client: self.client.clone(),
            events: self.events.clone(),
            call_id: self.id.clone(),
            target: target.to_string(),
            deadline: self.config.transfer_timeout().map(|after| Instant::now() + after),
        };

        let mut transfers = self.transfers.lock();
        transfers.retain(|handle| !handle.is_finished());
        let handle = tokio::spawn(watcher.run(notifications));
        if self.is_disposed() {
            handle.abort();
        } else {
            transfers.push(handle);
        }
        Ok(())
    }

    /// Transfers whose NOTIFY watcher is still running
    pub fn active_transfers(&self) -> usize {
        self.transfers
            .lock()
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn refer_target(&self, target: &str) -> String {
        if target.starts_with("sip:") || target.starts_with("sips:") {
            target.to_string()
        } else if target.contains('@') {
            format!("sip:{}", target)
        } else {
            format!("sip:{}@{}", target, self.config.refer_domain)
        }
    }

    /// Park the call. A zero result code means the call left our control
    /// and the session is disposed; any other code leaves it untouched.
    pub async fn park(&self) -> Result<CallParkResult> {
        self.ensure_active()?;

        let reqid = self.commands.next_reqid();
        let pending = self
            .commands
            .watch(self.client.messages(), reqid, CallCommand::CallPark);
        self.send_command(reqid, CallCommand::CallPark).await?;

        let response = pending
            .wait(self.config.command_timeout())
            .await
            .map_err(|e| match e {
                SessionError::InvalidState(_) if self.is_disposed() => {
                    SessionError::Disposed(self.id.clone())
                }
                other => other,
            })?;
        let result: CallParkResult = response.result_as()?;

        if result.is_success() {
            info!(call_id = %self.id, extension = %result.park_extension, "Call parked");
            self.dispose();
        } else {
            info!(call_id = %self.id, code = result.code, description = %result.description, "Park refused");
        }
        Ok(result)
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.fire_command(CallCommand::StartCallRecord).await
    }

    pub async fn stop_recording(&self) -> Result<()> {
        self.fire_command(CallCommand::StopCallRecord).await
    }

    async fn fire_command(&self, command: CallCommand) -> Result<()> {
        self.ensure_active()?;
        let reqid = self.commands.next_reqid();
        self.send_command(reqid, command).await?;
        debug!(call_id = %self.id, reqid, %command, "Command sent, no response awaited");
        Ok(())
    }

    async fn send_command(&self, reqid: u64, command: CallCommand) -> Result<()> {
        let body = CommandRequest::new(reqid, command).to_body()?;
        let info = self
            .request_builder(SipMethod::Info, &format!("sip:{}", self.config.domain))
            .body(JSON_CONTENT_TYPE, body)
            .build()?;
        self.client.send(info).await
    }

    pub fn mute(&self) {
        self.toggle_track(false);
    }

    pub fn unmute(&self) {
        self.toggle_track(true);
    }

    fn toggle_track(&self, enabled: bool) {
        if let Some(media) = self.media.lock().as_ref() {
            media.set_muted(!enabled);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.media
            .lock()
            .as_ref()
            .is_some_and(|media| media.is_muted())
    }

    /// Play `tones` on the first outgoing sender. Without a sender, or one
    /// that cannot carry DTMF, nothing happens.
    pub fn send_dtmf(
        &self,
        tones: &str,
        duration: Option<Duration>,
        inter_tone_gap: Option<Duration>,
    ) -> Result<()> {
        let guard = self.media.lock();
        let Some(media) = guard.as_ref() else {
            return Ok(());
        };

        let sent = media.send_dtmf(
            tones,
            duration.unwrap_or_else(|| self.config.dtmf_duration()),
            inter_tone_gap.unwrap_or_else(|| self.config.dtmf_inter_tone_gap()),
        )?;
        if !sent {
            debug!(call_id = %self.id, "No DTMF-capable sender");
        }
        Ok(())
    }

    /// Send BYE and dispose. The session is disposed even if the send fails.
    pub async fn hangup(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let bye = self
            .request_builder(SipMethod::Bye, &format!("sip:{}", self.config.domain))
            .build()?;
        let sent = self.client.send(bye).await;
        if let Err(e) = &sent {
            warn!(call_id = %self.id, error = %e, "Failed to send BYE");
        }
        self.dispose();
        sent
    }

    /// Answer a BYE from the far end and dispose.
    pub async fn handle_remote_bye(&self, bye: &SipMessage) -> Result<()> {
        if bye.method() != Some(SipMethod::Bye)
            || bye.get_call_id().map(String::as_str) != Some(self.id.as_str())
        {
            return Err(SessionError::InvalidState(format!(
                "{} is not a BYE for call {}",
                bye.subject(),
                self.id
            )));
        }

        let replied = self.client.reply(SipMessage::response_to(bye, 200)).await;
        info!(call_id = %self.id, "Remote party hung up");
        self.dispose();
        replied
    }

    fn local_description(&self) -> Option<String> {
        self.media
            .lock()
            .as_ref()
            .and_then(|media| media.local_description())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Disposed(self.id.clone()));
        }
        Ok(())
    }

    // Dialog headers shared by every request this session originates
    fn request_builder(&self, method: SipMethod, uri: &str) -> SipMessageBuilder {
        let via = ViaHeader::new(
            &self.config.via_transport,
            &self.config.via_host,
            &generate_branch(),
        );
        SipMessageBuilder::new()
            .request(method, uri)
            .header(HeaderName::CALL_ID, self.id.as_str())
            .header(HeaderName::FROM, &self.local_peer)
            .header(HeaderName::TO, &self.remote_peer)
            .add_header(HeaderName::VIA, &via.to_string())
            .header(
                HeaderName::CSEQ,
                &CSeqHeader::new(self.next_cseq(), method).to_string(),
            )
            .header(HeaderName::USER_AGENT, &self.config.user_agent)
    }
}

impl<C> Drop for CallSession<C> {
    fn drop(&mut self) {
        for watcher in self.transfers.get_mut().drain(..) {
            watcher.abort();
        }
    }
}

struct TransferWatcher<C> {
    client: Arc<C>,
    events: Arc<EventBus>,
    call_id: CallId,
    target: String,
    deadline: Option<Instant>,
}

impl<C: SignalingClient + Sync + 'static> TransferWatcher<C> {
    async fn run(self, mut notifications: MessageStream) {
        loop {
            let next = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, notifications.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(call_id = %self.call_id, transfer_target = %self.target, "Transfer not confirmed in time, releasing NOTIFY handler");
                            break;
                        }
                    }
                }
                None => notifications.next().await,
            };
            let Some(notify) = next else {
                break;
            };

            if let Err(e) = self.client.reply(SipMessage::response_to(&notify, 200)).await {
                warn!(call_id = %self.call_id, error = %e, "Failed to acknowledge NOTIFY");
            }

            let progress = notify.body_str().trim();
            if progress == TRANSFER_SUCCESS_BODY {
                notifications.close();
                info!(call_id = %self.call_id, transfer_target = %self.target, "Transfer completed");
                self.events.emit(&SessionEvent::TransferCompleted {
                    target: self.target.clone(),
                });
                break;
            }
            debug!(call_id = %self.call_id, progress, "Transfer in progress");
        }
    }
}

fn is_sdp(message: &SipMessage) -> bool {
    message
        .body
        .as_ref()
        .is_some_and(|body| body.content_type.starts_with(SDP_CONTENT_TYPE))
}

async fn with_deadline<T>(
    operation: &'static str,
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| SessionError::Timeout { operation, after })?,
        None => fut.await,
    }
}
