// Call Engine: the negotiation state machine
//
// Owns the single call slot. Every operation reads and writes the slot under
// a short lock that is never held across an await; after each await the
// continuation re-checks that its session is still the current, live one and
// otherwise releases whatever it acquired and stops.

use super::clock::{Clock, SystemClock};
use super::error::CallError;
use super::events::CallEvent;
use super::session::{CallRole, CallSession, CallSnapshot, CallStatus, RemoteDescription, SessionId};
use crate::config::CallConfig;
use crate::events::Subscribers;
use crate::media::{MediaAdapter, MediaEvent, MediaEventSink, MediaHandle, NegotiationPrimitive};
use crate::signal::{IceCandidate, InboundSignal, SessionDescription, Signal, SignalTransport};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of a multi-step continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// The session ended or was replaced while we were suspended
    Stale,
}

struct EngineInner {
    transport: Arc<dyn SignalTransport>,
    media: Arc<dyn MediaAdapter>,
    clock: Arc<dyn Clock>,
    config: CallConfig,
    slot: Mutex<Option<CallSession>>,
    events: Subscribers<CallEvent>,
    media_tx: UnboundedSender<(SessionId, MediaEvent)>,
    media_rx: Mutex<Option<UnboundedReceiver<(SessionId, MediaEvent)>>>,
}

/// Drives at most one call at a time for the logged-in user.
///
/// Cheap to clone; clones share the same slot and subscribers.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<EngineInner>,
}

impl CallEngine {
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        media: Arc<dyn MediaAdapter>,
        config: CallConfig,
    ) -> Self {
        Self::with_clock(transport, media, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn SignalTransport>,
        media: Arc<dyn MediaAdapter>,
        config: CallConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::unbounded();
        Self {
            inner: Arc::new(EngineInner {
                transport,
                media,
                clock,
                config,
                slot: Mutex::new(None),
                events: Subscribers::new(),
                media_tx,
                media_rx: Mutex::new(Some(media_rx)),
            }),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> UnboundedReceiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.inner.slot.lock().as_ref().map(CallSession::snapshot)
    }

    /// Status of the session in the slot; `Idle` when there is none
    pub fn status(&self) -> CallStatus {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(CallSession::status)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn is_in_call(&self) -> bool {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(CallSession::is_live)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // User operations
    // ------------------------------------------------------------------

    /// Call `remote`. Resolves with the local media handle once the offer has
    /// been sent.
    pub async fn initiate_call(&self, local: &str, remote: &str) -> Result<MediaHandle, CallError> {
        if local == remote {
            return Err(CallError::ProtocolViolation("cannot call yourself".to_string()));
        }

        let id = {
            let mut slot = self.inner.slot.lock();
            if let Some(existing) = slot.as_ref().filter(|s| s.is_live()) {
                return Err(CallError::busy(existing.remote()));
            }
            let mut session = CallSession::new(
                local,
                remote,
                CallRole::Caller,
                self.inner.config.max_pending_candidates,
            );
            session.advance(CallStatus::AwaitingLocalMedia);
            let id = session.id();
            *slot = Some(session);
            id
        };
        tracing::info!("📞 Calling {} (session {})", remote, id);
        self.emit_status(CallStatus::AwaitingLocalMedia, remote);

        // The remote must be reachable before we prompt for the microphone.
        if let Err(err) = self.inner.transport.send_initiate_call(remote).await {
            let err = CallError::from(err);
            self.fail(id, err.clone(), false).await;
            return Err(err);
        }
        if !self.is_current(id) {
            return Err(CallError::cancelled());
        }

        let (media, primitive) = self.acquire_and_attach(id).await?;

        let offer = match primitive.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
        };
        if !self.is_current(id) {
            return Err(CallError::cancelled());
        }

        if let Err(err) = self.inner.transport.send_offer(remote, &offer).await {
            let err = CallError::from(err);
            self.fail(id, err.clone(), true).await;
            return Err(err);
        }
        tracing::debug!("Offer sent to {}", remote);
        Ok(media)
    }

    /// Answer a call from `remote`. A ringing session is promoted; with no
    /// session one is created. Negotiation starts at once if the offer is
    /// already buffered, otherwise when it arrives.
    pub async fn accept_call(&self, local: &str, remote: &str) -> Result<MediaHandle, CallError> {
        let id = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_ringing() && session.remote() == remote => {
                    // Ringing sessions are created before we know who answers.
                    session.set_local(local);
                    session.advance(CallStatus::AwaitingLocalMedia);
                    session.id()
                }
                Some(session) if session.is_live() => {
                    return Err(CallError::busy(session.remote()));
                }
                _ => {
                    let mut session = CallSession::new(
                        local,
                        remote,
                        CallRole::Callee,
                        self.inner.config.max_pending_candidates,
                    );
                    session.advance(CallStatus::AwaitingLocalMedia);
                    let id = session.id();
                    *slot = Some(session);
                    id
                }
            }
        };
        tracing::info!("📞 Accepting call from {} (session {})", remote, id);
        self.emit_status(CallStatus::AwaitingLocalMedia, remote);

        let (media, primitive) = self.acquire_and_attach(id).await?;

        let buffered = self
            .with_current(id, |session| {
                if session.remote_description() != RemoteDescription::Pending {
                    return None;
                }
                let offer = session.buffer_mut().take_offer()?;
                session.set_remote_description(RemoteDescription::Applying);
                Some(offer)
            })
            .flatten();

        match buffered {
            Some(offer) => match self.negotiate_offer(id, primitive, offer).await? {
                Step::Continue => Ok(media),
                Step::Stale => Err(CallError::cancelled()),
            },
            None => {
                tracing::debug!("Waiting for offer from {}", remote);
                Ok(media)
            }
        }
    }

    /// Decline a ringing call from `from`. A call that is already being set
    /// up or is connected must be ended with `hang_up`; declining it here is
    /// refused without telling the remote anything.
    pub async fn reject_call(&self, from: &str) -> Result<(), CallError> {
        let resources = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_ringing() && session.remote() == from => {
                    session.teardown()
                }
                Some(session) if session.is_live() && session.remote() == from => {
                    return Err(CallError::ProtocolViolation(format!(
                        "call with {} is {}; hang up instead",
                        from,
                        session.status()
                    )));
                }
                _ => {
                    return Err(CallError::ProtocolViolation(format!(
                        "no ringing call from {}",
                        from
                    )))
                }
            }
        };

        tracing::info!("Rejecting call from {}", from);
        self.release(resources);
        self.emit_status(CallStatus::Ended, from);
        self.inner
            .transport
            .send_call_end(from)
            .await
            .map_err(CallError::from)
    }

    /// End the current call. A no-op when there is none.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (remote, resources) = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_live() => {
                    (session.remote().to_string(), session.teardown())
                }
                _ => return Ok(()),
            }
        };
        tracing::info!("📴 Hanging up on {}", remote);
        self.release(resources);
        self.emit_status(CallStatus::Ended, &remote);

        // Local cleanup is done either way; a failed notify is still reported.
        self.inner
            .transport
            .send_call_end(&remote)
            .await
            .map_err(CallError::from)
    }

    /// End the call if it has been negotiating for longer than the configured
    /// timeout. Returns true if a call was ended.
    pub async fn check_timeouts(&self) -> bool {
        let timeout = self.inner.config.negotiation_timeout();
        let now = self.inner.clock.now();
        let expired = {
            let slot = self.inner.slot.lock();
            slot.as_ref().and_then(|session| {
                let since = session.negotiating_since()?;
                let overdue = session.status() == CallStatus::Negotiating
                    && now.saturating_duration_since(since) >= timeout;
                overdue.then(|| session.id())
            })
        };

        match expired {
            Some(id) => {
                tracing::warn!("⏱️ Negotiation timed out (session {})", id);
                self.fail(
                    id,
                    CallError::NegotiationFailure("negotiation timed out".to_string()),
                    true,
                )
                .await
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound signals
    // ------------------------------------------------------------------

    /// Route one pushed signal. Protocol violations are logged and dropped.
    pub async fn handle_signal(&self, inbound: InboundSignal) {
        let InboundSignal { from, signal } = inbound;
        let kind = signal.kind();
        let result = match signal {
            Signal::IncomingCall => self.receive_incoming_call(&from),
            Signal::Offer(offer) => self.receive_offer(&from, offer).await,
            Signal::Answer(answer) => self.receive_answer(&from, answer).await,
            Signal::IceCandidate(candidate) => self.receive_candidate(&from, candidate).await,
            Signal::CallEnd => {
                self.receive_call_end(&from);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(CallError::ProtocolViolation(reason)) => {
                tracing::warn!("Dropped {} from {}: {}", kind, from, reason);
            }
            // Failures that ended the call were already reported as events.
            Err(err) => tracing::debug!("{} from {} failed: {}", kind, from, err),
        }
    }

    pub fn receive_incoming_call(&self, from: &str) -> Result<(), CallError> {
        let announce = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_live() && session.remote() == from => {
                    if session.role() != CallRole::Callee {
                        return Err(CallError::ProtocolViolation(
                            "incoming-call from the party we are calling".to_string(),
                        ));
                    }
                    session.is_ringing() && session.announce()
                }
                Some(session) if session.is_live() => {
                    return Err(CallError::busy(session.remote()));
                }
                _ => {
                    let mut session = CallSession::new(
                        "",
                        from,
                        CallRole::Callee,
                        self.inner.config.max_pending_candidates,
                    );
                    session.announce();
                    *slot = Some(session);
                    true
                }
            }
        };

        if announce {
            tracing::info!("🔔 Incoming call from {}", from);
            self.inner.events.emit(CallEvent::IncomingCall {
                from: from.to_string(),
            });
        }
        Ok(())
    }

    /// Announce a ringing session from `from` unless that already happened
    fn announce_ringing(&self, from: &str) -> Result<(), CallError> {
        let announce = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.remote() == from && session.is_ringing() => {
                    session.announce()
                }
                _ => false,
            }
        };
        if announce {
            tracing::info!("🔔 Incoming call from {} (offer first)", from);
            self.inner.events.emit(CallEvent::IncomingCall {
                from: from.to_string(),
            });
        }
        Ok(())
    }

    pub async fn receive_offer(&self, from: &str, offer: SessionDescription) -> Result<(), CallError> {
        let ready = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_live() => {
                    if session.remote() != from {
                        return Err(CallError::busy(session.remote()));
                    }
                    if session.role() != CallRole::Callee {
                        return Err(CallError::ProtocolViolation(
                            "offer received by the caller".to_string(),
                        ));
                    }
                    match session.primitive() {
                        None => {
                            session.buffer_offer(offer)?;
                            tracing::debug!("Buffered offer from {}", from);
                            None
                        }
                        Some(primitive)
                            if session.status() == CallStatus::Negotiating
                                && session.remote_description() == RemoteDescription::Pending =>
                        {
                            session.set_remote_description(RemoteDescription::Applying);
                            Some((session.id(), primitive, offer))
                        }
                        Some(_) => {
                            return Err(CallError::ProtocolViolation(format!(
                                "unexpected offer while {}",
                                session.status()
                            )));
                        }
                    }
                }
                _ => {
                    // The offer beat the incoming-call notice, or follows a
                    // finished call. Either way it starts a new ringing
                    // session, announced below like any incoming call.
                    let mut session = CallSession::new(
                        "",
                        from,
                        CallRole::Callee,
                        self.inner.config.max_pending_candidates,
                    );
                    session.buffer_offer(offer)?;
                    *slot = Some(session);
                    None
                }
            }
        };

        match ready {
            Some((id, primitive, offer)) => self.negotiate_offer(id, primitive, offer).await.map(|_| ()),
            None => self.announce_ringing(from),
        }
    }

    pub async fn receive_answer(&self, from: &str, answer: SessionDescription) -> Result<(), CallError> {
        let (id, primitive) = {
            let mut slot = self.inner.slot.lock();
            let session = match slot.as_mut() {
                Some(session) if session.is_live() && session.remote() == from => session,
                _ => {
                    return Err(CallError::ProtocolViolation(
                        "answer without a matching call".to_string(),
                    ))
                }
            };
            let primitive = match session.primitive() {
                Some(primitive)
                    if session.role() == CallRole::Caller
                        && session.status() == CallStatus::Negotiating
                        && session.remote_description() == RemoteDescription::Pending =>
                {
                    primitive
                }
                _ => {
                    return Err(CallError::ProtocolViolation(format!(
                        "unexpected answer while {}",
                        session.status()
                    )))
                }
            };
            session.set_remote_description(RemoteDescription::Applying);
            (session.id(), primitive)
        };

        if let Err(err) = primitive.apply_remote_answer(&answer).await {
            let err = CallError::from(err);
            self.fail(id, err.clone(), true).await;
            return Err(err);
        }
        if self
            .with_current(id, |s| s.set_remote_description(RemoteDescription::Applied))
            .is_none()
        {
            return Ok(());
        }

        if self.drain_candidates(id, &primitive).await? == Step::Continue {
            self.activate(id);
        }
        Ok(())
    }

    pub async fn receive_candidate(&self, from: &str, candidate: IceCandidate) -> Result<(), CallError> {
        let direct = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.remote() == from && !session.is_live() => {
                    tracing::debug!("Late candidate from {} ignored", from);
                    return Ok(());
                }
                Some(session) if session.is_live() && session.remote() == from => {
                    if session.accepts_candidates_directly() {
                        session.primitive().map(|p| (session.id(), p))
                    } else {
                        session.buffer_candidate(candidate.clone())?;
                        None
                    }
                }
                _ => {
                    return Err(CallError::ProtocolViolation(
                        "candidate without a matching call".to_string(),
                    ))
                }
            }
        };

        if let Some((id, primitive)) = direct {
            if let Err(err) = primitive.apply_remote_candidate(&candidate).await {
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// The remote party hung up. Ends the call without echoing call-end back.
    pub fn receive_call_end(&self, from: &str) {
        let resources = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.is_live() && session.remote() == from => {
                    Some(session.teardown())
                }
                _ => None,
            }
        };
        match resources {
            Some(resources) => {
                tracing::info!("📴 {} ended the call", from);
                self.release(resources);
                self.emit_status(CallStatus::Ended, from);
            }
            None => tracing::debug!("call-end from {} matches no live call", from),
        }
    }

    // ------------------------------------------------------------------
    // Media events
    // ------------------------------------------------------------------

    pub async fn handle_media_event(&self, session: SessionId, event: MediaEvent) {
        let remote = match self.with_current(session, |s| s.remote().to_string()) {
            Some(remote) => remote,
            None => {
                tracing::debug!("Stale media event for session {} ignored", session);
                return;
            }
        };

        match event {
            MediaEvent::LocalCandidate(candidate) => {
                if let Err(err) = self.inner.transport.send_candidate(&remote, &candidate).await {
                    tracing::warn!("Failed to send candidate to {}: {}", remote, err);
                }
            }
            MediaEvent::RemoteMedia(handle) => {
                tracing::info!("🔊 Remote media from {} ready", remote);
                self.inner.events.emit(CallEvent::RemoteMediaReady(handle));
            }
            MediaEvent::Failed(reason) => {
                self.fail(session, CallError::NegotiationFailure(reason), true)
                    .await;
            }
        }
    }

    /// Handle every media event queued so far. Returns how many were handled.
    pub async fn process_pending_media_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = {
                let mut guard = self.inner.media_rx.lock();
                guard.as_mut().and_then(|rx| rx.try_next().ok().flatten())
            };
            match next {
                Some((session, event)) => {
                    self.handle_media_event(session, event).await;
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    /// Serve inbound signals and media events until `signals` ends.
    pub async fn run<S>(&self, signals: S)
    where
        S: Stream<Item = InboundSignal> + Unpin,
    {
        let mut media_rx = match self.inner.media_rx.lock().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Call engine loop already running");
                return;
            }
        };
        let mut signals = signals.fuse();

        loop {
            futures::select! {
                inbound = signals.next() => match inbound {
                    Some(inbound) => self.handle_signal(inbound).await,
                    None => break,
                },
                event = media_rx.next() => {
                    if let Some((session, event)) = event {
                        self.handle_media_event(session, event).await;
                    }
                }
            }
        }

        *self.inner.media_rx.lock() = Some(media_rx);
        tracing::debug!("Call engine loop stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Acquire local media and build the primitive around it, then move the
    /// session to `Negotiating`.
    async fn acquire_and_attach(
        &self,
        id: SessionId,
    ) -> Result<(MediaHandle, Arc<dyn NegotiationPrimitive>), CallError> {
        let media = match self
            .inner
            .media
            .acquire_local_media(self.inner.config.media_kind)
            .await
        {
            Ok(media) => media,
            Err(err) => {
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
        };
        if !self.is_current(id) {
            tracing::debug!("Session {} ended during media prompt; releasing", id);
            self.inner.media.release_media(&media);
            return Err(CallError::cancelled());
        }

        let sink = MediaEventSink::new(id, self.inner.media_tx.clone());
        let primitive = match self.inner.media.create_negotiation_primitive(&media, sink) {
            Ok(primitive) => primitive,
            Err(err) => {
                self.inner.media.release_media(&media);
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
        };

        let now = self.inner.clock.now();
        let remote = self.with_current(id, |session| {
            session.attach(media.clone(), Arc::clone(&primitive), now);
            session.remote().to_string()
        });
        let remote = match remote {
            Some(remote) => remote,
            None => {
                primitive.close();
                self.inner.media.release_media(&media);
                return Err(CallError::cancelled());
            }
        };

        self.inner.events.emit(CallEvent::LocalMediaReady(media.clone()));
        self.emit_status(CallStatus::Negotiating, &remote);
        Ok((media, primitive))
    }

    /// Callee half of the exchange: apply the offer, answer it, then flush
    /// candidates that were waiting on the remote description.
    async fn negotiate_offer(
        &self,
        id: SessionId,
        primitive: Arc<dyn NegotiationPrimitive>,
        offer: SessionDescription,
    ) -> Result<Step, CallError> {
        if let Err(err) = primitive.apply_remote_offer(&offer).await {
            let err = CallError::from(err);
            self.fail(id, err.clone(), true).await;
            return Err(err);
        }
        let remote = match self.with_current(id, |session| {
            session.set_remote_description(RemoteDescription::Applied);
            session.remote().to_string()
        }) {
            Some(remote) => remote,
            None => return Ok(Step::Stale),
        };

        let answer = match primitive.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
        };
        if !self.is_current(id) {
            return Ok(Step::Stale);
        }

        if let Err(err) = self.inner.transport.send_answer(&remote, &answer).await {
            let err = CallError::from(err);
            self.fail(id, err.clone(), true).await;
            return Err(err);
        }
        tracing::debug!("Answer sent to {}", remote);

        let step = self.drain_candidates(id, &primitive).await?;
        if step == Step::Continue {
            self.activate(id);
        }
        Ok(step)
    }

    /// Apply buffered candidates one at a time in arrival order. Candidates
    /// that arrive meanwhile queue behind them; the buffer seals once empty.
    async fn drain_candidates(
        &self,
        id: SessionId,
        primitive: &Arc<dyn NegotiationPrimitive>,
    ) -> Result<Step, CallError> {
        if self.with_current(id, |s| s.buffer_mut().begin_drain()).is_none() {
            return Ok(Step::Stale);
        }

        let mut applied = 0usize;
        loop {
            let next = match self.with_current(id, |s| s.buffer_mut().next_candidate()) {
                Some(next) => next,
                None => return Ok(Step::Stale),
            };
            let candidate = match next {
                Some(candidate) => candidate,
                None => break,
            };
            if let Err(err) = primitive.apply_remote_candidate(&candidate).await {
                let err = CallError::from(err);
                self.fail(id, err.clone(), true).await;
                return Err(err);
            }
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!("Applied {} buffered candidate(s) (session {})", applied, id);
        }
        Ok(Step::Continue)
    }

    fn activate(&self, id: SessionId) {
        let remote = self
            .with_current(id, |session| {
                session.mark_active().then(|| session.remote().to_string())
            })
            .flatten();
        if let Some(remote) = remote {
            tracing::info!("✅ Call with {} active", remote);
            self.emit_status(CallStatus::Active, &remote);
        }
    }

    /// End session `id` because of `err`: release its resources, report the
    /// error and, if `notify`, tell the remote party. Returns false when the
    /// session was already gone.
    async fn fail(&self, id: SessionId, err: CallError, notify: bool) -> bool {
        let torn_down = {
            let mut slot = self.inner.slot.lock();
            match slot.as_mut() {
                Some(session) if session.id() == id && session.is_live() => {
                    Some((session.remote().to_string(), session.teardown()))
                }
                _ => None,
            }
        };
        let (remote, resources) = match torn_down {
            Some(torn_down) => torn_down,
            None => return false,
        };

        tracing::warn!("❌ Call with {} failed: {}", remote, err);
        self.release(resources);
        self.emit_status(CallStatus::Ended, &remote);
        self.inner.events.emit(CallEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });

        if notify {
            if let Err(send_err) = self.inner.transport.send_call_end(&remote).await {
                tracing::debug!("call-end to {} not delivered: {}", remote, send_err);
            }
        }
        true
    }

    fn release(&self, resources: (Option<MediaHandle>, Option<Arc<dyn NegotiationPrimitive>>)) {
        let (media, primitive) = resources;
        if let Some(primitive) = primitive {
            primitive.close();
        }
        if let Some(media) = media {
            self.inner.media.release_media(&media);
        }
    }

    fn is_current(&self, id: SessionId) -> bool {
        self.with_current(id, |_| ()).is_some()
    }

    /// Run `f` on the slot's session if it is still `id` and live
    fn with_current<R>(&self, id: SessionId, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let mut slot = self.inner.slot.lock();
        match slot.as_mut() {
            Some(session) if session.id() == id && session.is_live() => Some(f(session)),
            _ => None,
        }
    }

    fn emit_status(&self, status: CallStatus, remote: &str) {
        self.inner.events.emit(CallEvent::StateChanged {
            status,
            remote: remote.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::clock::MockClock;
    use crate::call::CallErrorKind;
    use crate::media::simulated::{PrimitiveOp, SimulatedMedia};
    use crate::signal::TransportError;
    use async_trait::async_trait;
    use std::time::Duration;
    use web_time::Instant;

    /// Records outbound signals instead of delivering them
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Signal)>>,
        unreachable: bool,
    }

    impl RecordingTransport {
        fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Default::default()
            }
        }

        fn record(&self, remote: &str, signal: Signal) -> Result<(), TransportError> {
            if self.unreachable {
                return Err(TransportError::RemoteUnavailable(remote.to_string()));
            }
            self.sent.lock().push((remote.to_string(), signal));
            Ok(())
        }

        fn kinds(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|(_, s)| s.kind().to_string())
                .collect()
        }
    }

    #[async_trait(?Send)]
    impl SignalTransport for RecordingTransport {
        async fn send_initiate_call(&self, remote: &str) -> Result<(), TransportError> {
            self.record(remote, Signal::IncomingCall)
        }
        async fn send_offer(&self, remote: &str, offer: &SessionDescription) -> Result<(), TransportError> {
            self.record(remote, Signal::Offer(offer.clone()))
        }
        async fn send_answer(&self, remote: &str, answer: &SessionDescription) -> Result<(), TransportError> {
            self.record(remote, Signal::Answer(answer.clone()))
        }
        async fn send_candidate(&self, remote: &str, candidate: &IceCandidate) -> Result<(), TransportError> {
            self.record(remote, Signal::IceCandidate(candidate.clone()))
        }
        async fn send_call_end(&self, remote: &str) -> Result<(), TransportError> {
            self.record(remote, Signal::CallEnd)
        }
    }

    fn engine_with(transport: Arc<RecordingTransport>, media: SimulatedMedia) -> CallEngine {
        CallEngine::new(transport, Arc::new(media), CallConfig::default())
    }

    fn drain_events(rx: &mut UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = rx.try_next() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_caller_sends_initiate_then_offer() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("alice");
        let engine = engine_with(transport.clone(), media.clone());

        let handle = engine.initiate_call("alice", "bob").await.unwrap();

        assert_eq!(transport.kinds(), vec!["incoming-call", "offer"]);
        assert_eq!(engine.status(), CallStatus::Negotiating);
        assert_eq!(media.acquired_count(), 1);
        assert_eq!(handle.resource::<String>().unwrap(), "local-stream@alice");
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded_to_remote() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice").with_local_candidates(3));

        engine.initiate_call("alice", "bob").await.unwrap();
        assert_eq!(engine.process_pending_media_events().await, 3);

        let kinds = transport.kinds();
        assert_eq!(kinds.iter().filter(|k| *k == "ice-candidate").count(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_remote_ends_before_media() {
        let transport = Arc::new(RecordingTransport::unreachable());
        let media = SimulatedMedia::new("alice");
        let engine = engine_with(transport, media.clone());
        let mut events = engine.subscribe();

        let err = engine.initiate_call("alice", "bob").await.unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::RemoteUnavailable);
        assert_eq!(media.acquired_count(), 0);
        assert_eq!(engine.status(), CallStatus::Ended);
        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::Error { kind: CallErrorKind::RemoteUnavailable, .. }
        )));
    }

    #[tokio::test]
    async fn test_busy_initiate_leaves_call_alone() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice"));
        engine.initiate_call("alice", "bob").await.unwrap();
        let before = engine.snapshot().unwrap();

        let err = engine.initiate_call("alice", "carol").await.unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
        assert_eq!(engine.snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn test_callee_buffers_until_accept() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("bob");
        let engine = engine_with(transport.clone(), media.clone());
        let mut events = engine.subscribe();

        engine.handle_signal(InboundSignal::new("alice", Signal::IncomingCall)).await;
        engine
            .handle_signal(InboundSignal::new("alice", Signal::Offer(SessionDescription::new("offer:alice"))))
            .await;
        engine
            .handle_signal(InboundSignal::new("alice", Signal::IceCandidate(IceCandidate::new("a-1"))))
            .await;

        let snap = engine.snapshot().unwrap();
        assert_eq!(snap.status, CallStatus::Idle);
        assert!(snap.pending_offer);
        assert_eq!(snap.pending_candidates, 1);
        assert!(transport.kinds().is_empty());

        engine.accept_call("bob", "alice").await.unwrap();

        assert_eq!(engine.status(), CallStatus::Active);
        assert_eq!(transport.kinds(), vec!["answer"]);
        let primitive = media.last_primitive().unwrap();
        assert_eq!(primitive.applied_candidates(), vec!["a-1"]);
        let events = drain_events(&mut events);
        assert_eq!(events[0], CallEvent::IncomingCall { from: "alice".into() });
        assert!(events.contains(&CallEvent::StateChanged {
            status: CallStatus::Active,
            remote: "alice".into()
        }));
    }

    #[tokio::test]
    async fn test_duplicate_incoming_call_announced_once() {
        let engine = engine_with(Arc::new(RecordingTransport::default()), SimulatedMedia::new("bob"));
        let mut events = engine.subscribe();

        engine.receive_incoming_call("alice").unwrap();
        engine.receive_incoming_call("alice").unwrap();

        assert_eq!(drain_events(&mut events).len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_call_while_busy_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("bob"));
        engine.initiate_call("bob", "carol").await.unwrap();

        let err = engine.receive_incoming_call("alice").unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
        assert_eq!(engine.snapshot().unwrap().remote, "carol");
    }

    #[tokio::test]
    async fn test_candidate_from_stranger_is_violation() {
        let engine = engine_with(Arc::new(RecordingTransport::default()), SimulatedMedia::new("bob"));
        engine.receive_incoming_call("alice").unwrap();

        let err = engine
            .receive_candidate("mallory", IceCandidate::new("x"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
        assert_eq!(engine.snapshot().unwrap().pending_candidates, 0);
    }

    #[tokio::test]
    async fn test_candidate_overflow_drops_newest() {
        let transport = Arc::new(RecordingTransport::default());
        let config = CallConfig {
            max_pending_candidates: 2,
            ..CallConfig::default()
        };
        let engine = CallEngine::new(transport, Arc::new(SimulatedMedia::new("bob")), config);
        engine.receive_incoming_call("alice").unwrap();

        for i in 0..3 {
            engine
                .handle_signal(InboundSignal::new(
                    "alice",
                    Signal::IceCandidate(IceCandidate::new(format!("a-{}", i))),
                ))
                .await;
        }

        assert_eq!(engine.snapshot().unwrap().pending_candidates, 2);
    }

    #[tokio::test]
    async fn test_answer_to_callee_is_dropped() {
        let engine = engine_with(Arc::new(RecordingTransport::default()), SimulatedMedia::new("bob"));
        engine.receive_incoming_call("alice").unwrap();

        let err = engine
            .receive_answer("alice", SessionDescription::new("answer:alice"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
        assert!(engine.is_in_call());
    }

    #[tokio::test]
    async fn test_hang_up_releases_and_notifies_once() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("alice");
        let engine = engine_with(transport.clone(), media.clone());
        let handle = engine.initiate_call("alice", "bob").await.unwrap();

        engine.hang_up().await.unwrap();
        engine.hang_up().await.unwrap();

        assert_eq!(media.release_count(handle.id()), 1);
        assert!(media.last_primitive().unwrap().is_closed());
        let ends = transport.kinds().iter().filter(|k| *k == "call-end").count();
        assert_eq!(ends, 1);
        assert_eq!(engine.status(), CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_remote_call_end_is_not_echoed() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice"));
        engine.initiate_call("alice", "bob").await.unwrap();

        engine.handle_signal(InboundSignal::new("bob", Signal::CallEnd)).await;

        assert_eq!(engine.status(), CallStatus::Ended);
        assert!(!transport.kinds().contains(&"call-end".to_string()));
    }

    #[tokio::test]
    async fn test_stale_media_event_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice"));
        engine.initiate_call("alice", "bob").await.unwrap();
        engine.hang_up().await.unwrap();
        let sent_before = transport.kinds().len();

        engine
            .handle_media_event(SessionId::new(), MediaEvent::LocalCandidate(IceCandidate::new("x")))
            .await;
        // Candidates queued for the ended session are stale too.
        engine.process_pending_media_events().await;

        assert_eq!(transport.kinds().len(), sent_before);
    }

    #[tokio::test]
    async fn test_media_failure_ends_call() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice"));
        let mut events = engine.subscribe();
        engine.initiate_call("alice", "bob").await.unwrap();
        let id = engine.snapshot().unwrap().id;

        engine
            .handle_media_event(id, MediaEvent::Failed("ice failed".into()))
            .await;

        assert_eq!(engine.status(), CallStatus::Ended);
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            CallEvent::Error { kind: CallErrorKind::NegotiationFailure, .. }
        )));
    }

    #[tokio::test]
    async fn test_rejected_remote_answer_fails_call() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("alice");
        let engine = engine_with(transport.clone(), media.clone());
        engine.initiate_call("alice", "bob").await.unwrap();

        let err = engine
            .receive_answer("bob", SessionDescription::new("bad-answer"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::NegotiationFailure);
        assert_eq!(engine.status(), CallStatus::Ended);
        assert_eq!(media.total_releases(), 1);
        assert!(transport.kinds().contains(&"call-end".to_string()));
    }

    #[tokio::test]
    async fn test_reject_ringing_call() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("bob");
        let engine = engine_with(transport.clone(), media.clone());
        engine.receive_incoming_call("alice").unwrap();

        engine.reject_call("alice").await.unwrap();

        assert_eq!(engine.status(), CallStatus::Ended);
        assert_eq!(transport.kinds(), vec!["call-end"]);
        assert_eq!(media.acquired_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_without_ringing_call_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("bob");
        let engine = engine_with(transport.clone(), media.clone());

        let err = engine.reject_call("alice").await.unwrap_err();
        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);

        engine.receive_incoming_call("alice").unwrap();
        engine.accept_call("bob", "alice").await.unwrap();
        let before = engine.snapshot().unwrap();

        let err = engine.reject_call("alice").await.unwrap_err();

        assert_eq!(err.kind(), CallErrorKind::ProtocolViolation);
        assert_eq!(engine.snapshot().unwrap(), before);
        assert!(transport.kinds().is_empty());
        assert_eq!(media.total_releases(), 0);
    }

    #[tokio::test]
    async fn test_offer_after_finished_call_rings_again() {
        let transport = Arc::new(RecordingTransport::default());
        let engine = engine_with(transport.clone(), SimulatedMedia::new("alice"));
        engine.initiate_call("alice", "bob").await.unwrap();
        engine.hang_up().await.unwrap();
        let finished = engine.snapshot().unwrap().id;
        let mut events = engine.subscribe();

        engine
            .receive_offer("bob", SessionDescription::new("offer:bob"))
            .await
            .unwrap();

        let snap = engine.snapshot().unwrap();
        assert_ne!(snap.id, finished);
        assert_eq!(snap.role, CallRole::Callee);
        assert_eq!(snap.status, CallStatus::Idle);
        assert!(snap.pending_offer);
        assert_eq!(
            drain_events(&mut events),
            vec![CallEvent::IncomingCall { from: "bob".into() }]
        );
    }

    #[tokio::test]
    async fn test_watchdog_ends_stuck_negotiation() {
        let start = Instant::now();
        let mut clock = MockClock::new();
        let mut calls = 0u32;
        clock.expect_now().returning(move || {
            calls += 1;
            // First reading stamps negotiation start; later ones are past the timeout.
            if calls == 1 {
                start
            } else {
                start + Duration::from_secs(31)
            }
        });

        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("alice");
        let engine = CallEngine::with_clock(
            transport.clone(),
            Arc::new(media.clone()),
            CallConfig::default(),
            Arc::new(clock),
        );
        let mut events = engine.subscribe();
        engine.initiate_call("alice", "bob").await.unwrap();

        assert!(engine.check_timeouts().await);
        assert!(!engine.check_timeouts().await);

        assert_eq!(engine.status(), CallStatus::Ended);
        assert_eq!(media.total_releases(), 1);
        assert!(transport.kinds().contains(&"call-end".to_string()));
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            CallEvent::Error { kind: CallErrorKind::NegotiationFailure, .. }
        )));
    }

    #[tokio::test]
    async fn test_watchdog_ignores_young_negotiation() {
        let start = Instant::now();
        let mut clock = MockClock::new();
        clock.expect_now().returning(move || start + Duration::from_secs(5));

        let engine = CallEngine::with_clock(
            Arc::new(RecordingTransport::default()),
            Arc::new(SimulatedMedia::new("alice")),
            CallConfig::default(),
            Arc::new(clock),
        );
        engine.initiate_call("alice", "bob").await.unwrap();

        assert!(!engine.check_timeouts().await);
        assert_eq!(engine.status(), CallStatus::Negotiating);
    }

    #[tokio::test]
    async fn test_permission_denied_tears_down() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("alice").deny_permission();
        let engine = engine_with(transport.clone(), media.clone());

        let err = engine.initiate_call("alice", "bob").await.unwrap_err();

        assert_eq!(err, CallError::PermissionDenied);
        assert_eq!(engine.status(), CallStatus::Ended);
        assert!(media.primitives().is_empty());
        assert_eq!(transport.kinds(), vec!["incoming-call", "call-end"]);
    }

    #[tokio::test]
    async fn test_offer_applied_after_accept() {
        let transport = Arc::new(RecordingTransport::default());
        let media = SimulatedMedia::new("bob");
        let engine = engine_with(transport.clone(), media.clone());

        engine.receive_incoming_call("alice").unwrap();
        engine.accept_call("bob", "alice").await.unwrap();
        assert_eq!(engine.status(), CallStatus::Negotiating);

        engine
            .receive_offer("alice", SessionDescription::new("offer:alice"))
            .await
            .unwrap();

        assert_eq!(engine.status(), CallStatus::Active);
        let primitive = media.last_primitive().unwrap();
        assert_eq!(primitive.count(|op| matches!(op, PrimitiveOp::AppliedOffer(_))), 1);
        assert_eq!(transport.kinds(), vec!["answer"]);
    }
}
