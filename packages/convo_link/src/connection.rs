//! Connection state machine.
//!
//! The top-level orchestrator: owns the signaling channel, the media
//! session, the stream reassembler and the thread registry, and exposes the
//! public API. All inbound frames, public operations, media results and
//! reconnect ticks are serialized through a single event-loop task, so the
//! session identifier, the stream accumulator and the active-thread id never
//! need locks.
//!
//! Consumers subscribe to a broadcast of typed [`ConnectionEvent`]s instead
//! of string-keyed callbacks; the rendering layer invokes markup interaction
//! handlers injected at construction rather than registering them on shared
//! global state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::media::{CaptureFactory, MediaEvent, MediaHandle, MediaSession, SideChannelEvent};
use crate::protocol::{ClientFrame, ContentKind, Message, ServerFrame};
use crate::reassembly::{ReassemblyEvent, StreamReassembler};
use crate::signaling::{ChannelEvent, SignalingChannel};
use crate::threads::ThreadRegistry;

/// Signaling connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Media phase, an independent axis from the signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Idle,
    Connecting,
    Connected,
}

/// Unified event stream delivered to consumers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    MediaStateChanged(MediaState),
    /// Server-issued session identifier captured.
    SessionEstablished { session_id: String },
    /// A complete message: either delivered whole by the server or the final
    /// snapshot of a finished stream.
    MessageReceived(Message),
    StreamStarted {
        id: String,
        chunk: String,
        kind: ContentKind,
    },
    StreamChunk {
        id: String,
        chunk: String,
        accumulated: String,
        kind: ContentKind,
    },
    /// The stream for `id` finished; the final message follows as a
    /// `MessageReceived`.
    StreamDone { id: String },
    EnhancementStarted,
    /// Emitted before a thread switch tears anything down, so consumers can
    /// flush pending state for the outgoing thread.
    ThreadChanging {
        from: Option<String>,
        to: String,
    },
    ThreadChanged { thread_id: String },
    RemoteMedia(MediaHandle),
    SideChannel(SideChannelEvent),
    Error(LinkError),
}

/// Point-in-time view of the connector, for status displays and tests.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub media_state: MediaState,
    pub session_id: Option<String>,
    pub active_thread: Option<String>,
    pub reconnect_attempts: u32,
}

pub type ActionCallback = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Interaction handlers for inline markup content, injected at construction.
/// The rendering layer invokes them directly through the connector; there
/// is no ambient global registry.
#[derive(Clone, Default)]
pub struct MarkupHandlers {
    action: Option<ActionCallback>,
}

impl MarkupHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_action(
        mut self,
        callback: impl Fn(&str, serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.action = Some(Arc::new(callback));
        self
    }

    /// Invoke the action handler. Returns false when none is registered.
    pub fn invoke_action(&self, name: &str, payload: serde_json::Value) -> bool {
        match &self.action {
            Some(callback) => {
                callback(name, payload);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for MarkupHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkupHandlers")
            .field("action", &self.action.is_some())
            .finish()
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    SendText {
        content: String,
        thread_id: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    SendAction {
        prompt: serde_json::Value,
        thread_id: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    },
    StartMedia {
        thread_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopMedia {
        reply: oneshot::Sender<()>,
    },
    SetActiveThread {
        thread_id: Option<String>,
    },
    SwitchThread {
        thread_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    // Internal ticks, routed through the same queue so everything stays
    // serialized.
    ReconnectTick,
    SwitchGraceElapsed,
    MediaReady {
        result: Box<Result<MediaSession>>,
    },
}

/// Builder for a [`Connector`].
pub struct ConnectorBuilder {
    config: LinkConfig,
    capture: Option<CaptureFactory>,
    handlers: MarkupHandlers,
}

impl ConnectorBuilder {
    /// Inject the local audio capture source used by `start_media`.
    pub fn capture(mut self, factory: CaptureFactory) -> Self {
        self.capture = Some(factory);
        self
    }

    /// Inject markup interaction handlers.
    pub fn markup_handlers(mut self, handlers: MarkupHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Spawn the event-loop task and return the public handle.
    pub fn spawn(self) -> Connector {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (chan_tx, chan_rx) = mpsc::channel(256);
        let (media_tx, media_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let channel = SignalingChannel::spawn(self.config.connect_timeout(), chan_tx);

        let actor = Actor {
            cfg: self.config.clone(),
            correlation_id: Uuid::new_v4(),
            state: ConnectionState::Disconnected,
            media_state: MediaState::Idle,
            session_id: None,
            channel,
            chan_rx,
            cmd_rx,
            internal_tx: cmd_tx.clone(),
            events: events.clone(),
            reassembler: StreamReassembler::new(),
            threads: ThreadRegistry::new(),
            capture: self.capture,
            media: None,
            media_tx,
            media_rx,
            media_waiter: None,
            pending_sends: Vec::new(),
            pending_media: Vec::new(),
            connect_waiters: Vec::new(),
            reconnect_attempts: 0,
            reconnect_scheduled: false,
            user_closed: false,
            channel_draining: false,
            pending_reopen: false,
            switching: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Connector {
            cfg: Arc::new(self.config),
            cmd_tx,
            events,
            handlers: self.handlers,
            cancel,
        }
    }
}

/// Public handle to one connection state machine instance.
pub struct Connector {
    cfg: Arc<LinkConfig>,
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    handlers: MarkupHandlers,
    cancel: CancellationToken,
}

impl Connector {
    pub fn builder(config: LinkConfig) -> ConnectorBuilder {
        ConnectorBuilder {
            config,
            capture: None,
            handlers: MarkupHandlers::new(),
        }
    }

    /// Subscribe to the unified event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Markup interaction handlers for the rendering layer to invoke.
    pub fn handlers(&self) -> &MarkupHandlers {
        &self.handlers
    }

    /// Open the signaling channel. Resolves once the channel is open; the
    /// session identifier may still be in flight.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Connect { reply }).await?;
        self.await_reply(rx, self.cfg.connect_timeout() + GRACE, "channel open")
            .await?
    }

    /// Send a free-text message. Connects and waits for the session
    /// identifier first when needed. Returns the generated message id for
    /// correlation.
    pub async fn send_text(
        &self,
        content: impl Into<String>,
        thread_id: Option<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SendText {
            content: content.into(),
            thread_id,
            reply,
        })
        .await?;
        self.await_reply(rx, self.send_bound(), "session identifier")
            .await?
    }

    /// Send a structured UI-driven interaction. Same preconditions as
    /// [`send_text`](Self::send_text); differs only in frame shape.
    pub async fn send_action(
        &self,
        prompt: serde_json::Value,
        thread_id: Option<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SendAction {
            prompt,
            thread_id,
            reply,
        })
        .await?;
        self.await_reply(rx, self.send_bound(), "session identifier")
            .await?
    }

    /// Negotiate the media session. Requires a capture source to have been
    /// injected at construction.
    pub async fn start_media(&self, thread_id: Option<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::StartMedia { thread_id, reply })
            .await?;
        let bound = self.send_bound() + self.cfg.connect_timeout();
        self.await_reply(rx, bound, "media negotiation").await?
    }

    /// Tear down the media session. Always safe to call.
    pub async fn stop_media(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send_command(Command::StopMedia { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Record the thread id used to tag subsequent outbound sends. No I/O.
    pub async fn set_active_thread(&self, thread_id: Option<String>) {
        let _ = self
            .send_command(Command::SetActiveThread { thread_id })
            .await;
    }

    /// Switch to another thread against the live channel: close, grace
    /// period, reopen thread-scoped, and wait for a fresh session
    /// identifier. A switch already in progress causes this call to be
    /// acknowledged as a no-op.
    pub async fn switch_thread(&self, thread_id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::SwitchThread {
            thread_id: thread_id.into(),
            reply,
        })
        .await?;
        let bound = self.cfg.switch_grace() + self.send_bound();
        self.await_reply(rx, bound, "thread switch").await?
    }

    /// Stop media, close the channel, clear the session identifier. Never
    /// triggers auto-reconnect.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send_command(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Status { reply }).await?;
        rx.await
            .map_err(|_| LinkError::Transport("connector terminated".into()))
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| LinkError::Transport("connector terminated".into()))
    }

    fn send_bound(&self) -> Duration {
        self.cfg.connect_timeout() + self.cfg.session_timeout() + GRACE
    }

    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<T>,
        bound: Duration,
        waiting_for: &'static str,
    ) -> Result<T> {
        match tokio::time::timeout(bound, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(LinkError::Transport("connector terminated".into())),
            Err(_) => Err(LinkError::Timeout(waiting_for)),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Slack added on top of configured bounds so the actor's own typed timeout
/// wins the race against the caller-side guard.
const GRACE: Duration = Duration::from_secs(2);

struct PendingSend {
    body: PendingBody,
    thread_id: Option<String>,
    reply: oneshot::Sender<Result<String>>,
}

enum PendingBody {
    Text(String),
    Action(serde_json::Value),
}

struct SwitchState {
    target: String,
    phase: SwitchPhase,
    reply: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPhase {
    /// Waiting for the old channel to close.
    Closing,
    /// Grace delay between close and reopen.
    Grace,
    /// New thread-scoped channel opening.
    Opening,
    /// Channel open, waiting for the fresh session identifier.
    AwaitSession,
}

struct Actor {
    cfg: LinkConfig,
    /// Locally generated, for log correlation only.
    correlation_id: Uuid,
    state: ConnectionState,
    media_state: MediaState,
    session_id: Option<String>,
    channel: SignalingChannel,
    chan_rx: mpsc::Receiver<ChannelEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    reassembler: StreamReassembler,
    threads: ThreadRegistry,
    capture: Option<CaptureFactory>,
    media: Option<MediaSession>,
    media_tx: mpsc::Sender<MediaEvent>,
    media_rx: mpsc::Receiver<MediaEvent>,
    media_waiter: Option<oneshot::Sender<Result<()>>>,
    pending_sends: Vec<PendingSend>,
    pending_media: Vec<oneshot::Sender<Result<()>>>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    reconnect_attempts: u32,
    reconnect_scheduled: bool,
    user_closed: bool,
    /// True between asking the channel to close and seeing its Closed (or
    /// Error) event; an open issued meanwhile would be ignored by the
    /// still-open channel task, so it is parked in `pending_reopen`.
    channel_draining: bool,
    pending_reopen: bool,
    switching: Option<SwitchState>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        debug!(correlation_id = %self.correlation_id, "connector event loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd).await,
                Some(ev) = self.chan_rx.recv() => self.handle_channel_event(ev).await,
                Some(ev) = self.media_rx.recv() => self.handle_media_event(ev).await,
                else => break,
            }
        }
        // Deterministic teardown on shutdown.
        if let Some(media) = self.media.take() {
            media.stop().await;
        }
        self.channel.close().await;
        debug!(correlation_id = %self.correlation_id, "connector event loop stopped");
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(correlation_id = %self.correlation_id, ?state, "connection state change");
            self.state = state;
            self.emit(ConnectionEvent::StateChanged(state));
        }
    }

    fn set_media_state(&mut self, state: MediaState) {
        if self.media_state != state {
            debug!(correlation_id = %self.correlation_id, ?state, "media state change");
            self.media_state = state;
            self.emit(ConnectionEvent::MediaStateChanged(state));
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                self.user_closed = false;
                match self.state {
                    ConnectionState::Connected => {
                        let _ = reply.send(Ok(()));
                    }
                    // Re-entrancy guard: a connect while one is in flight
                    // joins it instead of starting a second attempt.
                    ConnectionState::Connecting => self.connect_waiters.push(reply),
                    _ => {
                        self.connect_waiters.push(reply);
                        self.start_connect().await;
                    }
                }
            }
            Command::SendText {
                content,
                thread_id,
                reply,
            } => {
                self.handle_send(PendingBody::Text(content), thread_id, reply)
                    .await;
            }
            Command::SendAction {
                prompt,
                thread_id,
                reply,
            } => {
                self.handle_send(PendingBody::Action(prompt), thread_id, reply)
                    .await;
            }
            Command::StartMedia { thread_id, reply } => {
                self.handle_start_media(thread_id, reply).await;
            }
            Command::StopMedia { reply } => {
                self.teardown_media();
                let _ = reply.send(());
            }
            Command::SetActiveThread { thread_id } => {
                self.threads.set_active(thread_id);
            }
            Command::SwitchThread { thread_id, reply } => {
                self.handle_switch(thread_id, reply).await;
            }
            Command::Disconnect { reply } => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(StatusSnapshot {
                    state: self.state,
                    media_state: self.media_state,
                    session_id: self.session_id.clone(),
                    active_thread: self.threads.active().map(str::to_owned),
                    reconnect_attempts: self.reconnect_attempts,
                });
            }
            Command::ReconnectTick => {
                self.reconnect_scheduled = false;
                if self.user_closed || self.state == ConnectionState::Connected {
                    return;
                }
                info!(
                    correlation_id = %self.correlation_id,
                    attempt = self.reconnect_attempts,
                    "reconnect attempt"
                );
                self.start_connect().await;
            }
            Command::SwitchGraceElapsed => {
                if let Some(sw) = &mut self.switching {
                    if sw.phase == SwitchPhase::Grace {
                        sw.phase = SwitchPhase::Opening;
                        let target = sw.target.clone();
                        self.threads.set_active(Some(target));
                        self.start_connect().await;
                    }
                }
            }
            Command::MediaReady { result } => self.handle_media_ready(*result),
        }
    }

    async fn start_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        if self.channel_draining {
            // The previous socket is still closing; reopen once its Closed
            // event lands.
            self.pending_reopen = true;
            return;
        }
        let url = self.threads.endpoint_url(&self.cfg.signaling_url);
        self.channel.open(url).await;
    }

    async fn handle_send(
        &mut self,
        body: PendingBody,
        thread_id: Option<String>,
        reply: oneshot::Sender<Result<String>>,
    ) {
        if self.state == ConnectionState::Connected && self.session_id.is_some() {
            let id = self.dispatch_send(body, thread_id).await;
            let _ = reply.send(Ok(id));
            return;
        }

        // Transparent connect: queue the send and make sure a connection
        // attempt is under way. The caller's bounded wait turns a stall into
        // a typed timeout.
        self.pending_sends.retain(|p| !p.reply.is_closed());
        self.pending_sends.push(PendingSend {
            body,
            thread_id,
            reply,
        });
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            self.user_closed = false;
            self.start_connect().await;
        }
    }

    async fn dispatch_send(&mut self, body: PendingBody, thread_id: Option<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let tag = self.threads.tag(thread_id);
        let frame = match body {
            PendingBody::Text(message) => ClientFrame::Chat {
                message,
                thread_id: tag,
                id: id.clone(),
            },
            PendingBody::Action(prompt) => ClientFrame::StructuredAction {
                prompt,
                thread_id: tag,
                response_id: id.clone(),
            },
        };
        self.channel.send(&frame).await;
        id
    }

    async fn handle_start_media(
        &mut self,
        thread_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.media_state != MediaState::Idle {
            let _ = reply.send(Err(LinkError::Precondition("media already active")));
            return;
        }
        if self.capture.is_none() {
            let _ = reply.send(Err(LinkError::Device(
                "no capture source configured".into(),
            )));
            return;
        }
        if let Some(thread_id) = thread_id {
            self.threads.set_active(Some(thread_id));
        }

        if self.state == ConnectionState::Connected && self.session_id.is_some() {
            self.begin_media(reply);
            return;
        }

        self.pending_media.retain(|waiter| !waiter.is_closed());
        self.pending_media.push(reply);
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            self.user_closed = false;
            self.start_connect().await;
        }
    }

    fn begin_media(&mut self, reply: oneshot::Sender<Result<()>>) {
        let (Some(session_id), Some(factory)) = (self.session_id.clone(), self.capture.clone())
        else {
            let _ = reply.send(Err(LinkError::Precondition(
                "media start requires a session identifier",
            )));
            return;
        };

        self.set_media_state(MediaState::Connecting);
        self.media_waiter = Some(reply);

        let cfg = self.cfg.clone();
        let media_tx = self.media_tx.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = MediaSession::negotiate(cfg, session_id, factory, media_tx).await;
            let _ = internal_tx
                .send(Command::MediaReady {
                    result: Box::new(result),
                })
                .await;
        });
    }

    fn handle_media_ready(&mut self, result: Result<MediaSession>) {
        match result {
            Ok(session) => {
                if self.media_state != MediaState::Connecting {
                    // Stopped or disconnected while negotiating; discard.
                    debug!("media negotiation finished after teardown, discarding session");
                    tokio::spawn(session.stop());
                    return;
                }
                self.media = Some(session);
                self.set_media_state(MediaState::Connected);
                if let Some(waiter) = self.media_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(error = %e, "media negotiation failed");
                self.set_media_state(MediaState::Idle);
                self.emit(ConnectionEvent::Error(e.clone()));
                if let Some(waiter) = self.media_waiter.take() {
                    let _ = waiter.send(Err(e));
                }
            }
        }
    }

    /// Stop and drop any live or negotiating media. Never restarts it.
    fn teardown_media(&mut self) {
        if let Some(media) = self.media.take() {
            tokio::spawn(media.stop());
        }
        if let Some(waiter) = self.media_waiter.take() {
            let _ = waiter.send(Err(LinkError::Precondition("media stopped")));
        }
        self.set_media_state(MediaState::Idle);
    }

    async fn handle_switch(&mut self, thread_id: String, reply: oneshot::Sender<Result<()>>) {
        if self.switching.is_some() {
            // Serialized: a switch in progress swallows later requests.
            debug!(thread = %thread_id, "thread switch already in progress, ignoring");
            let _ = reply.send(Ok(()));
            return;
        }

        info!(
            correlation_id = %self.correlation_id,
            from = ?self.threads.active(),
            to = %thread_id,
            "switching thread"
        );
        self.emit(ConnectionEvent::ThreadChanging {
            from: self.threads.active().map(str::to_owned),
            to: thread_id.clone(),
        });
        self.user_closed = false;

        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.switching = Some(SwitchState {
                target: thread_id,
                phase: SwitchPhase::Closing,
                reply: Some(reply),
            });
            self.channel_draining = true;
            self.channel.close().await;
        } else {
            self.threads.set_active(Some(thread_id.clone()));
            self.switching = Some(SwitchState {
                target: thread_id,
                phase: SwitchPhase::Opening,
                reply: Some(reply),
            });
            self.start_connect().await;
        }
    }

    async fn handle_disconnect(&mut self) {
        info!(correlation_id = %self.correlation_id, "disconnect requested");
        self.user_closed = true;
        self.pending_reopen = false;
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.channel_draining = true;
        }
        self.teardown_media();
        self.channel.close().await;
        self.session_id = None;
        self.fail_waiters(LinkError::Precondition("disconnected before completion"));
        self.set_state(ConnectionState::Disconnected);
    }

    fn fail_waiters(&mut self, error: LinkError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for pending in self.pending_sends.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
        for waiter in self.pending_media.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                info!(correlation_id = %self.correlation_id, "signaling channel open");
                self.set_state(ConnectionState::Connected);
                self.reconnect_attempts = 0;
                self.reconnect_scheduled = false;
                self.channel_draining = false;
                self.pending_reopen = false;
                if let Some(sw) = &mut self.switching {
                    if sw.phase == SwitchPhase::Opening {
                        sw.phase = SwitchPhase::AwaitSession;
                    }
                }
                if !self.threads.is_thread_scoped() {
                    self.send_client_config().await;
                }
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ChannelEvent::Frame(raw) => {
                if let Some(frame) = ServerFrame::parse(&raw) {
                    self.handle_frame(frame).await;
                }
            }
            ChannelEvent::Error(error) => self.handle_channel_error(error),
            ChannelEvent::Closed { code, reason } => self.handle_closed(code, reason).await,
        }
    }

    async fn send_client_config(&mut self) {
        let mut config = serde_json::json!({
            "client": "convo_link",
            "version": env!("CARGO_PKG_VERSION"),
        });
        if let (Some(serde_json::Value::Object(extra)), Some(base)) =
            (self.cfg.client_config.clone(), config.as_object_mut())
        {
            base.extend(extra);
        }
        self.channel
            .send(&ClientFrame::ClientConfig { config })
            .await;
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SessionEstablished { connection_id } => {
                info!(
                    correlation_id = %self.correlation_id,
                    session = %connection_id,
                    "session established"
                );
                self.session_id = Some(connection_id.clone());
                self.emit(ConnectionEvent::SessionEstablished {
                    session_id: connection_id,
                });
                self.complete_switch();
                self.flush_pending().await;
            }
            ServerFrame::SessionState { state, message } => {
                debug!(state = %state, message = ?message, "session state frame");
                if state == "disconnecting" {
                    // Pre-emptive: the backend is about to drop us. Close our
                    // side too so a later connect starts from a clean socket.
                    self.session_id = None;
                    self.teardown_media();
                    self.fail_waiters(LinkError::Server("session ending".into()));
                    self.channel_draining = true;
                    self.channel.close().await;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            ServerFrame::AssistantResponse {
                id,
                content,
                content_type,
            } => {
                self.emit(ConnectionEvent::MessageReceived(Message::assistant(
                    id,
                    content,
                    content_type.unwrap_or(ContentKind::PlainText),
                )));
            }
            ServerFrame::UserResponse {
                id,
                content,
                content_type,
            } => {
                let mut message = Message::user(id, content);
                message.kind = content_type.unwrap_or(ContentKind::PlainText);
                self.emit(ConnectionEvent::MessageReceived(message));
            }
            ServerFrame::TokenChunk { id, content } => {
                let event = self.reassembler.ingest(&id, &content, ContentKind::Markup);
                self.emit_reassembly(event);
            }
            ServerFrame::UiTokenChunk { id, content } => {
                let event = self
                    .reassembler
                    .ingest(&id, &content, ContentKind::GeneratedUi);
                self.emit_reassembly(event);
            }
            ServerFrame::StreamDone { id } => {
                if let Some(event) = self.reassembler.finish(&id) {
                    self.emit_reassembly(event);
                }
            }
            ServerFrame::EnhancementStarted => {
                self.emit(ConnectionEvent::EnhancementStarted);
            }
            ServerFrame::Error { message } => {
                // An explicit server error does not close the channel and
                // never triggers reconnection.
                self.emit(ConnectionEvent::Error(LinkError::Server(message)));
            }
        }
    }

    fn emit_reassembly(&mut self, event: ReassemblyEvent) {
        match event {
            ReassemblyEvent::Started { id, chunk, kind } => {
                self.emit(ConnectionEvent::StreamStarted { id, chunk, kind });
            }
            ReassemblyEvent::Chunk {
                id,
                chunk,
                accumulated,
                kind,
            } => {
                self.emit(ConnectionEvent::StreamChunk {
                    id,
                    chunk,
                    accumulated,
                    kind,
                });
            }
            ReassemblyEvent::Done { message } => {
                self.emit(ConnectionEvent::StreamDone {
                    id: message.id.clone(),
                });
                self.emit(ConnectionEvent::MessageReceived(message));
            }
        }
    }

    fn complete_switch(&mut self) {
        let done = matches!(
            &self.switching,
            Some(sw) if matches!(sw.phase, SwitchPhase::Opening | SwitchPhase::AwaitSession)
        );
        if !done {
            return;
        }
        if let Some(mut sw) = self.switching.take() {
            info!(thread = %sw.target, "thread switch complete");
            self.emit(ConnectionEvent::ThreadChanged {
                thread_id: sw.target.clone(),
            });
            if let Some(reply) = sw.reply.take() {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn flush_pending(&mut self) {
        if self.pending_sends.is_empty() && self.pending_media.is_empty() {
            return;
        }
        debug!(
            sends = self.pending_sends.len(),
            media = self.pending_media.len(),
            "flushing operations gated on session identifier"
        );
        for pending in std::mem::take(&mut self.pending_sends) {
            if pending.reply.is_closed() {
                debug!("dropping queued send whose caller gave up");
                continue;
            }
            let id = self.dispatch_send(pending.body, pending.thread_id).await;
            let _ = pending.reply.send(Ok(id));
        }
        for reply in std::mem::take(&mut self.pending_media) {
            if reply.is_closed() {
                continue;
            }
            if self.media_state == MediaState::Idle {
                self.begin_media(reply);
            } else {
                let _ = reply.send(Err(LinkError::Precondition("media already active")));
            }
        }
    }

    fn handle_channel_error(&mut self, error: LinkError) {
        warn!(correlation_id = %self.correlation_id, error = %error, "signaling channel error");
        // A failed connect emits Error with no Closed to follow; the channel
        // task is back in its idle loop.
        self.channel_draining = false;
        self.emit(ConnectionEvent::Error(error.clone()));

        if let Some(mut sw) = self.switching.take() {
            if let Some(reply) = sw.reply.take() {
                let _ = reply.send(Err(error.clone()));
            }
        }

        if self.state == ConnectionState::Connecting {
            // Connect failure: no Closed event will follow.
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }
            self.set_state(ConnectionState::Error);
            self.maybe_schedule_reconnect(error);
        }
        // Errors on an open channel are followed by a Closed event, which
        // drives the state transition and any reconnect.
    }

    async fn handle_closed(&mut self, code: Option<u16>, reason: String) {
        info!(
            correlation_id = %self.correlation_id,
            code = ?code,
            reason = %reason,
            "signaling channel closed"
        );
        self.channel_draining = false;
        self.session_id = None;
        // A lost session identifier invalidates the media negotiation; the
        // mic is never re-armed without explicit user action.
        self.teardown_media();

        if let Some(sw) = &mut self.switching {
            if sw.phase == SwitchPhase::Closing {
                sw.phase = SwitchPhase::Grace;
                self.set_state(ConnectionState::Connecting);
                let grace = self.cfg.switch_grace();
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = internal_tx.send(Command::SwitchGraceElapsed).await;
                });
                return;
            }
        }

        // A closure the state machine already acted on (explicit disconnect,
        // server-announced session end) is expected; only a drop out of a
        // live state triggers reconnection.
        let unexpected = !self.user_closed && self.state != ConnectionState::Disconnected;
        self.set_state(ConnectionState::Disconnected);
        if self.pending_reopen && !self.user_closed {
            self.pending_reopen = false;
            self.start_connect().await;
        } else if unexpected {
            warn!(correlation_id = %self.correlation_id, "unexpected channel closure");
            self.maybe_schedule_reconnect(LinkError::Transport(
                "signaling channel closed unexpectedly".into(),
            ));
        }
    }

    fn maybe_schedule_reconnect(&mut self, error: LinkError) {
        if !self.cfg.auto_reconnect || self.user_closed || !error.is_reconnectable() {
            self.fail_waiters(error);
            return;
        }
        if self.reconnect_scheduled {
            return;
        }
        if self.reconnect_attempts >= self.cfg.max_reconnect_attempts {
            warn!(
                correlation_id = %self.correlation_id,
                attempts = self.reconnect_attempts,
                "reconnect attempts exhausted"
            );
            self.fail_waiters(error);
            return;
        }

        self.reconnect_attempts += 1;
        self.reconnect_scheduled = true;
        info!(
            correlation_id = %self.correlation_id,
            attempt = self.reconnect_attempts,
            max = self.cfg.max_reconnect_attempts,
            interval_ms = self.cfg.reconnect_interval_ms,
            "scheduling reconnect"
        );
        let interval = self.cfg.reconnect_interval();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = internal_tx.send(Command::ReconnectTick).await;
        });
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Remote(handle) => self.emit(ConnectionEvent::RemoteMedia(handle)),
            MediaEvent::SideChannel(kind) => self.emit(ConnectionEvent::SideChannel(kind)),
            MediaEvent::Error(error) => self.emit(ConnectionEvent::Error(error)),
        }
    }
}
