//! Signaling channel.
//!
//! A persistent, ordered, message-oriented WebSocket to the backend. The
//! channel runs as a single task owning the socket; the connector talks to it
//! through a command queue and hears back through a channel-event queue, so
//! all socket state lives in one place.
//!
//! Close is half-close aware: a `close()` that lands while the connect
//! handshake is still in flight is deferred until the handshake resolves:
//! if it succeeds the socket is closed immediately, if it fails there is
//! nothing to close. Naive immediate close during a handshake can leave a
//! dangling half-open socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::protocol::ClientFrame;

/// Raw connect/disconnect/frame events emitted by the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Opened,
    /// One inbound text payload, unparsed.
    Frame(String),
    Error(LinkError),
    Closed { code: Option<u16>, reason: String },
}

enum ChannelCmd {
    Open { url: String },
    Send { text: String },
    Close,
}

/// Handle to the channel task.
pub struct SignalingChannel {
    cmd_tx: mpsc::Sender<ChannelCmd>,
}

impl SignalingChannel {
    /// Spawn the channel task. Events arrive on `event_tx` in socket order.
    pub fn spawn(connect_timeout: Duration, event_tx: mpsc::Sender<ChannelEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = ChannelTask {
            cmd_rx,
            event_tx,
            connect_timeout,
        };
        tokio::spawn(task.run());
        Self { cmd_tx }
    }

    /// Request a connection to `url`. Idempotent; an open while already
    /// connecting or connected is a no-op. Completion is signalled by an
    /// `Opened` or `Error` event.
    pub async fn open(&self, url: String) {
        let _ = self.cmd_tx.send(ChannelCmd::Open { url }).await;
    }

    /// Enqueue a frame for transmission. If the channel is not open the
    /// frame is dropped with a warn log. Callers check readiness or let
    /// the connector queue and retry.
    pub async fn send(&self, frame: &ClientFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.cmd_tx.send(ChannelCmd::Send { text }).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize outbound frame, dropping"),
        }
    }

    /// Request a close. Safe in any state; at most one `Closed` event is
    /// emitted per actual closure.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ChannelCmd::Close).await;
    }
}

struct ChannelTask {
    cmd_rx: mpsc::Receiver<ChannelCmd>,
    event_tx: mpsc::Sender<ChannelEvent>,
    connect_timeout: Duration,
}

impl ChannelTask {
    async fn run(mut self) {
        // Idle loop: each Open runs one connection to completion, then the
        // channel returns here ready for a reopen.
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ChannelCmd::Open { url } => self.run_connection(url).await,
                ChannelCmd::Send { .. } => {
                    warn!("send while channel not open, dropping frame");
                }
                ChannelCmd::Close => {
                    debug!("close on idle channel, nothing to do");
                }
            }
        }
    }

    async fn emit(&self, event: ChannelEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn run_connection(&mut self, url: String) {
        debug!(url = %url, "opening signaling channel");

        let connect = connect_async(url);
        tokio::pin!(connect);
        let deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(deadline);

        let mut deferred_close = false;
        let ws = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok((ws, _response)) => break ws,
                    Err(e) => {
                        self.emit(ChannelEvent::Error(LinkError::Transport(format!(
                            "channel open failed: {e}"
                        ))))
                        .await;
                        return;
                    }
                },
                _ = &mut deadline => {
                    self.emit(ChannelEvent::Error(LinkError::Timeout("channel open"))).await;
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ChannelCmd::Close) => {
                        // Wait for the handshake to resolve, then act.
                        deferred_close = true;
                    }
                    Some(ChannelCmd::Send { .. }) => {
                        warn!("send while channel still connecting, dropping frame");
                    }
                    Some(ChannelCmd::Open { .. }) => {
                        debug!("open while already connecting, ignoring");
                    }
                    None => return,
                }
            }
        };

        if deferred_close {
            debug!("close requested during connect, closing freshly opened channel");
            let mut ws = ws;
            let _ = ws.close(None).await;
            self.emit(ChannelEvent::Closed {
                code: None,
                reason: "closed before open completed".into(),
            })
            .await;
            return;
        }

        self.emit(ChannelEvent::Opened).await;

        let (mut sink, mut stream) = ws.split();
        let mut closing = false;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ChannelCmd::Send { text }) => {
                        if closing {
                            warn!("send while channel closing, dropping frame");
                        } else if sink.send(WsMessage::Text(text.into())).await.is_err() {
                            self.emit(ChannelEvent::Error(LinkError::Transport(
                                "write to signaling channel failed".into(),
                            )))
                            .await;
                            self.emit(ChannelEvent::Closed {
                                code: None,
                                reason: "write failed".into(),
                            })
                            .await;
                            return;
                        }
                    }
                    Some(ChannelCmd::Close) => {
                        if !closing {
                            closing = true;
                            let _ = sink.send(WsMessage::Close(None)).await;
                        }
                    }
                    Some(ChannelCmd::Open { .. }) => {
                        debug!("open while already open, ignoring");
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.emit(ChannelEvent::Frame(text.as_str().to_owned())).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        self.emit(ChannelEvent::Closed { code, reason }).await;
                        return;
                    }
                    // Ping/pong are handled by the protocol layer; binary
                    // frames are not part of this protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        if !closing {
                            self.emit(ChannelEvent::Error(LinkError::Transport(format!(
                                "signaling channel read failed: {e}"
                            ))))
                            .await;
                        }
                        self.emit(ChannelEvent::Closed {
                            code: None,
                            reason: "transport error".into(),
                        })
                        .await;
                        return;
                    }
                    None => {
                        self.emit(ChannelEvent::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        })
                        .await;
                        return;
                    }
                }
            }
        }
    }
}
