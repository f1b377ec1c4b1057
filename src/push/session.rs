//! Per-connection push protocol state machine.
//!
//! ```text
//! Connecting ──upgrade──► Handshaking ──hello──► Active ──┐
//!                              │                          │ eviction, shutdown,
//!                              │ hello timeout,           │ keepalive timeout,
//!                              │ protocol error           │ protocol error,
//!                              ▼                          ▼ client close
//!                           Closing ◄─────────────────────┘
//!                              │
//!                              ▼
//!                            Closed
//! ```
//!
//! The session task is the only writer of its transport: notifications from
//! the router arrive as [`Outbound`] commands on a queue the task drains
//! between reads, and each frame is flushed before the next command is taken.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    decode_client, ChannelEntry, ClientMessage, ProtocolError, ServerMessage, STATUS_BAD_REQUEST,
    STATUS_OK,
};
use super::PushContext;
use crate::client::{ConnectionHandle, DeliveryError, Outbound};
use crate::constants::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CONNECTION_QUEUE_CAPACITY,
};
use crate::storage::primary_key;
use crate::update::{validate_chid, validate_uaid, Version};

type WsSink = SplitSink<WebSocket, Message>;

/// Lifecycle state of a push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, nothing read yet.
    Connecting,
    /// Waiting for `hello`.
    Handshaking,
    /// Registered; handling requests and notifications.
    Active,
    /// Tearing down the transport.
    Closing,
    /// Done.
    Closed,
}

/// Why a session is ending.
#[derive(Debug)]
enum CloseReason {
    Protocol(ProtocolError),
    ClientClosed,
    Transport(String),
    Evicted,
    Shutdown,
    HandshakeTimeout,
    KeepaliveTimeout,
}

impl CloseReason {
    /// Close frame to send, if the transport is still usable.
    fn frame(&self) -> Option<(u16, &'static str)> {
        match self {
            CloseReason::Protocol(_) => Some((CLOSE_PROTOCOL_ERROR, "protocol error")),
            CloseReason::Evicted => Some((CLOSE_NORMAL, "replaced by newer connection")),
            CloseReason::Shutdown => Some((CLOSE_GOING_AWAY, "server shutting down")),
            CloseReason::HandshakeTimeout => Some((CLOSE_PROTOCOL_ERROR, "hello timeout")),
            CloseReason::KeepaliveTimeout => Some((CLOSE_GOING_AWAY, "keepalive timeout")),
            CloseReason::ClientClosed | CloseReason::Transport(_) => None,
        }
    }
}

enum Event {
    Inbound(Option<Result<Message, axum::Error>>),
    Command(Option<Outbound>),
    Tick,
    Evicted,
    Shutdown,
}

/// State machine for one push connection.
#[derive(Debug)]
pub struct PushSession {
    ctx: PushContext,
    state: SessionState,
    handle: Option<ConnectionHandle>,
    commands_tx: mpsc::Sender<Outbound>,
    opened_at: Instant,
    last_inbound: Instant,
    ping_sent_at: Option<Instant>,
}

impl PushSession {
    /// Create a session for a transport that has just been accepted.
    pub fn new(ctx: PushContext) -> (Self, mpsc::Receiver<Outbound>) {
        let (commands_tx, commands_rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let now = Instant::now();
        let session = Self {
            ctx,
            state: SessionState::Connecting,
            handle: None,
            commands_tx,
            opened_at: now,
            last_inbound: now,
            ping_sent_at: None,
        };
        (session, commands_rx)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// UAID bound by the handshake, if any.
    pub fn uaid(&self) -> Option<&str> {
        self.handle.as_ref().map(ConnectionHandle::uaid)
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self, socket: WebSocket, mut commands_rx: mpsc::Receiver<Outbound>) {
        let (mut sink, mut stream) = socket.split();
        self.state = SessionState::Handshaking;

        let mut tick = tokio::time::interval(self.ctx.settings.tick_period());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.ctx.shutdown.clone();
        // Replaced by the handle's token once the handshake registers us
        let mut eviction = CancellationToken::new();
        let mut eviction_bound = false;

        let reason = loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => Event::Shutdown,
                () = eviction.cancelled() => Event::Evicted,
                msg = stream.next() => Event::Inbound(msg),
                cmd = commands_rx.recv() => Event::Command(cmd),
                _ = tick.tick() => Event::Tick,
            };

            let step = match event {
                Event::Shutdown => Err(CloseReason::Shutdown),
                Event::Evicted => Err(CloseReason::Evicted),
                Event::Inbound(None) => Err(CloseReason::ClientClosed),
                Event::Inbound(Some(Err(e))) => Err(CloseReason::Transport(e.to_string())),
                Event::Inbound(Some(Ok(msg))) => self.on_frame(&mut sink, msg).await,
                Event::Command(Some(cmd)) => self.on_command(&mut sink, cmd).await,
                // We hold a sender, so the queue cannot close while we run
                Event::Command(None) => Err(CloseReason::Transport("command queue closed".into())),
                Event::Tick => self.on_tick(&mut sink).await,
            };

            if let Err(reason) = step {
                break reason;
            }

            if !eviction_bound {
                if let Some(handle) = &self.handle {
                    eviction = handle.eviction_token();
                    eviction_bound = true;
                }
            }
        };

        self.close(&mut sink, &mut commands_rx, reason).await;
    }

    async fn on_frame(&mut self, sink: &mut WsSink, msg: Message) -> Result<(), CloseReason> {
        self.last_inbound = Instant::now();
        self.ping_sent_at = None;
        if let Some(handle) = &self.handle {
            handle.touch();
        }

        match msg {
            Message::Text(text) => {
                let parsed = decode_client(text.as_str()).map_err(CloseReason::Protocol)?;
                self.on_message(sink, parsed).await
            }
            Message::Binary(_) => Err(CloseReason::Protocol(ProtocolError::Binary)),
            // Transport-level keepalive; tungstenite answers pings itself
            Message::Ping(_) | Message::Pong(_) => Ok(()),
            Message::Close(_) => Err(CloseReason::ClientClosed),
        }
    }

    async fn on_message(
        &mut self,
        sink: &mut WsSink,
        msg: ClientMessage,
    ) -> Result<(), CloseReason> {
        if self.state == SessionState::Handshaking {
            return match msg {
                ClientMessage::Hello { uaid, channel_ids } => {
                    self.handshake(sink, uaid, channel_ids).await
                }
                other => Err(CloseReason::Protocol(ProtocolError::NotHandshaken(
                    other.kind(),
                ))),
            };
        }

        let Some(handle) = self.handle.clone() else {
            return Err(CloseReason::Protocol(ProtocolError::NotHandshaken(msg.kind())));
        };

        match msg {
            ClientMessage::Hello { uaid, .. } => {
                let bound = handle.uaid();
                match uaid.filter(|u| !u.is_empty()) {
                    Some(got) if got != bound => {
                        Err(CloseReason::Protocol(ProtocolError::UaidMismatch {
                            bound: bound.to_string(),
                            got,
                        }))
                    }
                    _ => {
                        self.send(
                            sink,
                            &ServerMessage::Hello {
                                uaid: bound.to_string(),
                                status: STATUS_OK,
                            },
                        )
                        .await
                    }
                }
            }
            ClientMessage::Register { chid } => {
                let status = if validate_chid(&chid).is_ok() {
                    handle.subscribe(&chid);
                    log::debug!("[Push] {} registered channel {}", handle.uaid(), chid);
                    STATUS_OK
                } else {
                    log::warn!("[Push] {} tried to register invalid channel {:?}", handle.uaid(), chid);
                    STATUS_BAD_REQUEST
                };
                self.send(sink, &ServerMessage::Register { chid, status }).await
            }
            ClientMessage::Unregister { chid } => {
                let status = if validate_chid(&chid).is_ok() {
                    handle.unsubscribe(&chid);
                    STATUS_OK
                } else {
                    STATUS_BAD_REQUEST
                };
                self.send(sink, &ServerMessage::Unregister { chid, status }).await
            }
            ClientMessage::Ack { chid, version } => {
                if validate_chid(&chid).is_ok() {
                    handle.record_ack(&chid, version);
                } else {
                    log::debug!("[Push] {} acked invalid channel {:?}", handle.uaid(), chid);
                }
                Ok(())
            }
            ClientMessage::Ping => self.send(sink, &ServerMessage::Pong).await,
            ClientMessage::Pong => Ok(()),
        }
    }

    async fn handshake(
        &mut self,
        sink: &mut WsSink,
        uaid: Option<String>,
        channel_ids: Vec<ChannelEntry>,
    ) -> Result<(), CloseReason> {
        let uaid = match uaid.filter(|u| !u.is_empty()) {
            Some(uaid) if validate_uaid(&uaid).is_ok() => uaid,
            Some(bad) => {
                log::warn!("[Push] Invalid UAID {:?} in hello, assigning a new one", bad);
                self.ctx.shards.assign_uaid()
            }
            None => self.ctx.shards.assign_uaid(),
        };

        let mut channels: HashMap<String, Version> = HashMap::new();
        for entry in channel_ids {
            if validate_chid(entry.chid()).is_err() {
                log::warn!("[Push] Skipping invalid channel {:?} in hello for {}", entry.chid(), uaid);
                continue;
            }
            let known = channels.entry(entry.chid().to_string()).or_insert(0);
            *known = (*known).max(entry.version());
        }

        let handle = ConnectionHandle::new(uaid.clone(), channels.clone(), self.commands_tx.clone());
        if let Some(previous) = self.ctx.registry.register(handle.clone()) {
            log::info!(
                "[Push] {} reconnected, evicting connection #{}",
                uaid,
                previous.conn_id()
            );
            previous.evict();
        }
        log::info!(
            "[Push] {} connected as #{} with {} channel(s)",
            uaid,
            handle.conn_id(),
            channels.len()
        );

        self.handle = Some(handle);
        self.state = SessionState::Active;

        self.send(
            sink,
            &ServerMessage::Hello {
                uaid: uaid.clone(),
                status: STATUS_OK,
            },
        )
        .await?;

        self.resync(sink, &uaid, channels).await
    }

    /// Push stored versions the client has not seen yet.
    ///
    /// Covers notifications that were lost while the client was offline or
    /// connected to a node that was unreachable from the update's origin.
    async fn resync(
        &mut self,
        sink: &mut WsSink,
        uaid: &str,
        channels: HashMap<String, Version>,
    ) -> Result<(), CloseReason> {
        let mut channels: Vec<(String, Version)> = channels.into_iter().collect();
        channels.sort();

        for (chid, known) in channels {
            let Ok(key) = primary_key(uaid, &chid) else {
                continue;
            };
            match self.ctx.store.get(&key).await {
                Ok(Some(stored)) if stored > known => {
                    log::debug!("[Push] Re-sync {}/{}: {} -> {}", uaid, chid, known, stored);
                    self.send(sink, &ServerMessage::Notification { chid, version: stored })
                        .await?;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[Push] Re-sync for {} skipped: {}", uaid, e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, sink: &mut WsSink, cmd: Outbound) -> Result<(), CloseReason> {
        match cmd {
            Outbound::Notify { chid, version, done } => {
                if self.state != SessionState::Active {
                    let _ = done.send(Err(DeliveryError::Closed));
                    return Ok(());
                }
                let result = self
                    .send(sink, &ServerMessage::Notification { chid, version })
                    .await;
                let _ = done.send(result.as_ref().map(|_| ()).map_err(|_| DeliveryError::Closed));
                result
            }
        }
    }

    async fn on_tick(&mut self, sink: &mut WsSink) -> Result<(), CloseReason> {
        let settings = self.ctx.settings;
        match self.state {
            SessionState::Handshaking => {
                if self.opened_at.elapsed() >= settings.hello_timeout {
                    return Err(CloseReason::HandshakeTimeout);
                }
                Ok(())
            }
            SessionState::Active => {
                if let Some(sent_at) = self.ping_sent_at {
                    if sent_at.elapsed() >= settings.pong_timeout {
                        return Err(CloseReason::KeepaliveTimeout);
                    }
                } else if self.last_inbound.elapsed() >= settings.ping_interval {
                    self.send(sink, &ServerMessage::Ping).await?;
                    self.ping_sent_at = Some(Instant::now());
                }
                Ok(())
            }
            SessionState::Connecting | SessionState::Closing | SessionState::Closed => Ok(()),
        }
    }

    /// Write one frame and flush it, bounded by the delivery timeout.
    async fn send(&mut self, sink: &mut WsSink, msg: &ServerMessage) -> Result<(), CloseReason> {
        let frame = Message::Text(msg.to_text().into());
        match tokio::time::timeout(self.ctx.settings.delivery_timeout, sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CloseReason::Transport(e.to_string())),
            Err(_) => Err(CloseReason::Transport("write timed out".into())),
        }
    }

    async fn close(
        &mut self,
        sink: &mut WsSink,
        commands_rx: &mut mpsc::Receiver<Outbound>,
        reason: CloseReason,
    ) {
        self.state = SessionState::Closing;
        let who = self.uaid().unwrap_or("<no hello>").to_string();

        match &reason {
            CloseReason::Protocol(e) => log::warn!("[Push] Protocol error from {}: {}", who, e),
            CloseReason::Transport(e) => log::info!("[Push] Transport error for {}: {}", who, e),
            other => log::info!("[Push] Closing {}: {:?}", who, other),
        }

        if let Some((code, text)) = reason.frame() {
            let frame = Message::Close(Some(CloseFrame {
                code,
                reason: text.into(),
            }));
            let _ = tokio::time::timeout(self.ctx.settings.delivery_timeout, sink.send(frame)).await;
        }
        let _ = tokio::time::timeout(self.ctx.settings.delivery_timeout, sink.close()).await;

        if let Some(handle) = &self.handle {
            self.ctx
                .registry
                .unregister_connection(handle.uaid(), handle.conn_id());
        }

        // Anyone still waiting on a delivery learns it will not happen
        commands_rx.close();
        while let Ok(Outbound::Notify { done, .. }) = commands_rx.try_recv() {
            let _ = done.send(Err(DeliveryError::Closed));
        }

        self.state = SessionState::Closed;
        log::debug!("[Push] Session for {} closed", who);
    }
}
