//! WebSocket transport for bot workers.
//!
//! Each socket is split into a writer task fed by an unbounded queue and an
//! inbound stream handed to the relay once the handshake is verified.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    botlink_protocol::{
        ErrorShape, Frame, Handshake, HandshakeReply, PROTOCOL_VERSION, error_codes,
    },
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::{sync::mpsc, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    channel::{ChannelError, CloseReason, DuplexChannel, InboundEvent, InboundStream},
    relay::RelayService,
};

enum Outbound {
    Text(String),
    Close(CloseReason),
}

/// Gateway side of a worker WebSocket.
///
/// The outbound queue is unbounded. A worker that stops reading is bounded
/// by idle eviction, which closes the channel and drops the queue.
pub struct WsChannel {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl WsChannel {
    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }

    fn send_handshake_reply(&self, reply: &HandshakeReply) -> Result<(), ChannelError> {
        let text = serde_json::to_string(reply).map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.send_text(text)
    }
}

#[async_trait]
impl DuplexChannel for WsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let text = frame
            .to_json()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.send_text(text)
    }

    async fn acknowledge(&self, bot_name: &str) -> Result<(), ChannelError> {
        self.send_handshake_reply(&HandshakeReply::Hello {
            bot_name: bot_name.to_string(),
            channel_id: self.id.clone(),
            protocol: PROTOCOL_VERSION,
        })
    }

    async fn close(&self, reason: CloseReason) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.tx
            .send(Outbound::Close(reason))
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Text(text) => {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            },
            Outbound::Close(reason) => {
                let frame = CloseFrame {
                    code: reason.code(),
                    reason: reason.as_str().into(),
                };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            },
        }
    }
    let _ = sender.close().await;
}

fn parse_inbound(raw: &str) -> InboundEvent {
    match Frame::parse(raw) {
        Ok(frame) => InboundEvent::Frame(frame),
        Err(e) => InboundEvent::Malformed(e.to_string()),
    }
}

fn inbound_stream(receiver: SplitStream<WebSocket>, cancel: CancellationToken) -> InboundStream {
    futures::stream::unfold(receiver, |mut rx| async move {
        let event = match rx.next().await {
            Some(Ok(Message::Text(text))) => parse_inbound(text.as_str()),
            Some(Ok(Message::Binary(_))) => {
                InboundEvent::Malformed("binary frames are not supported".to_string())
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => InboundEvent::Activity,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                debug!(error = %e, "worker socket error");
                return None;
            },
        };
        Some((event, rx))
    })
    .take_until(cancel.cancelled_owned())
    .boxed()
}

#[derive(Debug)]
enum HandshakeFailure {
    /// Socket went away before a handshake arrived.
    Closed,
    Timeout,
    Invalid(String),
}

async fn recv_handshake(
    receiver: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Result<Handshake, HandshakeFailure> {
    let deadline = Instant::now() + timeout;
    loop {
        let msg = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Err(_) => return Err(HandshakeFailure::Timeout),
            Ok(None | Some(Err(_))) => return Err(HandshakeFailure::Closed),
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Text(text) => {
                return Handshake::parse(text.as_str())
                    .map_err(|e| HandshakeFailure::Invalid(e.to_string()));
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                return Err(HandshakeFailure::Invalid(
                    "handshake must be a text frame".to_string(),
                ));
            },
            Message::Close(_) => return Err(HandshakeFailure::Closed),
        }
    }
}

async fn reject(channel: &WsChannel, code: &str, message: impl Into<String>) {
    let reply = HandshakeReply::Error {
        error: ErrorShape::new(code, message),
    };
    if let Err(e) = channel.send_handshake_reply(&reply) {
        debug!(channel_id = %channel.id, error = %e, "could not send handshake error");
    }
    let _ = channel.close(CloseReason::Unauthorized).await;
}

/// Drive one worker socket from handshake to close.
pub async fn handle_worker_socket(
    socket: WebSocket,
    relay: Arc<RelayService>,
    handshake_timeout: Duration,
    remote_addr: SocketAddr,
) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let write_task = tokio::spawn(write_loop(sender, rx));

    let channel_id = uuid::Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    let channel = Arc::new(WsChannel {
        id: channel_id.clone(),
        tx,
        closed: AtomicBool::new(false),
        cancel: cancel.clone(),
    });
    debug!(channel_id = %channel_id, remote = %remote_addr, "worker socket opened");

    match recv_handshake(&mut receiver, handshake_timeout).await {
        Ok(handshake) => {
            match relay
                .authorize_connection(channel.clone(), &handshake)
                .await
            {
                Ok(conn) => {
                    info!(
                        bot = %handshake.identity_name,
                        channel_id = %channel_id,
                        remote = %remote_addr,
                        "worker authorized"
                    );
                    let reader = relay.establish_connection(conn, inbound_stream(receiver, cancel));
                    let _ = reader.await;
                },
                Err(e) => reject(&channel, e.code(), e.to_string()).await,
            }
        },
        Err(HandshakeFailure::Closed) => {
            debug!(channel_id = %channel_id, "worker left before handshake");
            let _ = channel.close(CloseReason::Shutdown).await;
        },
        Err(HandshakeFailure::Timeout) => {
            warn!(channel_id = %channel_id, remote = %remote_addr, "worker handshake timed out");
            reject(&channel, error_codes::INVALID_REQUEST, "handshake timeout").await;
        },
        Err(HandshakeFailure::Invalid(reason)) => {
            warn!(channel_id = %channel_id, remote = %remote_addr, %reason, "invalid worker handshake");
            reject(
                &channel,
                error_codes::INVALID_REQUEST,
                format!("invalid handshake: {reason}"),
            )
            .await;
        },
    }

    drop(channel);
    let _ = write_task.await;
    debug!(channel_id = %channel_id, "worker socket closed");
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn text_frames_parse_or_report_malformed() {
        assert_eq!(
            parse_inbound(r#"{"type":"reply","correlationId":"1","payload":{"a":1}}"#),
            InboundEvent::Frame(Frame::reply("1", json!({"a": 1})))
        );
        assert!(matches!(
            parse_inbound("not json"),
            InboundEvent::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn close_is_queued_once_after_pending_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = WsChannel {
            id: "c1".into(),
            tx,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        channel.send(Frame::ping()).await.unwrap();
        channel.close(CloseReason::Idle).await.unwrap();
        channel.close(CloseReason::Replaced).await.unwrap();
        assert!(channel.send(Frame::ping()).await.is_err());

        assert!(matches!(rx.recv().await, Some(Outbound::Text(t)) if t == r#"{"type":"ping"}"#));
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Close(CloseReason::Idle))
        ));
        drop(channel);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn acknowledge_sends_hello() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = WsChannel {
            id: "c1".into(),
            tx,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        channel.acknowledge("echo-bot").await.unwrap();
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected hello text");
        };
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["botName"], "echo-bot");
        assert_eq!(v["channelId"], "c1");
    }
}
