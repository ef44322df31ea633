//! Duplex channel capability used by the relay core.
//!
//! The registry and relay only ever talk to a worker through
//! [`DuplexChannel`]; inbound traffic reaches them as an [`InboundStream`]
//! that ends when the channel closes. The WebSocket transport lives in
//! [`crate::ws`]; [`LocalChannel`] is an in-process transport for embedding
//! workers in the same binary and for tests.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    botlink_protocol::Frame,
    futures::{StreamExt, stream::BoxStream},
    serde_json::Value,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Why the gateway closed a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer authorized connection took over the identity.
    Replaced,
    /// No inbound activity within the idle threshold.
    Idle,
    /// The identity was removed from the repository.
    Deregistered,
    /// Handshake rejected.
    Unauthorized,
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the worker.
    pub fn code(self) -> u16 {
        match self {
            Self::Shutdown => 1001,
            Self::Unauthorized => 1008,
            Self::Replaced => 4000,
            Self::Idle => 4001,
            Self::Deregistered => 4002,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Idle => "idle",
            Self::Deregistered => "deregistered",
            Self::Unauthorized => "unauthorized",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Something arriving from the worker side of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Frame(Frame),
    /// A text frame that did not parse; still counts as liveness.
    Malformed(String),
    /// Transport-level liveness (WebSocket ping/pong).
    Activity,
}

/// Inbound events of one channel. The stream ending means the channel closed.
pub type InboundStream = BoxStream<'static, InboundEvent>;

/// Outbound half of a worker connection.
///
/// Implementations deliver frames in the order `send` is called and never
/// interleave two frames; concurrent senders are queued.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    /// Unique id of this channel instance.
    fn id(&self) -> &str;

    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Tell the worker its handshake was accepted. Transports without an
    /// explicit acknowledgement keep the default.
    async fn acknowledge(&self, _bot_name: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Close the channel. Closing twice is a no-op.
    async fn close(&self, reason: CloseReason) -> Result<(), ChannelError>;

    fn is_closed(&self) -> bool;
}

// ── In-process channel ───────────────────────────────────────────────────────

/// Gateway side of an in-process channel.
pub struct LocalChannel {
    id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    close_reason: std::sync::Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

/// Worker side of an in-process channel.
pub struct LocalPeer {
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    channel: Arc<LocalChannel>,
}

impl LocalChannel {
    /// Create a connected pair: the channel handed to the relay, the peer
    /// acting as the worker, and the inbound stream for
    /// [`RelayService::establish_connection`](crate::relay::RelayService::establish_connection).
    pub fn pair(id: impl Into<String>) -> (Arc<Self>, LocalPeer, InboundStream) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let channel = Arc::new(Self {
            id: id.into(),
            outbound: out_tx,
            closed: AtomicBool::new(false),
            close_reason: std::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        let inbound = futures::stream::unfold((in_rx, cancel), |(mut rx, cancel)| async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                event = rx.recv() => event.map(|event| (event, (rx, cancel))),
            }
        })
        .boxed();

        let peer = LocalPeer {
            outbound: out_rx,
            inbound: in_tx,
            channel: Arc::clone(&channel),
        };
        (channel, peer, inbound)
    }

    /// Reason passed to the first `close` call, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|r| *r)
    }
}

#[async_trait]
impl DuplexChannel for LocalChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }

    async fn close(&self, reason: CloseReason) -> Result<(), ChannelError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(mut slot) = self.close_reason.lock() {
                *slot = Some(reason);
            }
            self.cancel.cancel();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LocalPeer {
    /// Next frame sent by the gateway, or `None` once the channel is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.outbound.recv() => frame,
            () = self.channel.cancel.cancelled() => self.outbound.try_recv().ok(),
        }
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.inbound.send(InboundEvent::Frame(frame)).is_ok()
    }

    pub fn reply(&self, correlation_id: &str, payload: Value) -> bool {
        self.send(Frame::reply(correlation_id, payload))
    }

    pub fn ping(&self) -> bool {
        self.send(Frame::ping())
    }

    pub fn send_raw(&self, event: InboundEvent) -> bool {
        self.inbound.send(event).is_ok()
    }

    /// The gateway-side handle of this pair.
    pub fn channel(&self) -> &Arc<LocalChannel> {
        &self.channel
    }

    /// Drop the worker side, ending the inbound stream.
    pub fn disconnect(self) {}
}
