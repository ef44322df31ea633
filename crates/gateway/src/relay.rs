//! Request/reply relay between HTTP callers and connected bot workers.
//!
//! Every dispatch registers a pending entry keyed by a fresh correlation id,
//! sends an `event` frame down the worker's channel and waits on a oneshot
//! slot. The slot is filled by exactly one of: the matching `reply` frame,
//! the loss of the channel that carried the event, or the timeout.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    botlink_bots::{BotRepository, RepositoryError},
    botlink_config::RelayConfig,
    botlink_protocol::{Frame, Handshake},
    dashmap::DashMap,
    futures::StreamExt,
    serde::Serialize,
    serde_json::Value,
    tokio::{sync::oneshot, task::JoinHandle, time::Instant},
    tracing::{debug, error, info, trace, warn},
};

#[cfg(feature = "metrics")]
use botlink_metrics::{counter, gauge, histogram};

use crate::{
    channel::{CloseReason, DuplexChannel, InboundEvent, InboundStream},
    connections::{Connection, ConnectionRegistry},
    error::RelayError,
};

/// Timing knobs of the relay, resolved from [`RelayConfig`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub response_timeout: Duration,
    pub keep_duration: Duration,
    pub idle_timeout: Duration,
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            response_timeout: config.bot_response_timeout(),
            keep_duration: config.bot_keep_duration(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

enum Completion {
    Reply(Value),
    ConnectionLost,
}

struct PendingRequest {
    bot_name: String,
    /// Channel that carried the event; its loss fails this request.
    channel_id: String,
    slot: oneshot::Sender<Completion>,
}

/// Removes the pending entry when a dispatch finishes or is cancelled.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
        #[cfg(feature = "metrics")]
        gauge!(botlink_metrics::relay::PENDING_REQUESTS).set(self.pending.len() as f64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Replied,
    Timeout,
    ConnectionLost,
}

impl RequestOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

/// Diagnostic record of a finished dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub correlation_id: String,
    pub bot_name: String,
    pub submitted_at: u64,
    pub finished_at: u64,
    pub duration_ms: u64,
    pub outcome: RequestOutcome,
}

struct FinishedRequest {
    record: RequestRecord,
    finished: Instant,
}

/// What one [`RelayService::maintain`] pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub idle_evicted: usize,
    pub orphans_evicted: usize,
    pub records_purged: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct RelayService {
    bots: Arc<BotRepository>,
    registry: ConnectionRegistry,
    pending: DashMap<String, PendingRequest>,
    finished: DashMap<String, FinishedRequest>,
    settings: RelaySettings,
}

impl RelayService {
    pub fn new(bots: Arc<BotRepository>, settings: RelaySettings) -> Self {
        Self {
            bots,
            registry: ConnectionRegistry::new(),
            pending: DashMap::new(),
            finished: DashMap::new(),
            settings,
        }
    }

    pub fn bots(&self) -> &Arc<BotRepository> {
        &self.bots
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Verify a worker handshake and bind its channel to the identity.
    ///
    /// A rejected channel is never registered; closing it is up to the
    /// transport.
    pub async fn authorize_connection(
        &self,
        channel: Arc<dyn DuplexChannel>,
        handshake: &Handshake,
    ) -> Result<Arc<Connection>, RelayError> {
        let bot = handshake.identity_name.as_str();
        if !self.bots.verify(bot, &handshake.secret).await {
            warn!(bot, channel_id = channel.id(), "worker handshake rejected");
            #[cfg(feature = "metrics")]
            counter!(botlink_metrics::connections::AUTHORIZATIONS_TOTAL, "result" => "rejected")
                .increment(1);
            return Err(RelayError::Unauthorized {
                bot: bot.to_string(),
            });
        }

        // Hello goes out before the channel becomes reachable for dispatch.
        if let Err(e) = channel.acknowledge(bot).await {
            warn!(bot, error = %e, "failed to acknowledge worker handshake");
            return Err(RelayError::ConnectionLost {
                bot: bot.to_string(),
            });
        }

        #[cfg(feature = "metrics")]
        counter!(botlink_metrics::connections::AUTHORIZATIONS_TOTAL, "result" => "accepted")
            .increment(1);
        Ok(self.registry.accept(bot, channel).await)
    }

    /// Start consuming `inbound` for an authorized connection.
    ///
    /// The returned task finishes once the channel has closed and every
    /// request pinned to it has been failed.
    pub fn establish_connection(
        self: &Arc<Self>,
        conn: Arc<Connection>,
        inbound: InboundStream,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let reader = tokio::spawn(Arc::clone(&relay).read_loop(Arc::clone(&conn), inbound));
            if let Err(e) = reader.await
                && e.is_panic()
            {
                error!(
                    bot = conn.bot_name(),
                    channel_id = conn.channel_id(),
                    "worker reader task panicked"
                );
            }
            relay.connection_closed(&conn).await;
        })
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>, mut inbound: InboundStream) {
        let bot = conn.bot_name();
        let channel_id = conn.channel_id();
        while let Some(event) = inbound.next().await {
            self.registry.touch(bot, channel_id);
            match event {
                InboundEvent::Frame(Frame::Reply {
                    correlation_id,
                    payload,
                }) => {
                    self.resolve(bot, &correlation_id, payload);
                },
                InboundEvent::Frame(Frame::Ping { .. }) | InboundEvent::Activity => {
                    trace!(bot, channel_id, "worker heartbeat");
                },
                InboundEvent::Frame(Frame::Event { correlation_id, .. }) => {
                    debug!(bot, channel_id, %correlation_id, "ignoring event frame from worker");
                },
                InboundEvent::Malformed(reason) => {
                    warn!(bot, channel_id, %reason, "malformed frame from worker");
                },
            }
        }
    }

    async fn connection_closed(&self, conn: &Connection) {
        let removed = self.registry.remove_by_channel(conn.channel_id()).is_some();
        let failed = self.fail_pending_for_channel(conn.channel_id());
        // Releases the transport writer when the worker hung up first.
        if !conn.channel().is_closed()
            && let Err(e) = conn.channel().close(CloseReason::Shutdown).await
        {
            debug!(channel_id = conn.channel_id(), error = %e, "close after disconnect failed");
        }
        info!(
            bot = conn.bot_name(),
            channel_id = conn.channel_id(),
            removed,
            failed_requests = failed,
            "worker disconnected"
        );
    }

    /// Fail every pending request whose event went out on `channel_id`.
    pub fn fail_pending_for_channel(&self, channel_id: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.channel_id == channel_id)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, req)) = self.pending.remove_if(&id, |_, p| p.channel_id == channel_id)
            {
                let _ = req.slot.send(Completion::ConnectionLost);
                failed += 1;
            }
        }
        failed
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Send `payload` to the worker for `bot_name` and wait for its reply.
    ///
    /// `timeout` defaults to the configured bot response timeout.
    pub async fn dispatch(
        &self,
        bot_name: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RelayError> {
        let conn = self.registry.lookup(bot_name).inspect_err(|_| {
            #[cfg(feature = "metrics")]
            counter!(botlink_metrics::relay::DISPATCH_TOTAL, "outcome" => "not_connected")
                .increment(1);
        })?;
        let timeout = timeout.unwrap_or(self.settings.response_timeout);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let submitted_at = Instant::now();
        let submitted_ms = now_ms();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), PendingRequest {
            bot_name: bot_name.to_string(),
            channel_id: conn.channel_id().to_string(),
            slot: tx,
        });
        let guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };
        #[cfg(feature = "metrics")]
        gauge!(botlink_metrics::relay::PENDING_REQUESTS).set(self.pending.len() as f64);

        debug!(
            bot = bot_name,
            channel_id = conn.channel_id(),
            %correlation_id,
            timeout_ms = timeout.as_millis() as u64,
            "dispatching event"
        );

        let result = match conn
            .channel()
            .send(Frame::event(&correlation_id, payload))
            .await
        {
            Err(e) => {
                warn!(bot = bot_name, %correlation_id, error = %e, "failed to send event");
                Err(RelayError::ConnectionLost {
                    bot: bot_name.to_string(),
                })
            },
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Completion::Reply(value))) => Ok(value),
                Ok(Ok(Completion::ConnectionLost)) | Ok(Err(_)) => {
                    Err(RelayError::ConnectionLost {
                        bot: bot_name.to_string(),
                    })
                },
                Err(_) => Err(RelayError::Timeout {
                    bot: bot_name.to_string(),
                    timeout,
                }),
            },
        };
        drop(guard);

        let outcome = match &result {
            Ok(_) => RequestOutcome::Replied,
            Err(RelayError::Timeout { .. }) => RequestOutcome::Timeout,
            Err(_) => RequestOutcome::ConnectionLost,
        };
        let elapsed = submitted_at.elapsed();
        match outcome {
            RequestOutcome::Replied => {
                debug!(bot = bot_name, %correlation_id, elapsed_ms = elapsed.as_millis() as u64, "reply relayed");
            },
            _ => {
                info!(bot = bot_name, %correlation_id, outcome = outcome.as_str(), "dispatch failed");
            },
        }
        #[cfg(feature = "metrics")]
        {
            counter!(botlink_metrics::relay::DISPATCH_TOTAL, "outcome" => outcome.as_str())
                .increment(1);
            histogram!(botlink_metrics::relay::DISPATCH_DURATION_SECONDS)
                .record(elapsed.as_secs_f64());
        }
        self.record(RequestRecord {
            correlation_id,
            bot_name: bot_name.to_string(),
            submitted_at: submitted_ms,
            finished_at: now_ms(),
            duration_ms: elapsed.as_millis() as u64,
            outcome,
        });
        result
    }

    /// Complete the pending request `correlation_id` with `payload`.
    ///
    /// Replies for unknown, finished or foreign requests are dropped and
    /// return false.
    pub fn resolve(&self, bot_name: &str, correlation_id: &str, payload: Value) -> bool {
        match self
            .pending
            .remove_if(correlation_id, |_, p| p.bot_name == bot_name)
        {
            Some((_, req)) => {
                if req.slot.send(Completion::Reply(payload)).is_err() {
                    debug!(bot = bot_name, correlation_id, "reply arrived after waiter left");
                    return false;
                }
                true
            },
            None => {
                debug!(bot = bot_name, correlation_id, "dropping unmatched reply");
                #[cfg(feature = "metrics")]
                counter!(botlink_metrics::relay::REPLIES_DROPPED_TOTAL).increment(1);
                false
            },
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn record(&self, record: RequestRecord) {
        if self.settings.keep_duration.is_zero() {
            return;
        }
        self.finished.insert(record.correlation_id.clone(), FinishedRequest {
            record,
            finished: Instant::now(),
        });
    }

    /// Diagnostic records still within the keep duration, newest first.
    pub fn recent_requests(&self) -> Vec<RequestRecord> {
        let mut out: Vec<_> = self.finished.iter().map(|e| e.record.clone()).collect();
        out.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        out
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Remove an identity and disconnect its worker.
    pub async fn deregister_bot(&self, name: &str) -> Result<(), RepositoryError> {
        self.bots.remove(name).await?;
        self.registry.evict(name, CloseReason::Deregistered).await;
        Ok(())
    }

    /// Periodic housekeeping: idle eviction, orphan eviction and purging of
    /// expired diagnostic records.
    pub async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            idle_evicted: self.registry.sweep(self.settings.idle_timeout).await.len(),
            ..Default::default()
        };

        for name in self.registry.bot_names() {
            match self.bots.find(&name).await {
                Err(RepositoryError::NotFound(_)) => {
                    info!(bot = %name, "evicting worker whose identity was removed");
                    if self
                        .registry
                        .evict(&name, CloseReason::Deregistered)
                        .await
                        .is_some()
                    {
                        report.orphans_evicted += 1;
                    }
                },
                Err(e) => warn!(bot = %name, error = %e, "identity lookup failed during sweep"),
                Ok(_) => {},
            }
        }

        let now = Instant::now();
        let keep = self.settings.keep_duration;
        let before = self.finished.len();
        self.finished
            .retain(|_, f| now.saturating_duration_since(f.finished) < keep);
        report.records_purged = before.saturating_sub(self.finished.len());

        if report != MaintenanceReport::default() {
            debug!(?report, "maintenance pass");
        }
        report
    }

    /// Close every connection and fail all outstanding requests.
    pub async fn shutdown(&self) {
        let closed = self.registry.close_all(CloseReason::Shutdown).await;
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, req)) = self.pending.remove(&id) {
                let _ = req.slot.send(Completion::ConnectionLost);
            }
        }
        info!(connections = closed, "relay shut down");
    }
}
