use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::DashMap,
    serde::Serialize,
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use botlink_metrics::{counter, gauge};

use crate::{
    channel::{CloseReason, DuplexChannel},
    error::RelayError,
};

/// A live, authorized worker channel bound to a bot identity.
pub struct Connection {
    bot_name: String,
    channel_id: String,
    channel: Arc<dyn DuplexChannel>,
    connected_at: Instant,
    /// Nanoseconds after `connected_at` of the last inbound activity.
    last_seen: AtomicU64,
}

impl Connection {
    fn new(bot_name: &str, channel: Arc<dyn DuplexChannel>) -> Self {
        Self {
            bot_name: bot_name.to_string(),
            channel_id: channel.id().to_string(),
            channel,
            connected_at: Instant::now(),
            last_seen: AtomicU64::new(0),
        }
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn channel(&self) -> &Arc<dyn DuplexChannel> {
        &self.channel
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_seen(&self) -> Instant {
        self.connected_at + Duration::from_nanos(self.last_seen.load(Ordering::Relaxed))
    }

    pub fn touch(&self) {
        let offset = Instant::now().saturating_duration_since(self.connected_at);
        let nanos = u64::try_from(offset.as_nanos()).unwrap_or(u64::MAX);
        self.last_seen.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }

    fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            bot_name: self.bot_name.clone(),
            channel_id: self.channel_id.clone(),
            connected_for_ms: duration_ms(now.saturating_duration_since(self.connected_at)),
            idle_for_ms: duration_ms(self.idle_for(now)),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Snapshot of a connection for the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub bot_name: String,
    pub channel_id: String,
    pub connected_for_ms: u64,
    pub idle_for_ms: u64,
}

/// Live connections keyed by bot name, at most one per name.
pub struct ConnectionRegistry {
    /// bot_name → Connection
    by_bot: DashMap<String, Arc<Connection>>,
    /// channel_id → bot_name (reverse lookup for cleanup on disconnect)
    by_channel: DashMap<String, String>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_bot: DashMap::new(),
            by_channel: DashMap::new(),
        }
    }

    /// Bind `channel` to `bot_name`. A previous channel for the same name is
    /// closed with [`CloseReason::Replaced`].
    pub async fn accept(&self, bot_name: &str, channel: Arc<dyn DuplexChannel>) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(bot_name, channel));
        self.by_channel
            .insert(conn.channel_id.clone(), bot_name.to_string());
        let previous = self.by_bot.insert(bot_name.to_string(), Arc::clone(&conn));
        self.record_active();

        info!(
            bot = bot_name,
            channel_id = %conn.channel_id,
            "worker connected"
        );

        if let Some(previous) = previous {
            self.by_channel.remove(&previous.channel_id);
            info!(
                bot = bot_name,
                channel_id = %previous.channel_id,
                "replacing previous worker connection"
            );
            if let Err(e) = previous.channel.close(CloseReason::Replaced).await {
                warn!(bot = bot_name, error = %e, "failed to close replaced channel");
            }
            #[cfg(feature = "metrics")]
            counter!(botlink_metrics::connections::REPLACED_TOTAL).increment(1);
        }
        conn
    }

    pub fn lookup(&self, bot_name: &str) -> Result<Arc<Connection>, RelayError> {
        self.by_bot
            .get(bot_name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| RelayError::NotConnected {
                bot: bot_name.to_string(),
            })
    }

    /// Record activity on `channel_id`. Returns false when that channel is no
    /// longer the live connection for `bot_name`.
    pub fn touch(&self, bot_name: &str, channel_id: &str) -> bool {
        match self.by_bot.get(bot_name) {
            Some(conn) if conn.channel_id == channel_id => {
                conn.touch();
                true
            },
            _ => false,
        }
    }

    pub fn remove(&self, bot_name: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.by_bot.remove(bot_name)?;
        self.by_channel.remove(&conn.channel_id);
        self.record_active();
        Some(conn)
    }

    /// Remove the connection carried by `channel_id`, if it is still the live
    /// one for its bot.
    pub fn remove_by_channel(&self, channel_id: &str) -> Option<Arc<Connection>> {
        let (_, bot_name) = self.by_channel.remove(channel_id)?;
        let (_, conn) = self
            .by_bot
            .remove_if(&bot_name, |_, c| c.channel_id == channel_id)?;
        self.record_active();
        debug!(bot = %bot_name, channel_id, "connection removed");
        Some(conn)
    }

    /// Remove and close the connection for `bot_name`.
    pub async fn evict(&self, bot_name: &str, reason: CloseReason) -> Option<Arc<Connection>> {
        let conn = self.remove(bot_name)?;
        close_logged(&conn, reason).await;
        #[cfg(feature = "metrics")]
        counter!(botlink_metrics::connections::EVICTED_TOTAL, "reason" => reason.as_str())
            .increment(1);
        Some(conn)
    }

    /// Close and remove every connection idle for longer than `idle`.
    pub async fn sweep(&self, idle: Duration) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let stale: Vec<(String, String)> = self
            .by_bot
            .iter()
            .filter(|entry| entry.idle_for(now) > idle)
            .map(|entry| (entry.key().clone(), entry.channel_id.clone()))
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for (bot_name, channel_id) in stale {
            // Re-checked under the entry lock: the worker may have spoken or
            // been replaced since the scan.
            let Some((_, conn)) = self.by_bot.remove_if(&bot_name, |_, c| {
                c.channel_id == channel_id && c.idle_for(now) > idle
            }) else {
                continue;
            };
            self.by_channel.remove(&channel_id);
            info!(
                bot = %bot_name,
                channel_id = %channel_id,
                idle_ms = duration_ms(conn.idle_for(now)),
                "evicting idle worker"
            );
            close_logged(&conn, CloseReason::Idle).await;
            #[cfg(feature = "metrics")]
            counter!(botlink_metrics::connections::EVICTED_TOTAL, "reason" => "idle")
                .increment(1);
            evicted.push(conn);
        }
        if !evicted.is_empty() {
            self.record_active();
        }
        evicted
    }

    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let names: Vec<String> = self.by_bot.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for name in names {
            if let Some(conn) = self.remove(&name) {
                close_logged(&conn, reason).await;
                closed += 1;
            }
        }
        closed
    }

    /// Names of the bots with a live connection.
    pub fn bot_names(&self) -> Vec<String> {
        self.by_bot.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut out: Vec<_> = self.by_bot.iter().map(|e| e.info(now)).collect();
        out.sort_by(|a, b| a.bot_name.cmp(&b.bot_name));
        out
    }

    pub fn len(&self) -> usize {
        self.by_bot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_bot.is_empty()
    }

    fn record_active(&self) {
        #[cfg(feature = "metrics")]
        gauge!(botlink_metrics::connections::ACTIVE).set(self.by_bot.len() as f64);
    }
}

async fn close_logged(conn: &Connection, reason: CloseReason) {
    if let Err(e) = conn.channel.close(reason).await {
        warn!(
            bot = %conn.bot_name,
            channel_id = %conn.channel_id,
            reason = reason.as_str(),
            error = %e,
            "failed to close worker channel"
        );
    }
}
