//! Connection state manager: registry, heartbeat sweep and stale-connection sweep.
//!
//! All record mutation happens under one `RwLock`. State-change and heartbeat
//! notifications are collected while the lock is held and dispatched after it
//! is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::connection::record::{ConnectionRecord, ConnectionState};
use crate::error::ConnectionError;
use crate::listeners::{ConnectionStateListener, HeartbeatListener, dispatch};

struct StateChange {
    session_id: String,
    from: ConnectionState,
    to: ConnectionState,
}

#[derive(Default)]
struct Counters {
    total_connections: u64,
    failed_connections: u64,
    total_messages: u64,
    total_errors: u64,
    last_cleanup_time: Option<DateTime<Utc>>,
    start_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    shutdown: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

/// Connection manager statistics. Diagnostic only.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatistics {
    pub is_running: bool,
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub total_messages: u64,
    pub total_errors: u64,
    pub last_cleanup_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub current_connections: usize,
    pub state_distribution: HashMap<String, usize>,
    pub average_errors_per_connection: f64,
    pub average_messages_per_connection: f64,
    pub config: ConnectionConfig,
}

struct ManagerInner {
    config: ConnectionConfig,
    connections: RwLock<HashMap<String, ConnectionRecord>>,
    state_listeners: StdRwLock<Vec<ConnectionStateListener>>,
    heartbeat_listeners: StdRwLock<Vec<HeartbeatListener>>,
    counters: StdMutex<Counters>,
    lifecycle: StdMutex<Lifecycle>,
}

impl ManagerInner {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, changes: Vec<StateChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners = self
            .state_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for change in changes {
            dispatch("connection state", &change.session_id, &listeners, |l| {
                l(&change.session_id, change.from, change.to)
            });
        }
    }

    fn notify_heartbeat(&self, session_id: &str) {
        let listeners = self
            .heartbeat_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        dispatch("heartbeat", session_id, &listeners, |l| l(session_id));
    }

    /// Move a timed-out session to ERROR, then to RECONNECTING or out of the registry.
    fn expire(
        &self,
        connections: &mut HashMap<String, ConnectionRecord>,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateChange>, ConnectionError> {
        let not_found = || ConnectionError::NotFound {
            session_id: session_id.to_string(),
        };
        let mut changes = Vec::new();

        let record = connections.get_mut(session_id).ok_or_else(not_found)?;
        if let Some(from) = record.apply_state(ConnectionState::Error, now) {
            changes.push(StateChange {
                session_id: session_id.to_string(),
                from,
                to: ConnectionState::Error,
            });
        }

        if self.config.enable_auto_reconnect
            && record.reconnect_attempts < self.config.max_reconnect_attempts
        {
            if let Some(from) = record.apply_state(ConnectionState::Reconnecting, now) {
                changes.push(StateChange {
                    session_id: session_id.to_string(),
                    from,
                    to: ConnectionState::Reconnecting,
                });
            }
            tracing::info!(
                session_id = %session_id,
                attempt = record.reconnect_attempts,
                "Connection timed out, reconnecting"
            );
        } else {
            let removed = connections.remove(session_id).ok_or_else(not_found)?;
            changes.push(StateChange {
                session_id: session_id.to_string(),
                from: removed.state,
                to: ConnectionState::Disconnected,
            });
            tracing::warn!(
                session_id = %session_id,
                attempts = removed.reconnect_attempts,
                "Connection timed out with no reconnects left, unregistered"
            );
        }

        Ok(changes)
    }

    async fn check_heartbeats_at(&self, now: DateTime<Utc>) -> usize {
        let mut changes = Vec::new();
        let timed_out = {
            let mut connections = self.connections.write().await;
            let timed_out: Vec<String> = connections
                .values()
                .filter(|r| r.is_connected())
                .filter(|r| {
                    r.idle_for(now)
                        .is_some_and(|idle| idle > self.config.connection_timeout)
                })
                .map(|r| r.session_id.clone())
                .collect();

            for session_id in &timed_out {
                match self.expire(&mut connections, session_id, now) {
                    Ok(mut expired) => changes.append(&mut expired),
                    Err(e) => {
                        tracing::error!(
                            session_id = %session_id,
                            error = %e,
                            "Failed to process timed-out connection, forcing unregister"
                        );
                        if let Some(record) = connections.remove(session_id) {
                            changes.push(StateChange {
                                session_id: session_id.clone(),
                                from: record.state,
                                to: ConnectionState::Disconnected,
                            });
                        }
                    }
                }
            }
            timed_out.len()
        };

        self.notify(changes);
        timed_out
    }

    async fn cleanup_stale_connections_at(&self, now: DateTime<Utc>) -> usize {
        let removed: Vec<StateChange> = {
            let mut connections = self.connections.write().await;
            let stale: Vec<String> = connections
                .values()
                .filter(|r| {
                    r.idle_for(now)
                        .is_some_and(|idle| idle > self.config.connection_timeout)
                })
                .map(|r| r.session_id.clone())
                .collect();

            stale
                .into_iter()
                .filter_map(|session_id| {
                    let record = connections.remove(&session_id)?;
                    tracing::info!(
                        session_id = %session_id,
                        state = %record.state,
                        "Stale connection cleaned up"
                    );
                    Some(StateChange {
                        session_id,
                        from: record.state,
                        to: ConnectionState::Disconnected,
                    })
                })
                .collect()
        };

        let count = removed.len();
        if count > 0 {
            let mut counters = self.counters();
            counters.failed_connections += count as u64;
            counters.last_cleanup_time = Some(Utc::now());
            drop(counters);
            tracing::info!(count, "Cleaned up stale connections");
        }
        self.notify(removed);
        count
    }
}

/// Tracks liveness of long-lived duplex sessions.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ConnectionStateManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionStateManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connections: RwLock::new(HashMap::new()),
                state_listeners: StdRwLock::new(Vec::new()),
                heartbeat_listeners: StdRwLock::new(Vec::new()),
                counters: StdMutex::new(Counters::default()),
                lifecycle: StdMutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle().started
    }

    /// Register a session in CONNECTING. Returns `false` if it already exists.
    pub async fn register_connection(&self, session_id: &str) -> bool {
        {
            let mut connections = self.inner.connections.write().await;
            if connections.contains_key(session_id) {
                tracing::warn!(session_id = %session_id, "Connection already registered");
                return false;
            }
            connections.insert(
                session_id.to_string(),
                ConnectionRecord::new(session_id, Utc::now()),
            );
        }
        self.inner.counters().total_connections += 1;
        tracing::info!(session_id = %session_id, "Connection registered");

        self.inner.notify(vec![StateChange {
            session_id: session_id.to_string(),
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connecting,
        }]);
        true
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub async fn unregister_connection(&self, session_id: &str) -> bool {
        let Some(record) = self.inner.connections.write().await.remove(session_id) else {
            tracing::warn!(session_id = %session_id, "Connection not found");
            return false;
        };
        tracing::info!(session_id = %session_id, "Connection unregistered");

        self.inner.notify(vec![StateChange {
            session_id: session_id.to_string(),
            from: record.state,
            to: ConnectionState::Disconnected,
        }]);
        true
    }

    /// Copy of the session's record.
    pub async fn get_connection_state(&self, session_id: &str) -> Option<ConnectionRecord> {
        self.inner.connections.read().await.get(session_id).cloned()
    }

    /// Set the session's state. Setting the current state is a no-op that
    /// still reports `true`.
    pub async fn set_connection_state(&self, session_id: &str, state: ConnectionState) -> bool {
        let changed = {
            let mut connections = self.inner.connections.write().await;
            let Some(record) = connections.get_mut(session_id) else {
                tracing::warn!(session_id = %session_id, "Connection not found");
                return false;
            };
            record.apply_state(state, Utc::now())
        };

        if let Some(from) = changed {
            tracing::info!(session_id = %session_id, from = %from, to = %state, "Connection state changed");
            self.inner.notify(vec![StateChange {
                session_id: session_id.to_string(),
                from,
                to: state,
            }]);
        }
        true
    }

    pub async fn update_heartbeat(&self, session_id: &str) -> bool {
        {
            let mut connections = self.inner.connections.write().await;
            let Some(record) = connections.get_mut(session_id) else {
                tracing::warn!(session_id = %session_id, "Connection not found");
                return false;
            };
            record.record_heartbeat(Utc::now());
        }
        tracing::debug!(session_id = %session_id, "Heartbeat");
        self.inner.notify_heartbeat(session_id);
        true
    }

    pub async fn increment_message_count(&self, session_id: &str) -> bool {
        {
            let mut connections = self.inner.connections.write().await;
            let Some(record) = connections.get_mut(session_id) else {
                tracing::warn!(session_id = %session_id, "Connection not found");
                return false;
            };
            record.record_message();
        }
        self.inner.counters().total_messages += 1;
        true
    }

    /// Count an error on the session. More than five errors force ERROR.
    pub async fn increment_error_count(&self, session_id: &str, error: Option<&str>) -> bool {
        let changed = {
            let mut connections = self.inner.connections.write().await;
            let Some(record) = connections.get_mut(session_id) else {
                tracing::warn!(session_id = %session_id, "Connection not found");
                return false;
            };
            if record.record_error(error) {
                record.apply_state(ConnectionState::Error, Utc::now())
            } else {
                None
            }
        };
        self.inner.counters().total_errors += 1;

        if let Some(from) = changed {
            tracing::warn!(session_id = %session_id, "Too many errors, connection marked as error");
            self.inner.notify(vec![StateChange {
                session_id: session_id.to_string(),
                from,
                to: ConnectionState::Error,
            }]);
        }
        true
    }

    pub async fn set_metadata(&self, session_id: &str, key: &str, value: serde_json::Value) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(session_id) {
            Some(record) => {
                record.metadata.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Session ids, sorted, optionally filtered by state.
    pub async fn list_connections(&self, state: Option<ConnectionState>) -> Vec<String> {
        let connections = self.inner.connections.read().await;
        let mut ids: Vec<String> = connections
            .values()
            .filter(|r| state.is_none_or(|s| r.state == s))
            .map(|r| r.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn get_healthy_connections(&self) -> Vec<String> {
        self.get_healthy_connections_at(Utc::now()).await
    }

    pub async fn get_healthy_connections_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let connections = self.inner.connections.read().await;
        let mut ids: Vec<String> = connections
            .values()
            .filter(|r| r.is_healthy_at(now))
            .map(|r| r.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run the heartbeat sweep now. Returns the number of timed-out sessions.
    pub async fn check_heartbeats(&self) -> usize {
        self.inner.check_heartbeats_at(Utc::now()).await
    }

    /// Heartbeat sweep against an explicit clock.
    pub async fn check_heartbeats_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.check_heartbeats_at(now).await
    }

    /// Evict every session idle past the connection timeout, in any state.
    pub async fn cleanup_stale_connections(&self) -> usize {
        self.inner.cleanup_stale_connections_at(Utc::now()).await
    }

    pub async fn cleanup_stale_connections_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.cleanup_stale_connections_at(now).await
    }

    pub fn add_state_change_listener(&self, listener: ConnectionStateListener) {
        self.inner
            .state_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn add_heartbeat_listener(&self, listener: HeartbeatListener) {
        self.inner
            .heartbeat_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Start the heartbeat and cleanup sweeps. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.started {
            tracing::warn!("Connection manager already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let heartbeat = spawn_sweep(
            "heartbeat",
            self.inner.config.heartbeat_interval,
            shutdown.clone(),
            {
                let inner = self.inner.clone();
                move || {
                    let inner = inner.clone();
                    async move {
                        inner.check_heartbeats_at(Utc::now()).await;
                    }
                }
            },
        );
        let cleanup = spawn_sweep(
            "cleanup",
            self.inner.config.cleanup_interval(),
            shutdown.clone(),
            {
                let inner = self.inner.clone();
                move || {
                    let inner = inner.clone();
                    async move {
                        inner.cleanup_stale_connections_at(Utc::now()).await;
                    }
                }
            },
        );

        lifecycle.loops = vec![heartbeat, cleanup];
        lifecycle.shutdown = Some(shutdown);
        lifecycle.started = true;
        drop(lifecycle);

        self.inner.counters().start_time = Some(Utc::now());
        tracing::info!(
            heartbeat_interval_secs = self.inner.config.heartbeat_interval.as_secs(),
            connection_timeout_secs = self.inner.config.connection_timeout.as_secs(),
            "Connection manager started"
        );
    }

    /// Stop the sweeps and unregister every remaining session.
    pub async fn stop(&self) {
        let (shutdown, loops) = {
            let mut lifecycle = self.inner.lifecycle();
            if !lifecycle.started {
                tracing::warn!("Connection manager is not running");
                return;
            }
            lifecycle.started = false;
            (
                lifecycle.shutdown.take(),
                std::mem::take(&mut lifecycle.loops),
            )
        };

        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Connection sweep ended abnormally");
            }
        }

        for session_id in self.list_connections(None).await {
            self.unregister_connection(&session_id).await;
        }
        tracing::info!("Connection manager stopped");
    }

    pub async fn get_statistics(&self) -> ConnectionStatistics {
        let (current, distribution, errors, messages) = {
            let connections = self.inner.connections.read().await;
            let mut distribution: HashMap<String, usize> = HashMap::new();
            let mut errors = 0u64;
            let mut messages = 0u64;
            for record in connections.values() {
                *distribution.entry(record.state.to_string()).or_default() += 1;
                errors += u64::from(record.error_count);
                messages += record.message_count;
            }
            (connections.len(), distribution, errors, messages)
        };

        let per_connection = |total: u64| {
            if current > 0 {
                total as f64 / current as f64
            } else {
                0.0
            }
        };

        let counters = self.inner.counters();
        ConnectionStatistics {
            is_running: self.inner.lifecycle().started,
            total_connections: counters.total_connections,
            active_connections: current,
            failed_connections: counters.failed_connections,
            total_messages: counters.total_messages,
            total_errors: counters.total_errors,
            last_cleanup_time: counters.last_cleanup_time,
            start_time: counters.start_time,
            current_connections: current,
            state_distribution: distribution,
            average_errors_per_connection: per_connection(errors),
            average_messages_per_connection: per_connection(messages),
            config: self.inner.config.clone(),
        }
    }
}

/// Run `sweep` every `period`, first after one full period, until `shutdown`.
fn spawn_sweep<F, Fut>(
    name: &'static str,
    period: std::time::Duration,
    shutdown: CancellationToken,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let period = period.max(std::time::Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(sweep = name, "Connection sweep started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => sweep().await,
            }
        }
        tracing::debug!(sweep = name, "Connection sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    type Seen = Arc<Mutex<Vec<(String, ConnectionState, ConnectionState)>>>;

    fn recording(manager: &ConnectionStateManager) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.add_state_change_listener(Arc::new(move |id, from, to| {
            sink.lock().unwrap().push((id.to_string(), from, to));
            Ok(())
        }));
        seen
    }

    async fn connected(manager: &ConnectionStateManager, id: &str) {
        assert!(manager.register_connection(id).await);
        assert!(manager.set_connection_state(id, ConnectionState::Connected).await);
    }

    #[tokio::test]
    async fn register_twice_fails() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        let seen = recording(&manager);
        assert!(manager.register_connection("s1").await);
        assert!(!manager.register_connection("s1").await);

        let record = manager.get_connection_state("s1").await.unwrap();
        assert_eq!(record.state, ConnectionState::Connecting);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                "s1".to_string(),
                ConnectionState::Disconnected,
                ConnectionState::Connecting
            )]
        );
    }

    #[tokio::test]
    async fn unknown_sessions_report_false() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        assert!(!manager.unregister_connection("nope").await);
        assert!(!manager.update_heartbeat("nope").await);
        assert!(!manager.increment_message_count("nope").await);
        assert!(!manager.increment_error_count("nope", None).await);
        assert!(!manager.set_connection_state("nope", ConnectionState::Connected).await);
        assert!(!manager.set_metadata("nope", "k", serde_json::json!(1)).await);
        assert!(manager.get_connection_state("nope").await.is_none());
    }

    #[tokio::test]
    async fn unchanged_state_is_silent() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        let seen = recording(&manager);
        assert!(manager.set_connection_state("s1", ConnectionState::Connected).await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_notifies_disconnected() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        let seen = recording(&manager);
        assert!(manager.unregister_connection("s1").await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(
                "s1".to_string(),
                ConnectionState::Connected,
                ConnectionState::Disconnected
            )]
        );
    }

    #[tokio::test]
    async fn too_many_errors_force_error_state() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        for _ in 0..5 {
            manager.increment_error_count("s1", Some("oops")).await;
        }
        assert_eq!(
            manager.get_connection_state("s1").await.unwrap().state,
            ConnectionState::Connected
        );
        manager.increment_error_count("s1", Some("last straw")).await;
        let record = manager.get_connection_state("s1").await.unwrap();
        assert_eq!(record.state, ConnectionState::Error);
        assert_eq!(record.last_error.as_deref(), Some("last straw"));
        assert_eq!(manager.get_statistics().await.total_errors, 6);
    }

    #[tokio::test]
    async fn heartbeat_listener_failure_does_not_fail_caller() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        manager.add_heartbeat_listener(Arc::new(|_| anyhow::bail!("listener down")));
        manager.add_heartbeat_listener(Arc::new(|_| panic!("listener panicked")));
        connected(&manager, "s1").await;
        assert!(manager.update_heartbeat("s1").await);
        assert!(manager.get_connection_state("s1").await.unwrap().last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn heartbeat_sweep_reconnects_within_budget() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        let seen = recording(&manager);

        let later = Utc::now() + TimeDelta::seconds(61);
        assert_eq!(manager.check_heartbeats_at(later).await, 1);

        let record = manager.get_connection_state("s1").await.unwrap();
        assert_eq!(record.state, ConnectionState::Reconnecting);
        assert_eq!(record.reconnect_attempts, 1);
        let transitions: Vec<_> = seen.lock().unwrap().iter().map(|(_, f, t)| (*f, *t)).collect();
        assert_eq!(
            transitions,
            vec![
                (ConnectionState::Connected, ConnectionState::Error),
                (ConnectionState::Error, ConnectionState::Reconnecting)
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_sweep_without_auto_reconnect_evicts() {
        let manager = ConnectionStateManager::new(ConnectionConfig {
            enable_auto_reconnect: false,
            ..Default::default()
        });
        connected(&manager, "s1").await;
        let later = Utc::now() + TimeDelta::seconds(61);
        assert_eq!(manager.check_heartbeats_at(later).await, 1);
        assert!(manager.list_connections(None).await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_sweep_ignores_fresh_and_non_connected() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "fresh").await;
        manager.register_connection("connecting").await;
        manager.update_heartbeat("fresh").await;

        let soon = Utc::now() + TimeDelta::seconds(30);
        assert_eq!(manager.check_heartbeats_at(soon).await, 0);
        let later = Utc::now() + TimeDelta::seconds(120);
        assert_eq!(manager.check_heartbeats_at(later).await, 1);
        assert_eq!(
            manager.get_connection_state("connecting").await.unwrap().state,
            ConnectionState::Connecting
        );
    }

    #[tokio::test]
    async fn cleanup_evicts_stale_sessions_in_any_state() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "connected").await;
        manager.register_connection("connecting").await;
        connected(&manager, "errored").await;
        manager.set_connection_state("errored", ConnectionState::Error).await;
        let seen = recording(&manager);

        assert_eq!(manager.cleanup_stale_connections_at(Utc::now()).await, 0);

        let later = Utc::now() + TimeDelta::seconds(61);
        assert_eq!(manager.cleanup_stale_connections_at(later).await, 3);
        assert!(manager.list_connections(None).await.is_empty());
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .all(|(_, _, to)| *to == ConnectionState::Disconnected)
        );

        let stats = manager.get_statistics().await;
        assert_eq!(stats.failed_connections, 3);
        assert!(stats.last_cleanup_time.is_some());
    }

    #[tokio::test]
    async fn healthy_connections_use_explicit_clock() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        manager.register_connection("s2").await;

        let now = Utc::now();
        assert_eq!(manager.get_healthy_connections_at(now).await, vec!["s1".to_string()]);
        assert!(
            manager
                .get_healthy_connections_at(now + TimeDelta::seconds(31))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "b").await;
        connected(&manager, "a").await;
        manager.register_connection("c").await;

        assert_eq!(
            manager.list_connections(Some(ConnectionState::Connected)).await,
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(manager.list_connections(None).await.len(), 3);
    }

    #[tokio::test]
    async fn statistics_summarize_registry() {
        let manager = ConnectionStateManager::new(ConnectionConfig::default());
        connected(&manager, "s1").await;
        connected(&manager, "s2").await;
        manager.increment_message_count("s1").await;
        manager.increment_message_count("s1").await;
        manager.set_metadata("s1", "client", serde_json::json!("web")).await;

        let stats = manager.get_statistics().await;
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.current_connections, 2);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.average_messages_per_connection, 1.0);
        assert_eq!(stats.state_distribution.get("connected"), Some(&2));
        assert_eq!(
            manager.get_connection_state("s1").await.unwrap().metadata["client"],
            "web"
        );
    }

    #[tokio::test]
    async fn stop_unregisters_everything() {
        let manager = ConnectionStateManager::new(ConnectionConfig {
            heartbeat_interval: Duration::from_millis(10),
            ..Default::default()
        });
        manager.start();
        assert!(manager.is_running());
        connected(&manager, "s1").await;
        let seen = recording(&manager);

        manager.stop().await;
        assert!(!manager.is_running());
        assert!(manager.list_connections(None).await.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
