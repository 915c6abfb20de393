//! Registry of live signaling channels, one per (group, user).

use super::channel::{CloseReason, SignalingHandle, spawn_channel};
use super::socket::SocketConnector;
use super::ConnectionKey;
use gage_common::config::{HealthConfig, SignalingConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns the channel actors. Entries disappear when their actor exits, however
/// it exits.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<ConnectionKey, SignalingHandle>>>,
    connector: Arc<dyn SocketConnector>,
    signaling: SignalingConfig,
    health: HealthConfig,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        signaling: SignalingConfig,
        health: HealthConfig,
    ) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            connector,
            signaling,
            health,
        }
    }

    /// Get the channel for `key`, spawning and connecting it if absent.
    pub async fn open(&self, key: ConnectionKey) -> SignalingHandle {
        // Fast path: channel exists
        {
            let connections = self.connections.read().await;
            if let Some(handle) = connections.get(&key) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        // Slow path: double-check under the write lock
        let mut connections = self.connections.write().await;
        if let Some(handle) = connections.get(&key) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (handle, task) = spawn_channel(
            key.clone(),
            self.signaling.clone(),
            self.health.clone(),
            Arc::clone(&self.connector),
        );

        let connections_ref = Arc::clone(&self.connections);
        let instance = handle.instance_id().to_owned();
        let exit_key = key.clone();
        tokio::spawn(async move {
            let _ = task.await;
            // Clean up when the actor stops, unless a newer channel took the slot
            let mut connections = connections_ref.write().await;
            if connections
                .get(&exit_key)
                .is_some_and(|h| h.instance_id() == instance)
            {
                connections.remove(&exit_key);
            }
            tracing::info!(key = %exit_key, "Signaling channel removed from registry");
        });

        connections.insert(key.clone(), handle.clone());
        drop(connections);
        tracing::info!(key = %key, "Signaling channel created");

        handle.connect().await;
        handle
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<SignalingHandle> {
        self.connections.read().await.get(key).cloned()
    }

    /// Tear down and forget the channel for `key`.
    pub async fn close(&self, key: &ConnectionKey, reason: CloseReason) {
        let handle = self.connections.write().await.remove(key);
        if let Some(handle) = handle {
            handle.teardown(reason).await;
        }
    }

    /// Tear down every channel.
    pub async fn close_all(&self, reason: CloseReason) {
        let handles: Vec<SignalingHandle> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            handle.teardown(reason).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
