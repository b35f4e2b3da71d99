//! Shared registry of live connections
//!
//! Maps opaque handles to connections so independent tasks can drive
//! different relationships concurrently. The map itself sits behind a
//! short-lived [`parking_lot::RwLock`]; each connection gets its own
//! [`tokio::sync::Mutex`], so work on one record never blocks another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::connection::Connection;
use crate::error::{LinkError, LinkResult};

/// A registered connection, lockable per record.
pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, SharedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the handle that names it.
    pub fn add(&self, connection: Connection) -> String {
        let handle = Ulid::new().to_string();
        info!(
            handle = %handle,
            source_id = %connection.source_id(),
            "Connection registered"
        );
        self.connections
            .write()
            .insert(handle.clone(), Arc::new(Mutex::new(connection)));
        handle
    }

    /// Look up a connection by handle.
    pub fn get(&self, handle: &str) -> LinkResult<SharedConnection> {
        self.connections.read().get(handle).cloned().ok_or_else(|| {
            LinkError::InvalidHandle(format!("no connection for handle {}", handle))
        })
    }

    /// Drop a connection from the registry and invalidate it.
    ///
    /// Clones of the handle obtained earlier observe the deletion: their
    /// next state-changing call fails with `InvalidHandle`.
    pub async fn remove(&self, handle: &str) -> LinkResult<()> {
        let connection = self.connections.write().remove(handle).ok_or_else(|| {
            LinkError::InvalidHandle(format!("no connection for handle {}", handle))
        })?;
        connection.lock().await.delete();
        info!(handle = %handle, "Connection removed");
        Ok(())
    }

    pub fn handles(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Find a connection by the caller-assigned source id.
    pub async fn find_by_source_id(&self, source_id: &str) -> Option<SharedConnection> {
        let entries: Vec<SharedConnection> = self.connections.read().values().cloned().collect();
        for entry in entries {
            if entry.lock().await.source_id() == source_id {
                return Some(entry);
            }
        }
        None
    }
}
