//! Broker connection lifecycle
//!
//! The worker holds two connections, one for consuming and one for
//! publishing. Connections are created lazily, cached per role, and
//! rebuilt by the next `ensure_*` call after the broker drops them.

use lapin::{Connection, ConnectionProperties};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::RECONNECTS_TOTAL;
use crate::settings::Settings;

/// Connection role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consuming side
    Read,
    /// Publishing side
    Write,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Read => write!(f, "read"),
            Role::Write => write!(f, "write"),
        }
    }
}

/// Manages the worker's two broker connections.
///
/// The per-role `Mutex` doubles as the single-flight guard: the first
/// caller holds the lock across establishment and concurrent callers
/// suspend on it, then find the cached handle.
pub struct ConnectionManager {
    settings: Arc<Settings>,
    read: Mutex<Option<Arc<Connection>>>,
    write: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    /// Create a manager with no live connections
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            read: Mutex::new(None),
            write: Mutex::new(None),
        }
    }

    /// Return the live read connection, establishing it if absent
    pub async fn ensure_read_connection(&self) -> Result<Arc<Connection>> {
        self.ensure(Role::Read, &self.read).await
    }

    /// Return the live write connection, establishing it if absent
    pub async fn ensure_write_connection(&self) -> Result<Arc<Connection>> {
        self.ensure(Role::Write, &self.write).await
    }

    async fn ensure(
        &self,
        role: Role,
        slot: &Mutex<Option<Arc<Connection>>>,
    ) -> Result<Arc<Connection>> {
        let mut guard = slot.lock().await;

        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(connection.clone());
            }
            warn!("{} connection is no longer live, rebuilding", role);
            RECONNECTS_TOTAL.with_label_values(&["connection"]).inc();
            *guard = None;
        }

        let connection = Arc::new(self.establish(role).await?);
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn establish(&self, role: Role) -> Result<Connection> {
        let attempts = self.settings.amqp_reconnect_attempts;
        let name = client_name(role);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let properties = ConnectionProperties::default().with_connection_name(name.clone().into());

            match Connection::connect(&self.settings.amqp_uri, properties).await {
                Ok(connection) => {
                    info!("{} connection '{}' established", role, name);
                    connection.on_error(move |err| {
                        error!("{} connection closed unexpectedly: {}", role, err);
                    });
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        "{} connection attempt {}/{} failed: {}",
                        role, attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(
                            self.settings.amqp_reconnect_timeout,
                        ))
                        .await;
                    }
                }
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts configured".to_string());
        Err(Error::Connection(format!(
            "{} connection failed after {} attempts: {}",
            role, attempts, cause
        )))
    }

    /// Close both connections and clear the caches.
    ///
    /// Already-closed handles are tolerated.
    pub async fn disconnect(&self) {
        for (role, slot) in [(Role::Read, &self.read), (Role::Write, &self.write)] {
            let mut guard = slot.lock().await;
            if let Some(connection) = guard.take() {
                if let Err(e) = connection.close(200, "worker shutdown").await {
                    warn!("closing {} connection failed: {}", role, e);
                } else {
                    info!("{} connection closed", role);
                }
            }
        }
    }
}

fn client_name(role: Role) -> String {
    format!("{}-{}-{}", role, hostname(), std::process::id())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Arc<Settings> {
        Arc::new(crate::test_support::settings())
    }

    #[test]
    fn test_client_name_is_host_qualified() {
        let name = client_name(Role::Read);
        assert!(name.starts_with("read-"));
        assert!(name.ends_with(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_without_connections_is_noop() {
        let manager = ConnectionManager::new(settings());
        manager.disconnect().await;
    }

    #[tokio::test]
    #[ignore] // Requires RabbitMQ
    async fn test_concurrent_ensure_yields_one_connection() {
        let manager = Arc::new(ConnectionManager::new(settings()));

        let (a, b) = tokio::join!(
            manager.ensure_read_connection(),
            manager.ensure_read_connection()
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        manager.disconnect().await;
    }
}
