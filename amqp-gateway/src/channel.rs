//! Broker channel lifecycle
//!
//! One consumer channel (prefetch, no confirms) on the read connection
//! and one publish channel (confirm mode) on the write connection, each
//! cached behind the same single-flight discipline as the connections.

use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use lapin::Channel;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::metrics::RECONNECTS_TOTAL;
use crate::settings::Settings;

/// Manages the worker's two channels
pub struct ChannelManager {
    settings: Arc<Settings>,
    connections: Arc<ConnectionManager>,
    consumer: Mutex<Option<Channel>>,
    publish: Mutex<Option<Channel>>,
}

impl ChannelManager {
    /// Create a manager with no live channels
    pub fn new(settings: Arc<Settings>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            settings,
            connections,
            consumer: Mutex::new(None),
            publish: Mutex::new(None),
        }
    }

    /// Return the live consumer channel, creating it if absent.
    ///
    /// Creation sets the configured prefetch count.
    pub async fn ensure_consumer_channel(&self) -> Result<Channel> {
        let mut guard = self.consumer.lock().await;

        if let Some(channel) = live(&mut guard, "consumer") {
            return Ok(channel);
        }

        let connection = self.connections.ensure_read_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Channel(format!("creating consumer channel: {}", e)))?;
        channel
            .basic_qos(
                self.settings.rabbitmq_prefetch_sailor,
                BasicQosOptions::default(),
            )
            .await
            .map_err(|e| Error::Channel(format!("setting prefetch: {}", e)))?;

        info!(
            "consumer channel {} opened (prefetch {})",
            channel.id(),
            self.settings.rabbitmq_prefetch_sailor
        );
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Return the live publish channel, creating it if absent.
    ///
    /// Creation puts the channel in confirm mode.
    pub async fn ensure_publish_channel(&self) -> Result<Channel> {
        let mut guard = self.publish.lock().await;

        if let Some(channel) = live(&mut guard, "publish") {
            return Ok(channel);
        }

        let connection = self.connections.ensure_write_connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Channel(format!("creating publish channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Channel(format!("enabling confirms: {}", e)))?;

        info!("publish channel {} opened (confirm mode)", channel.id());
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Drop the cached consumer channel so the next `ensure` rebuilds it
    pub async fn invalidate_consumer_channel(&self) {
        *self.consumer.lock().await = None;
    }

    /// Drop the cached publish channel so the next `ensure` rebuilds it
    pub async fn invalidate_publish_channel(&self) {
        *self.publish.lock().await = None;
    }

    /// Close both channels and clear the caches
    pub async fn close(&self) {
        for (kind, slot) in [("consumer", &self.consumer), ("publish", &self.publish)] {
            let mut guard = slot.lock().await;
            if let Some(channel) = guard.take() {
                if let Err(e) = channel.close(200, "worker shutdown").await {
                    debug!("closing {} channel failed: {}", kind, e);
                }
            }
        }
    }
}

fn live(guard: &mut Option<Channel>, kind: &str) -> Option<Channel> {
    match guard {
        Some(channel) if channel.status().connected() => Some(channel.clone()),
        Some(_) => {
            warn!("{} channel is no longer live, rebuilding", kind);
            RECONNECTS_TOTAL.with_label_values(&["channel"]).inc();
            *guard = None;
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_without_channels_is_noop() {
        let settings = Arc::new(crate::test_support::settings());
        let connections = Arc::new(ConnectionManager::new(settings.clone()));
        let channels = ChannelManager::new(settings, connections);
        channels.close().await;
    }

    #[tokio::test]
    #[ignore] // Requires RabbitMQ
    async fn test_concurrent_ensure_yields_one_channel() {
        let settings = Arc::new(crate::test_support::settings());
        let connections = Arc::new(ConnectionManager::new(settings.clone()));
        let channels = Arc::new(ChannelManager::new(settings, connections.clone()));

        let (a, b) = tokio::join!(
            channels.ensure_publish_channel(),
            channels.ensure_publish_channel()
        );
        assert_eq!(a.unwrap().id(), b.unwrap().id());

        channels.close().await;
        connections.disconnect().await;
    }
}
