//! Consumption manager
//!
//! Registers the worker's single consume subscription, decodes inbound
//! deliveries, records them in the message registry, and dispatches to
//! the injected handler sequentially. When the consumer channel dies
//! with the subscription active, the subscription is re-established on
//! a fresh channel with the same queue and handler.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use envelope_codec::{Envelope, EnvelopeCodec, InputFormat};

use crate::channel::ChannelManager;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::headers;
use crate::metrics::{CONSUME_DURATION, CONSUME_TOTAL, RECONNECTS_TOTAL};
use crate::registry::{MessageRegistry, RawMessage};
use crate::settings::Settings;

/// Worker lifecycle state.
///
/// `Recovering` is entered only on an unexpected channel loss while a
/// subscription is active, and is invisible to callers: no operation
/// fails because recovery is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No connections
    Idle,
    /// First subscription being established
    Connecting,
    /// Consuming
    Connected,
    /// Re-establishing the subscription after a channel loss
    Recovering,
    /// Tearing down
    Disconnecting,
}

/// Business-logic handler invoked for each decoded message.
///
/// The handler reports its own failures through the publisher's error
/// and rebound paths before returning `Err`; rejection by the consume
/// loop is a last-resort safety net, not the primary error channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message
    async fn handle(&self, envelope: Envelope, raw: Arc<RawMessage>) -> Result<()>;
}

#[derive(Clone)]
struct Subscription {
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

/// Owns the consume subscription and the ack/reject correlation
pub struct ConsumptionManager {
    settings: Arc<Settings>,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    codec: Arc<EnvelopeCodec>,
    registry: Arc<MessageRegistry>,
    input_format: InputFormat,
    subscription: Mutex<Option<Subscription>>,
    current_tag: Arc<RwLock<Option<String>>>,
    state_tx: watch::Sender<WorkerState>,
}

impl ConsumptionManager {
    /// Create a manager; nothing connects until `listen_queue`
    pub fn new(
        settings: Arc<Settings>,
        connections: Arc<ConnectionManager>,
        channels: Arc<ChannelManager>,
        codec: Arc<EnvelopeCodec>,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self> {
        let input_format = settings.input_format()?;
        let (state_tx, _) = watch::channel(WorkerState::Idle);

        Ok(Self {
            settings,
            connections,
            channels,
            codec,
            registry,
            input_format,
            subscription: Mutex::new(None),
            current_tag: Arc::new(RwLock::new(None)),
            state_tx,
        })
    }

    /// Observe the worker state
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// The message registry backing ack/reject correlation
    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Subscribe to the configured inbound queue and dispatch each
    /// decoded delivery to `handler`.
    ///
    /// Returns once the subscription is established; dispatch continues
    /// on a background task until `disconnect` or an unrecoverable
    /// subscription loss.
    pub async fn listen_queue(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let queue = self.settings.listen_messages_on.clone();
        {
            let mut subscription = self.subscription.lock().await;
            if subscription.is_some() {
                return Err(Error::IllegalOperation(
                    "a consume subscription is already active".to_string(),
                ));
            }
            *subscription = Some(Subscription {
                queue: queue.clone(),
                handler,
            });
        }

        let _ = self.state_tx.send(WorkerState::Connecting);
        let (channel, consumer) = match self.subscribe(&queue).await {
            Ok(established) => established,
            Err(e) => {
                *self.subscription.lock().await = None;
                let _ = self.state_tx.send(WorkerState::Idle);
                return Err(e);
            }
        };
        let _ = self.state_tx.send(WorkerState::Connected);
        info!("consuming from {}", queue);

        tokio::spawn(self.clone().run(channel, consumer));
        Ok(())
    }

    /// Acknowledge a message by id.
    ///
    /// When the registered delivery belongs to a previous channel
    /// generation, the call waits for the broker to redeliver on the
    /// current one, so the ack is issued on a channel the broker still
    /// considers valid.
    pub async fn ack(&self, message_id: &str) -> Result<()> {
        let entry = self.wait_for_current(message_id).await?;
        let channel = self.channels.ensure_consumer_channel().await?;
        channel
            .basic_ack(entry.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Channel(format!("ack of message {}: {}", message_id, e)))?;
        self.registry.remove(message_id);
        debug!("message {} acknowledged", message_id);
        Ok(())
    }

    /// Reject a message by id, without requeueing
    pub async fn reject(&self, message_id: &str) -> Result<()> {
        let entry = self.wait_for_current(message_id).await?;
        let channel = self.channels.ensure_consumer_channel().await?;
        channel
            .basic_reject(entry.delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| Error::Channel(format!("reject of message {}: {}", message_id, e)))?;
        self.registry.remove(message_id);
        debug!("message {} rejected", message_id);
        Ok(())
    }

    /// End the subscription and close channels and connections
    pub async fn disconnect(&self) {
        let _ = self.state_tx.send(WorkerState::Disconnecting);
        *self.subscription.lock().await = None;
        *self.current_tag.write() = None;
        self.channels.close().await;
        self.connections.disconnect().await;
        let _ = self.state_tx.send(WorkerState::Idle);
        info!("worker disconnected");
    }

    async fn subscribe(&self, queue: &str) -> Result<(Channel, lapin::Consumer)> {
        let channel = self.channels.ensure_consumer_channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("worker-{}", Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Channel(format!("consume on {}: {}", queue, e)))?;

        let tag = consumer.tag().as_str().to_string();
        debug!("consumer {} registered on {}", tag, queue);
        *self.current_tag.write() = Some(tag);

        Ok((channel, consumer))
    }

    async fn run(self: Arc<Self>, mut channel: Channel, mut consumer: lapin::Consumer) {
        loop {
            // snapshot of the active subscription; cleared by disconnect
            let Some(subscription) = self.subscription.lock().await.clone() else {
                break;
            };

            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        self.process_delivery(&channel, delivery, &subscription.handler)
                            .await
                    }
                    Err(e) => {
                        error!("consumer stream failed: {}", e);
                        break;
                    }
                }
            }

            if self.subscription.lock().await.is_none() {
                // disconnect() ended the subscription
                break;
            }

            warn!(
                "consumer channel lost, re-establishing subscription on {}",
                subscription.queue
            );
            let _ = self.state_tx.send(WorkerState::Recovering);
            RECONNECTS_TOTAL.with_label_values(&["consume"]).inc();
            self.channels.invalidate_consumer_channel().await;
            *self.current_tag.write() = None;

            // let the owning connection process its own close first
            tokio::task::yield_now().await;

            match self.subscribe(&subscription.queue).await {
                Ok((new_channel, new_consumer)) => {
                    channel = new_channel;
                    consumer = new_consumer;
                    let _ = self.state_tx.send(WorkerState::Connected);
                    info!("subscription on {} re-established", subscription.queue);
                }
                Err(e) => {
                    error!(
                        "failed to re-establish subscription on {}: {}",
                        subscription.queue, e
                    );
                    *self.subscription.lock().await = None;
                    let _ = self.state_tx.send(WorkerState::Idle);
                    break;
                }
            }
        }
    }

    async fn process_delivery(
        &self,
        channel: &Channel,
        delivery: Delivery,
        handler: &Arc<dyn MessageHandler>,
    ) {
        let consumer_tag = self.current_tag.read().clone().unwrap_or_default();
        let raw = Arc::new(RawMessage::from_delivery(delivery, consumer_tag));

        let protocol_version = headers::header_i64(&raw.properties, "protocolVersion")
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1);

        let envelope = match self
            .codec
            .decode(&raw.content, self.input_format, protocol_version)
        {
            Ok(envelope) => fold_reply_to(envelope, &raw),
            Err(e) => {
                // undecodable content can never be processed
                error!("rejecting undecodable message: {}", e);
                CONSUME_TOTAL.with_label_values(&["decode_error"]).inc();
                if let Err(reject_err) = channel
                    .basic_reject(raw.delivery_tag, BasicRejectOptions { requeue: false })
                    .await
                {
                    error!("rejecting undecodable message failed: {}", reject_err);
                }
                return;
            }
        };

        let message_id = headers::header_string(&raw.properties, "messageId")
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.registry.record(message_id.clone(), raw.clone());

        let start = Instant::now();
        match handler.handle(envelope, raw).await {
            Ok(()) => {
                CONSUME_DURATION
                    .with_label_values(&["success"])
                    .observe(start.elapsed().as_secs_f64());
                CONSUME_TOTAL.with_label_values(&["success"]).inc();

                if self.registry.get(&message_id).is_some() {
                    if let Err(e) = self.ack(&message_id).await {
                        error!("acknowledging message {} failed: {}", message_id, e);
                    }
                }
            }
            Err(e) => {
                error!("handler failed for message {}: {}", message_id, e);
                CONSUME_DURATION
                    .with_label_values(&["error"])
                    .observe(start.elapsed().as_secs_f64());
                CONSUME_TOTAL.with_label_values(&["handler_error"]).inc();

                if self.registry.get(&message_id).is_some() {
                    if let Err(reject_err) = self.reject(&message_id).await {
                        error!("rejecting message {} failed: {}", message_id, reject_err);
                    }
                }
            }
        }
    }

    async fn wait_for_current(&self, message_id: &str) -> Result<Arc<RawMessage>> {
        let current_tag = self.current_tag.clone();
        self.registry
            .wait_for(message_id, move |message| {
                current_tag.read().as_deref() == Some(message.consumer_tag.as_str())
            })
            .await
    }
}

fn fold_reply_to(mut envelope: Envelope, raw: &RawMessage) -> Envelope {
    if let Some(reply_to) = raw.properties.reply_to().as_ref() {
        envelope
            .headers
            .entry("reply_to".to_string())
            .or_insert_with(|| reply_to.as_str().to_string());
    }
    envelope
}
