//! Rebound protocol
//!
//! A rebound re-queues a message to its own input queue with a broker
//! TTL that doubles on every iteration; the queue's dead-letter-to-self
//! binding (external topology) brings it back after the TTL elapses.
//! Past the configured limit the message escalates to the error path
//! instead.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use envelope_codec::ErrorReport;

use crate::error::Result;
use crate::headers;
use crate::metrics::REBOUNDS_TOTAL;
use crate::publisher::{OutgoingProperties, PublishOutcome, Publisher};
use crate::registry::RawMessage;
use crate::settings::Settings;

const REBOUND_ITERATION_HEADER: &str = "reboundIteration";
const REBOUND_REASON_HEADER: &str = "reboundReason";

/// Decides between re-queue-with-delay and error escalation
pub struct ReboundRouter {
    settings: Arc<Settings>,
    publisher: Arc<Publisher>,
}

impl ReboundRouter {
    /// Create a router publishing through the given publisher
    pub fn new(settings: Arc<Settings>, publisher: Arc<Publisher>) -> Self {
        Self {
            settings,
            publisher,
        }
    }

    /// Re-queue the original, still-encrypted message with a doubled
    /// TTL, or escalate to the error path once the iteration exceeds
    /// the rebound limit.
    pub async fn send_rebound(
        &self,
        reason: &str,
        original: &RawMessage,
        outgoing_headers: HashMap<String, Value>,
    ) -> Result<PublishOutcome> {
        let iteration = previous_iteration(original) + 1;

        if iteration > self.settings.rebound_limit {
            warn!(
                "rebound limit of {} reached, escalating to the error path",
                self.settings.rebound_limit
            );
            REBOUNDS_TOTAL.with_label_values(&["escalated"]).inc();

            let report = ErrorReport::new("Error", "Rebound limit exceeded");
            return self
                .publisher
                .send_error(&report, OutgoingProperties::from_headers(outgoing_headers), None)
                .await;
        }

        let expiration = rebound_expiration(self.settings.rebound_initial_expiration, iteration);
        info!(
            "rebound iteration {} for routing key {}, due back in {} ms",
            iteration, original.routing_key, expiration
        );
        REBOUNDS_TOTAL.with_label_values(&["requeued"]).inc();

        let mut properties = OutgoingProperties::from_headers(outgoing_headers);
        properties
            .headers
            .insert(REBOUND_ITERATION_HEADER.to_string(), json!(iteration));
        properties
            .headers
            .insert(REBOUND_REASON_HEADER.to_string(), json!(reason));
        properties.expiration_ms = Some(expiration);

        self.publisher
            .send_to_exchange(
                &self.settings.publish_messages_to,
                &self.settings.rebound_routing_key,
                original.content.clone(),
                &properties,
                None,
            )
            .await
    }
}

fn previous_iteration(original: &RawMessage) -> u32 {
    headers::header_i64(&original.properties, REBOUND_ITERATION_HEADER)
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0)
}

/// TTL of rebound number `iteration`: the initial expiration doubled on
/// every subsequent iteration.
pub(crate) fn rebound_expiration(initial_ms: u64, iteration: u32) -> u64 {
    let factor = 2u64.saturating_pow(iteration.saturating_sub(1).min(62));
    initial_ms.saturating_mul(factor)
}
