//! Outbound webhook delivery.
//!
//! Rows land in `_ayb_webhook_deliveries` inside the transaction of the
//! write that produced them; this dispatcher picks them up after commit,
//! signs the payload, and retries with exponential backoff until delivery
//! or exhaustion.

use std::{sync::Arc, time::Duration};

use ayb_db::{Db, WebhookDeliveryRecord, WebhookRecord};
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, warn};

use crate::retry_backoff;

pub const SIGNATURE_HEADER: &str = "X-AYB-Signature";

/// `hex(HMAC_SHA256(secret, body))`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone, Debug)]
pub struct WebhookDispatcherConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub request_timeout: Duration,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            batch_size: 32,
            max_attempts: 8,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WebhookDispatcher {
    db: Db,
    http: reqwest::Client,
    config: WebhookDispatcherConfig,
    wake: Notify,
}

impl WebhookDispatcher {
    pub fn new(db: Db, config: WebhookDispatcherConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            db,
            http,
            config,
            wake: Notify::new(),
        }
    }

    /// Post-commit signal: new deliveries are waiting.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let claimed = match self.db.claim_due_deliveries(self.config.batch_size).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(error = %err, "delivery claim failed");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown.wait_for(|stop| *stop) => return,
                }
                continue;
            }

            futures::stream::iter(claimed)
                .for_each_concurrent(self.config.concurrency, |delivery| async {
                    self.deliver(delivery).await;
                })
                .await;
        }
    }

    async fn deliver(&self, delivery: WebhookDeliveryRecord) {
        let webhook = match self.db.fetch_webhook(delivery.webhook_id).await {
            Ok(Some(webhook)) if webhook.enabled => webhook,
            Ok(_) => {
                // Endpoint deleted or disabled while the row was pending.
                let _ = self
                    .db
                    .mark_delivery_failed(delivery.id, "webhook removed or disabled")
                    .await;
                return;
            }
            Err(err) => {
                error!(delivery_id = %delivery.id, error = %err, "webhook lookup failed");
                return;
            }
        };

        match self.attempt(&webhook, &delivery).await {
            Ok(()) => {
                debug!(delivery_id = %delivery.id, url = %webhook.url, "webhook delivered");
                if let Err(err) = self.db.mark_delivery_delivered(delivery.id).await {
                    error!(delivery_id = %delivery.id, error = %err, "delivered-state write failed");
                }
            }
            Err(message) => {
                let result = if delivery.attempts >= self.config.max_attempts {
                    warn!(delivery_id = %delivery.id, attempts = delivery.attempts, error = %message,
                        "webhook delivery exhausted");
                    self.db.mark_delivery_failed(delivery.id, &message).await
                } else {
                    let delay = retry_backoff(delivery.attempts)
                        + Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    self.db.mark_delivery_retry(delivery.id, next, &message).await
                };
                if let Err(err) = result {
                    error!(delivery_id = %delivery.id, error = %err, "retry-state write failed");
                }
            }
        }
    }

    async fn attempt(
        &self,
        webhook: &WebhookRecord,
        delivery: &WebhookDeliveryRecord,
    ) -> Result<(), String> {
        let body = serde_json::to_vec(&delivery.event).map_err(|err| err.to_string())?;
        let signature = sign_payload(&webhook.secret, &body);

        let response = self
            .http
            .post(&webhook.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("endpoint returned {}", response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let body = br#"{"action":"create","table":"posts"}"#;
        let first = sign_payload("secret", body);
        let second = sign_payload("secret", body);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        // A different key yields a different signature.
        assert_ne!(first, sign_payload("other", body));
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let signature = sign_payload("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            signature,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
